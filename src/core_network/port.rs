use log::debug;
use std::net::{IpAddr, SocketAddr};
use tokio::net::{TcpListener, TcpStream};

/// Formats the `PORT` argument for an IPv4 listener, or the `EPRT` argument
/// for anything else. Returns the verb and its argument.
pub fn format_port_command(addr: SocketAddr) -> (&'static str, String) {
    match addr.ip() {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            (
                "PORT",
                format!(
                    "{},{},{},{},{},{}",
                    o[0],
                    o[1],
                    o[2],
                    o[3],
                    addr.port() >> 8,
                    addr.port() & 0xff
                ),
            )
        }
        IpAddr::V6(v6) => ("EPRT", format!("|2|{}|{}|", v6, addr.port())),
    }
}

/// Binds the listener for an active mode data connection.
pub async fn setup_active_listener(ip: IpAddr) -> Result<(TcpListener, SocketAddr), std::io::Error> {
    let listener = TcpListener::bind((ip, 0)).await?;
    let addr = listener.local_addr()?;
    debug!("Active mode listener set up on {}", addr);
    Ok((listener, addr))
}

/// Accepts the server's connection on the active mode listener.
pub async fn accept_active_connection(listener: TcpListener) -> Result<TcpStream, std::io::Error> {
    let (stream, addr) = listener.accept().await?;
    debug!("Accepted data connection from: {}", addr);
    Ok(stream)
}
