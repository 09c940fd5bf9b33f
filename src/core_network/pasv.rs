use crate::config::PassiveFallbackMode;
use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::TcpStream;

static PASV_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    let octet = r"(25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)";
    Regex::new(&format!(
        r"(?:^|[^\d]){o},{o},{o},{o},(\d{{1,3}}),(\d{{1,3}})",
        o = octet
    ))
    .ok()
});

static EPSV_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\(([!-~])([!-~])([!-~])(\d{1,5})([!-~])\)").ok());

/// Extracts the address from a `227 Entering Passive Mode (a,b,c,d,p1,p2)` reply.
pub fn parse_pasv_reply(text: &str) -> Option<SocketAddr> {
    let caps = PASV_RE.as_ref()?.captures(text)?;
    let mut octets = [0u8; 4];
    for (i, octet) in octets.iter_mut().enumerate() {
        *octet = caps.get(i + 1)?.as_str().parse().ok()?;
    }
    let high: u16 = caps.get(5)?.as_str().parse().ok()?;
    let low: u16 = caps.get(6)?.as_str().parse().ok()?;
    if high > 255 || low > 255 {
        return None;
    }
    Some(SocketAddr::new(
        IpAddr::V4(Ipv4Addr::from(octets)),
        high * 256 + low,
    ))
}

/// Extracts the port from a `229 Entering Extended Passive Mode (|||port|)`
/// reply. The host is always the control connection's peer.
pub fn parse_epsv_reply(text: &str, peer: IpAddr) -> Option<SocketAddr> {
    let caps = EPSV_RE.as_ref()?.captures(text)?;
    let delim = caps.get(1)?.as_str();
    if caps.get(2)?.as_str() != delim
        || caps.get(3)?.as_str() != delim
        || caps.get(5)?.as_str() != delim
    {
        return None;
    }
    let port: u16 = caps.get(4)?.as_str().parse().ok()?;
    (port != 0).then_some(SocketAddr::new(peer, port))
}

/// False for loopback, private, link-local and unspecified addresses.
pub fn is_routable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            !(v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80)
        }
    }
}

/// Picks the address to open the passive data connection to.
pub fn resolve_passive_addr(
    reply: SocketAddr,
    peer: Option<IpAddr>,
    mode: PassiveFallbackMode,
) -> SocketAddr {
    let Some(peer) = peer else {
        return reply;
    };
    let substitute = match mode {
        PassiveFallbackMode::Trust => false,
        PassiveFallbackMode::Peer => true,
        PassiveFallbackMode::Auto => !is_routable(reply.ip()) && is_routable(peer),
    };
    if substitute && reply.ip() != peer {
        info!(
            "Server sent passive reply with unroutable address {}, using {} instead",
            reply.ip(),
            peer
        );
        return SocketAddr::new(peer, reply.port());
    }
    reply
}

/// Opens the passive data connection.
pub async fn connect_passive(addr: SocketAddr) -> Result<TcpStream, std::io::Error> {
    let stream = TcpStream::connect(addr).await?;
    debug!("Passive data connection established with {}", addr);
    Ok(stream)
}
