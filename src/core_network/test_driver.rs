use crate::config::EngineConfig;
use crate::core_engine::{ControlSocket, ListFlags, SessionContext, TransferCommand};
use crate::core_error::ReplyCode;
use crate::core_network::{AutoAnswer, FtpConnection, SftpConnection};
use crate::core_server::{Protocol, Server, ServerPath, ServerType};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;

const LISTING: &str = "-rw-r--r-- 1 bob users 5 Jan 01 2020 hello.txt\r\n";

fn unix(path: &str) -> ServerPath {
    ServerPath::parse(path, ServerType::Unix).unwrap()
}

async fn reply(write: &mut OwnedWriteHalf, text: &str) {
    write
        .write_all(format!("{}\r\n", text).as_bytes())
        .await
        .unwrap();
}

/// A one-connection FTP server over loopback. Returns the commands it saw.
async fn serve(listener: TcpListener) -> Vec<String> {
    let (stream, _) = listener.accept().await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let mut log = Vec::new();
    let mut cwd = "/".to_string();
    let mut data: Option<TcpListener> = None;

    reply(&mut write, "220 Welcome").await;
    while let Ok(Some(line)) = lines.next_line().await {
        log.push(line.clone());
        let (verb, arg) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        match verb {
            "USER" => reply(&mut write, "331 Password required").await,
            "PASS" => reply(&mut write, "230 Logged in").await,
            "SYST" => reply(&mut write, "215 UNIX Type: L8").await,
            "FEAT" => reply(&mut write, "211-Features:\r\n SIZE\r\n211 End").await,
            "TYPE" | "OPTS" => reply(&mut write, "200 OK").await,
            "PWD" => reply(&mut write, &format!("257 \"{}\" is current", cwd)).await,
            "CWD" => {
                cwd = arg.to_string();
                reply(&mut write, "250 OK").await
            }
            "SIZE" => reply(&mut write, "213 5").await,
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let port = listener.local_addr().unwrap().port();
                data = Some(listener);
                let text = format!(
                    "227 Entering Passive Mode (127,0,0,1,{},{})",
                    port >> 8,
                    port & 0xff
                );
                reply(&mut write, &text).await
            }
            "LIST" | "RETR" => {
                let Some(listener) = data.take() else {
                    reply(&mut write, "425 Use PASV first").await;
                    continue;
                };
                reply(&mut write, "150 Opening data connection").await;
                let (mut stream, _) = listener.accept().await.unwrap();
                let payload: &[u8] = if verb == "LIST" {
                    LISTING.as_bytes()
                } else {
                    b"hello"
                };
                stream.write_all(payload).await.unwrap();
                drop(stream);
                reply(&mut write, "226 Transfer complete").await
            }
            "QUIT" => {
                reply(&mut write, "221 Bye").await;
                break;
            }
            _ => reply(&mut write, "500 Unknown command").await,
        }
    }
    log
}

#[tokio::test]
async fn test_ftp_session_over_loopback() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let fake = tokio::spawn(serve(listener));

    let ctx = SessionContext::new();
    let server =
        Server::new(Protocol::InsecureFtp, "127.0.0.1", port).with_credentials("bob", "secret");
    let mut conn = FtpConnection::new(ctx.clone(), &EngineConfig::default());
    let mut handler = AutoAnswer::default();

    let code = conn.run(&mut handler, |s| s.connect(server.clone())).await;
    assert_eq!(code, ReplyCode::Ok);
    assert!(conn.socket().is_logged_on());

    let code = conn
        .run(&mut handler, |s| s.list(unix("/pub"), "", ListFlags::default()))
        .await;
    assert_eq!(code, ReplyCode::Ok);
    let (listing, _) = ctx.cache.lookup(&server, &unix("/pub"), false).unwrap();
    assert_eq!(listing.entries()[0].name, "hello.txt");

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("hello.txt");
    let command = TransferCommand {
        download: true,
        local_path: local.clone(),
        local_size: None,
        local_time: None,
        remote_path: unix("/pub"),
        remote_file: "hello.txt".to_string(),
    };
    let code = conn.run(&mut handler, |s| s.file_transfer(command)).await;
    assert_eq!(code, ReplyCode::Ok);
    assert_eq!(std::fs::read(&local).unwrap(), b"hello".to_vec());

    drop(conn);
    let log = fake.await.unwrap();
    assert_eq!(&log[..2], &["USER bob".to_string(), "PASS secret".to_string()]);
    assert!(log.iter().any(|c| c == "LIST"));
    assert!(log.iter().any(|c| c == "RETR hello.txt" || c == "RETR /pub/hello.txt"));
}

#[tokio::test]
async fn test_refused_connection_fails_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let server = Server::new(Protocol::InsecureFtp, "127.0.0.1", port);
    let mut conn = FtpConnection::new(SessionContext::new(), &EngineConfig::default());
    let code = conn
        .run(&mut AutoAnswer::default(), |s| s.connect(server))
        .await;
    assert!(code.is_error());
    assert!(code.is_disconnected());
    assert!(!conn.socket().is_connected());
}

/// Answers like the SFTP worker logged in to a server whose home holds one
/// file.
#[cfg(unix)]
const WORKER_SCRIPT: &str = r#"#!/bin/sh
echo "0fzSftp started, protocol_version=11"
while read -r line; do
  case "$line" in
    -*) ;;
    pwd|cd*) echo "0/home/bob"; echo "10" ;;
    ls*)
      echo "6-rw-r--r--    1 bob  bob  1024 Jan 01 2020 file.txt"
      echo "1700000000"
      echo "file.txt"
      echo "10" ;;
    *) echo "10" ;;
  esac
done
"#;

#[cfg(unix)]
fn worker_config(dir: &std::path::Path, script: &str) -> EngineConfig {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("worker.sh");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    let mut config = EngineConfig::default();
    config.sftp.worker_path = path;
    config
}

#[cfg(unix)]
#[tokio::test]
async fn test_sftp_session_with_worker_process() {
    let dir = tempfile::tempdir().unwrap();
    let config = worker_config(dir.path(), WORKER_SCRIPT);
    let ctx = SessionContext::new();
    let server = Server::new(Protocol::Sftp, "sftp.example.org", 22).with_credentials("bob", "");
    let mut conn = SftpConnection::new(ctx.clone(), &config);
    let mut handler = AutoAnswer::default();

    let code = conn.run(&mut handler, |s| s.connect(server.clone())).await;
    assert_eq!(code, ReplyCode::Ok);
    assert!(conn.socket().is_logged_on());

    let code = conn
        .run(&mut handler, |s| s.list(unix("/home/bob"), "", ListFlags::default()))
        .await;
    assert_eq!(code, ReplyCode::Ok);
    let (listing, _) = ctx.cache.lookup(&server, &unix("/home/bob"), false).unwrap();
    assert_eq!(listing.entries()[0].name, "file.txt");
}

#[cfg(unix)]
#[tokio::test]
async fn test_sftp_worker_exit_fails_connect() {
    let dir = tempfile::tempdir().unwrap();
    let config = worker_config(dir.path(), "#!/bin/sh\nexit 0\n");
    let server = Server::new(Protocol::Sftp, "sftp.example.org", 22);
    let mut conn = SftpConnection::new(SessionContext::new(), &config);
    let code = conn
        .run(&mut AutoAnswer::default(), |s| s.connect(server))
        .await;
    assert!(code.is_error());
    assert!(!conn.socket().is_connected());
}
