use crate::config::EngineConfig;
use crate::core_engine::timezone::format_timeval;
use crate::core_engine::{
    AsyncReply, AsyncRequest, ControlSocket, DataTask, FileExistsAction, ListFlags, Notification,
    Outbound, SessionContext, TransferCommand, TransferEndReason,
};
use crate::core_error::ReplyCode;
use crate::core_ftpcommand::FtpControlSocket;
use crate::core_listing::DirectoryListingParser;
use crate::core_server::{Capability, CapabilityValue, Protocol, Server, ServerPath, ServerType};
use chrono::{Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use std::net::SocketAddr;
use std::path::PathBuf;

const FEATURES: &str = "211-Features:\r\n MDTM\r\n SIZE\r\n UTF8\r\n211 End";
const LISTING: &str = "-rw-r--r-- 1 user group 1024 Jan 01 2020 file.txt\r\n";

fn server() -> Server {
    Server::new(Protocol::InsecureFtp, "ftp.example.org", 21).with_credentials("bob", "secret")
}

fn unix(path: &str) -> ServerPath {
    ServerPath::parse(path, ServerType::Unix).unwrap()
}

fn reply(sock: &mut FtpControlSocket, text: &str) {
    sock.on_control_data(format!("{}\r\n", text).as_bytes());
}

/// Drains the commands the socket put on the wire.
fn sent(sock: &mut FtpControlSocket) -> Vec<String> {
    sock.drain_outbound()
        .into_iter()
        .filter_map(|action| match action {
            Outbound::Send(bytes) => Some(
                String::from_utf8_lossy(&bytes)
                    .trim_end_matches("\r\n")
                    .to_string(),
            ),
            _ => None,
        })
        .collect()
}

fn finished(notifications: &[Notification]) -> Vec<ReplyCode> {
    notifications
        .iter()
        .filter_map(|n| match n {
            Notification::OperationFinished(code) => Some(*code),
            _ => None,
        })
        .collect()
}

fn requests(notifications: &[Notification]) -> Vec<(u64, AsyncRequest)> {
    notifications
        .iter()
        .filter_map(|n| match n {
            Notification::AsyncRequest { id, request } => Some((*id, request.clone())),
            _ => None,
        })
        .collect()
}

/// Answers every command like a small Unix FTP server would.
struct FakeServer {
    cwd: String,
    features: String,
    listing: String,
    hidden_listing: Option<String>,
    missing: Vec<String>,
    mdtm: Option<String>,
    /// Size of every remote file, `None` if none exists.
    size: Option<u64>,
    rest: u64,
    ignore_rest: bool,
    /// Fixed answers that win over the normal handling of a verb.
    overrides: Vec<(&'static str, &'static str)>,
    log: Vec<String>,
    /// Everything but commands the socket asked the driver to do.
    actions: Vec<Outbound>,
}

impl FakeServer {
    fn new() -> Self {
        Self {
            cwd: "/".to_string(),
            features: FEATURES.to_string(),
            listing: LISTING.to_string(),
            hidden_listing: None,
            missing: Vec::new(),
            mdtm: None,
            size: Some(1024),
            rest: 0,
            ignore_rest: false,
            overrides: Vec::new(),
            log: Vec::new(),
            actions: Vec::new(),
        }
    }

    fn handle(&mut self, sock: &mut FtpControlSocket, command: &str) {
        let (verb, arg) = command.split_once(' ').unwrap_or((command, ""));
        if let Some((_, answer)) = self.overrides.iter().find(|(v, _)| *v == verb) {
            reply(sock, answer);
            return;
        }
        match verb {
            "USER" => reply(sock, "331 Password required"),
            "PASS" => reply(sock, "230 Logged in"),
            "SYST" => reply(sock, "215 UNIX Type: L8"),
            "FEAT" => {
                let features = self.features.clone();
                reply(sock, &features)
            }
            "OPTS" | "TYPE" | "NOOP" => reply(sock, "200 OK"),
            "PWD" => {
                let text = format!("257 \"{}\" is the current directory", self.cwd);
                reply(sock, &text)
            }
            "CWD" => {
                let target = if arg.starts_with('/') {
                    arg.to_string()
                } else {
                    format!("{}/{}", self.cwd.trim_end_matches('/'), arg)
                };
                if self.missing.contains(&target) {
                    reply(sock, "550 No such directory")
                } else {
                    self.cwd = target;
                    reply(sock, "250 Directory changed")
                }
            }
            "MKD" => {
                let target = if arg.starts_with('/') {
                    arg.to_string()
                } else {
                    format!("{}/{}", self.cwd.trim_end_matches('/'), arg)
                };
                self.missing.retain(|m| *m != target);
                reply(sock, "257 Created")
            }
            "PASV" => reply(sock, "227 Entering Passive Mode (203,0,113,5,19,137)"),
            "LIST" | "MLSD" => {
                let data = match (&self.hidden_listing, arg) {
                    (Some(hidden), "-a") => hidden.clone(),
                    _ => self.listing.clone(),
                };
                reply(sock, "150 Opening data connection");
                sock.on_listing_data(data.as_bytes());
                sock.on_transfer_end(TransferEndReason::Successful, data.len() as u64);
                reply(sock, "226 Transfer complete")
            }
            "MDTM" => match self.mdtm.clone() {
                Some(time) => reply(sock, &format!("213 {}", time)),
                None => reply(sock, "550 Not available"),
            },
            "SIZE" => match self.size {
                Some(size) => reply(sock, &format!("213 {}", size)),
                None => reply(sock, "550 No such file"),
            },
            "REST" => {
                self.rest = arg.parse().unwrap();
                reply(sock, "350 Restarting")
            }
            "RETR" => {
                let size = self.size.unwrap_or(0);
                let bytes = if self.ignore_rest { size } else { size - self.rest };
                self.rest = 0;
                reply(sock, "150 Opening data connection");
                sock.on_transfer_end(TransferEndReason::Successful, bytes);
                reply(sock, "226 Transfer complete")
            }
            "STOR" | "APPE" => {
                reply(sock, "150 Opening data connection");
                sock.on_transfer_end(TransferEndReason::Successful, 5);
                reply(sock, "226 Transfer complete")
            }
            "PORT" | "EPRT" => reply(sock, "200 PORT command successful"),
            "MFMT" => reply(sock, "213 Modified"),
            "SITE" => reply(sock, "200 SITE command successful"),
            "RMD" => reply(sock, "250 Directory removed"),
            _ => reply(sock, "500 Unknown command"),
        }
    }

    /// Keeps answering until the socket stops asking for anything. An
    /// active mode listener is reported ready right away.
    fn run(&mut self, sock: &mut FtpControlSocket) {
        loop {
            let actions = sock.drain_outbound();
            if actions.is_empty() {
                return;
            }
            for action in actions {
                match action {
                    Outbound::Send(bytes) => {
                        let command = String::from_utf8_lossy(&bytes)
                            .trim_end_matches("\r\n")
                            .to_string();
                        self.log.push(command.clone());
                        self.handle(sock, &command);
                    }
                    Outbound::ListenForData { ip, task } => {
                        self.actions.push(Outbound::ListenForData { ip, task });
                        sock.on_data_listening(SocketAddr::new(ip, 50000));
                    }
                    other => self.actions.push(other),
                }
            }
        }
    }

    /// The task of the last data connection the socket asked for.
    fn last_data_task(&self) -> Option<DataTask> {
        self.actions.iter().rev().find_map(|action| match action {
            Outbound::OpenDataConnection { task, .. } | Outbound::ListenForData { task, .. } => {
                Some(task.clone())
            }
            _ => None,
        })
    }

    fn discarded(&self) -> Vec<PathBuf> {
        self.actions
            .iter()
            .filter_map(|action| match action {
                Outbound::DiscardLocalFile(path) => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    fn take_log(&mut self) -> Vec<String> {
        std::mem::take(&mut self.log)
    }
}

fn connect(sock: &mut FtpControlSocket, server: Server) {
    assert_eq!(sock.connect(server), ReplyCode::WouldBlock);
    let local: SocketAddr = "192.168.1.2:40000".parse().unwrap();
    let peer: SocketAddr = "203.0.113.5:21".parse().unwrap();
    sock.on_connected(local, peer);
}

fn logged_in(ctx: SessionContext, config: &EngineConfig, fake: &mut FakeServer) -> FtpControlSocket {
    let mut sock = FtpControlSocket::new(ctx, config);
    connect(&mut sock, server());
    reply(&mut sock, "220 Welcome");
    fake.run(&mut sock);
    assert!(sock.is_logged_on());
    sock.drain_notifications();
    fake.take_log();
    sock
}

#[test]
fn test_login_reports_exactly_one_result() {
    let mut fake = FakeServer::new();
    let mut sock = FtpControlSocket::new(SessionContext::new(), &EngineConfig::default());
    connect(&mut sock, server());
    reply(&mut sock, "220 Welcome");
    fake.run(&mut sock);

    assert_eq!(
        fake.take_log(),
        vec!["USER bob", "PASS secret", "SYST", "FEAT", "OPTS UTF8 ON"]
    );
    assert!(sock.is_logged_on());
    assert_eq!(finished(&sock.drain_notifications()), vec![ReplyCode::Ok]);
    assert_eq!(sock.pending_replies(), 0);
}

#[test]
fn test_second_login_uses_cached_capabilities() {
    let ctx = SessionContext::new();
    let config = EngineConfig::default();
    let mut fake = FakeServer::new();
    let _first = logged_in(ctx.clone(), &config, &mut fake);

    let mut second = FtpControlSocket::new(ctx, &config);
    connect(&mut second, server());
    reply(&mut second, "220 Welcome");
    fake.run(&mut second);
    assert_eq!(fake.take_log(), vec!["USER bob", "PASS secret", "OPTS UTF8 ON"]);
    assert!(second.is_logged_on());
}

#[test]
fn test_welcome_refused_closes_connection() {
    let mut sock = FtpControlSocket::new(SessionContext::new(), &EngineConfig::default());
    connect(&mut sock, server());
    sock.drain_outbound();
    reply(&mut sock, "421 Too many connections");

    let codes = finished(&sock.drain_notifications());
    assert_eq!(codes.len(), 1);
    assert!(codes[0].is_critical());
    assert!(!sock.is_connected());
    assert!(sock.drain_outbound().contains(&Outbound::Disconnect));
}

#[test]
fn test_unsolicited_reply_is_fatal() {
    let ctx = SessionContext::new();
    let mut fake = FakeServer::new();
    let mut sock = logged_in(ctx, &EngineConfig::default(), &mut fake);
    reply(&mut sock, "200 Nobody asked");
    assert!(!sock.is_connected());
}

#[test]
fn test_failed_cwd_fails_listing() {
    let mut fake = FakeServer::new();
    fake.missing.push("/pub".to_string());
    let mut sock = logged_in(SessionContext::new(), &EngineConfig::default(), &mut fake);

    assert_eq!(
        sock.list(unix("/pub"), "", ListFlags::default()),
        ReplyCode::WouldBlock
    );
    fake.run(&mut sock);
    assert_eq!(fake.take_log(), vec!["CWD /pub"]);

    let notifications = sock.drain_notifications();
    assert!(notifications.contains(&Notification::DirectoryListing {
        path: unix("/pub"),
        primary: true,
        failed: true,
    }));
    let codes = finished(&notifications);
    assert_eq!(codes.len(), 1);
    assert!(codes[0].is_error() && !codes[0].is_critical());
    assert!(sock.is_connected());
    assert!(!sock.is_busy());
}

#[test]
fn test_listing_is_stored_and_served_from_cache() {
    let ctx = SessionContext::new();
    let mut fake = FakeServer::new();
    let mut sock = logged_in(ctx.clone(), &EngineConfig::default(), &mut fake);

    sock.list(unix("/pub"), "", ListFlags::default());
    fake.run(&mut sock);
    assert_eq!(
        fake.take_log(),
        vec!["CWD /pub", "PWD", "TYPE A", "PASV", "LIST"]
    );
    assert_eq!(finished(&sock.drain_notifications()), vec![ReplyCode::Ok]);
    assert_eq!(sock.current_path(), &unix("/pub"));

    let (listing, outdated) = ctx.cache.lookup(&server(), &unix("/pub"), false).unwrap();
    assert!(!outdated);
    assert_eq!(listing.entries()[0].name, "file.txt");

    // A second request never reaches the server.
    assert_eq!(sock.list(unix("/pub"), "", ListFlags::default()), ReplyCode::Ok);
    assert!(sent(&mut sock).is_empty());
}

#[test]
fn test_private_passive_address_is_replaced_by_peer() {
    let mut fake = FakeServer::new();
    let mut sock = logged_in(SessionContext::new(), &EngineConfig::default(), &mut fake);

    sock.list(unix("/pub"), "", ListFlags::default());
    for (command, answer) in [
        ("CWD /pub", "250 OK"),
        ("PWD", "257 \"/pub\""),
        ("TYPE A", "200 OK"),
        ("PASV", "227 Entering Passive Mode (127,0,0,1,19,137)"),
    ] {
        assert_eq!(sent(&mut sock), vec![command]);
        reply(&mut sock, answer);
    }

    let outbound = sock.drain_outbound();
    let opened = outbound.iter().find_map(|action| match action {
        Outbound::OpenDataConnection { addr, .. } => Some(*addr),
        _ => None,
    });
    assert_eq!(opened, Some("203.0.113.5:5001".parse().unwrap()));
    assert!(outbound.contains(&Outbound::Send(b"LIST\r\n".to_vec())));
}

#[test]
fn test_replies_of_canceled_commands_are_skipped() {
    let mut fake = FakeServer::new();
    let mut sock = logged_in(SessionContext::new(), &EngineConfig::default(), &mut fake);

    sock.list(unix("/pub"), "", ListFlags::default());
    assert_eq!(sent(&mut sock), vec!["CWD /pub"]);
    sock.cancel();
    let codes = finished(&sock.drain_notifications());
    assert_eq!(codes.len(), 1);
    assert!(codes[0].is_canceled());
    assert_eq!(sock.replies_to_skip(), 1);

    // The next command waits until the stale reply is in.
    assert_eq!(sock.raw_command("NOOP"), ReplyCode::WouldBlock);
    assert!(sent(&mut sock).is_empty());

    reply(&mut sock, "250 Directory changed");
    assert_eq!(sock.replies_to_skip(), 0);
    assert_eq!(sent(&mut sock), vec!["NOOP"]);
    reply(&mut sock, "200 OK");
    assert_eq!(finished(&sock.drain_notifications()), vec![ReplyCode::Ok]);
    assert!(sock.is_connected());
}

#[test]
fn test_keepalive_reply_is_skipped() {
    let mut config = EngineConfig::default();
    config.engine.keepalive_interval_secs = 0;
    let mut fake = FakeServer::new();
    let mut sock = logged_in(SessionContext::new(), &config, &mut fake);

    sock.on_keepalive_timer(std::time::Instant::now());
    let commands = sent(&mut sock);
    assert_eq!(commands.len(), 1);
    assert!(["NOOP", "PWD", "TYPE I"].contains(&commands[0].as_str()));
    assert_eq!(sock.replies_to_skip(), 1);

    reply(&mut sock, "200 OK");
    assert_eq!(sock.replies_to_skip(), 0);
    assert!(sock.is_connected());
    assert!(finished(&sock.drain_notifications()).is_empty());
}

#[test]
fn test_list_hidden_support_detection() {
    let mut config = EngineConfig::default();
    config.engine.view_hidden_files = true;
    let ctx = SessionContext::new();
    let mut fake = FakeServer::new();
    fake.hidden_listing = Some(format!(
        "{}-rw-r--r-- 1 user group 10 Jan 01 2020 .profile\r\n",
        LISTING
    ));
    let mut sock = logged_in(ctx.clone(), &config, &mut fake);

    sock.list(unix("/pub"), "", ListFlags::default());
    fake.run(&mut sock);
    assert_eq!(
        fake.take_log(),
        vec!["CWD /pub", "PWD", "TYPE A", "PASV", "LIST", "PASV", "LIST -a"]
    );
    assert_eq!(
        ctx.capabilities().get(&server(), Capability::ListHiddenSupport),
        CapabilityValue::Yes
    );
    let (listing, _) = ctx.cache.lookup(&server(), &unix("/pub"), false).unwrap();
    assert_eq!(listing.len(), 2);

    // Known support goes straight to LIST -a.
    sock.list(unix("/pub"), "", ListFlags { refresh: true, ..Default::default() });
    fake.run(&mut sock);
    assert_eq!(fake.take_log(), vec!["PASV", "LIST -a"]);
}

#[test]
fn test_list_hidden_without_extra_entries_is_unsupported() {
    let mut config = EngineConfig::default();
    config.engine.view_hidden_files = true;
    let ctx = SessionContext::new();
    let mut fake = FakeServer::new();
    fake.hidden_listing = Some(LISTING.to_string());
    let mut sock = logged_in(ctx.clone(), &config, &mut fake);

    sock.list(unix("/pub"), "", ListFlags::default());
    fake.run(&mut sock);
    assert_eq!(
        ctx.capabilities().get(&server(), Capability::ListHiddenSupport),
        CapabilityValue::No
    );
}

#[test]
fn test_timezone_offset_detected_with_mdtm() {
    let line = "-rw-r--r-- 1 user group 1024 Jan 01 12:00 recent.txt";
    let listed = DirectoryListingParser::new()
        .parse_line(line)
        .and_then(|entry| entry.time)
        .unwrap();
    let exact = listed.time + Duration::minutes(120);

    let ctx = SessionContext::new();
    let mut fake = FakeServer::new();
    fake.listing = format!("{}\r\n", line);
    fake.mdtm = Some(format_timeval(exact));
    let mut sock = logged_in(ctx.clone(), &EngineConfig::default(), &mut fake);

    sock.list(unix("/pub"), "", ListFlags::default());
    fake.run(&mut sock);
    assert_eq!(fake.take_log().last().map(String::as_str), Some("MDTM recent.txt"));

    let (value, offset) = ctx
        .capabilities()
        .get_number(&server(), Capability::TimezoneOffset);
    assert_eq!(value, CapabilityValue::Yes);
    assert_eq!(offset, Some(120));

    let (listing, _) = ctx.cache.lookup(&server(), &unix("/pub"), false).unwrap();
    assert_eq!(listing.entries()[0].time.map(|t| t.time), Some(exact));
}

#[test]
fn test_charset_fallback_is_tried_once() {
    let mut sock = FtpControlSocket::new(SessionContext::new(), &EngineConfig::default());
    connect(
        &mut sock,
        Server::new(Protocol::InsecureFtp, "ftp.example.org", 21).with_credentials("jörg", "pässword"),
    );
    sock.drain_outbound();
    reply(&mut sock, "220 Welcome");

    let mut users = Vec::new();
    loop {
        let outbound = sock.drain_outbound();
        let Some(Outbound::Send(line)) = outbound.into_iter().find(|a| matches!(a, Outbound::Send(_)))
        else {
            break;
        };
        if line.starts_with(b"USER") {
            users.push(line);
            reply(&mut sock, "331 Password required");
        } else {
            reply(&mut sock, "530 Login incorrect");
        }
    }

    assert_eq!(users.len(), 2);
    assert_eq!(users[0], "USER jörg\r\n".as_bytes());
    assert_eq!(users[1], b"USER j\xf6rg\r\n");

    let codes = finished(&sock.drain_notifications());
    assert_eq!(codes.len(), 1);
    assert!(codes[0].is_critical() && codes[0].is_password_failed());
    assert!(!sock.is_connected());
}

#[test]
fn test_listing_lock_shared_between_sockets() {
    let ctx = SessionContext::new();
    let config = EngineConfig::default();
    let mut fake_a = FakeServer::new();
    let mut fake_b = FakeServer::new();
    let mut a = logged_in(ctx.clone(), &config, &mut fake_a);
    let mut b = logged_in(ctx.clone(), &config, &mut fake_b);

    a.list(unix("/pub"), "", ListFlags::default());
    for (command, answer) in [("CWD /pub", "250 OK"), ("PWD", "257 \"/pub\"")] {
        assert_eq!(sent(&mut a), vec![command]);
        reply(&mut a, answer);
    }
    assert_eq!(sent(&mut a), vec!["TYPE A"]);

    b.list(unix("/pub"), "", ListFlags::default());
    fake_b.run(&mut b);
    assert_eq!(fake_b.take_log(), vec!["CWD /pub", "PWD"]);
    assert!(b.is_busy());

    reply(&mut a, "200 OK");
    fake_a.run(&mut a);
    let woken = a.drain_notifications().into_iter().find_map(|n| match n {
        Notification::LocksReleased(ids) => Some(ids),
        _ => None,
    });
    assert_eq!(woken, Some(vec![b.socket_id()]));

    b.on_lock_available();
    assert!(sent(&mut b).is_empty());
    let notifications = b.drain_notifications();
    assert!(notifications.contains(&Notification::DirectoryListing {
        path: unix("/pub"),
        primary: true,
        failed: false,
    }));
    assert_eq!(finished(&notifications), vec![ReplyCode::Ok]);
}

#[test]
fn test_path_cache_skips_pwd() {
    let mut fake = FakeServer::new();
    let mut sock = logged_in(SessionContext::new(), &EngineConfig::default(), &mut fake);

    sock.list(unix("/pub"), "incoming", ListFlags::default());
    fake.run(&mut sock);
    assert_eq!(
        fake.take_log(),
        vec!["CWD /pub", "PWD", "CWD /pub/incoming", "PWD", "TYPE A", "PASV", "LIST"]
    );
    sock.list(unix("/"), "", ListFlags::default());
    fake.run(&mut sock);
    fake.take_log();

    let refresh = ListFlags {
        refresh: true,
        ..Default::default()
    };
    sock.list(unix("/pub"), "incoming", refresh);
    fake.run(&mut sock);
    assert_eq!(fake.take_log(), vec!["CWD /pub/incoming", "PASV", "LIST"]);
    assert_eq!(sock.current_path(), &unix("/pub/incoming"));
}

#[test]
fn test_mkdir_creates_missing_segments() {
    let ctx = SessionContext::new();
    let mut fake = FakeServer::new();
    fake.missing = vec!["/pub/a".to_string(), "/pub/a/b".to_string()];
    let mut sock = logged_in(ctx, &EngineConfig::default(), &mut fake);

    assert_eq!(sock.mkdir(unix("/pub/a/b")), ReplyCode::WouldBlock);
    fake.run(&mut sock);
    assert_eq!(
        fake.take_log(),
        vec!["CWD /pub/a/b", "CWD /pub/a", "CWD /pub", "MKD a", "CWD a", "MKD b", "CWD b"]
    );
    let notifications = sock.drain_notifications();
    assert_eq!(finished(&notifications), vec![ReplyCode::Ok]);
    assert!(notifications.contains(&Notification::DirectoryListing {
        path: unix("/pub/a"),
        primary: false,
        failed: false,
    }));
    assert_eq!(sock.current_path(), &unix("/pub/a/b"));
}

#[test]
fn test_rename_updates_cache() {
    let ctx = SessionContext::new();
    let mut fake = FakeServer::new();
    let mut sock = logged_in(ctx.clone(), &EngineConfig::default(), &mut fake);
    sock.list(unix("/pub"), "", ListFlags::default());
    fake.run(&mut sock);
    fake.take_log();
    sock.drain_notifications();

    sock.rename(unix("/pub"), "file.txt", unix("/pub"), "renamed.txt");
    assert_eq!(sent(&mut sock), vec!["RNFR file.txt"]);
    reply(&mut sock, "350 Ready for destination");
    assert_eq!(sent(&mut sock), vec!["RNTO renamed.txt"]);
    reply(&mut sock, "250 Renamed");
    assert_eq!(finished(&sock.drain_notifications()), vec![ReplyCode::Ok]);

    let (listing, _) = ctx.cache.lookup(&server(), &unix("/pub"), true).unwrap();
    assert!(listing.find("renamed.txt").is_some());
    assert!(listing.find("file.txt").is_none());
}

#[test]
fn test_delete_reports_partial_failure() {
    let ctx = SessionContext::new();
    let mut fake = FakeServer::new();
    let mut sock = logged_in(ctx, &EngineConfig::default(), &mut fake);

    sock.delete(unix("/pub"), vec!["a".to_string(), "b".to_string()]);
    for (command, answer) in [
        ("CWD /pub", "250 OK"),
        ("PWD", "257 \"/pub\""),
        ("DELE a", "250 Deleted"),
        ("DELE b", "550 Permission denied"),
    ] {
        assert_eq!(sent(&mut sock), vec![command]);
        reply(&mut sock, answer);
    }
    let codes = finished(&sock.drain_notifications());
    assert_eq!(codes.len(), 1);
    assert!(codes[0].is_error());
}

#[test]
fn test_operation_requires_login() {
    let mut sock = FtpControlSocket::new(SessionContext::new(), &EngineConfig::default());
    assert!(sock.list(unix("/"), "", ListFlags::default()).is_error());
    assert!(sock.raw_command("NOOP").is_error());
}

#[test]
fn test_cached_listing_finishes_without_notification() {
    let ctx = SessionContext::new();
    let mut fake = FakeServer::new();
    let mut sock = logged_in(ctx, &EngineConfig::default(), &mut fake);
    sock.list(unix("/pub"), "", ListFlags::default());
    fake.run(&mut sock);
    sock.drain_notifications();

    assert_eq!(sock.list(unix("/pub"), "", ListFlags::default()), ReplyCode::Ok);
    let notifications = sock.drain_notifications();
    assert!(finished(&notifications).is_empty());
    assert!(notifications.contains(&Notification::DirectoryListing {
        path: unix("/pub"),
        primary: true,
        failed: false,
    }));
}

fn download(local_size: Option<u64>) -> TransferCommand {
    TransferCommand {
        download: true,
        local_path: PathBuf::from("/tmp/file.txt"),
        local_size,
        local_time: None,
        remote_path: unix("/pub"),
        remote_file: "file.txt".to_string(),
    }
}

/// Answers the file exists question the socket is waiting on.
fn answer_file_exists(sock: &mut FtpControlSocket, action: FileExistsAction) {
    let asked = requests(&sock.drain_notifications());
    let [(id, AsyncRequest::FileExists(_))] = asked.as_slice() else {
        panic!("expected a file exists request, got {:?}", asked);
    };
    sock.set_async_request_reply(*id, AsyncReply::FileExists(action));
}

#[test]
fn test_download_into_new_file() {
    let mut fake = FakeServer::new();
    let mut sock = logged_in(SessionContext::new(), &EngineConfig::default(), &mut fake);

    assert_eq!(sock.file_transfer(download(None)), ReplyCode::WouldBlock);
    fake.run(&mut sock);
    assert_eq!(
        fake.take_log(),
        vec!["CWD /pub", "PWD", "SIZE file.txt", "TYPE A", "PASV", "RETR file.txt"]
    );
    assert_eq!(
        fake.last_data_task(),
        Some(DataTask::Download {
            local_path: PathBuf::from("/tmp/file.txt"),
            offset: 0
        })
    );
    assert_eq!(finished(&sock.drain_notifications()), vec![ReplyCode::Ok]);
    assert!(fake.discarded().is_empty());
    assert!(!sock.is_busy());
}

#[test]
fn test_upload_sets_remote_time_with_mfmt() {
    let mut config = EngineConfig::default();
    config.engine.preserve_timestamps = true;
    let mut fake = FakeServer::new();
    fake.features = "211-Features:\r\n MDTM\r\n MFMT\r\n SIZE\r\n UTF8\r\n211 End".to_string();
    fake.size = None;
    let mut sock = logged_in(SessionContext::new(), &config, &mut fake);

    let time = Utc.with_ymd_and_hms(2020, 9, 13, 12, 26, 40).unwrap();
    sock.file_transfer(TransferCommand {
        download: false,
        local_path: PathBuf::from("/tmp/image.bin"),
        local_size: Some(5),
        local_time: Some(time),
        remote_path: unix("/pub"),
        remote_file: "image.bin".to_string(),
    });
    fake.run(&mut sock);

    let mfmt = format!("MFMT {} image.bin", format_timeval(time));
    assert_eq!(
        fake.take_log(),
        vec!["CWD /pub", "PWD", "SIZE image.bin", "TYPE I", "PASV", "STOR image.bin", mfmt.as_str()]
    );
    assert_eq!(
        fake.last_data_task(),
        Some(DataTask::Upload {
            local_path: PathBuf::from("/tmp/image.bin"),
            offset: 0
        })
    );
    let notifications = sock.drain_notifications();
    assert_eq!(finished(&notifications), vec![ReplyCode::Ok]);
    assert!(notifications.contains(&Notification::DirectoryListing {
        path: unix("/pub"),
        primary: false,
        failed: false,
    }));
}

#[test]
fn test_failed_overwrite_keeps_existing_local_file() {
    let mut fake = FakeServer::new();
    fake.overrides.push(("RETR", "550 Permission denied"));
    let mut sock = logged_in(SessionContext::new(), &EngineConfig::default(), &mut fake);

    sock.file_transfer(download(Some(100)));
    fake.run(&mut sock);
    assert_eq!(
        fake.take_log(),
        vec!["CWD /pub", "PWD", "SIZE file.txt", "MDTM file.txt"]
    );
    answer_file_exists(&mut sock, FileExistsAction::Overwrite);
    fake.run(&mut sock);
    assert_eq!(fake.take_log(), vec!["TYPE A", "PASV", "RETR file.txt"]);

    let codes = finished(&sock.drain_notifications());
    assert_eq!(codes.len(), 1);
    assert!(codes[0].is_error());
    assert!(fake.actions.contains(&Outbound::CloseData));
    assert!(fake.discarded().is_empty());
}

#[test]
fn test_failed_download_discards_new_empty_file() {
    let mut fake = FakeServer::new();
    fake.overrides.push(("RETR", "550 Permission denied"));
    let mut sock = logged_in(SessionContext::new(), &EngineConfig::default(), &mut fake);

    sock.file_transfer(download(None));
    fake.run(&mut sock);
    assert!(finished(&sock.drain_notifications())[0].is_error());
    assert_eq!(fake.discarded(), vec![PathBuf::from("/tmp/file.txt")]);
}

#[test]
fn test_file_exists_resume_restarts_at_local_size() {
    let mut fake = FakeServer::new();
    let mut sock = logged_in(SessionContext::new(), &EngineConfig::default(), &mut fake);

    sock.file_transfer(download(Some(100)));
    fake.run(&mut sock);
    fake.take_log();
    answer_file_exists(&mut sock, FileExistsAction::Resume);
    fake.run(&mut sock);

    assert_eq!(
        fake.take_log(),
        vec!["TYPE A", "PASV", "REST 100", "RETR file.txt"]
    );
    assert_eq!(
        fake.last_data_task(),
        Some(DataTask::Download {
            local_path: PathBuf::from("/tmp/file.txt"),
            offset: 100
        })
    );
    assert_eq!(finished(&sock.drain_notifications()), vec![ReplyCode::Ok]);
}

#[test]
fn test_file_exists_rename_downloads_under_new_name() {
    let mut fake = FakeServer::new();
    let mut sock = logged_in(SessionContext::new(), &EngineConfig::default(), &mut fake);

    sock.file_transfer(download(Some(100)));
    fake.run(&mut sock);
    fake.take_log();
    answer_file_exists(&mut sock, FileExistsAction::Rename("file-1.txt".to_string()));
    fake.run(&mut sock);

    assert_eq!(fake.take_log(), vec!["TYPE A", "PASV", "RETR file.txt"]);
    assert_eq!(
        fake.last_data_task(),
        Some(DataTask::Download {
            local_path: PathBuf::from("/tmp/file-1.txt"),
            offset: 0
        })
    );
    assert_eq!(finished(&sock.drain_notifications()), vec![ReplyCode::Ok]);
}

#[test]
fn test_file_exists_skip_and_complete_resume_transfer_nothing() {
    let mut fake = FakeServer::new();
    let mut sock = logged_in(SessionContext::new(), &EngineConfig::default(), &mut fake);

    sock.file_transfer(download(Some(100)));
    fake.run(&mut sock);
    fake.take_log();
    answer_file_exists(&mut sock, FileExistsAction::Skip);
    fake.run(&mut sock);
    assert!(fake.take_log().is_empty());
    assert_eq!(finished(&sock.drain_notifications()), vec![ReplyCode::Ok]);

    // The local file already has the remote size.
    sock.file_transfer(download(Some(1024)));
    fake.run(&mut sock);
    fake.take_log();
    answer_file_exists(&mut sock, FileExistsAction::Resume);
    fake.run(&mut sock);
    assert!(fake.take_log().is_empty());
    assert_eq!(finished(&sock.drain_notifications()), vec![ReplyCode::Ok]);
    assert_eq!(fake.last_data_task(), None);
}

#[test]
fn test_known_large_file_resume_bug() {
    const LARGE: u64 = 5_000_000_000;
    let ctx = SessionContext::new();
    let mut fake = FakeServer::new();
    fake.size = Some(LARGE);
    let mut sock = logged_in(ctx.clone(), &EngineConfig::default(), &mut fake);
    ctx.capabilities()
        .set(&server(), Capability::Resume4GbBug, CapabilityValue::Yes);

    // Equal sizes mean the download is complete.
    sock.file_transfer(download(Some(LARGE)));
    fake.run(&mut sock);
    fake.take_log();
    answer_file_exists(&mut sock, FileExistsAction::Resume);
    fake.run(&mut sock);
    assert!(fake.take_log().is_empty());
    assert_eq!(finished(&sock.drain_notifications()), vec![ReplyCode::Ok]);

    // Anything else cannot be resumed on this server.
    sock.file_transfer(download(Some(LARGE - 10)));
    fake.run(&mut sock);
    fake.take_log();
    answer_file_exists(&mut sock, FileExistsAction::Resume);
    fake.run(&mut sock);
    assert!(fake.take_log().is_empty());
    let codes = finished(&sock.drain_notifications());
    assert_eq!(codes.len(), 1);
    assert!(codes[0].is_critical());
    assert!(fake.discarded().is_empty());
}

const PARTIAL: u64 = 3 << 30;

#[test]
fn test_resume_check_reads_exactly_one_byte() {
    let ctx = SessionContext::new();
    let mut fake = FakeServer::new();
    fake.size = Some(PARTIAL + 1);
    let mut sock = logged_in(ctx.clone(), &EngineConfig::default(), &mut fake);

    sock.file_transfer(download(Some(PARTIAL)));
    fake.run(&mut sock);
    fake.take_log();
    answer_file_exists(&mut sock, FileExistsAction::Resume);
    fake.run(&mut sock);

    let rest = format!("REST {}", PARTIAL);
    assert_eq!(
        fake.take_log(),
        vec![
            "TYPE I",
            "PASV",
            rest.as_str(),
            "RETR file.txt",
            "TYPE A",
            "PASV",
            rest.as_str(),
            "RETR file.txt"
        ]
    );
    assert_eq!(
        ctx.capabilities().get(&server(), Capability::Resume2GbBug),
        CapabilityValue::No
    );
    assert_eq!(finished(&sock.drain_notifications()), vec![ReplyCode::Ok]);
}

#[test]
fn test_resume_check_detects_broken_server() {
    let ctx = SessionContext::new();
    let mut fake = FakeServer::new();
    fake.size = Some(PARTIAL + 1);
    fake.ignore_rest = true;
    let mut sock = logged_in(ctx.clone(), &EngineConfig::default(), &mut fake);

    sock.file_transfer(download(Some(PARTIAL)));
    fake.run(&mut sock);
    fake.take_log();
    answer_file_exists(&mut sock, FileExistsAction::Resume);
    fake.run(&mut sock);

    let rest = format!("REST {}", PARTIAL);
    assert_eq!(
        fake.take_log(),
        vec!["TYPE I", "PASV", rest.as_str(), "RETR file.txt"]
    );
    assert_eq!(
        ctx.capabilities().get(&server(), Capability::Resume2GbBug),
        CapabilityValue::Yes
    );
    let codes = finished(&sock.drain_notifications());
    assert_eq!(codes.len(), 1);
    assert!(codes[0].is_critical());
}

#[test]
fn test_refused_passive_mode_falls_back_to_active() {
    let mut fake = FakeServer::new();
    fake.overrides.push(("PASV", "500 Passive mode refused"));
    let mut sock = logged_in(SessionContext::new(), &EngineConfig::default(), &mut fake);

    sock.file_transfer(download(None));
    fake.run(&mut sock);
    assert_eq!(
        fake.take_log(),
        vec![
            "CWD /pub",
            "PWD",
            "SIZE file.txt",
            "TYPE A",
            "PASV",
            "PORT 192,168,1,2,195,80",
            "RETR file.txt"
        ]
    );
    assert!(fake.actions.iter().any(|action| matches!(
        action,
        Outbound::ListenForData { ip, .. } if ip.to_string() == "192.168.1.2"
    )));
    assert_eq!(finished(&sock.drain_notifications()), vec![ReplyCode::Ok]);
}

#[test]
fn test_refused_active_mode_falls_back_to_passive() {
    let mut config = EngineConfig::default();
    config.engine.use_passive = false;
    let mut fake = FakeServer::new();
    fake.overrides.push(("PORT", "500 Illegal PORT command"));
    let mut sock = logged_in(SessionContext::new(), &config, &mut fake);

    sock.file_transfer(download(None));
    fake.run(&mut sock);
    assert_eq!(
        fake.take_log(),
        vec![
            "CWD /pub",
            "PWD",
            "SIZE file.txt",
            "TYPE A",
            "PORT 192,168,1,2,195,80",
            "PASV",
            "RETR file.txt"
        ]
    );
    assert!(fake.actions.contains(&Outbound::CloseData));
    assert_eq!(finished(&sock.drain_notifications()), vec![ReplyCode::Ok]);
}

#[test]
fn test_chmod_uses_site_chmod() {
    let mut fake = FakeServer::new();
    let mut sock = logged_in(SessionContext::new(), &EngineConfig::default(), &mut fake);

    assert_eq!(sock.chmod(unix("/pub"), "file.txt", "644"), ReplyCode::WouldBlock);
    fake.run(&mut sock);
    assert_eq!(
        fake.take_log(),
        vec!["CWD /pub", "PWD", "SITE CHMOD 644 file.txt"]
    );
    let notifications = sock.drain_notifications();
    assert_eq!(finished(&notifications), vec![ReplyCode::Ok]);
    assert!(notifications.contains(&Notification::DirectoryListing {
        path: unix("/pub"),
        primary: false,
        failed: false,
    }));
}

#[test]
fn test_remove_dir_updates_cache() {
    let ctx = SessionContext::new();
    let mut fake = FakeServer::new();
    fake.listing = format!(
        "{}drwxr-xr-x 2 user group 4096 Jan 01 2020 incoming\r\n",
        LISTING
    );
    let mut sock = logged_in(ctx.clone(), &EngineConfig::default(), &mut fake);
    sock.list(unix("/pub"), "", ListFlags::default());
    fake.run(&mut sock);
    fake.take_log();
    sock.drain_notifications();

    assert_eq!(sock.remove_dir(unix("/pub"), "incoming"), ReplyCode::WouldBlock);
    fake.run(&mut sock);
    assert_eq!(fake.take_log(), vec!["RMD incoming"]);
    assert_eq!(finished(&sock.drain_notifications()), vec![ReplyCode::Ok]);

    let (listing, _) = ctx.cache.lookup(&server(), &unix("/pub"), true).unwrap();
    assert!(listing.find("incoming").is_none());
    assert!(listing.find("file.txt").is_some());
}
