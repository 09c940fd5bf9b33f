use crate::config::EngineConfig;
use crate::core_cache::TimePrecision;
use crate::core_engine::{
    AsyncReply, AsyncRequest, ControlSocket, FileExistsAction, ListFlags, Notification, Outbound,
    RequestId, SessionContext, TransferCommand,
};
use crate::core_error::{ErrorKind, ReplyCode};
use crate::core_listing::DirectoryListingParser;
use crate::core_server::{Capability, CapabilityValue, Protocol, Server, ServerPath, ServerType};
use crate::core_sftp::protocol::MessageDecoder;
use crate::core_sftp::SftpControlSocket;
use chrono::{Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use std::path::PathBuf;

const GREETING: &str = "0fzSftp started, protocol_version=11";
const LS_LINE: &str = "-rw-r--r--    1 bob  bob  1024 Jan 01 2020 file.txt";

fn server() -> Server {
    Server::new(Protocol::Sftp, "sftp.example.org", 22).with_credentials("bob", "secret")
}

fn unix(path: &str) -> ServerPath {
    ServerPath::parse(path, ServerType::Unix).unwrap()
}

/// Feeds raw worker output lines through the framing decoder.
fn feed(sock: &mut SftpControlSocket, lines: &[&str]) {
    let mut decoder = MessageDecoder::new();
    for line in lines {
        if let Some(message) = decoder.feed_line(line).unwrap() {
            sock.on_worker_message(message);
        }
    }
}

/// Drains the lines written to the worker, quota grants excluded.
fn sent(sock: &mut SftpControlSocket) -> Vec<String> {
    sock.drain_outbound()
        .into_iter()
        .filter_map(|action| match action {
            Outbound::WorkerLine(line) if !line.starts_with('-') => Some(line),
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

fn requests(notifications: &[Notification]) -> Vec<(RequestId, AsyncRequest)> {
    notifications
        .iter()
        .filter_map(|n| match n {
            Notification::AsyncRequest { id, request } => Some((*id, request.clone())),
            _ => None,
        })
        .collect()
}

fn unquote(arg: &str) -> String {
    arg.trim().trim_matches('"').replace("\"\"", "\"")
}

/// Answers commands like the worker talking to a small Unix server.
struct FakeWorker {
    cwd: String,
    /// `(ls line, mtime, name)` per entry.
    listing: Vec<(String, String, String)>,
    missing: Vec<String>,
    failing: Vec<String>,
    mtime: Option<i64>,
    log: Vec<String>,
}

impl FakeWorker {
    fn new() -> Self {
        Self {
            cwd: "/home/bob".to_string(),
            listing: vec![(
                LS_LINE.to_string(),
                "1700000000".to_string(),
                "file.txt".to_string(),
            )],
            missing: Vec::new(),
            failing: Vec::new(),
            mtime: None,
            log: Vec::new(),
        }
    }

    fn handle(&mut self, sock: &mut SftpControlSocket, command: &str) {
        let (verb, arg) = command.split_once(' ').unwrap_or((command, ""));
        if self.failing.iter().any(|f| f == verb) {
            feed(sock, &["2Permission denied", "11"]);
            return;
        }
        match verb {
            "open" | "keyfile" => feed(sock, &["10"]),
            "pwd" => {
                let reply = format!("0{}", self.cwd);
                feed(sock, &[&reply, "10"]);
            }
            "cd" => {
                let target = unquote(arg);
                if self.missing.contains(&target) {
                    feed(sock, &["2No such file or directory", "11"]);
                    return;
                }
                self.cwd = target;
                let reply = format!("0{}", self.cwd);
                feed(sock, &[&reply, "10"]);
            }
            "ls" => {
                let mut lines = Vec::new();
                for (line, mtime, name) in &self.listing {
                    lines.push(format!("6{}", line));
                    lines.push(mtime.clone());
                    lines.push(name.clone());
                }
                lines.push("10".to_string());
                let lines: Vec<&str> = lines.iter().map(String::as_str).collect();
                feed(sock, &lines);
            }
            "mtime" => match self.mtime {
                Some(secs) => {
                    let reply = format!("0{}", secs);
                    feed(sock, &[&reply, "10"]);
                }
                None => feed(sock, &["11"]),
            },
            "mkdir" => {
                let target = unquote(arg);
                self.missing.retain(|m| *m != target);
                feed(sock, &["10"]);
            }
            _ => feed(sock, &["10"]),
        }
    }

    fn run(&mut self, sock: &mut SftpControlSocket) {
        loop {
            let commands = sent(sock);
            if commands.is_empty() {
                return;
            }
            for command in commands {
                self.log.push(command.clone());
                self.handle(sock, &command);
            }
        }
    }

    fn take_log(&mut self) -> Vec<String> {
        std::mem::take(&mut self.log)
    }
}

fn logged_in(ctx: SessionContext, config: &EngineConfig, fake: &mut FakeWorker) -> SftpControlSocket {
    let mut sock = SftpControlSocket::new(ctx, config);
    assert_eq!(sock.connect(server()), ReplyCode::WouldBlock);
    feed(&mut sock, &[GREETING]);
    fake.run(&mut sock);
    assert!(sock.is_logged_on());
    sock.drain_notifications();
    fake.take_log();
    sock
}

#[test]
fn test_connect_spawns_worker_and_answers_questions() {
    let mut sock = SftpControlSocket::new(SessionContext::new(), &EngineConfig::default());
    assert_eq!(sock.connect(server()), ReplyCode::WouldBlock);
    assert_eq!(
        sock.drain_outbound(),
        vec![Outbound::SpawnWorker {
            program: PathBuf::from("fzsftp"),
            args: Vec::new()
        }]
    );

    feed(&mut sock, &[GREETING]);
    assert_eq!(
        sock.drain_outbound(),
        vec![
            Outbound::WorkerLine("-0-1".to_string()),
            Outbound::WorkerLine("-1-1".to_string()),
            Outbound::WorkerLine("open \"bob@sftp.example.org\" 22".to_string()),
        ]
    );

    feed(
        &mut sock,
        &["7hostkey", "sftp.example.org", "22", "ssh-ed25519 255 SHA256:abc"],
    );
    let asked = requests(&sock.drain_notifications());
    let [(id, AsyncRequest::HostKeyTrust { changed: false, fingerprint, .. })] = asked.as_slice()
    else {
        panic!("expected a host key request, got {:?}", asked);
    };
    assert_eq!(fingerprint, "ssh-ed25519 255 SHA256:abc");
    sock.set_async_request_reply(*id, AsyncReply::Trust(true));
    assert_eq!(sent(&mut sock), vec!["y"]);

    // The stored password answers the first prompt.
    feed(&mut sock, &["7password", "Password:"]);
    assert_eq!(sent(&mut sock), vec!["secret"]);
    assert!(requests(&sock.drain_notifications()).is_empty());

    feed(&mut sock, &["9cipher_cs aes256-ctr", "9kex curve25519-sha256", "10"]);
    assert!(sock.is_logged_on());
    assert_eq!(finished(&sock.drain_notifications()), vec![ReplyCode::Ok]);
    assert_eq!(
        sock.crypto_parameters().cipher_client_to_server.as_deref(),
        Some("aes256-ctr")
    );
    assert_eq!(
        sock.crypto_parameters().kex.as_deref(),
        Some("curve25519-sha256")
    );
}

#[test]
fn test_keyfiles_are_sent_before_open() {
    let mut config = EngineConfig::default();
    config.sftp.keyfiles = vec![PathBuf::from("/keys/id_ed25519")];
    let mut fake = FakeWorker::new();
    let mut sock = SftpControlSocket::new(SessionContext::new(), &config);
    sock.connect(server());
    feed(&mut sock, &[GREETING]);
    fake.run(&mut sock);
    assert_eq!(
        fake.take_log(),
        vec![
            "keyfile \"/keys/id_ed25519\"",
            "open \"bob@sftp.example.org\" 22"
        ]
    );
    assert!(sock.is_logged_on());
}

#[test]
fn test_worker_version_mismatch_is_fatal() {
    let mut sock = SftpControlSocket::new(SessionContext::new(), &EngineConfig::default());
    sock.connect(server());
    sock.drain_outbound();
    feed(&mut sock, &["0fzSftp started, protocol_version=10"]);

    let codes = finished(&sock.drain_notifications());
    assert_eq!(codes.len(), 1);
    assert!(codes[0].is_critical());
    assert!(codes[0].is_disconnected());
    assert!(!sock.is_connected());
    assert!(sock.drain_outbound().contains(&Outbound::Disconnect));
}

#[test]
fn test_rejected_password_is_reported() {
    let mut sock = SftpControlSocket::new(SessionContext::new(), &EngineConfig::default());
    sock.connect(server());
    feed(&mut sock, &[GREETING]);
    sock.drain_outbound();

    feed(&mut sock, &["7password", "Password:"]);
    assert_eq!(sent(&mut sock), vec!["secret"]);
    feed(&mut sock, &["2Access denied", "11"]);

    let codes = finished(&sock.drain_notifications());
    assert_eq!(codes.len(), 1);
    assert!(codes[0].is_password_failed());
    assert!(codes[0].is_critical());
    assert!(!sock.is_connected());
}

#[test]
fn test_second_password_prompt_goes_to_the_user() {
    let mut sock = SftpControlSocket::new(SessionContext::new(), &EngineConfig::default());
    sock.connect(server());
    feed(&mut sock, &[GREETING]);
    sock.drain_outbound();

    feed(&mut sock, &["7password", "Password:", "7password", "Verification code:"]);
    assert_eq!(sent(&mut sock), vec!["secret"]);
    let asked = requests(&sock.drain_notifications());
    let [(id, AsyncRequest::InteractiveLogin { challenge })] = asked.as_slice() else {
        panic!("expected an interactive login request, got {:?}", asked);
    };
    assert_eq!(challenge, "Verification code:");

    sock.set_async_request_reply(*id, AsyncReply::Password(None));
    let codes = finished(&sock.drain_notifications());
    assert_eq!(codes.len(), 1);
    assert!(codes[0].is_canceled());
    assert!(!sock.is_connected());
}

#[test]
fn test_rejected_host_key_fails_connect() {
    let mut sock = SftpControlSocket::new(SessionContext::new(), &EngineConfig::default());
    sock.connect(server());
    feed(&mut sock, &[GREETING]);
    sock.drain_outbound();

    feed(
        &mut sock,
        &["7hostkey_changed", "sftp.example.org", "22", "ssh-rsa 2048 SHA256:xyz"],
    );
    let asked = requests(&sock.drain_notifications());
    let [(id, AsyncRequest::HostKeyTrust { changed: true, .. })] = asked.as_slice() else {
        panic!("expected a changed host key request, got {:?}", asked);
    };
    sock.set_async_request_reply(*id, AsyncReply::Trust(false));
    assert_eq!(sent(&mut sock), vec!["n"]);

    feed(&mut sock, &["12"]);
    let codes = finished(&sock.drain_notifications());
    assert_eq!(codes.len(), 1);
    assert!(codes[0].is_disconnected());
    assert!(!codes[0].is_password_failed());
}

#[test]
fn test_stale_async_reply_is_ignored() {
    let mut sock = SftpControlSocket::new(SessionContext::new(), &EngineConfig::default());
    sock.connect(server());
    feed(&mut sock, &[GREETING]);
    sock.drain_outbound();
    feed(
        &mut sock,
        &["7hostkey", "sftp.example.org", "22", "ssh-ed25519 255 SHA256:abc"],
    );
    let asked = requests(&sock.drain_notifications());
    let (id, _) = &asked[0];
    sock.set_async_request_reply(id + 1, AsyncReply::Trust(true));
    assert!(sent(&mut sock).is_empty());
}

#[test]
fn test_listing_keeps_worker_times_and_names() {
    let ctx = SessionContext::new();
    let mut fake = FakeWorker::new();
    fake.listing.push((
        "drwxr-xr-x    2 bob  bob  4096 Jan 01 2020 odd?name".to_string(),
        String::new(),
        "odd\tname".to_string(),
    ));
    let mut sock = logged_in(ctx.clone(), &EngineConfig::default(), &mut fake);

    sock.list(unix("/home/bob/pub"), "", ListFlags::default());
    fake.run(&mut sock);
    assert_eq!(fake.take_log(), vec!["cd \"/home/bob/pub\"", "ls"]);
    assert_eq!(finished(&sock.drain_notifications()), vec![ReplyCode::Ok]);
    assert_eq!(sock.current_path(), &unix("/home/bob/pub"));

    let (listing, _) = ctx.cache.lookup(&server(), &unix("/home/bob/pub"), false).unwrap();
    let file = &listing.entries()[0];
    assert_eq!(file.name, "file.txt");
    assert_eq!(file.time.map(|t| t.time.timestamp()), Some(1_700_000_000));
    assert_eq!(file.time.map(|t| t.precision), Some(TimePrecision::Seconds));
    assert_eq!(listing.entries()[1].name, "odd\tname");
    assert!(listing.entries()[1].is_dir());

    // Cached now, nothing goes to the worker.
    assert_eq!(
        sock.list(unix("/home/bob/pub"), "", ListFlags::default()),
        ReplyCode::Ok
    );
    assert!(sent(&mut sock).is_empty());
}

#[test]
fn test_timezone_offset_detected_with_mtime() {
    let line = "-rw-r--r--    1 bob  bob  1024 Jan 01 12:00 recent.txt";
    let listed = DirectoryListingParser::new()
        .parse_line(line)
        .and_then(|entry| entry.time)
        .unwrap();
    let exact = listed.time + Duration::minutes(-60);

    let ctx = SessionContext::new();
    let mut fake = FakeWorker::new();
    fake.listing = vec![(line.to_string(), String::new(), "recent.txt".to_string())];
    fake.mtime = Some(exact.timestamp());
    let mut sock = logged_in(ctx.clone(), &EngineConfig::default(), &mut fake);

    sock.list(unix("/home/bob"), "", ListFlags::default());
    fake.run(&mut sock);
    assert_eq!(
        fake.take_log(),
        vec!["cd \"/home/bob\"", "ls", "mtime \"/home/bob/recent.txt\""]
    );

    let (value, offset) = ctx
        .capabilities()
        .get_number(&server(), Capability::TimezoneOffset);
    assert_eq!(value, CapabilityValue::Yes);
    assert_eq!(offset, Some(-60));
    let (listing, _) = ctx.cache.lookup(&server(), &unix("/home/bob"), false).unwrap();
    assert_eq!(listing.entries()[0].time.map(|t| t.time), Some(exact));
}

#[test]
fn test_download_resume_after_listing_directory() {
    let ctx = SessionContext::new();
    let mut fake = FakeWorker::new();
    let mut sock = logged_in(ctx.clone(), &EngineConfig::default(), &mut fake);

    sock.file_transfer(TransferCommand {
        download: true,
        local_path: PathBuf::from("/tmp/file.txt"),
        local_size: Some(10),
        local_time: None,
        remote_path: unix("/home/bob/pub"),
        remote_file: "file.txt".to_string(),
    });
    fake.run(&mut sock);
    assert_eq!(fake.take_log(), vec!["cd \"/home/bob/pub\"", "ls"]);

    let asked = requests(&sock.drain_notifications());
    let [(id, AsyncRequest::FileExists(request))] = asked.as_slice() else {
        panic!("expected a file exists request, got {:?}", asked);
    };
    assert_eq!(request.remote_size, Some(1024));
    assert_eq!(
        request.remote_time.map(|t| t.time),
        Utc.timestamp_opt(1_700_000_000, 0).single()
    );

    sock.set_async_request_reply(*id, AsyncReply::FileExists(FileExistsAction::Resume));
    assert_eq!(
        sent(&mut sock),
        vec!["reget \"/home/bob/pub/file.txt\" \"/tmp/file.txt\" 10"]
    );
    feed(&mut sock, &["5100", "5200"]);
    feed(&mut sock, &["10"]);

    let notifications = sock.drain_notifications();
    let progress: Vec<u64> = notifications
        .iter()
        .filter_map(|n| match n {
            Notification::TransferStatus { bytes } => Some(*bytes),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![100, 300]);
    assert_eq!(finished(&notifications), vec![ReplyCode::Ok]);
}

#[test]
fn test_upload_preserves_time_and_updates_cache() {
    let ctx = SessionContext::new();
    let mut config = EngineConfig::default();
    config.engine.preserve_timestamps = true;
    let mut fake = FakeWorker::new();
    let mut sock = logged_in(ctx.clone(), &config, &mut fake);

    sock.list(unix("/home/bob/pub"), "", ListFlags::default());
    fake.run(&mut sock);
    fake.take_log();
    sock.drain_notifications();

    let local_time = Utc.timestamp_opt(1_600_000_000, 0).single();
    sock.file_transfer(TransferCommand {
        download: false,
        local_path: PathBuf::from("/tmp/up.bin"),
        local_size: Some(42),
        local_time,
        remote_path: unix("/home/bob/pub"),
        remote_file: "up.bin".to_string(),
    });
    fake.run(&mut sock);
    assert_eq!(
        fake.take_log(),
        vec![
            "put \"/tmp/up.bin\" \"/home/bob/pub/up.bin\"",
            "chmtime 1600000000 \"/home/bob/pub/up.bin\"",
        ]
    );
    assert_eq!(finished(&sock.drain_notifications()), vec![ReplyCode::Ok]);

    let (listing, _) = ctx.cache.lookup(&server(), &unix("/home/bob/pub"), true).unwrap();
    let (index, _) = listing.find("up.bin").unwrap();
    assert_eq!(listing.entries()[index].size, Some(42));
}

#[test]
fn test_mkdir_creates_missing_parents() {
    let ctx = SessionContext::new();
    let mut fake = FakeWorker::new();
    fake.missing = vec!["/home/bob/a".to_string(), "/home/bob/a/b".to_string()];
    let mut sock = logged_in(ctx.clone(), &EngineConfig::default(), &mut fake);

    sock.mkdir(unix("/home/bob/a/b"));
    fake.run(&mut sock);
    assert_eq!(
        fake.take_log(),
        vec![
            "cd \"/home/bob/a/b\"",
            "cd \"/home/bob/a\"",
            "cd \"/home/bob\"",
            "mkdir \"/home/bob/a\"",
            "mkdir \"/home/bob/a/b\"",
        ]
    );
    let notifications = sock.drain_notifications();
    assert_eq!(finished(&notifications), vec![ReplyCode::Ok]);
    assert!(notifications.contains(&Notification::DirectoryListing {
        path: unix("/home/bob/a"),
        primary: false,
        failed: false,
    }));
}

#[test]
fn test_file_operations_use_quoted_full_paths() {
    let mut fake = FakeWorker::new();
    let mut sock = logged_in(SessionContext::new(), &EngineConfig::default(), &mut fake);
    let dir = unix("/home/bob");

    sock.delete(dir.clone(), vec!["a b.txt".to_string(), "say\"hi\"".to_string()]);
    fake.run(&mut sock);
    sock.remove_dir(dir.clone(), "old");
    fake.run(&mut sock);
    sock.rename(dir.clone(), "x", unix("/tmp"), "y");
    fake.run(&mut sock);
    sock.chmod(dir, "run.sh", "755");
    fake.run(&mut sock);

    assert_eq!(
        fake.take_log(),
        vec![
            "rm \"/home/bob/a b.txt\"",
            "rm \"/home/bob/say\"\"hi\"\"\"",
            "rmdir \"/home/bob/old\"",
            "mv \"/home/bob/x\" \"/tmp/y\"",
            "chmod 755 \"/home/bob/run.sh\"",
        ]
    );
    assert_eq!(finished(&sock.drain_notifications()), vec![ReplyCode::Ok; 4]);
}

#[test]
fn test_partial_delete_failure() {
    let ctx = SessionContext::new();
    let mut fake = FakeWorker::new();
    let mut sock = logged_in(ctx.clone(), &EngineConfig::default(), &mut fake);
    sock.list(unix("/home/bob"), "", ListFlags::default());
    fake.run(&mut sock);
    sock.drain_notifications();

    fake.failing = vec!["rm".to_string()];
    sock.delete(unix("/home/bob"), vec!["file.txt".to_string()]);
    fake.run(&mut sock);
    assert_eq!(finished(&sock.drain_notifications()), vec![ReplyCode::error()]);
    let (listing, _) = ctx.cache.lookup(&server(), &unix("/home/bob"), true).unwrap();
    assert!(listing.has_unsure_entries());
}

#[test]
fn test_cancel_closes_the_connection() {
    let mut fake = FakeWorker::new();
    let mut sock = logged_in(SessionContext::new(), &EngineConfig::default(), &mut fake);

    sock.list(unix("/home/bob/pub"), "", ListFlags::default());
    assert_eq!(sent(&mut sock), vec!["cd \"/home/bob/pub\""]);
    sock.cancel();

    let codes = finished(&sock.drain_notifications());
    assert_eq!(codes.len(), 1);
    assert!(codes[0].is_canceled());
    assert!(codes[0].is_disconnected());
    assert!(!sock.is_connected());
    assert!(sock.drain_outbound().contains(&Outbound::Disconnect));
}

#[test]
fn test_done_without_command_is_fatal() {
    let mut fake = FakeWorker::new();
    let mut sock = logged_in(SessionContext::new(), &EngineConfig::default(), &mut fake);
    feed(&mut sock, &["10"]);
    assert!(!sock.is_connected());
}

#[test]
fn test_worker_error_ends_running_operation() {
    let mut fake = FakeWorker::new();
    let mut sock = logged_in(SessionContext::new(), &EngineConfig::default(), &mut fake);
    sock.list(unix("/home/bob/pub"), "", ListFlags::default());
    sock.on_worker_error(crate::core_error::EngineError::WorkerGone);

    let codes = finished(&sock.drain_notifications());
    assert_eq!(codes.len(), 1);
    assert!(codes[0].is_disconnected());
    assert!(!sock.is_connected());
}

#[test]
fn test_raw_commands_are_not_supported() {
    let mut fake = FakeWorker::new();
    let mut sock = logged_in(SessionContext::new(), &EngineConfig::default(), &mut fake);
    assert_eq!(
        sock.raw_command("SITE HELP"),
        ReplyCode::of_kind(ErrorKind::NotSupported)
    );
}

#[test]
fn test_cached_listing_finishes_without_notification() {
    let mut fake = FakeWorker::new();
    let mut sock = logged_in(SessionContext::new(), &EngineConfig::default(), &mut fake);
    sock.list(unix("/home/bob"), "", ListFlags::default());
    fake.run(&mut sock);
    sock.drain_notifications();

    assert_eq!(sock.list(unix("/home/bob"), "", ListFlags::default()), ReplyCode::Ok);
    let notifications = sock.drain_notifications();
    assert!(finished(&notifications).is_empty());
    assert!(notifications.contains(&Notification::DirectoryListing {
        path: unix("/home/bob"),
        primary: true,
        failed: false,
    }));
}

fn download_to(local: &str, local_size: Option<u64>) -> TransferCommand {
    TransferCommand {
        download: true,
        local_path: PathBuf::from(local),
        local_size,
        local_time: None,
        remote_path: unix("/home/bob/pub"),
        remote_file: "file.txt".to_string(),
    }
}

fn discarded(outbound: &[Outbound]) -> Vec<PathBuf> {
    outbound
        .iter()
        .filter_map(|action| match action {
            Outbound::DiscardLocalFile(path) => Some(path.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_failed_download_discards_new_empty_file() {
    let mut fake = FakeWorker::new();
    let mut sock = logged_in(SessionContext::new(), &EngineConfig::default(), &mut fake);
    sock.list(unix("/home/bob/pub"), "", ListFlags::default());
    fake.run(&mut sock);
    sock.drain_notifications();

    sock.file_transfer(download_to("/tmp/new.txt", None));
    assert_eq!(
        sent(&mut sock),
        vec!["get \"/home/bob/pub/file.txt\" \"/tmp/new.txt\""]
    );
    feed(&mut sock, &["2Permission denied", "11"]);
    assert_eq!(
        discarded(&sock.drain_outbound()),
        vec![PathBuf::from("/tmp/new.txt")]
    );
    assert_eq!(finished(&sock.drain_notifications()), vec![ReplyCode::error()]);
}

#[test]
fn test_failed_overwrite_keeps_existing_local_file() {
    let mut fake = FakeWorker::new();
    let mut sock = logged_in(SessionContext::new(), &EngineConfig::default(), &mut fake);
    sock.list(unix("/home/bob/pub"), "", ListFlags::default());
    fake.run(&mut sock);
    sock.drain_notifications();

    sock.file_transfer(download_to("/tmp/existing.txt", Some(100)));
    let asked = requests(&sock.drain_notifications());
    let [(id, AsyncRequest::FileExists(_))] = asked.as_slice() else {
        panic!("expected a file exists request, got {:?}", asked);
    };
    sock.set_async_request_reply(*id, AsyncReply::FileExists(FileExistsAction::Overwrite));
    assert_eq!(
        sent(&mut sock),
        vec!["get \"/home/bob/pub/file.txt\" \"/tmp/existing.txt\""]
    );
    feed(&mut sock, &["2Permission denied", "11"]);
    assert!(discarded(&sock.drain_outbound()).is_empty());
    assert_eq!(finished(&sock.drain_notifications()), vec![ReplyCode::error()]);
}
