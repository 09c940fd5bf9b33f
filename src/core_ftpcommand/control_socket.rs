//! The FTP control connection state machine.
//!
//! The socket never touches the network. The driver calls the `on_*` event
//! methods with whatever arrived and carries out the [`Outbound`] actions the
//! socket queues. Each operation lives in its own module and implements its
//! send, parse and sub-result handlers as methods on [`FtpControlSocket`].

use crate::config::{EngineConfig, ProxyConfig};
use crate::core_engine::{
    AsyncReply, AsyncRequest, ControlSocket, ListFlags, Notification, OpDispatch, OpKind,
    Outbound, RequestId, SessionContext, SocketCore, SocketId, Step, TransferCommand,
    TransferEndReason,
};
use crate::core_error::ReplyCode;
use crate::core_ftpcommand::chmod::ChmodOp;
use crate::core_ftpcommand::dele::DeleteOp;
use crate::core_ftpcommand::ftpcommand::FtpOp;
use crate::core_ftpcommand::list::ListOp;
use crate::core_ftpcommand::logon::LogonOp;
use crate::core_ftpcommand::mkd::MkdirOp;
use crate::core_ftpcommand::raw::RawCommandOp;
use crate::core_ftpcommand::rename::RenameOp;
use crate::core_ftpcommand::rmd::RemoveDirOp;
use crate::core_ftpcommand::transfer::TransferOp;
use crate::core_listing::DirectoryListingParser;
use crate::core_server::{Capability, CapabilityValue, Charset, Protocol, Server, ServerPath};
use log::{debug, error, info, warn};
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::time::Instant;

pub struct FtpControlSocket {
    pub(super) core: SocketCore<FtpOp>,
    pub(super) proxy: Option<ProxyConfig>,
    recv_buffer: Vec<u8>,
    /// Code of the multi-line reply being collected.
    multiline: Option<String>,
    /// Every line of the last complete reply.
    pub(super) reply_lines: Vec<String>,
    /// Final line of the last complete reply.
    pub(super) last_reply: String,
    pending_replies: u32,
    replies_to_skip: u32,
    pub(super) use_utf8: bool,
    pub(super) last_type: Option<char>,
    pub(super) local_addr: Option<SocketAddr>,
    pub(super) peer_addr: Option<SocketAddr>,
    pub(super) tls_active: bool,
    pub(super) protect_data: bool,
    connected: bool,
    pub(super) logged_on: bool,
    pub(super) listing_parser: DirectoryListingParser,
    pub(super) last_transfer_bytes: u64,
}

impl FtpControlSocket {
    pub fn new(ctx: SessionContext, config: &EngineConfig) -> Self {
        Self {
            core: SocketCore::new(ctx, config.engine.clone()),
            proxy: config.proxy.clone(),
            recv_buffer: Vec::new(),
            multiline: None,
            reply_lines: Vec::new(),
            last_reply: String::new(),
            pending_replies: 0,
            replies_to_skip: 0,
            use_utf8: true,
            last_type: None,
            local_addr: None,
            peer_addr: None,
            tls_active: false,
            protect_data: false,
            connected: false,
            logged_on: false,
            listing_parser: DirectoryListingParser::new(),
            last_transfer_bytes: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_logged_on(&self) -> bool {
        self.logged_on
    }

    pub fn is_busy(&self) -> bool {
        !self.core.ops.is_empty()
    }

    pub fn pending_replies(&self) -> u32 {
        self.pending_replies
    }

    pub fn replies_to_skip(&self) -> u32 {
        self.replies_to_skip
    }

    pub fn server(&self) -> Option<&Server> {
        self.core.server()
    }

    // Reply helpers

    /// Numeric code of the last reply, 0 if it had none.
    pub(super) fn reply_code(&self) -> u16 {
        self.last_reply
            .get(..3)
            .and_then(|c| c.parse().ok())
            .unwrap_or(0)
    }

    /// First digit of the last reply.
    pub(super) fn reply_class(&self) -> u16 {
        self.reply_code() / 100
    }

    pub(super) fn reply_succeeded(&self) -> bool {
        self.reply_class() == 2
    }

    /// Text of the last reply after the code.
    pub(super) fn reply_text(&self) -> &str {
        self.last_reply.get(4..).unwrap_or("").trim()
    }

    pub(super) fn capability(&self, capability: Capability) -> CapabilityValue {
        match self.core.server() {
            Some(server) => self.core.ctx.capabilities().get(server, capability),
            None => CapabilityValue::Unknown,
        }
    }

    pub(super) fn set_capability(&self, capability: Capability, value: CapabilityValue) {
        if let Some(server) = self.core.server() {
            self.core.ctx.capabilities().set(server, capability, value);
        }
    }

    // Encoding

    fn encode(&self, text: &str) -> Vec<u8> {
        if self.use_utf8 {
            return text.as_bytes().to_vec();
        }
        text.chars()
            .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
            .collect()
    }

    fn decode(&self, raw: &[u8]) -> String {
        if self.use_utf8 {
            if let Ok(text) = std::str::from_utf8(raw) {
                return text.to_string();
            }
        }
        raw.iter().map(|&b| char::from(b)).collect()
    }

    // Wire

    /// Sends `command`. With `hide` the whole argument is masked in the log,
    /// otherwise only `PASS` and `ACCT` arguments are.
    pub(super) fn send_command_masked(&mut self, command: &str, hide: bool) {
        let upper = command.to_ascii_uppercase();
        let shown = if hide || upper.starts_with("PASS ") || upper.starts_with("ACCT ") {
            let verb = command.split(' ').next().unwrap_or(command);
            format!("{} ****", verb)
        } else {
            command.to_string()
        };
        debug!("Command: {}", shown);

        let mut line = self.encode(command);
        line.extend_from_slice(b"\r\n");
        self.core.emit(Outbound::Send(line));
        self.pending_replies += 1;
        self.core.touch();
    }

    // Events

    pub fn on_connected(&mut self, local: SocketAddr, peer: SocketAddr) {
        info!("Connected to {}", peer);
        self.local_addr = Some(local);
        self.peer_addr = Some(peer);
        self.core.touch();
        if self.core.server().map(|s| s.protocol) == Some(Protocol::Ftps) {
            self.core.emit(Outbound::StartTls);
        }
    }

    pub fn on_control_data(&mut self, data: &[u8]) {
        if !self.connected {
            return;
        }
        self.core.touch();
        self.recv_buffer.extend_from_slice(data);
        while let Some(pos) = self.recv_buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.recv_buffer.drain(..=pos).collect();
            let line = self.decode(&raw);
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            self.on_line(line);
            if !self.connected {
                self.recv_buffer.clear();
                return;
            }
        }
    }

    fn on_line(&mut self, line: String) {
        debug!("Response: {}", line);
        if let Some(code) = &self.multiline {
            let closes = line.len() >= 3
                && line.starts_with(code.as_str())
                && line.as_bytes().get(3).map_or(true, |&b| b == b' ');
            self.reply_lines.push(line.clone());
            if closes {
                self.multiline = None;
                self.last_reply = line;
                self.on_reply();
            }
            return;
        }

        let bytes = line.as_bytes();
        if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
            warn!("Ignoring malformed reply line");
            return;
        }
        self.reply_lines = vec![line.clone()];
        if bytes.get(3) == Some(&b'-') {
            self.multiline = Some(line[..3].to_string());
            return;
        }
        self.last_reply = line;
        self.on_reply();
    }

    fn on_reply(&mut self) {
        if self.reply_class() == 1 {
            if matches!(self.core.ops.top(), Some(FtpOp::RawTransfer(_))) && self.replies_to_skip == 0
            {
                self.parse_response();
            }
            return;
        }

        if self.pending_replies == 0 {
            error!("Received a reply without a pending command, closing connection");
            self.do_close(ReplyCode::critical());
            return;
        }
        self.pending_replies -= 1;

        if self.replies_to_skip > 0 {
            self.replies_to_skip -= 1;
            debug!("Skipping reply, {} left to skip", self.replies_to_skip);
            if self.replies_to_skip == 0 && !self.core.ops.is_empty() {
                self.send_next_command();
            }
            return;
        }

        if self.core.ops.is_empty() {
            warn!("Reply without an operation");
            return;
        }
        self.parse_response();
    }

    pub fn on_tls_established(&mut self, fingerprint: &str) {
        self.core.touch();
        let Some(FtpOp::Logon(_)) = self.core.ops.top() else {
            warn!("TLS established without a pending logon");
            return;
        };
        let (host, port) = self
            .core
            .server()
            .map(|s| (s.host.clone(), s.port))
            .unwrap_or_default();
        if let Some(FtpOp::Logon(op)) = self.core.ops.top_mut() {
            op.tls_trust_pending = true;
        }
        self.core.send_async_request(AsyncRequest::CertificateTrust {
            host,
            port,
            fingerprint: fingerprint.to_string(),
        });
    }

    pub fn on_tls_failed(&mut self, reason: &str) {
        error!("TLS handshake failed: {}", reason);
        self.do_close(ReplyCode::critical());
    }

    /// The driver's active mode listener is ready at `addr`.
    pub fn on_data_listening(&mut self, addr: SocketAddr) {
        self.core.touch();
        self.dispatch(|socket, op| match op {
            FtpOp::RawTransfer(raw) => socket.rawtransfer_listening(raw, addr),
            _ => Step::Wait,
        });
    }

    pub fn on_listing_data(&mut self, data: &[u8]) {
        self.core.touch();
        self.listing_parser.add_data(data);
    }

    pub fn on_transfer_progress(&mut self, bytes: u64) {
        self.core.touch();
        self.last_transfer_bytes = bytes;
        self.core.notify(Notification::TransferStatus { bytes });
    }

    pub fn on_transfer_end(&mut self, reason: TransferEndReason, bytes: u64) {
        self.core.touch();
        self.last_transfer_bytes = bytes;
        self.dispatch(|socket, op| match op {
            FtpOp::RawTransfer(raw) => socket.rawtransfer_data_end(raw, reason),
            _ => {
                debug!("Transfer end without a raw transfer");
                Step::Wait
            }
        });
    }

    pub fn on_disconnected(&mut self) {
        if !self.connected {
            return;
        }
        warn!("Connection closed by server");
        self.do_close(ReplyCode::critical().with_disconnected());
    }

    /// Sends a harmless command when the connection has been idle long
    /// enough. Its reply is skipped.
    pub fn on_keepalive_timer(&mut self, now: Instant) {
        if !self.core.options.keepalive
            || !self.logged_on
            || !self.core.ops.is_empty()
            || self.pending_replies > 0
            || self.core.idle_for(now) < self.core.options.keepalive_interval()
        {
            return;
        }
        let type_command = format!("TYPE {}", self.last_type.unwrap_or('I'));
        let choices = ["NOOP", "PWD", type_command.as_str()];
        let command = choices
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or("NOOP")
            .to_string();
        debug!("Sending keepalive");
        self.send_command(&command);
        self.replies_to_skip += 1;
    }

    fn parse_response(&mut self) {
        self.dispatch(Self::op_parse);
    }

    fn do_close(&mut self, code: ReplyCode) {
        let code = code.with_disconnected();
        if !self.core.ops.is_empty() {
            self.reset_operation(code);
        }
        self.close_connection();
    }

    fn op_parse(&mut self, op: &mut FtpOp) -> Step<FtpOp> {
        match op {
            FtpOp::Logon(o) => self.logon_parse(o),
            FtpOp::ChangeDir(o) => self.cwd_parse(o),
            FtpOp::List(o) => self.list_parse(o),
            FtpOp::RawTransfer(o) => self.rawtransfer_parse(o),
            FtpOp::Transfer(o) => self.transfer_parse(o),
            FtpOp::Mkdir(o) => self.mkdir_parse(o),
            FtpOp::Delete(o) => self.delete_parse(o),
            FtpOp::RemoveDir(o) => self.rmd_parse(o),
            FtpOp::Rename(o) => self.rename_parse(o),
            FtpOp::Chmod(o) => self.chmod_parse(o),
            FtpOp::Raw(o) => self.raw_parse(o),
        }
    }

    /// Puts `op` on the idle stack and drives it as far as it goes.
    fn start_operation(&mut self, op: FtpOp) -> ReplyCode {
        if !self.connected || !self.logged_on {
            error!("Cannot start {:?}: not connected", op.kind());
            return ReplyCode::error();
        }
        if !self.core.ops.is_empty() {
            error!("Cannot start {:?}: another operation is running", op.kind());
            return ReplyCode::internal();
        }
        self.core.ops.push(op);
        self.send_next_command();
        ReplyCode::WouldBlock
    }
}

impl OpDispatch for FtpControlSocket {
    type Op = FtpOp;

    fn core_mut(&mut self) -> &mut SocketCore<FtpOp> {
        &mut self.core
    }

    fn ready_to_send(&self) -> bool {
        if self.replies_to_skip > 0 {
            debug!("Waiting for skipped replies before sending");
            return false;
        }
        true
    }

    fn send_command(&mut self, command: &str) {
        self.send_command_masked(command, false);
    }

    fn op_send(&mut self, op: &mut FtpOp) -> Step<FtpOp> {
        match op {
            FtpOp::Logon(o) => self.logon_send(o),
            FtpOp::ChangeDir(o) => self.cwd_send(o),
            FtpOp::List(o) => self.list_send(o),
            FtpOp::RawTransfer(o) => self.rawtransfer_send(o),
            FtpOp::Transfer(o) => self.transfer_send(o),
            FtpOp::Mkdir(o) => self.mkdir_send(o),
            FtpOp::Delete(o) => self.delete_send(o),
            FtpOp::RemoveDir(o) => self.rmd_send(o),
            FtpOp::Rename(o) => self.rename_send(o),
            FtpOp::Chmod(o) => self.chmod_send(o),
            FtpOp::Raw(o) => self.raw_send(o),
        }
    }

    fn op_subcommand_result(&mut self, op: &mut FtpOp, code: ReplyCode) -> Step<FtpOp> {
        match op {
            FtpOp::List(o) => self.list_subcommand_result(o, code),
            FtpOp::Transfer(o) => self.transfer_subcommand_result(o, code),
            FtpOp::Delete(o) => self.delete_subcommand_result(o, code),
            FtpOp::RemoveDir(o) => self.rmd_subcommand_result(o, code),
            FtpOp::Rename(o) => self.rename_subcommand_result(o, code),
            FtpOp::Chmod(o) => self.chmod_subcommand_result(o, code),
            other => {
                error!("{:?} has no nested operations", other.kind());
                Step::Finish(ReplyCode::internal())
            }
        }
    }

    fn finish_op(&mut self, op: FtpOp, code: ReplyCode) {
        match op {
            FtpOp::Logon(_) => {
                if !code.is_ok() {
                    self.close_connection();
                }
            }
            FtpOp::List(o) => self.list_finished(o, code),
            FtpOp::RawTransfer(o) => self.rawtransfer_finished(o, code),
            FtpOp::Transfer(o) => self.transfer_finished(o, code),
            FtpOp::Mkdir(o) => self.mkdir_finished(o, code),
            FtpOp::Delete(o) => self.delete_finished(o),
            FtpOp::RemoveDir(o) => self.rmd_finished(o),
            FtpOp::Rename(o) => self.rename_finished(o),
            FtpOp::Chmod(o) => self.chmod_finished(o),
            FtpOp::ChangeDir(_) | FtpOp::Raw(_) => {}
        }
    }

    fn close_connection(&mut self) {
        if !self.connected {
            return;
        }
        info!("Disconnected");
        self.connected = false;
        self.logged_on = false;
        self.core.emit(Outbound::CloseData);
        self.core.emit(Outbound::Disconnect);
        self.recv_buffer.clear();
        self.multiline = None;
        self.pending_replies = 0;
        self.replies_to_skip = 0;
        self.last_type = None;
        self.tls_active = false;
        self.protect_data = false;
        self.core.current_path = ServerPath::default();
        self.core.forget_locks();
    }

    fn before_operation_finished(&mut self) {
        self.replies_to_skip = self.pending_replies;
    }
}

impl ControlSocket for FtpControlSocket {
    fn socket_id(&self) -> SocketId {
        self.core.id
    }

    fn connect(&mut self, server: Server) -> ReplyCode {
        if self.connected {
            error!("Already connected");
            return ReplyCode::error();
        }
        if !server.protocol.is_ftp() {
            error!("FTP socket cannot connect with {:?}", server.protocol);
            return ReplyCode::of_kind(crate::core_error::ErrorKind::NotSupported);
        }
        let (host, port) = match &self.proxy {
            Some(proxy) => (proxy.host.clone(), proxy.port),
            None => (server.host.clone(), server.port),
        };
        info!("Connecting to {}:{}", host, port);

        self.use_utf8 = server.charset != Charset::Local;
        self.core.server = Some(server);
        self.core.current_path = ServerPath::default();
        self.connected = true;
        self.logged_on = false;
        self.pending_replies = 1;
        self.replies_to_skip = 0;
        self.core.emit(Outbound::Connect { host, port });
        self.core.ops.push(FtpOp::Logon(LogonOp::new()));
        self.core.touch();
        ReplyCode::WouldBlock
    }

    fn list(&mut self, path: ServerPath, subdir: &str, flags: ListFlags) -> ReplyCode {
        if self.connected && self.logged_on && self.core.ops.is_empty() && !flags.refresh {
            if let Some(code) = self.list_from_cache_early(&path, subdir) {
                return code;
            }
        }
        self.start_operation(FtpOp::List(ListOp::new(path, subdir, flags)))
    }

    fn file_transfer(&mut self, command: TransferCommand) -> ReplyCode {
        if command.remote_file.is_empty() || command.remote_path.is_empty() {
            return ReplyCode::internal();
        }
        self.start_operation(FtpOp::Transfer(TransferOp::new(command)))
    }

    fn delete(&mut self, path: ServerPath, files: Vec<String>) -> ReplyCode {
        if files.is_empty() || path.is_empty() {
            return ReplyCode::internal();
        }
        self.start_operation(FtpOp::Delete(DeleteOp::new(path, files)))
    }

    fn remove_dir(&mut self, path: ServerPath, subdir: &str) -> ReplyCode {
        if subdir.is_empty() || path.is_empty() {
            return ReplyCode::internal();
        }
        self.start_operation(FtpOp::RemoveDir(RemoveDirOp::new(path, subdir)))
    }

    fn mkdir(&mut self, path: ServerPath) -> ReplyCode {
        if !path.has_parent() {
            return ReplyCode::internal();
        }
        self.start_operation(FtpOp::Mkdir(MkdirOp::new(path)))
    }

    fn rename(
        &mut self,
        from_path: ServerPath,
        from_file: &str,
        to_path: ServerPath,
        to_file: &str,
    ) -> ReplyCode {
        if from_file.is_empty() || to_file.is_empty() {
            return ReplyCode::internal();
        }
        self.start_operation(FtpOp::Rename(RenameOp::new(
            from_path, from_file, to_path, to_file,
        )))
    }

    fn chmod(&mut self, path: ServerPath, file: &str, permissions: &str) -> ReplyCode {
        if file.is_empty() || permissions.is_empty() {
            return ReplyCode::internal();
        }
        self.start_operation(FtpOp::Chmod(ChmodOp::new(path, file, permissions)))
    }

    fn raw_command(&mut self, command: &str) -> ReplyCode {
        if command.trim().is_empty() {
            return ReplyCode::internal();
        }
        self.start_operation(FtpOp::Raw(RawCommandOp::new(command)))
    }

    fn cancel(&mut self) {
        let Some(top) = self.core.ops.iter().next() else {
            return;
        };
        info!("Canceling operation");
        if top.kind() == OpKind::Connect {
            self.do_close(ReplyCode::canceled());
        } else {
            self.core.clear_async_request();
            self.reset_operation(ReplyCode::canceled());
        }
    }

    fn set_async_request_reply(&mut self, id: RequestId, reply: AsyncReply) {
        if !self.core.take_async_reply(id) {
            return;
        }
        self.dispatch(|socket, op| match (op, reply) {
            (FtpOp::Transfer(transfer), AsyncReply::FileExists(action)) => {
                socket.transfer_file_exists_reply(transfer, action)
            }
            (FtpOp::Logon(logon), AsyncReply::Trust(trusted)) => {
                socket.logon_trust_reply(logon, trusted)
            }
            (FtpOp::Logon(logon), AsyncReply::Password(password)) => {
                socket.logon_password_reply(logon, password)
            }
            (other, reply) => {
                warn!("Unexpected reply {:?} for {:?}", reply, other.kind());
                Step::Wait
            }
        });
    }

    fn on_lock_available(&mut self) {
        if !self.core.ops.is_empty() {
            debug!("Lock available, resuming");
            self.send_next_command();
        }
    }

    fn check_timeout(&mut self, now: Instant) {
        if !self.connected || self.core.is_waiting_externally() {
            return;
        }
        if self.core.ops.is_empty() && self.pending_replies == 0 {
            return;
        }
        let idle = self.core.idle_for(now);
        if idle >= self.core.options.timeout() {
            error!(
                "Connection timed out after {} seconds of inactivity",
                idle.as_secs()
            );
            self.do_close(ReplyCode::timeout());
        }
    }

    fn drain_outbound(&mut self) -> Vec<Outbound> {
        self.core.drain_outbound()
    }

    fn drain_notifications(&mut self) -> Vec<Notification> {
        self.core.drain_notifications()
    }

    fn current_path(&self) -> &ServerPath {
        &self.core.current_path
    }
}
