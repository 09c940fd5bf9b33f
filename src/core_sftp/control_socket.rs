//! The SFTP control socket.
//!
//! All SSH work is done by an external worker process. The socket writes
//! one command line at a time to the worker's stdin and consumes the framed
//! messages its reader thread decodes. A command is over when the worker
//! sends `done`; anything it wants from the user (host key trust, password)
//! goes through the same async request mechanism the FTP socket uses.

use crate::config::{EngineConfig, SftpOptions};
use crate::core_engine::{
    AsyncReply, ControlSocket, ListFlags, Notification, OpDispatch, Outbound, RequestId,
    SessionContext, SocketCore, SocketId, Step, TransferCommand,
};
use crate::core_error::{EngineError, ErrorKind, ReplyCode};
use crate::core_listing::DirectoryListingParser;
use crate::core_server::{Capability, CapabilityValue, Protocol, Server, ServerPath, ServerType};
use crate::core_sftp::connect::ConnectOp;
use crate::core_sftp::fileops::{ChmodOp, DeleteOp, MkdirOp, RemoveDirOp, RenameOp};
use crate::core_sftp::list::ListOp;
use crate::core_sftp::protocol::{QuotaDirection, SftpMessage};
use crate::core_sftp::sftpcommand::SftpOp;
use crate::core_sftp::transfer::TransferOp;
use log::{debug, error, info, warn};
use std::time::Instant;

/// Algorithms the worker negotiated for the current connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CryptoParameters {
    pub kex: Option<String>,
    pub kex_hash: Option<String>,
    pub cipher_client_to_server: Option<String>,
    pub cipher_server_to_client: Option<String>,
    pub mac_client_to_server: Option<String>,
    pub mac_server_to_client: Option<String>,
    pub hostkey: Option<String>,
}

impl CryptoParameters {
    fn set(&mut self, name: &str, value: &str) {
        let slot = match name {
            "kex" => &mut self.kex,
            "kex_hash" => &mut self.kex_hash,
            "cipher_cs" => &mut self.cipher_client_to_server,
            "cipher_sc" => &mut self.cipher_server_to_client,
            "mac_cs" => &mut self.mac_client_to_server,
            "mac_sc" => &mut self.mac_server_to_client,
            "hostkey" => &mut self.hostkey,
            _ => {
                debug!("Ignoring unknown crypto parameter {}", name);
                return;
            }
        };
        *slot = Some(value.to_string());
    }
}

pub struct SftpControlSocket {
    pub(super) core: SocketCore<SftpOp>,
    pub(super) sftp: SftpOptions,
    connected: bool,
    pub(super) logged_on: bool,
    /// A command was written and its `done` has not arrived yet.
    awaiting_done: bool,
    /// Text of the last `reply` message, taken by whoever parses it.
    pub(super) last_reply: Option<String>,
    pub(super) listing_parser: DirectoryListingParser,
    crypto: CryptoParameters,
    pub(super) transferred_bytes: u64,
}

impl SftpControlSocket {
    pub fn new(ctx: SessionContext, config: &EngineConfig) -> Self {
        Self {
            core: SocketCore::new(ctx, config.engine.clone()),
            sftp: config.sftp.clone(),
            connected: false,
            logged_on: false,
            awaiting_done: false,
            last_reply: None,
            listing_parser: DirectoryListingParser::new(),
            crypto: CryptoParameters::default(),
            transferred_bytes: 0,
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

    pub fn server(&self) -> Option<&Server> {
        self.core.server()
    }

    pub fn crypto_parameters(&self) -> &CryptoParameters {
        &self.crypto
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

    /// Parses the path the worker reported after `cd` or `pwd`.
    pub(super) fn take_reply_path(&mut self) -> Option<ServerPath> {
        let text = self.last_reply.take()?;
        ServerPath::parse(text.trim(), ServerType::Unix)
    }

    // Wire

    /// Writes a line that answers a question of the worker. No `done`
    /// follows it.
    pub(super) fn write_line(&mut self, line: &str, hide: bool) {
        if hide {
            debug!("Command: ****");
        } else {
            debug!("Command: {}", line);
        }
        self.core.emit(Outbound::WorkerLine(line.to_string()));
        self.core.touch();
    }

    // Events

    pub fn on_worker_message(&mut self, message: SftpMessage) {
        if !self.connected {
            return;
        }
        self.core.touch();
        match message {
            SftpMessage::Reply(text) => {
                debug!("Reply: {}", text);
                if matches!(self.core.ops.top(), Some(SftpOp::Connect(op)) if op.awaits_greeting())
                {
                    self.dispatch(|socket, op| match op {
                        SftpOp::Connect(connect) => socket.connect_greeting(connect, &text),
                        _ => Step::Wait,
                    });
                } else {
                    self.last_reply = Some(text);
                }
            }
            SftpMessage::Done(code) => {
                if !self.awaiting_done {
                    error!("Worker finished a command that was never sent");
                    self.do_close(ReplyCode::critical());
                    return;
                }
                self.awaiting_done = false;
                self.dispatch(|socket, op| socket.op_parse(op, code));
            }
            SftpMessage::Error(text) => error!("{}", text),
            SftpMessage::Verbose(text) => debug!("{}", text),
            SftpMessage::Status(text) => info!("{}", text),
            SftpMessage::Transfer(bytes) => {
                self.transferred_bytes += bytes;
                let total = self.transferred_bytes;
                self.core.notify(Notification::TransferStatus { bytes: total });
            }
            SftpMessage::ListEntry { line, mtime, name } => {
                if matches!(self.core.ops.top(), Some(SftpOp::List(_))) {
                    self.listing_parser
                        .add_line_with_time(&line, mtime, Some(&name));
                } else {
                    warn!("Listing entry without a running listing");
                }
            }
            SftpMessage::Request(request) => {
                self.dispatch(|socket, op| match op {
                    SftpOp::Connect(connect) => socket.connect_request(connect, request),
                    other => {
                        warn!("Worker request during {:?}", other.kind());
                        Step::Wait
                    }
                });
            }
            SftpMessage::UsedQuota { direction, bytes } => {
                debug!("Worker used {} bytes of {:?} quota", bytes, direction);
                self.grant_quota(direction);
            }
            SftpMessage::CryptoParameter { name, value } => {
                debug!("{}: {}", name, value);
                self.crypto.set(&name, &value);
            }
        }
    }

    /// The worker reported something that breaks the connection: garbage on
    /// its output, a closed pipe or a failed spawn.
    pub fn on_worker_error(&mut self, err: EngineError) {
        if !self.connected {
            return;
        }
        error!("{}", err);
        self.do_close(err.to_reply_code());
    }

    /// Rate limiting is not implemented, so every grant is unlimited.
    pub(super) fn grant_quota(&mut self, direction: QuotaDirection) {
        self.core
            .emit(Outbound::WorkerLine(format!("-{}-1", direction.digit())));
    }

    fn do_close(&mut self, code: ReplyCode) {
        let code = code.with_disconnected();
        if !self.core.ops.is_empty() {
            self.reset_operation(code);
        }
        self.close_connection();
    }

    fn op_parse(&mut self, op: &mut SftpOp, code: ReplyCode) -> Step<SftpOp> {
        match op {
            SftpOp::Connect(o) => self.connect_parse(o, code),
            SftpOp::ChangeDir(o) => self.cwd_parse(o, code),
            SftpOp::List(o) => self.list_parse(o, code),
            SftpOp::Transfer(o) => self.transfer_parse(o, code),
            SftpOp::Mkdir(o) => self.mkdir_parse(o, code),
            SftpOp::Delete(o) => self.delete_parse(o, code),
            SftpOp::RemoveDir(o) => self.rmdir_parse(o, code),
            SftpOp::Rename(o) => self.rename_parse(o, code),
            SftpOp::Chmod(o) => self.chmod_parse(o, code),
        }
    }

    fn start_operation(&mut self, op: SftpOp) -> ReplyCode {
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

impl OpDispatch for SftpControlSocket {
    type Op = SftpOp;

    fn core_mut(&mut self) -> &mut SocketCore<SftpOp> {
        &mut self.core
    }

    fn ready_to_send(&self) -> bool {
        !self.awaiting_done
    }

    fn send_command(&mut self, command: &str) {
        self.last_reply = None;
        self.write_line(command, false);
        self.awaiting_done = true;
    }

    fn op_send(&mut self, op: &mut SftpOp) -> Step<SftpOp> {
        match op {
            SftpOp::Connect(o) => self.connect_send(o),
            SftpOp::ChangeDir(o) => self.cwd_send(o),
            SftpOp::List(o) => self.list_send(o),
            SftpOp::Transfer(o) => self.transfer_send(o),
            SftpOp::Mkdir(o) => self.mkdir_send(o),
            SftpOp::Delete(o) => self.delete_send(o),
            SftpOp::RemoveDir(o) => self.rmdir_send(o),
            SftpOp::Rename(o) => self.rename_send(o),
            SftpOp::Chmod(o) => self.chmod_send(o),
        }
    }

    fn op_subcommand_result(&mut self, op: &mut SftpOp, code: ReplyCode) -> Step<SftpOp> {
        match op {
            SftpOp::List(o) => self.list_subcommand_result(o, code),
            SftpOp::Transfer(o) => self.transfer_subcommand_result(o, code),
            other => {
                error!("{:?} has no nested operations", other.kind());
                Step::Finish(ReplyCode::internal())
            }
        }
    }

    fn finish_op(&mut self, op: SftpOp, code: ReplyCode) {
        match op {
            SftpOp::Connect(_) => {
                if !code.is_ok() {
                    self.close_connection();
                }
            }
            SftpOp::List(o) => self.list_finished(o, code),
            SftpOp::Transfer(o) => self.transfer_finished(o, code),
            SftpOp::Mkdir(o) => self.mkdir_finished(o, code),
            SftpOp::Delete(o) => self.delete_finished(o),
            SftpOp::RemoveDir(o) => self.rmdir_finished(o),
            SftpOp::Rename(o) => self.rename_finished(o),
            SftpOp::Chmod(o) => self.chmod_finished(o),
            SftpOp::ChangeDir(_) => {}
        }
    }

    /// Asks the driver to stop the worker and forgets per-connection state.
    fn close_connection(&mut self) {
        if !self.connected {
            return;
        }
        info!("Disconnected");
        self.connected = false;
        self.logged_on = false;
        self.awaiting_done = false;
        self.last_reply = None;
        self.core.emit(Outbound::Disconnect);
        self.core.current_path = ServerPath::default();
        self.core.forget_locks();
    }
}

impl ControlSocket for SftpControlSocket {
    fn socket_id(&self) -> SocketId {
        self.core.id
    }

    fn connect(&mut self, server: Server) -> ReplyCode {
        if self.connected {
            error!("Already connected");
            return ReplyCode::error();
        }
        if server.protocol != Protocol::Sftp {
            error!("SFTP socket cannot connect with {:?}", server.protocol);
            return ReplyCode::of_kind(ErrorKind::NotSupported);
        }
        info!("Connecting to {}", server.display_name());
        self.core.emit(Outbound::SpawnWorker {
            program: self.sftp.worker_path.clone(),
            args: Vec::new(),
        });
        self.core.server = Some(server);
        self.core.current_path = ServerPath::default();
        self.connected = true;
        self.logged_on = false;
        self.awaiting_done = false;
        self.crypto = CryptoParameters::default();
        self.core
            .ops
            .push(SftpOp::Connect(ConnectOp::new(self.sftp.keyfiles.clone())));
        self.core.touch();
        ReplyCode::WouldBlock
    }

    fn list(&mut self, path: ServerPath, subdir: &str, flags: ListFlags) -> ReplyCode {
        if self.connected && self.logged_on && self.core.ops.is_empty() && !flags.refresh {
            if let Some(code) = self.list_from_cache_early(&path, subdir) {
                return code;
            }
        }
        self.start_operation(SftpOp::List(ListOp::new(path, subdir, flags)))
    }

    fn file_transfer(&mut self, command: TransferCommand) -> ReplyCode {
        if command.remote_file.is_empty() || command.remote_path.is_empty() {
            return ReplyCode::internal();
        }
        self.start_operation(SftpOp::Transfer(TransferOp::new(command)))
    }

    fn delete(&mut self, path: ServerPath, files: Vec<String>) -> ReplyCode {
        if files.is_empty() || path.is_empty() {
            return ReplyCode::internal();
        }
        self.start_operation(SftpOp::Delete(DeleteOp::new(path, files)))
    }

    fn remove_dir(&mut self, path: ServerPath, subdir: &str) -> ReplyCode {
        if subdir.is_empty() || path.is_empty() {
            return ReplyCode::internal();
        }
        self.start_operation(SftpOp::RemoveDir(RemoveDirOp::new(path, subdir)))
    }

    fn mkdir(&mut self, path: ServerPath) -> ReplyCode {
        if !path.has_parent() {
            return ReplyCode::internal();
        }
        self.start_operation(SftpOp::Mkdir(MkdirOp::new(path)))
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
        self.start_operation(SftpOp::Rename(RenameOp::new(
            from_path, from_file, to_path, to_file,
        )))
    }

    fn chmod(&mut self, path: ServerPath, file: &str, permissions: &str) -> ReplyCode {
        if file.is_empty() || permissions.is_empty() {
            return ReplyCode::internal();
        }
        self.start_operation(SftpOp::Chmod(ChmodOp::new(path, file, permissions)))
    }

    fn raw_command(&mut self, _command: &str) -> ReplyCode {
        error!("Raw commands are not supported over SFTP");
        ReplyCode::of_kind(ErrorKind::NotSupported)
    }

    /// The worker cannot abort a command, so canceling ends the connection.
    fn cancel(&mut self) {
        if self.core.ops.is_empty() {
            return;
        }
        info!("Canceling operation");
        self.do_close(ReplyCode::canceled());
    }

    fn set_async_request_reply(&mut self, id: RequestId, reply: AsyncReply) {
        if !self.core.take_async_reply(id) {
            return;
        }
        self.dispatch(|socket, op| match (op, reply) {
            (SftpOp::Connect(connect), AsyncReply::Trust(trusted)) => {
                socket.connect_trust_reply(connect, trusted)
            }
            (SftpOp::Connect(connect), AsyncReply::Password(password)) => {
                socket.connect_password_reply(connect, password)
            }
            (SftpOp::Transfer(transfer), AsyncReply::FileExists(action)) => {
                socket.transfer_file_exists_reply(transfer, action)
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
        if self.core.ops.is_empty() && !self.awaiting_done {
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
