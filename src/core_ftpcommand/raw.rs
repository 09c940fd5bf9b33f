//! Arbitrary commands typed by the user. Nothing is known about their
//! effect, so every cached fact about the server's paths is dropped.

use crate::core_engine::Step;
use crate::core_error::ReplyCode;
use crate::core_ftpcommand::control_socket::FtpControlSocket;
use crate::core_ftpcommand::ftpcommand::FtpOp;
use crate::core_server::ServerPath;

#[derive(Debug)]
pub struct RawCommandOp {
    pub command: String,
}

impl RawCommandOp {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.trim().to_string(),
        }
    }
}

impl FtpControlSocket {
    pub(super) fn raw_send(&mut self, op: &mut RawCommandOp) -> Step<FtpOp> {
        if let Some(server) = self.core.server.clone() {
            self.core.ctx.cache.invalidate_server(&server);
            self.core.ctx.path_cache.invalidate_server(&server);
        }
        self.core.current_path = ServerPath::default();
        self.last_type = None;
        Step::Send(op.command.clone())
    }

    pub(super) fn raw_parse(&mut self, _op: &mut RawCommandOp) -> Step<FtpOp> {
        match self.reply_class() {
            2 | 3 => Step::Finish(ReplyCode::Ok),
            _ => Step::Finish(ReplyCode::error()),
        }
    }
}
