use crate::core_cache::EntryKind;
use crate::core_engine::Step;
use crate::core_error::ReplyCode;
use crate::core_ftpcommand::control_socket::FtpControlSocket;
use crate::core_ftpcommand::cwd::CwdOp;
use crate::core_ftpcommand::ftpcommand::FtpOp;
use crate::core_server::ServerPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChmodState {
    WaitCwd,
    Chmod,
}

#[derive(Debug)]
pub struct ChmodOp {
    pub path: ServerPath,
    pub file: String,
    pub permissions: String,
    state: ChmodState,
    omit_path: bool,
}

impl ChmodOp {
    pub fn new(path: ServerPath, file: &str, permissions: &str) -> Self {
        Self {
            path,
            file: file.to_string(),
            permissions: permissions.to_string(),
            state: ChmodState::WaitCwd,
            omit_path: false,
        }
    }
}

impl FtpControlSocket {
    pub(super) fn chmod_send(&mut self, op: &mut ChmodOp) -> Step<FtpOp> {
        match op.state {
            ChmodState::WaitCwd => {
                Step::Push(FtpOp::ChangeDir(CwdOp::new(op.path.clone(), "", false)))
            }
            ChmodState::Chmod => Step::Send(format!(
                "SITE CHMOD {} {}",
                op.permissions,
                op.path.format_filename(&op.file, op.omit_path)
            )),
        }
    }

    pub(super) fn chmod_subcommand_result(
        &mut self,
        op: &mut ChmodOp,
        code: ReplyCode,
    ) -> Step<FtpOp> {
        op.omit_path = code.is_ok();
        op.state = ChmodState::Chmod;
        Step::Continue
    }

    pub(super) fn chmod_parse(&mut self, op: &mut ChmodOp) -> Step<FtpOp> {
        if !self.reply_succeeded() {
            return Step::Finish(ReplyCode::error());
        }
        if let Some(server) = self.core.server.clone() {
            self.core.ctx.cache.update_file(
                &server,
                &op.path,
                &op.file,
                false,
                EntryKind::Unknown,
                None,
            );
        }
        Step::Finish(ReplyCode::Ok)
    }

    pub(super) fn chmod_finished(&mut self, op: ChmodOp) {
        self.core.listing_notification(op.path, false, false);
    }
}
