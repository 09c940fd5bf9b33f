use crate::core_cache::EntryKind;
use crate::core_engine::Step;
use crate::core_error::ReplyCode;
use crate::core_ftpcommand::control_socket::FtpControlSocket;
use crate::core_ftpcommand::cwd::CwdOp;
use crate::core_ftpcommand::ftpcommand::FtpOp;
use crate::core_server::ServerPath;
use log::{info, warn};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteState {
    WaitCwd,
    Delete,
}

#[derive(Debug)]
pub struct DeleteOp {
    pub path: ServerPath,
    files: VecDeque<String>,
    state: DeleteState,
    omit_path: bool,
    any_failed: bool,
}

impl DeleteOp {
    pub fn new(path: ServerPath, files: Vec<String>) -> Self {
        Self {
            path,
            files: files.into(),
            state: DeleteState::WaitCwd,
            omit_path: false,
            any_failed: false,
        }
    }
}

impl FtpControlSocket {
    pub(super) fn delete_send(&mut self, op: &mut DeleteOp) -> Step<FtpOp> {
        match op.state {
            DeleteState::WaitCwd => {
                Step::Push(FtpOp::ChangeDir(CwdOp::new(op.path.clone(), "", false)))
            }
            DeleteState::Delete => match op.files.front() {
                Some(file) => Step::Send(format!(
                    "DELE {}",
                    op.path.format_filename(file, op.omit_path)
                )),
                None => Step::Finish(ReplyCode::Ok),
            },
        }
    }

    pub(super) fn delete_subcommand_result(
        &mut self,
        op: &mut DeleteOp,
        code: ReplyCode,
    ) -> Step<FtpOp> {
        op.omit_path = code.is_ok();
        op.state = DeleteState::Delete;
        Step::Continue
    }

    pub(super) fn delete_parse(&mut self, op: &mut DeleteOp) -> Step<FtpOp> {
        let Some(server) = self.core.server.clone() else {
            return Step::Finish(ReplyCode::internal());
        };
        let Some(file) = op.files.pop_front() else {
            return Step::Finish(ReplyCode::internal());
        };
        let cache = &self.core.ctx.cache;
        if self.reply_succeeded() {
            info!("Deleted {}", op.path.format_filename(&file, false));
            cache.remove_file(&server, &op.path, &file);
        } else {
            warn!("Could not delete {}: {}", file, self.last_reply);
            cache.invalidate_file(&server, &op.path, &file, EntryKind::File);
            op.any_failed = true;
        }
        if op.files.is_empty() {
            return Step::Finish(if op.any_failed {
                ReplyCode::error()
            } else {
                ReplyCode::Ok
            });
        }
        Step::Continue
    }

    pub(super) fn delete_finished(&mut self, op: DeleteOp) {
        self.core.listing_notification(op.path, false, false);
    }
}
