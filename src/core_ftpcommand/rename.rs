use crate::core_cache::EntryKind;
use crate::core_engine::Step;
use crate::core_error::ReplyCode;
use crate::core_ftpcommand::control_socket::FtpControlSocket;
use crate::core_ftpcommand::cwd::CwdOp;
use crate::core_ftpcommand::ftpcommand::FtpOp;
use crate::core_server::ServerPath;
use log::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameState {
    WaitCwd,
    Rnfr,
    Rnto,
}

#[derive(Debug)]
pub struct RenameOp {
    pub from_path: ServerPath,
    pub from_file: String,
    pub to_path: ServerPath,
    pub to_file: String,
    state: RenameState,
    omit_path: bool,
}

impl RenameOp {
    pub fn new(from_path: ServerPath, from_file: &str, to_path: ServerPath, to_file: &str) -> Self {
        Self {
            from_path,
            from_file: from_file.to_string(),
            to_path,
            to_file: to_file.to_string(),
            state: RenameState::WaitCwd,
            omit_path: false,
        }
    }
}

impl FtpControlSocket {
    pub(super) fn rename_send(&mut self, op: &mut RenameOp) -> Step<FtpOp> {
        match op.state {
            RenameState::WaitCwd => {
                Step::Push(FtpOp::ChangeDir(CwdOp::new(op.from_path.clone(), "", false)))
            }
            RenameState::Rnfr => Step::Send(format!(
                "RNFR {}",
                op.from_path.format_filename(&op.from_file, op.omit_path)
            )),
            RenameState::Rnto => {
                let same_dir = op.omit_path && op.to_path == op.from_path;
                Step::Send(format!(
                    "RNTO {}",
                    op.to_path.format_filename(&op.to_file, same_dir)
                ))
            }
        }
    }

    pub(super) fn rename_subcommand_result(
        &mut self,
        op: &mut RenameOp,
        code: ReplyCode,
    ) -> Step<FtpOp> {
        op.omit_path = code.is_ok();
        op.state = RenameState::Rnfr;
        Step::Continue
    }

    pub(super) fn rename_parse(&mut self, op: &mut RenameOp) -> Step<FtpOp> {
        let Some(server) = self.core.server.clone() else {
            return Step::Finish(ReplyCode::internal());
        };
        match op.state {
            RenameState::Rnfr => {
                if self.reply_class() != 3 {
                    return Step::Finish(ReplyCode::error());
                }
                op.state = RenameState::Rnto;
                Step::Continue
            }
            RenameState::Rnto => {
                let ctx = &self.core.ctx;
                if !self.reply_succeeded() {
                    ctx.cache
                        .invalidate_file(&server, &op.from_path, &op.from_file, EntryKind::Unknown);
                    return Step::Finish(ReplyCode::error());
                }
                ctx.cache
                    .rename(&server, &op.from_path, &op.from_file, &op.to_path, &op.to_file);
                ctx.path_cache
                    .invalidate_path(&server, &op.from_path, &op.from_file);
                ctx.path_cache.invalidate_path(&server, &op.to_path, &op.to_file);
                info!("Renamed {} to {}", op.from_file, op.to_file);
                Step::Finish(ReplyCode::Ok)
            }
            RenameState::WaitCwd => Step::Finish(ReplyCode::internal()),
        }
    }

    pub(super) fn rename_finished(&mut self, op: RenameOp) {
        let different = op.from_path != op.to_path;
        self.core.listing_notification(op.from_path, false, false);
        if different {
            self.core.listing_notification(op.to_path, false, false);
        }
    }
}
