use crate::core_engine::Step;
use crate::core_error::ReplyCode;
use crate::core_ftpcommand::control_socket::FtpControlSocket;
use crate::core_ftpcommand::cwd::CwdOp;
use crate::core_ftpcommand::ftpcommand::FtpOp;
use crate::core_server::ServerPath;
use log::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveDirState {
    WaitCwd,
    Rmd,
}

#[derive(Debug)]
pub struct RemoveDirOp {
    pub path: ServerPath,
    pub subdir: String,
    state: RemoveDirState,
    omit_path: bool,
}

impl RemoveDirOp {
    pub fn new(path: ServerPath, subdir: &str) -> Self {
        Self {
            path,
            subdir: subdir.to_string(),
            state: RemoveDirState::WaitCwd,
            omit_path: false,
        }
    }
}

impl FtpControlSocket {
    pub(super) fn rmd_send(&mut self, op: &mut RemoveDirOp) -> Step<FtpOp> {
        match op.state {
            RemoveDirState::WaitCwd => {
                Step::Push(FtpOp::ChangeDir(CwdOp::new(op.path.clone(), "", false)))
            }
            RemoveDirState::Rmd => Step::Send(format!(
                "RMD {}",
                op.path.format_filename(&op.subdir, op.omit_path)
            )),
        }
    }

    pub(super) fn rmd_subcommand_result(
        &mut self,
        op: &mut RemoveDirOp,
        code: ReplyCode,
    ) -> Step<FtpOp> {
        op.omit_path = code.is_ok();
        op.state = RemoveDirState::Rmd;
        Step::Continue
    }

    pub(super) fn rmd_parse(&mut self, op: &mut RemoveDirOp) -> Step<FtpOp> {
        if !self.reply_succeeded() {
            return Step::Finish(ReplyCode::error());
        }
        let Some(server) = self.core.server.clone() else {
            return Step::Finish(ReplyCode::internal());
        };
        let ctx = &self.core.ctx;
        let target = ctx
            .path_cache
            .lookup(&server, &op.path, &op.subdir)
            .unwrap_or_default();
        ctx.cache.remove_dir(&server, &op.path, &op.subdir, &target);
        ctx.path_cache.invalidate_path(&server, &op.path, &op.subdir);
        info!("Removed {}", op.path.format_filename(&op.subdir, false));
        Step::Finish(ReplyCode::Ok)
    }

    pub(super) fn rmd_finished(&mut self, op: RemoveDirOp) {
        self.core.listing_notification(op.path, false, false);
    }
}
