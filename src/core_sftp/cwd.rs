use crate::core_engine::Step;
use crate::core_error::{ErrorKind, ReplyCode};
use crate::core_server::ServerPath;
use crate::core_sftp::control_socket::SftpControlSocket;
use crate::core_sftp::protocol::quote_filename;
use crate::core_sftp::sftpcommand::SftpOp;
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CwdState {
    Init,
    Pwd,
    Cwd,
    CwdSubdir,
}

/// Changes into `path`, then `subdir` below it. The worker answers both
/// `pwd` and `cd` with the resulting absolute path.
#[derive(Debug)]
pub struct CwdOp {
    pub path: ServerPath,
    pub subdir: String,
    pub link_discovery: bool,
    state: CwdState,
    known_target: Option<ServerPath>,
}

impl CwdOp {
    pub fn new(path: ServerPath, subdir: &str, link_discovery: bool) -> Self {
        Self {
            path,
            subdir: subdir.to_string(),
            link_discovery,
            state: CwdState::Init,
            known_target: None,
        }
    }
}

impl SftpControlSocket {
    pub(super) fn cwd_send(&mut self, op: &mut CwdOp) -> Step<SftpOp> {
        match op.state {
            CwdState::Init => self.cwd_init(op),
            CwdState::Pwd => Step::Send("pwd".to_string()),
            CwdState::Cwd => Step::Send(format!("cd {}", quote_filename(&op.path.get_path()))),
            CwdState::CwdSubdir => {
                let current = &self.core.current_path;
                let target = match current.change_path(&op.subdir) {
                    Some(path) => path.get_path(),
                    None => op.subdir.clone(),
                };
                Step::Send(format!("cd {}", quote_filename(&target)))
            }
        }
    }

    fn cwd_init(&mut self, op: &mut CwdOp) -> Step<SftpOp> {
        let Some(server) = self.core.server.clone() else {
            return Step::Finish(ReplyCode::internal());
        };
        let current = self.core.current_path.clone();
        let base = if op.path.is_empty() {
            current.clone()
        } else {
            op.path.clone()
        };
        if base.is_empty() {
            op.state = if op.subdir.is_empty() {
                CwdState::Pwd
            } else {
                CwdState::CwdSubdir
            };
            return Step::Continue;
        }
        op.path = base.clone();

        if op.subdir.is_empty() {
            if base == current {
                return Step::Finish(ReplyCode::Ok);
            }
            op.state = CwdState::Cwd;
            return Step::Continue;
        }

        if let Some(target) = self.core.ctx.path_cache.lookup(&server, &base, &op.subdir) {
            if target == current {
                debug!("Already in {}", target);
                return Step::Finish(ReplyCode::Ok);
            }
            op.path = target.clone();
            op.known_target = Some(target);
            op.state = CwdState::Cwd;
            return Step::Continue;
        }

        op.state = if base == current {
            CwdState::CwdSubdir
        } else {
            CwdState::Cwd
        };
        Step::Continue
    }

    pub(super) fn cwd_parse(&mut self, op: &mut CwdOp, code: ReplyCode) -> Step<SftpOp> {
        let reported = self.take_reply_path();
        match op.state {
            CwdState::Pwd => match (code.is_ok(), reported) {
                (true, Some(path)) => {
                    self.core.current_path = path;
                    Step::Finish(ReplyCode::Ok)
                }
                _ => Step::Finish(ReplyCode::error()),
            },
            CwdState::Cwd => {
                if !code.is_ok() {
                    if op.known_target.is_some() {
                        if let Some(server) = self.core.server.clone() {
                            self.core.ctx.path_cache.invalidate_server(&server);
                        }
                    }
                    self.core.current_path = ServerPath::default();
                    return Step::Finish(ReplyCode::error());
                }
                if let Some(target) = op.known_target.take() {
                    self.core.current_path = reported.unwrap_or(target);
                    return Step::Finish(ReplyCode::Ok);
                }
                let current = reported.unwrap_or_else(|| op.path.clone());
                if let Some(server) = self.core.server.clone() {
                    self.core.ctx.path_cache.store(&server, &current, &op.path, "");
                }
                self.core.current_path = current;
                if op.subdir.is_empty() {
                    return Step::Finish(ReplyCode::Ok);
                }
                op.state = CwdState::CwdSubdir;
                Step::Continue
            }
            CwdState::CwdSubdir => {
                if !code.is_ok() {
                    if op.link_discovery {
                        debug!("{} is not a directory", op.subdir);
                        return Step::Finish(ReplyCode::of_kind(ErrorKind::LinkNotDir));
                    }
                    return Step::Finish(ReplyCode::error());
                }
                let base = self.core.current_path.clone();
                let Some(current) = reported.or_else(|| base.change_path(&op.subdir)) else {
                    self.core.current_path = ServerPath::default();
                    return Step::Finish(ReplyCode::error());
                };
                if let Some(server) = self.core.server.clone() {
                    if !base.is_empty() {
                        self.core.ctx.path_cache.store(&server, &current, &base, &op.subdir);
                    }
                }
                self.core.current_path = current;
                Step::Finish(ReplyCode::Ok)
            }
            CwdState::Init => Step::Finish(ReplyCode::internal()),
        }
    }
}
