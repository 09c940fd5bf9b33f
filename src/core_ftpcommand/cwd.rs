use crate::core_engine::Step;
use crate::core_error::{ErrorKind, ReplyCode};
use crate::core_ftpcommand::control_socket::FtpControlSocket;
use crate::core_ftpcommand::ftpcommand::FtpOp;
use crate::core_server::{ServerPath, ServerType};
use log::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CwdState {
    Init,
    /// Only asking where we are.
    Pwd,
    Cwd,
    PwdCwd,
    CwdSubdir,
    PwdSubdir,
}

#[derive(Debug)]
pub struct CwdOp {
    pub path: ServerPath,
    pub subdir: String,
    pub link_discovery: bool,
    state: CwdState,
    /// Set when the path cache already resolved the target.
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

/// Extracts the quoted path of a `257 "/path" is current directory` reply.
/// Doubled quotes inside the path stand for one quote.
pub fn parse_pwd_reply(reply: &str) -> Option<String> {
    let start = reply.find('"')?;
    let mut chars = reply[start + 1..].chars().peekable();
    let mut path = String::new();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
                path.push('"');
                continue;
            }
            return (!path.is_empty()).then_some(path);
        }
        path.push(c);
    }
    None
}

impl FtpControlSocket {
    pub(super) fn cwd_send(&mut self, op: &mut CwdOp) -> Step<FtpOp> {
        match op.state {
            CwdState::Init => self.cwd_init(op),
            CwdState::Pwd | CwdState::PwdCwd | CwdState::PwdSubdir => {
                Step::Send("PWD".to_string())
            }
            CwdState::Cwd => Step::Send(format!("CWD {}", op.path.get_path())),
            CwdState::CwdSubdir => {
                if op.subdir == ".." && self.core.current_path.has_parent() {
                    Step::Send("CDUP".to_string())
                } else {
                    let arg = if self.core.current_path.is_empty() {
                        op.subdir.clone()
                    } else {
                        self.core.current_path.format_subdir(&op.subdir)
                    };
                    Step::Send(format!("CWD {}", arg))
                }
            }
        }
    }

    fn cwd_init(&mut self, op: &mut CwdOp) -> Step<FtpOp> {
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

        let path_cache = self.core.ctx.path_cache.clone();
        if op.subdir.is_empty() {
            if base == current {
                return Step::Finish(ReplyCode::Ok);
            }
            if path_cache.lookup(&server, &base, "").as_ref() == Some(&current) {
                return Step::Finish(ReplyCode::Ok);
            }
            op.state = CwdState::Cwd;
            return Step::Continue;
        }

        if let Some(target) = path_cache.lookup(&server, &base, &op.subdir) {
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

    pub(super) fn cwd_parse(&mut self, op: &mut CwdOp) -> Step<FtpOp> {
        let succeeded = self.reply_succeeded();
        match op.state {
            CwdState::Pwd => match self.parse_pwd() {
                Some(path) => {
                    self.core.current_path = path;
                    Step::Finish(ReplyCode::Ok)
                }
                None => Step::Finish(ReplyCode::error()),
            },
            CwdState::Cwd => {
                if !succeeded {
                    if op.known_target.is_some() {
                        if let Some(server) = self.core.server.clone() {
                            self.core.ctx.path_cache.invalidate_server(&server);
                        }
                    }
                    self.core.current_path = ServerPath::default();
                    return Step::Finish(ReplyCode::error());
                }
                if let Some(target) = op.known_target.take() {
                    self.core.current_path = target;
                    return Step::Finish(ReplyCode::Ok);
                }
                op.state = CwdState::PwdCwd;
                Step::Continue
            }
            CwdState::PwdCwd => {
                let current = match self.parse_pwd() {
                    Some(path) => path,
                    None => {
                        warn!("PWD failed, assuming {}", op.path);
                        op.path.clone()
                    }
                };
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
                if !succeeded {
                    if op.link_discovery {
                        debug!("{} is not a directory", op.subdir);
                        return Step::Finish(ReplyCode::of_kind(ErrorKind::LinkNotDir));
                    }
                    return Step::Finish(ReplyCode::error());
                }
                op.state = CwdState::PwdSubdir;
                Step::Continue
            }
            CwdState::PwdSubdir => {
                let base = self.core.current_path.clone();
                let current = match self.parse_pwd() {
                    Some(path) => Some(path),
                    None => base.change_path(&op.subdir),
                };
                let Some(current) = current else {
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

    /// Reads the current directory out of a PWD reply. The first one also
    /// settles an undetected server type.
    fn parse_pwd(&mut self) -> Option<ServerPath> {
        if !self.reply_succeeded() {
            return None;
        }
        let raw = parse_pwd_reply(&self.last_reply)?;
        let server = self.core.server.as_mut()?;
        let path = ServerPath::parse(&raw, server.server_type)?;
        if server.server_type == ServerType::Default {
            debug!("Server type {:?} detected from PWD", path.kind());
            server.server_type = path.kind();
        }
        Some(path)
    }
}
