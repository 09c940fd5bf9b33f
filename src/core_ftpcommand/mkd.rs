//! Recursive directory creation.
//!
//! Walks up from the target with `CWD` until a directory exists, then
//! creates and enters each missing segment. If entering a freshly created
//! segment fails the whole path is created with one `MKD`.

use crate::core_cache::EntryKind;
use crate::core_engine::{LockReason, Step};
use crate::core_error::ReplyCode;
use crate::core_ftpcommand::control_socket::FtpControlSocket;
use crate::core_ftpcommand::ftpcommand::FtpOp;
use crate::core_server::ServerPath;
use log::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MkdirState {
    Lock,
    FindParent,
    Mkd,
    CwdSub,
    MkdFull,
}

#[derive(Debug)]
pub struct MkdirOp {
    pub path: ServerPath,
    state: MkdirState,
    /// Deepest directory probed so far.
    current: ServerPath,
    /// Segments below `current` still to create.
    missing: Vec<String>,
    holds_lock: bool,
}

impl MkdirOp {
    pub fn new(path: ServerPath) -> Self {
        Self {
            current: path.clone(),
            path,
            state: MkdirState::Lock,
            missing: Vec::new(),
            holds_lock: false,
        }
    }
}

impl FtpControlSocket {
    pub(super) fn mkdir_send(&mut self, op: &mut MkdirOp) -> Step<FtpOp> {
        match op.state {
            MkdirState::Lock => {
                if !self.core.try_lock(&op.path, LockReason::Mkdir) {
                    return Step::Wait;
                }
                op.holds_lock = true;
                op.state = MkdirState::FindParent;
                if op.current == self.core.current_path {
                    debug!("{} already exists", op.path);
                    return Step::Finish(ReplyCode::Ok);
                }
                Step::Continue
            }
            MkdirState::FindParent => Step::Send(format!("CWD {}", op.current.get_path())),
            MkdirState::Mkd => match op.missing.first() {
                Some(segment) => Step::Send(format!("MKD {}", segment)),
                None => Step::Finish(ReplyCode::Ok),
            },
            MkdirState::CwdSub => match op.missing.first() {
                Some(segment) => Step::Send(format!("CWD {}", segment)),
                None => Step::Finish(ReplyCode::Ok),
            },
            MkdirState::MkdFull => Step::Send(format!("MKD {}", op.path.get_path())),
        }
    }

    pub(super) fn mkdir_parse(&mut self, op: &mut MkdirOp) -> Step<FtpOp> {
        let Some(server) = self.core.server.clone() else {
            return Step::Finish(ReplyCode::internal());
        };
        let succeeded = self.reply_succeeded();
        match op.state {
            MkdirState::FindParent => {
                if succeeded {
                    self.core.current_path = op.current.clone();
                    if op.missing.is_empty() {
                        return Step::Finish(ReplyCode::Ok);
                    }
                    op.state = MkdirState::Mkd;
                    return Step::Continue;
                }
                let segment = op.current.last_segment().map(str::to_string);
                match (segment, op.current.parent()) {
                    (Some(segment), Some(parent)) => {
                        op.missing.insert(0, segment);
                        op.current = parent;
                    }
                    _ => op.state = MkdirState::MkdFull,
                }
                Step::Continue
            }
            MkdirState::Mkd => {
                // A failure may just mean it exists already; entering it tells.
                op.state = MkdirState::CwdSub;
                Step::Continue
            }
            MkdirState::CwdSub => {
                if !succeeded {
                    self.core.current_path = ServerPath::default();
                    op.state = MkdirState::MkdFull;
                    return Step::Continue;
                }
                let segment = op.missing.remove(0);
                self.core.ctx.cache.update_file(
                    &server,
                    &op.current,
                    &segment,
                    true,
                    EntryKind::Dir,
                    None,
                );
                let Some(next) = op.current.with_segment(&segment) else {
                    return Step::Finish(ReplyCode::internal());
                };
                op.current = next;
                self.core.current_path = op.current.clone();
                if op.missing.is_empty() {
                    info!("Created {}", op.path);
                    return Step::Finish(ReplyCode::Ok);
                }
                op.state = MkdirState::Mkd;
                Step::Continue
            }
            MkdirState::MkdFull => {
                if !succeeded {
                    return Step::Finish(ReplyCode::error());
                }
                if let (Some(parent), Some(name)) = (op.path.parent(), op.path.last_segment()) {
                    self.core
                        .ctx
                        .cache
                        .update_file(&server, &parent, name, true, EntryKind::Dir, None);
                }
                info!("Created {}", op.path);
                Step::Finish(ReplyCode::Ok)
            }
            MkdirState::Lock => Step::Finish(ReplyCode::internal()),
        }
    }

    pub(super) fn mkdir_finished(&mut self, op: MkdirOp, code: ReplyCode) {
        self.core.release_if_held(op.holds_lock, LockReason::Mkdir);
        if code.is_ok() {
            if let Some(parent) = op.path.parent() {
                self.core.listing_notification(parent, false, false);
            }
        }
    }
}
