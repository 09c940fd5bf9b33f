//! Single-command operations: `mkdir`, `rm`, `rmdir`, `mv` and `chmod`.
//!
//! Every argument is an absolute, quoted path, so none of them needs to
//! change the working directory first.

use crate::core_cache::EntryKind;
use crate::core_engine::{LockReason, Step};
use crate::core_error::ReplyCode;
use crate::core_server::ServerPath;
use crate::core_sftp::control_socket::SftpControlSocket;
use crate::core_sftp::protocol::quote_filename;
use crate::core_sftp::sftpcommand::SftpOp;
use log::{debug, info, warn};
use std::collections::VecDeque;

fn quoted(path: &ServerPath, file: &str) -> String {
    quote_filename(&path.format_filename(file, false))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MkdirState {
    Lock,
    FindParent,
    Mkdir,
}

/// Creates `path` and any missing parents. Walks up with `cd` until a
/// directory exists, then creates each missing segment below it.
#[derive(Debug)]
pub struct MkdirOp {
    pub path: ServerPath,
    state: MkdirState,
    current: ServerPath,
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

#[derive(Debug)]
pub struct DeleteOp {
    pub path: ServerPath,
    files: VecDeque<String>,
    any_failed: bool,
}

impl DeleteOp {
    pub fn new(path: ServerPath, files: Vec<String>) -> Self {
        Self {
            path,
            files: files.into(),
            any_failed: false,
        }
    }
}

#[derive(Debug)]
pub struct RemoveDirOp {
    pub path: ServerPath,
    pub subdir: String,
}

impl RemoveDirOp {
    pub fn new(path: ServerPath, subdir: &str) -> Self {
        Self {
            path,
            subdir: subdir.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct RenameOp {
    pub from_path: ServerPath,
    pub from_file: String,
    pub to_path: ServerPath,
    pub to_file: String,
}

impl RenameOp {
    pub fn new(from_path: ServerPath, from_file: &str, to_path: ServerPath, to_file: &str) -> Self {
        Self {
            from_path,
            from_file: from_file.to_string(),
            to_path,
            to_file: to_file.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ChmodOp {
    pub path: ServerPath,
    pub file: String,
    pub permissions: String,
}

impl ChmodOp {
    pub fn new(path: ServerPath, file: &str, permissions: &str) -> Self {
        Self {
            path,
            file: file.to_string(),
            permissions: permissions.to_string(),
        }
    }
}

impl SftpControlSocket {
    pub(super) fn mkdir_send(&mut self, op: &mut MkdirOp) -> Step<SftpOp> {
        match op.state {
            MkdirState::Lock => {
                if !self.core.try_lock(&op.path, LockReason::Mkdir) {
                    return Step::Wait;
                }
                op.holds_lock = true;
                if op.current == self.core.current_path {
                    debug!("{} already exists", op.path);
                    return Step::Finish(ReplyCode::Ok);
                }
                op.state = MkdirState::FindParent;
                Step::Continue
            }
            MkdirState::FindParent => {
                Step::Send(format!("cd {}", quote_filename(&op.current.get_path())))
            }
            MkdirState::Mkdir => match op.missing.first() {
                Some(segment) => Step::Send(format!("mkdir {}", quoted(&op.current, segment))),
                None => Step::Finish(ReplyCode::Ok),
            },
        }
    }

    pub(super) fn mkdir_parse(&mut self, op: &mut MkdirOp, code: ReplyCode) -> Step<SftpOp> {
        let Some(server) = self.core.server.clone() else {
            return Step::Finish(ReplyCode::internal());
        };
        match op.state {
            MkdirState::FindParent => {
                if code.is_ok() {
                    self.core.current_path =
                        self.take_reply_path().unwrap_or_else(|| op.current.clone());
                    if op.missing.is_empty() {
                        return Step::Finish(ReplyCode::Ok);
                    }
                    op.state = MkdirState::Mkdir;
                    return Step::Continue;
                }
                let segment = op.current.last_segment().map(str::to_string);
                match (segment, op.current.parent()) {
                    (Some(segment), Some(parent)) => {
                        op.missing.insert(0, segment);
                        op.current = parent;
                        Step::Continue
                    }
                    _ => Step::Finish(ReplyCode::error()),
                }
            }
            MkdirState::Mkdir => {
                if !code.is_ok() {
                    return Step::Finish(ReplyCode::error());
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
                if op.missing.is_empty() {
                    info!("Created {}", op.path);
                    return Step::Finish(ReplyCode::Ok);
                }
                Step::Continue
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

    pub(super) fn delete_send(&mut self, op: &mut DeleteOp) -> Step<SftpOp> {
        match op.files.front() {
            Some(file) => Step::Send(format!("rm {}", quoted(&op.path, file))),
            None if op.any_failed => Step::Finish(ReplyCode::error()),
            None => Step::Finish(ReplyCode::Ok),
        }
    }

    pub(super) fn delete_parse(&mut self, op: &mut DeleteOp, code: ReplyCode) -> Step<SftpOp> {
        let Some(server) = self.core.server.clone() else {
            return Step::Finish(ReplyCode::internal());
        };
        let Some(file) = op.files.pop_front() else {
            return Step::Finish(ReplyCode::internal());
        };
        if code.is_ok() {
            self.core.ctx.cache.remove_file(&server, &op.path, &file);
        } else {
            warn!("Could not delete {}", file);
            self.core
                .ctx
                .cache
                .invalidate_file(&server, &op.path, &file, EntryKind::File);
            op.any_failed = true;
        }
        Step::Continue
    }

    pub(super) fn delete_finished(&mut self, op: DeleteOp) {
        self.core.listing_notification(op.path, false, false);
    }

    pub(super) fn rmdir_send(&mut self, op: &mut RemoveDirOp) -> Step<SftpOp> {
        Step::Send(format!("rmdir {}", quoted(&op.path, &op.subdir)))
    }

    pub(super) fn rmdir_parse(&mut self, op: &mut RemoveDirOp, code: ReplyCode) -> Step<SftpOp> {
        if !code.is_ok() {
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

    pub(super) fn rmdir_finished(&mut self, op: RemoveDirOp) {
        self.core.listing_notification(op.path, false, false);
    }

    pub(super) fn rename_send(&mut self, op: &mut RenameOp) -> Step<SftpOp> {
        Step::Send(format!(
            "mv {} {}",
            quoted(&op.from_path, &op.from_file),
            quoted(&op.to_path, &op.to_file)
        ))
    }

    pub(super) fn rename_parse(&mut self, op: &mut RenameOp, code: ReplyCode) -> Step<SftpOp> {
        let Some(server) = self.core.server.clone() else {
            return Step::Finish(ReplyCode::internal());
        };
        let ctx = &self.core.ctx;
        if !code.is_ok() {
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

    pub(super) fn rename_finished(&mut self, op: RenameOp) {
        let different = op.from_path != op.to_path;
        self.core.listing_notification(op.from_path, false, false);
        if different {
            self.core.listing_notification(op.to_path, false, false);
        }
    }

    pub(super) fn chmod_send(&mut self, op: &mut ChmodOp) -> Step<SftpOp> {
        Step::Send(format!(
            "chmod {} {}",
            op.permissions,
            quoted(&op.path, &op.file)
        ))
    }

    pub(super) fn chmod_parse(&mut self, op: &mut ChmodOp, code: ReplyCode) -> Step<SftpOp> {
        if !code.is_ok() {
            return Step::Finish(ReplyCode::error());
        }
        if let Some(server) = self.core.server.clone() {
            self.core
                .ctx
                .cache
                .update_file(&server, &op.path, &op.file, false, EntryKind::Unknown, None);
        }
        Step::Finish(ReplyCode::Ok)
    }

    pub(super) fn chmod_finished(&mut self, op: ChmodOp) {
        self.core.listing_notification(op.path, false, false);
    }
}
