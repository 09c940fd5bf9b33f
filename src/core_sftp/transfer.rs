//! File transfers through the worker's `get`/`put` family.
//!
//! The remote file's facts come from the cache, listing the directory first
//! if it is not cached. `mtime` fills in a precise time when one is needed.
//! The worker writes the local file itself.

use crate::core_cache::{EntryKind, FileLookup, RemoteTime, TimePrecision};
use crate::core_engine::{
    AsyncRequest, FileExistsAction, FileExistsRequest, ListFlags, Outbound, Step, TransferCommand,
};
use crate::core_error::ReplyCode;
use crate::core_sftp::control_socket::SftpControlSocket;
use crate::core_sftp::list::ListOp;
use crate::core_sftp::protocol::quote_filename;
use crate::core_sftp::sftpcommand::SftpOp;
use chrono::{TimeZone, Utc};
use log::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Lookup,
    WaitList,
    Mtime,
    WaitFileExists,
    Transfer,
    WaitTransfer,
    Chmtime,
}

#[derive(Debug)]
pub struct TransferOp {
    pub command: TransferCommand,
    state: TransferState,
    remote_size: Option<u64>,
    remote_time: Option<RemoteTime>,
    remote_exists: Option<bool>,
    resume: bool,
    transfer_started: bool,
}

impl TransferOp {
    pub fn new(command: TransferCommand) -> Self {
        Self {
            command,
            state: TransferState::Lookup,
            remote_size: None,
            remote_time: None,
            remote_exists: None,
            resume: false,
            transfer_started: false,
        }
    }

    fn remote_name(&self) -> String {
        quote_filename(
            &self
                .command
                .remote_path
                .format_filename(&self.command.remote_file, false),
        )
    }

    fn local_name(&self) -> String {
        quote_filename(&self.command.local_path.to_string_lossy())
    }

    fn target_exists(&self) -> bool {
        if self.command.download {
            self.command.local_size.is_some()
        } else {
            self.remote_exists == Some(true)
        }
    }
}

impl SftpControlSocket {
    pub(super) fn transfer_send(&mut self, op: &mut TransferOp) -> Step<SftpOp> {
        match op.state {
            TransferState::Lookup => self.transfer_lookup(op, true),
            TransferState::Mtime => Step::Send(format!("mtime {}", op.remote_name())),
            TransferState::Transfer => self.start_transfer(op),
            TransferState::WaitList
            | TransferState::WaitFileExists
            | TransferState::WaitTransfer
            | TransferState::Chmtime => Step::Wait,
        }
    }

    /// Reads what the cache knows about the remote file. With `may_list`
    /// an uncached directory is listed first.
    fn transfer_lookup(&mut self, op: &mut TransferOp, may_list: bool) -> Step<SftpOp> {
        let Some(server) = self.core.server.clone() else {
            return Step::Finish(ReplyCode::internal());
        };
        match self.core.ctx.cache.lookup_file(
            &server,
            &op.command.remote_path,
            &op.command.remote_file,
        ) {
            FileLookup::NoDirectory if may_list => {
                debug!("Listing {} to look for {}", op.command.remote_path, op.command.remote_file);
                op.state = TransferState::WaitList;
                return Step::Push(SftpOp::List(ListOp::new(
                    op.command.remote_path.clone(),
                    "",
                    ListFlags::default(),
                )));
            }
            FileLookup::Found { entry, .. } if !entry.is_unsure() => {
                if entry.is_dir() {
                    error!("{} is a directory", op.command.remote_file);
                    return Step::Finish(ReplyCode::error());
                }
                op.remote_exists = Some(true);
                op.remote_size = entry.size;
                op.remote_time = entry.time;
            }
            FileLookup::NotFound => op.remote_exists = Some(false),
            _ => {}
        }

        let want_time = (op.command.download && self.core.options.preserve_timestamps)
            || op.target_exists();
        if want_time
            && op.remote_exists != Some(false)
            && op.remote_time.map_or(true, |t| !t.has_seconds())
        {
            op.state = TransferState::Mtime;
            return Step::Continue;
        }
        self.transfer_check_file_exists(op)
    }

    fn transfer_check_file_exists(&mut self, op: &mut TransferOp) -> Step<SftpOp> {
        if !op.target_exists() {
            op.state = TransferState::Transfer;
            return Step::Continue;
        }
        op.state = TransferState::WaitFileExists;
        self.core.send_async_request(AsyncRequest::FileExists(FileExistsRequest {
            download: op.command.download,
            local_path: op.command.local_path.clone(),
            local_size: op.command.local_size,
            local_time: op.command.local_time,
            remote_path: op.command.remote_path.clone(),
            remote_file: op.command.remote_file.clone(),
            remote_size: op.remote_size,
            remote_time: op.remote_time,
        }));
        Step::Wait
    }

    pub(super) fn transfer_file_exists_reply(
        &mut self,
        op: &mut TransferOp,
        action: FileExistsAction,
    ) -> Step<SftpOp> {
        if op.state != TransferState::WaitFileExists {
            return Step::Wait;
        }
        let (source_time, target_time) = if op.command.download {
            (op.remote_time.map(|t| t.time), op.command.local_time)
        } else {
            (op.command.local_time, op.remote_time.map(|t| t.time))
        };
        op.resume = false;
        op.state = TransferState::Transfer;
        match action {
            FileExistsAction::Overwrite => Step::Continue,
            FileExistsAction::OverwriteNewer => match (source_time, target_time) {
                (Some(source), Some(target)) if source <= target => {
                    info!("Skipping {}, target is not older", op.command.remote_file);
                    Step::Finish(ReplyCode::Ok)
                }
                _ => Step::Continue,
            },
            FileExistsAction::OverwriteSize => match (op.remote_size, op.command.local_size) {
                (Some(remote), Some(local)) if remote == local => {
                    info!("Skipping {}, sizes match", op.command.remote_file);
                    Step::Finish(ReplyCode::Ok)
                }
                _ => Step::Continue,
            },
            FileExistsAction::Resume => {
                let (offset, other) = if op.command.download {
                    (op.command.local_size, op.remote_size)
                } else {
                    (op.remote_size, op.command.local_size)
                };
                let offset = offset.unwrap_or(0);
                if offset > 0 && other == Some(offset) {
                    info!("{} is already complete", op.command.remote_file);
                    return Step::Finish(ReplyCode::Ok);
                }
                op.resume = offset > 0;
                Step::Continue
            }
            FileExistsAction::Rename(name) => {
                if op.command.download {
                    op.command.local_path.set_file_name(&name);
                    op.command.local_size = None;
                    op.command.local_time = None;
                    return Step::Continue;
                }
                op.command.remote_file = name;
                op.remote_size = None;
                op.remote_time = None;
                op.remote_exists = None;
                op.state = TransferState::Lookup;
                Step::Continue
            }
            FileExistsAction::Skip => {
                info!("Skipping {}", op.command.remote_file);
                Step::Finish(ReplyCode::Ok)
            }
        }
    }

    fn start_transfer(&mut self, op: &mut TransferOp) -> Step<SftpOp> {
        let (remote, local) = (op.remote_name(), op.local_name());
        let command = match (op.command.download, op.resume) {
            (true, false) => format!("get {} {}", remote, local),
            (true, true) => format!(
                "reget {} {} {}",
                remote,
                local,
                op.command.local_size.unwrap_or(0)
            ),
            (false, false) => format!("put {} {}", local, remote),
            (false, true) => format!(
                "reput {} {} {}",
                local,
                remote,
                op.remote_size.unwrap_or(0)
            ),
        };
        op.transfer_started = true;
        op.state = TransferState::WaitTransfer;
        self.transferred_bytes = 0;
        Step::Send(command)
    }

    pub(super) fn transfer_subcommand_result(
        &mut self,
        op: &mut TransferOp,
        code: ReplyCode,
    ) -> Step<SftpOp> {
        if op.state != TransferState::WaitList {
            return Step::Finish(ReplyCode::internal());
        }
        if !code.is_ok() {
            debug!("Listing {} failed, transferring blind", op.command.remote_path);
        }
        self.transfer_lookup(op, false)
    }

    pub(super) fn transfer_parse(&mut self, op: &mut TransferOp, code: ReplyCode) -> Step<SftpOp> {
        match op.state {
            TransferState::Mtime => {
                let reply = self.last_reply.take();
                let exact = reply
                    .filter(|_| code.is_ok())
                    .and_then(|text| text.trim().parse::<i64>().ok())
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
                if let Some(time) = exact {
                    op.remote_time = Some(RemoteTime::new(time, TimePrecision::Seconds));
                    op.remote_exists = Some(true);
                }
                self.transfer_check_file_exists(op)
            }
            TransferState::WaitTransfer => {
                if !code.is_ok() {
                    return Step::Finish(code);
                }
                self.transfer_succeeded(op)
            }
            TransferState::Chmtime => {
                if !code.is_ok() {
                    warn!("Could not set the remote modification time");
                }
                Step::Finish(ReplyCode::Ok)
            }
            _ => Step::Finish(ReplyCode::internal()),
        }
    }

    fn transfer_succeeded(&mut self, op: &mut TransferOp) -> Step<SftpOp> {
        let preserve = self.core.options.preserve_timestamps;
        if op.command.download {
            info!("Downloaded {}", op.command.remote_file);
            if let (true, Some(time)) = (preserve, op.remote_time) {
                self.core.emit(Outbound::SetLocalFileTime {
                    path: op.command.local_path.clone(),
                    time: time.time,
                });
            }
            return Step::Finish(ReplyCode::Ok);
        }

        info!("Uploaded {}", op.command.remote_file);
        if let Some(server) = self.core.server.clone() {
            self.core.ctx.cache.update_file(
                &server,
                &op.command.remote_path,
                &op.command.remote_file,
                true,
                EntryKind::File,
                op.command.local_size,
            );
        }
        if let (true, Some(time)) = (preserve, op.command.local_time) {
            op.state = TransferState::Chmtime;
            return Step::Send(format!("chmtime {} {}", time.timestamp(), op.remote_name()));
        }
        Step::Finish(ReplyCode::Ok)
    }

    pub(super) fn transfer_finished(&mut self, op: TransferOp, code: ReplyCode) {
        if op.command.download {
            if !code.is_ok()
                && op.transfer_started
                && !op.resume
                && op.command.local_size.is_none()
                && self.transferred_bytes == 0
            {
                debug!("Removing empty local file {}", op.command.local_path.display());
                self.core
                    .emit(Outbound::DiscardLocalFile(op.command.local_path.clone()));
            }
            return;
        }
        if let Some(server) = self.core.server.clone() {
            if !code.is_ok() && op.transfer_started {
                self.core.ctx.cache.invalidate_file(
                    &server,
                    &op.command.remote_path,
                    &op.command.remote_file,
                    EntryKind::File,
                );
            }
        }
        if op.transfer_started {
            self.core
                .listing_notification(op.command.remote_path.clone(), false, false);
        }
    }
}
