//! File transfers: remote file facts, file-exists resolution, resume checks
//! and the transfer itself.

use crate::core_cache::{EntryKind, FileLookup, RemoteTime, TimePrecision};
use crate::core_engine::timezone::{format_timeval, parse_timeval};
use crate::core_engine::{
    AsyncRequest, DataTask, FileExistsAction, FileExistsRequest, Outbound, Step, TransferCommand,
};
use crate::core_error::ReplyCode;
use crate::core_ftpcommand::control_socket::FtpControlSocket;
use crate::core_ftpcommand::cwd::CwdOp;
use crate::core_ftpcommand::ftpcommand::FtpOp;
use crate::core_server::{Capability, CapabilityValue};
use log::{debug, error, info, warn};

const SIZE_2GB: u64 = 1 << 31;
const SIZE_4GB: u64 = 1 << 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    WaitCwd,
    Size,
    Mdtm,
    WaitFileExists,
    ResumeTest,
    WaitResumeTest,
    Transfer,
    WaitTransfer,
    Mfmt,
}

#[derive(Debug)]
pub struct TransferOp {
    pub command: TransferCommand,
    state: TransferState,
    omit_path: bool,
    remote_size: Option<u64>,
    remote_time: Option<RemoteTime>,
    /// `None` while unknown.
    remote_exists: Option<bool>,
    resume: bool,
    transfer_started: bool,
}

impl TransferOp {
    pub fn new(command: TransferCommand) -> Self {
        Self {
            command,
            state: TransferState::WaitCwd,
            omit_path: false,
            remote_size: None,
            remote_time: None,
            remote_exists: None,
            resume: false,
            transfer_started: false,
        }
    }

    fn remote_name(&self) -> String {
        self.command
            .remote_path
            .format_filename(&self.command.remote_file, self.omit_path)
    }

    /// The resume bug capability that applies to `offset`, if any.
    fn resume_bug_capability(offset: u64) -> Option<Capability> {
        if offset >= SIZE_4GB {
            Some(Capability::Resume4GbBug)
        } else if offset >= SIZE_2GB {
            Some(Capability::Resume2GbBug)
        } else {
            None
        }
    }
}

impl FtpControlSocket {
    pub(super) fn transfer_send(&mut self, op: &mut TransferOp) -> Step<FtpOp> {
        match op.state {
            TransferState::WaitCwd => Step::Push(FtpOp::ChangeDir(CwdOp::new(
                op.command.remote_path.clone(),
                "",
                false,
            ))),
            TransferState::Size => Step::Send(format!("SIZE {}", op.remote_name())),
            TransferState::Mdtm => Step::Send(format!("MDTM {}", op.remote_name())),
            TransferState::ResumeTest => {
                let offset = op.remote_size.unwrap_or(1).saturating_sub(1);
                op.state = TransferState::WaitResumeTest;
                info!("Testing the server for the large file resume bug");
                Step::Push(FtpOp::RawTransfer(self.new_raw_transfer(
                    &format!("RETR {}", op.remote_name()),
                    DataTask::Discard,
                    'I',
                    offset,
                )))
            }
            TransferState::Transfer => self.start_transfer(op),
            TransferState::WaitFileExists
            | TransferState::WaitResumeTest
            | TransferState::WaitTransfer
            | TransferState::Mfmt => Step::Wait,
        }
    }

    /// Decides what to ask the server about the remote file before the
    /// file-exists check.
    fn transfer_after_cwd(&mut self, op: &mut TransferOp) -> Step<FtpOp> {
        let Some(server) = self.core.server.clone() else {
            return Step::Finish(ReplyCode::internal());
        };
        match self.core.ctx.cache.lookup_file(
            &server,
            &op.command.remote_path,
            &op.command.remote_file,
        ) {
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

        let need_size = op.remote_exists.is_none()
            || (op.remote_exists == Some(true) && op.remote_size.is_none());
        if need_size && self.capability(Capability::SizeCommand) != CapabilityValue::No {
            op.state = TransferState::Size;
            return Step::Continue;
        }
        self.transfer_after_size(op)
    }

    fn transfer_after_size(&mut self, op: &mut TransferOp) -> Step<FtpOp> {
        let target_exists = if op.command.download {
            op.command.local_size.is_some()
        } else {
            op.remote_exists == Some(true)
        };
        let want_time = (op.command.download && self.core.options.preserve_timestamps)
            || target_exists;
        let remote_may_exist = op.remote_exists != Some(false);
        if want_time
            && remote_may_exist
            && op.remote_time.map_or(true, |t| t.precision < TimePrecision::Seconds)
            && self.capability(Capability::MdtmCommand) != CapabilityValue::No
        {
            op.state = TransferState::Mdtm;
            return Step::Continue;
        }
        self.transfer_check_file_exists(op)
    }

    fn transfer_check_file_exists(&mut self, op: &mut TransferOp) -> Step<FtpOp> {
        let target_exists = if op.command.download {
            op.command.local_size.is_some()
        } else {
            op.remote_exists == Some(true)
        };
        if !target_exists {
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
    ) -> Step<FtpOp> {
        if op.state != TransferState::WaitFileExists {
            return Step::Wait;
        }
        let (source_time, target_time) = if op.command.download {
            (op.remote_time.map(|t| t.time), op.command.local_time)
        } else {
            (op.command.local_time, op.remote_time.map(|t| t.time))
        };
        match action {
            FileExistsAction::Overwrite => self.transfer_overwrite(op),
            FileExistsAction::OverwriteNewer => match (source_time, target_time) {
                (Some(source), Some(target)) if source <= target => {
                    info!("Skipping {}, target is not older", op.command.remote_file);
                    Step::Finish(ReplyCode::Ok)
                }
                _ => self.transfer_overwrite(op),
            },
            FileExistsAction::OverwriteSize => {
                match (op.remote_size, op.command.local_size) {
                    (Some(remote), Some(local)) if remote == local => {
                        info!("Skipping {}, sizes match", op.command.remote_file);
                        Step::Finish(ReplyCode::Ok)
                    }
                    _ => self.transfer_overwrite(op),
                }
            }
            FileExistsAction::Resume => {
                op.resume = true;
                self.transfer_prepare_resume(op)
            }
            FileExistsAction::Rename(name) => {
                if op.command.download {
                    op.command.local_path.set_file_name(&name);
                    op.command.local_size = None;
                    op.command.local_time = None;
                    self.transfer_overwrite(op)
                } else {
                    op.command.remote_file = name;
                    op.remote_size = None;
                    op.remote_time = None;
                    op.remote_exists = None;
                    if self.capability(Capability::SizeCommand) != CapabilityValue::No {
                        op.state = TransferState::Size;
                        return Step::Continue;
                    }
                    self.transfer_overwrite(op)
                }
            }
            FileExistsAction::Skip => {
                info!("Skipping {}", op.command.remote_file);
                Step::Finish(ReplyCode::Ok)
            }
        }
    }

    fn transfer_overwrite(&mut self, op: &mut TransferOp) -> Step<FtpOp> {
        op.resume = false;
        op.state = TransferState::Transfer;
        Step::Continue
    }

    fn transfer_prepare_resume(&mut self, op: &mut TransferOp) -> Step<FtpOp> {
        if !op.command.download {
            let offset = op.remote_size.unwrap_or(0);
            if offset == 0 {
                return self.transfer_overwrite(op);
            }
            if op.command.local_size == Some(offset) {
                info!("{} is already complete", op.command.remote_file);
                return Step::Finish(ReplyCode::Ok);
            }
            op.state = TransferState::Transfer;
            return Step::Continue;
        }

        let offset = op.command.local_size.unwrap_or(0);
        if offset == 0 {
            return self.transfer_overwrite(op);
        }
        if let Some(capability) = TransferOp::resume_bug_capability(offset) {
            match self.capability(capability) {
                CapabilityValue::Yes => {
                    if op.remote_size == Some(offset) {
                        info!("{} is already complete", op.command.remote_file);
                        return Step::Finish(ReplyCode::Ok);
                    }
                    error!("Server cannot resume files this large");
                    return Step::Finish(ReplyCode::critical());
                }
                CapabilityValue::Unknown if op.remote_size.is_some_and(|s| s > 1) => {
                    op.state = TransferState::ResumeTest;
                    return Step::Continue;
                }
                _ => {}
            }
        }
        if op.remote_size == Some(offset) {
            info!("{} is already complete", op.command.remote_file);
            return Step::Finish(ReplyCode::Ok);
        }
        op.state = TransferState::Transfer;
        Step::Continue
    }

    fn start_transfer(&mut self, op: &mut TransferOp) -> Step<FtpOp> {
        let type_code = if self.core.options.is_ascii(&op.command.remote_file) {
            'A'
        } else {
            'I'
        };
        let name = op.remote_name();
        let local_path = op.command.local_path.clone();
        let raw = if op.command.download {
            let offset = if op.resume {
                op.command.local_size.unwrap_or(0)
            } else {
                0
            };
            self.new_raw_transfer(
                &format!("RETR {}", name),
                DataTask::Download { local_path, offset },
                type_code,
                offset,
            )
        } else {
            let offset = if op.resume {
                op.remote_size.unwrap_or(0)
            } else {
                0
            };
            if offset > 0 && self.capability(Capability::RestStream) != CapabilityValue::Yes {
                self.new_raw_transfer(
                    &format!("APPE {}", name),
                    DataTask::Upload { local_path, offset },
                    type_code,
                    0,
                )
            } else {
                self.new_raw_transfer(
                    &format!("STOR {}", name),
                    DataTask::Upload { local_path, offset },
                    type_code,
                    offset,
                )
            }
        };
        op.transfer_started = true;
        op.state = TransferState::WaitTransfer;
        self.last_transfer_bytes = 0;
        Step::Push(FtpOp::RawTransfer(raw))
    }

    pub(super) fn transfer_parse(&mut self, op: &mut TransferOp) -> Step<FtpOp> {
        let code = self.reply_code();
        match op.state {
            TransferState::Size => {
                if code == 213 {
                    self.set_capability(Capability::SizeCommand, CapabilityValue::Yes);
                    match self.reply_text().parse::<u64>() {
                        Ok(size) => {
                            op.remote_size = Some(size);
                            op.remote_exists = Some(true);
                        }
                        Err(_) => warn!("Malformed SIZE reply: {}", self.last_reply),
                    }
                } else if code == 550 {
                    op.remote_exists = Some(false);
                } else if code == 500 || code == 502 {
                    self.set_capability(Capability::SizeCommand, CapabilityValue::No);
                }
                self.transfer_after_size(op)
            }
            TransferState::Mdtm => {
                if self.reply_succeeded() {
                    self.set_capability(Capability::MdtmCommand, CapabilityValue::Yes);
                    if let Some(time) = parse_timeval(self.reply_text()) {
                        op.remote_time = Some(RemoteTime::new(time, TimePrecision::Seconds));
                        op.remote_exists = Some(true);
                    }
                } else if code == 500 || code == 502 {
                    self.set_capability(Capability::MdtmCommand, CapabilityValue::No);
                }
                self.transfer_check_file_exists(op)
            }
            TransferState::Mfmt => {
                if !self.reply_succeeded() {
                    warn!("Could not set the remote modification time");
                }
                Step::Finish(ReplyCode::Ok)
            }
            _ => Step::Finish(ReplyCode::internal()),
        }
    }

    pub(super) fn transfer_subcommand_result(
        &mut self,
        op: &mut TransferOp,
        code: ReplyCode,
    ) -> Step<FtpOp> {
        match op.state {
            TransferState::WaitCwd => {
                op.omit_path = code.is_ok();
                if !code.is_ok() {
                    debug!("Using full paths");
                }
                self.transfer_after_cwd(op)
            }
            TransferState::WaitResumeTest => {
                let offset = op.command.local_size.unwrap_or(0);
                let Some(capability) = TransferOp::resume_bug_capability(offset) else {
                    return Step::Finish(ReplyCode::internal());
                };
                if code.is_ok() && self.last_transfer_bytes == 1 {
                    debug!("Server resumes large files correctly");
                    self.set_capability(capability, CapabilityValue::No);
                } else {
                    warn!("Server has the large file resume bug");
                    self.set_capability(capability, CapabilityValue::Yes);
                }
                self.transfer_prepare_resume(op)
            }
            TransferState::WaitTransfer => {
                if !code.is_ok() {
                    return Step::Finish(code);
                }
                self.transfer_succeeded(op)
            }
            _ => Step::Finish(ReplyCode::internal()),
        }
    }

    fn transfer_succeeded(&mut self, op: &mut TransferOp) -> Step<FtpOp> {
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
        let mfmt = self.capability(Capability::MfmtCommand) == CapabilityValue::Yes;
        if let (true, true, Some(time)) = (preserve, mfmt, op.command.local_time) {
            op.state = TransferState::Mfmt;
            return Step::Send(format!("MFMT {} {}", format_timeval(time), op.remote_name()));
        }
        Step::Finish(ReplyCode::Ok)
    }

    pub(super) fn transfer_finished(&mut self, op: TransferOp, code: ReplyCode) {
        let server = self.core.server.clone();
        if op.command.download {
            if !code.is_ok()
                && op.transfer_started
                && !op.resume
                && op.command.local_size.is_none()
                && self.last_transfer_bytes == 0
            {
                debug!("Removing empty local file {}", op.command.local_path.display());
                self.core
                    .emit(Outbound::DiscardLocalFile(op.command.local_path.clone()));
            }
            return;
        }
        if let Some(server) = server {
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
