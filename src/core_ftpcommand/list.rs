//! Directory listing: change into the directory, reuse the cache when it is
//! trustworthy, otherwise fetch under a path lock.

use crate::core_cache::{DirectoryListing, RemoteTime};
use crate::core_engine::timezone::{compute_offset, parse_timeval, probe_candidate};
use crate::core_engine::{DataTask, ListFlags, LockReason, Step};
use crate::core_error::ReplyCode;
use crate::core_ftpcommand::control_socket::FtpControlSocket;
use crate::core_ftpcommand::cwd::CwdOp;
use crate::core_ftpcommand::ftpcommand::FtpOp;
use crate::core_server::{Capability, CapabilityValue, Server, ServerPath};
use log::{debug, info, warn};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListState {
    WaitCwd,
    WaitLock,
    WaitTransfer,
    /// Plain LIST done, now fetching `LIST -a` to compare.
    WaitHiddenTransfer,
    Mdtm,
}

#[derive(Debug)]
pub struct ListOp {
    pub path: ServerPath,
    pub subdir: String,
    pub flags: ListFlags,
    state: ListState,
    started: Instant,
    holds_lock: bool,
    used_mlsd: bool,
    hidden_probe: bool,
    plain_listing: Option<DirectoryListing>,
    listing: Option<DirectoryListing>,
    probe_time: Option<RemoteTime>,
}

impl ListOp {
    pub fn new(path: ServerPath, subdir: &str, flags: ListFlags) -> Self {
        Self {
            path,
            subdir: subdir.to_string(),
            flags,
            state: ListState::WaitCwd,
            started: Instant::now(),
            holds_lock: false,
            used_mlsd: false,
            hidden_probe: false,
            plain_listing: None,
            listing: None,
            probe_time: None,
        }
    }
}

impl FtpControlSocket {
    /// Answers a listing request straight from the cache when the target
    /// directory is already known and its listing is fresh.
    pub(super) fn list_from_cache_early(&mut self, path: &ServerPath, subdir: &str) -> Option<ReplyCode> {
        let server = self.core.server.clone()?;
        let base = if path.is_empty() {
            self.core.current_path.clone()
        } else {
            path.clone()
        };
        if base.is_empty() {
            return None;
        }
        let target = if subdir.is_empty() {
            base
        } else {
            self.core.ctx.path_cache.lookup(&server, &base, subdir)?
        };
        let (_, outdated) = self.core.ctx.cache.lookup(&server, &target, false)?;
        if outdated {
            return None;
        }
        debug!("Listing of {} served from cache", target);
        self.core.listing_notification(target, true, false);
        Some(ReplyCode::Ok)
    }

    pub(super) fn list_send(&mut self, op: &mut ListOp) -> Step<FtpOp> {
        match op.state {
            ListState::WaitCwd => Step::Push(FtpOp::ChangeDir(CwdOp::new(
                op.path.clone(),
                &op.subdir,
                op.flags.link_discovery,
            ))),
            ListState::WaitLock => {
                let Some(server) = self.core.server.clone() else {
                    return Step::Finish(ReplyCode::internal());
                };
                let current = self.core.current_path.clone();
                if let Some(step) = self.list_from_cache(op, &server, &current) {
                    return step;
                }
                if !self.core.try_lock(&current, LockReason::List) {
                    return Step::Wait;
                }
                op.holds_lock = true;
                // Another socket may have listed it while we waited.
                if let Some(step) = self.list_from_cache(op, &server, &current) {
                    return step;
                }
                self.start_listing(op)
            }
            ListState::WaitTransfer | ListState::WaitHiddenTransfer | ListState::Mdtm => Step::Wait,
        }
    }

    fn list_from_cache(
        &mut self,
        op: &ListOp,
        server: &Server,
        current: &ServerPath,
    ) -> Option<Step<FtpOp>> {
        let cache = self.core.ctx.cache.clone();
        let (_, outdated) = cache.lookup(server, current, false)?;
        if outdated {
            return None;
        }
        if op.flags.refresh {
            let changed = cache.get_change_time(server, current)?;
            if changed < op.started {
                return None;
            }
        }
        debug!("Using cached listing of {}", current);
        self.core.listing_notification(current.clone(), true, false);
        Some(Step::Finish(ReplyCode::Ok))
    }

    fn start_listing(&mut self, op: &mut ListOp) -> Step<FtpOp> {
        self.listing_parser.reset();
        let offset = self.core.timezone_offset();
        self.listing_parser.set_timezone_offset(offset);

        let mlsd = self.capability(Capability::MlsdCommand) == CapabilityValue::Yes;
        let hidden = self.core.options.view_hidden_files;
        let list_hidden = self.capability(Capability::ListHiddenSupport);
        let command = if mlsd {
            "MLSD"
        } else if hidden && list_hidden == CapabilityValue::Yes {
            "LIST -a"
        } else {
            "LIST"
        };
        op.used_mlsd = mlsd;
        op.hidden_probe = !mlsd && hidden && list_hidden == CapabilityValue::Unknown;
        op.state = ListState::WaitTransfer;
        Step::Push(FtpOp::RawTransfer(self.new_raw_transfer(
            command,
            DataTask::Listing,
            'A',
            0,
        )))
    }

    pub(super) fn list_subcommand_result(&mut self, op: &mut ListOp, code: ReplyCode) -> Step<FtpOp> {
        let Some(server) = self.core.server.clone() else {
            return Step::Finish(ReplyCode::internal());
        };
        let current = self.core.current_path.clone();
        match op.state {
            ListState::WaitCwd => {
                if !code.is_ok() {
                    return Step::Finish(code);
                }
                op.state = ListState::WaitLock;
                Step::Continue
            }
            ListState::WaitTransfer => {
                if !code.is_ok() {
                    return Step::Finish(code);
                }
                let listing = self.listing_parser.parse(&current);
                if op.hidden_probe {
                    debug!("Checking whether LIST -a shows hidden files");
                    op.plain_listing = Some(listing);
                    op.state = ListState::WaitHiddenTransfer;
                    self.listing_parser.reset();
                    return Step::Push(FtpOp::RawTransfer(self.new_raw_transfer(
                        "LIST -a",
                        DataTask::Listing,
                        'A',
                        0,
                    )));
                }
                self.listing_received(op, &server, listing)
            }
            ListState::WaitHiddenTransfer => {
                let Some(plain) = op.plain_listing.take() else {
                    return Step::Finish(ReplyCode::internal());
                };
                let mut caps = self.core.ctx.capabilities();
                let listing = if code.is_ok() {
                    let hidden = self.listing_parser.parse(&current);
                    if hidden.is_strict_superset_of(&plain) {
                        info!("Server supports LIST -a");
                        caps.set(&server, Capability::ListHiddenSupport, CapabilityValue::Yes);
                        hidden
                    } else {
                        caps.set(&server, Capability::ListHiddenSupport, CapabilityValue::No);
                        plain
                    }
                } else {
                    caps.set(&server, Capability::ListHiddenSupport, CapabilityValue::No);
                    plain
                };
                drop(caps);
                self.listing_received(op, &server, listing)
            }
            ListState::WaitLock | ListState::Mdtm => Step::Finish(ReplyCode::internal()),
        }
    }

    /// Starts the timezone probe if it is worth running, otherwise stores
    /// the listing.
    fn listing_received(
        &mut self,
        op: &mut ListOp,
        server: &Server,
        listing: DirectoryListing,
    ) -> Step<FtpOp> {
        let probe = !op.used_mlsd
            && server.timezone_offset == 0
            && self.capability(Capability::TimezoneOffset) == CapabilityValue::Unknown
            && self.capability(Capability::MdtmCommand) != CapabilityValue::No;
        if probe {
            if let Some(entry) = probe_candidate(&listing) {
                let command = format!(
                    "MDTM {}",
                    listing.path.format_filename(&entry.name, true)
                );
                op.probe_time = entry.time;
                op.listing = Some(listing);
                op.state = ListState::Mdtm;
                return Step::Send(command);
            }
        }
        self.store_listing(listing, server)
    }

    fn store_listing(&mut self, listing: DirectoryListing, server: &Server) -> Step<FtpOp> {
        info!("Directory listing of {} successful", listing.path);
        let path = listing.path.clone();
        self.core.ctx.cache.store(listing, server);
        self.core.listing_notification(path, true, false);
        Step::Finish(ReplyCode::Ok)
    }

    pub(super) fn list_parse(&mut self, op: &mut ListOp) -> Step<FtpOp> {
        if op.state != ListState::Mdtm {
            return Step::Finish(ReplyCode::internal());
        }
        let Some(server) = self.core.server.clone() else {
            return Step::Finish(ReplyCode::internal());
        };
        let Some(mut listing) = op.listing.take() else {
            return Step::Finish(ReplyCode::internal());
        };

        let exact = if self.reply_succeeded() {
            self.set_capability(Capability::MdtmCommand, CapabilityValue::Yes);
            parse_timeval(self.reply_text())
        } else {
            None
        };
        let offset = match (op.probe_time, exact) {
            (Some(listed), Some(exact)) => compute_offset(&listed, exact),
            _ => None,
        };
        match offset {
            Some(offset) => {
                self.core.ctx.capabilities().set_number(
                    &server,
                    Capability::TimezoneOffset,
                    CapabilityValue::Yes,
                    offset,
                );
                if offset != 0 {
                    info!("Detected server timezone offset of {} minutes", offset);
                    listing.apply_timezone_offset(offset);
                }
            }
            None => {
                warn!("Could not determine the server timezone");
                self.set_capability(Capability::TimezoneOffset, CapabilityValue::No);
            }
        }
        self.store_listing(listing, &server)
    }

    pub(super) fn list_finished(&mut self, op: ListOp, code: ReplyCode) {
        self.core.release_if_held(op.holds_lock, LockReason::List);
        if !code.is_ok() {
            let path = if self.core.current_path.is_empty() {
                op.path
            } else {
                self.core.current_path.clone()
            };
            self.core.listing_notification(path, true, true);
        }
    }
}
