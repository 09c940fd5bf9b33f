//! Directory listing over the worker's `ls`.
//!
//! Entries arrive as `listentry` messages while `ls` runs. Entries the
//! worker gave an exact mtime for are UTC already; if none had one, a single
//! `mtime` probe detects the server timezone as FTP does with `MDTM`.

use crate::core_cache::{DirectoryListing, RemoteTime};
use crate::core_engine::timezone::{compute_offset, probe_candidate};
use crate::core_engine::{ListFlags, LockReason, Step};
use crate::core_error::ReplyCode;
use crate::core_server::{Capability, CapabilityValue, Server, ServerPath};
use crate::core_sftp::control_socket::SftpControlSocket;
use crate::core_sftp::cwd::CwdOp;
use crate::core_sftp::protocol::quote_filename;
use crate::core_sftp::sftpcommand::SftpOp;
use chrono::{TimeZone, Utc};
use log::{debug, info, warn};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListState {
    WaitCwd,
    WaitLock,
    Ls,
    Mtime,
}

#[derive(Debug)]
pub struct ListOp {
    pub path: ServerPath,
    pub subdir: String,
    pub flags: ListFlags,
    state: ListState,
    started: Instant,
    holds_lock: bool,
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
            listing: None,
            probe_time: None,
        }
    }
}

impl SftpControlSocket {
    pub(super) fn list_from_cache_early(
        &mut self,
        path: &ServerPath,
        subdir: &str,
    ) -> Option<ReplyCode> {
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

    pub(super) fn list_send(&mut self, op: &mut ListOp) -> Step<SftpOp> {
        match op.state {
            ListState::WaitCwd => Step::Push(SftpOp::ChangeDir(CwdOp::new(
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
                if let Some(step) = self.list_from_cache(op, &server, &current) {
                    return step;
                }
                self.listing_parser.reset();
                self.listing_parser
                    .set_timezone_offset(self.core.timezone_offset());
                op.state = ListState::Ls;
                Step::Send("ls".to_string())
            }
            ListState::Ls | ListState::Mtime => Step::Wait,
        }
    }

    fn list_from_cache(
        &mut self,
        op: &ListOp,
        server: &Server,
        current: &ServerPath,
    ) -> Option<Step<SftpOp>> {
        let cache = self.core.ctx.cache.clone();
        let (_, outdated) = cache.lookup(server, current, false)?;
        if outdated {
            return None;
        }
        if op.flags.refresh && cache.get_change_time(server, current)? < op.started {
            return None;
        }
        debug!("Using cached listing of {}", current);
        self.core.listing_notification(current.clone(), true, false);
        Some(Step::Finish(ReplyCode::Ok))
    }

    pub(super) fn list_subcommand_result(&mut self, op: &mut ListOp, code: ReplyCode) -> Step<SftpOp> {
        if op.state != ListState::WaitCwd || !code.is_ok() {
            return Step::Finish(code);
        }
        op.state = ListState::WaitLock;
        Step::Continue
    }

    pub(super) fn list_parse(&mut self, op: &mut ListOp, code: ReplyCode) -> Step<SftpOp> {
        let Some(server) = self.core.server.clone() else {
            return Step::Finish(ReplyCode::internal());
        };
        match op.state {
            ListState::Ls => {
                if !code.is_ok() {
                    return Step::Finish(code);
                }
                let current = self.core.current_path.clone();
                let listing = self.listing_parser.parse(&current);
                self.listing_received(op, &server, listing)
            }
            ListState::Mtime => {
                let Some(mut listing) = op.listing.take() else {
                    return Step::Finish(ReplyCode::internal());
                };
                let exact = self
                    .last_reply
                    .take()
                    .filter(|_| code.is_ok())
                    .and_then(|text| text.trim().parse::<i64>().ok())
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
                match op.probe_time.zip(exact).and_then(|(listed, exact)| compute_offset(&listed, exact)) {
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
            ListState::WaitCwd | ListState::WaitLock => Step::Finish(ReplyCode::internal()),
        }
    }

    fn listing_received(
        &mut self,
        op: &mut ListOp,
        server: &Server,
        listing: DirectoryListing,
    ) -> Step<SftpOp> {
        let probe = server.timezone_offset == 0
            && self.capability(Capability::TimezoneOffset) == CapabilityValue::Unknown;
        if probe {
            let candidate = probe_candidate(&listing)
                .filter(|entry| entry.time.is_some_and(|t| !t.has_seconds()))
                .map(|entry| (entry.name.clone(), entry.time));
            if let Some((name, time)) = candidate {
                let command = format!(
                    "mtime {}",
                    quote_filename(&listing.path.format_filename(&name, false))
                );
                op.probe_time = time;
                op.listing = Some(listing);
                op.state = ListState::Mtime;
                return Step::Send(command);
            }
        }
        self.store_listing(listing, server)
    }

    fn store_listing(&mut self, listing: DirectoryListing, server: &Server) -> Step<SftpOp> {
        info!("Directory listing of {} successful", listing.path);
        let path = listing.path.clone();
        self.core.ctx.cache.store(listing, server);
        self.core.listing_notification(path, true, false);
        Step::Finish(ReplyCode::Ok)
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
