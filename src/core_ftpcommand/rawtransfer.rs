//! One data connection: `TYPE`, `PRET`, `PASV`/`EPSV` or `PORT`/`EPRT`,
//! `REST`, then the transfer command itself.

use crate::constants::EMPTY_LISTING_REPLIES;
use crate::core_engine::{DataTask, Outbound, Step, TransferEndReason};
use crate::core_error::{ErrorKind, ReplyCode};
use crate::core_ftpcommand::control_socket::FtpControlSocket;
use crate::core_ftpcommand::ftpcommand::FtpOp;
use crate::core_network::pasv::{parse_epsv_reply, parse_pasv_reply, resolve_passive_addr};
use crate::core_network::port::format_port_command;
use crate::core_server::{Capability, CapabilityValue, PasvMode};
use log::{debug, error, info, warn};
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawTransferState {
    Type,
    Pret,
    PasvPort,
    /// Waiting for the driver's active mode listener.
    WaitListen,
    Port,
    Rest,
    Transfer,
    WaitFinish,
}

#[derive(Debug)]
pub struct RawTransferOp {
    pub command: String,
    pub task: DataTask,
    pub type_code: char,
    pub rest_offset: u64,
    state: RawTransferState,
    passive: bool,
    tried_passive: bool,
    tried_active: bool,
    port_command: Option<String>,
    reply_ok: Option<bool>,
    data_end: Option<TransferEndReason>,
}

/// True for the replies some servers send instead of an empty listing.
pub fn is_empty_listing_reply(reply: &str) -> bool {
    let reply = reply.trim().to_ascii_lowercase();
    EMPTY_LISTING_REPLIES.iter().any(|r| *r == reply)
}

impl FtpControlSocket {
    pub(super) fn new_raw_transfer(
        &self,
        command: &str,
        task: DataTask,
        type_code: char,
        rest_offset: u64,
    ) -> RawTransferOp {
        let passive = match self.core.server().map(|s| s.pasv_mode) {
            Some(PasvMode::Passive) => true,
            Some(PasvMode::Active) => false,
            _ => self.core.options.use_passive,
        };
        RawTransferOp {
            command: command.to_string(),
            task,
            type_code,
            rest_offset,
            state: RawTransferState::Type,
            passive,
            tried_passive: false,
            tried_active: false,
            port_command: None,
            reply_ok: None,
            data_end: None,
        }
    }

    fn state_after_type(&self, op: &RawTransferOp) -> RawTransferState {
        if op.passive && self.capability(Capability::PretCommand) == CapabilityValue::Yes {
            RawTransferState::Pret
        } else {
            RawTransferState::PasvPort
        }
    }

    pub(super) fn rawtransfer_send(&mut self, op: &mut RawTransferOp) -> Step<FtpOp> {
        match op.state {
            RawTransferState::Type => {
                if self.last_type == Some(op.type_code) {
                    op.state = self.state_after_type(op);
                    return Step::Continue;
                }
                Step::Send(format!("TYPE {}", op.type_code))
            }
            RawTransferState::Pret => Step::Send(format!("PRET {}", op.command)),
            RawTransferState::PasvPort => {
                if op.passive {
                    op.tried_passive = true;
                    if self.peer_addr.is_some_and(|a| a.is_ipv6()) {
                        return Step::Send("EPSV".to_string());
                    }
                    return Step::Send("PASV".to_string());
                }
                op.tried_active = true;
                let Some(local) = self.local_addr else {
                    warn!("No local address for active mode");
                    return self.rawtransfer_fallback(op);
                };
                op.state = RawTransferState::WaitListen;
                self.core.emit(Outbound::ListenForData {
                    ip: local.ip(),
                    task: op.task.clone(),
                });
                Step::Wait
            }
            RawTransferState::WaitListen | RawTransferState::WaitFinish => Step::Wait,
            RawTransferState::Port => match op.port_command.take() {
                Some(command) => Step::Send(command),
                None => Step::Finish(ReplyCode::internal()),
            },
            RawTransferState::Rest => Step::Send(format!("REST {}", op.rest_offset)),
            RawTransferState::Transfer => Step::Send(op.command.clone()),
        }
    }

    pub(super) fn rawtransfer_listening(
        &mut self,
        op: &mut RawTransferOp,
        addr: SocketAddr,
    ) -> Step<FtpOp> {
        if op.state != RawTransferState::WaitListen {
            return Step::Wait;
        }
        let (verb, arg) = format_port_command(addr);
        op.port_command = Some(format!("{} {}", verb, arg));
        op.state = RawTransferState::Port;
        Step::Continue
    }

    /// Switches between passive and active mode if that is allowed and the
    /// other mode has not been tried yet.
    fn rawtransfer_fallback(&mut self, op: &mut RawTransferOp) -> Step<FtpOp> {
        let untried = if op.passive {
            !op.tried_active
        } else {
            !op.tried_passive
        };
        if !self.core.options.allow_transfer_mode_fallback || !untried {
            error!("Failed to set up the data connection");
            return Step::Finish(ReplyCode::error());
        }
        op.passive = !op.passive;
        info!(
            "Falling back to {} mode",
            if op.passive { "passive" } else { "active" }
        );
        op.state = RawTransferState::PasvPort;
        Step::Continue
    }

    fn after_data_setup(op: &RawTransferOp) -> RawTransferState {
        if op.rest_offset > 0 {
            RawTransferState::Rest
        } else {
            RawTransferState::Transfer
        }
    }

    pub(super) fn rawtransfer_parse(&mut self, op: &mut RawTransferOp) -> Step<FtpOp> {
        let class = self.reply_class();
        if class == 1 {
            if op.state == RawTransferState::Transfer {
                debug!("Transfer started");
            }
            return Step::Wait;
        }
        match op.state {
            RawTransferState::Type => {
                if class != 2 {
                    return Step::Finish(ReplyCode::error());
                }
                self.last_type = Some(op.type_code);
                op.state = self.state_after_type(op);
                Step::Continue
            }
            RawTransferState::Pret => {
                if class != 2 {
                    error!("PRET rejected: {}", self.last_reply);
                    return Step::Finish(ReplyCode::error());
                }
                op.state = RawTransferState::PasvPort;
                Step::Continue
            }
            RawTransferState::PasvPort => {
                if class != 2 {
                    return self.rawtransfer_fallback(op);
                }
                let peer = self.peer_addr.map(|a| a.ip());
                let parsed = if self.reply_code() == 229 {
                    peer.and_then(|ip| parse_epsv_reply(&self.last_reply, ip))
                } else {
                    parse_pasv_reply(&self.last_reply)
                        .map(|addr| resolve_passive_addr(addr, peer, self.core.options.passive_fallback_mode))
                };
                let Some(addr) = parsed else {
                    warn!("Could not parse passive reply: {}", self.last_reply);
                    return self.rawtransfer_fallback(op);
                };
                debug!("Opening data connection to {}", addr);
                self.core.emit(Outbound::OpenDataConnection {
                    addr,
                    task: op.task.clone(),
                });
                op.state = Self::after_data_setup(op);
                Step::Continue
            }
            RawTransferState::Port => {
                if class != 2 {
                    self.core.emit(Outbound::CloseData);
                    return self.rawtransfer_fallback(op);
                }
                op.state = Self::after_data_setup(op);
                Step::Continue
            }
            RawTransferState::Rest => {
                if class != 2 && class != 3 {
                    return Step::Finish(ReplyCode::error());
                }
                op.state = RawTransferState::Transfer;
                Step::Continue
            }
            RawTransferState::Transfer => {
                op.state = RawTransferState::WaitFinish;
                if class == 2 {
                    op.reply_ok = Some(true);
                } else if op.task == DataTask::Listing && is_empty_listing_reply(&self.last_reply) {
                    debug!("Server reports an empty directory");
                    op.reply_ok = Some(true);
                    if op.data_end.is_none() {
                        self.core.emit(Outbound::CloseData);
                        op.data_end = Some(TransferEndReason::Successful);
                    }
                } else {
                    op.reply_ok = Some(false);
                }
                Self::rawtransfer_check_done(op)
            }
            RawTransferState::WaitListen | RawTransferState::WaitFinish => Step::Wait,
        }
    }

    pub(super) fn rawtransfer_data_end(
        &mut self,
        op: &mut RawTransferOp,
        reason: TransferEndReason,
    ) -> Step<FtpOp> {
        debug!("Data connection closed: {:?}", reason);
        op.data_end = Some(reason);
        if op.state == RawTransferState::WaitFinish {
            return Self::rawtransfer_check_done(op);
        }
        Step::Wait
    }

    /// The transfer is over once both the final reply and the data
    /// connection's end are in.
    fn rawtransfer_check_done(op: &RawTransferOp) -> Step<FtpOp> {
        match (op.reply_ok, op.data_end) {
            (Some(false), _) => Step::Finish(ReplyCode::error()),
            (Some(true), Some(TransferEndReason::Successful)) => Step::Finish(ReplyCode::Ok),
            (Some(true), Some(TransferEndReason::FailedCritical)) => {
                Step::Finish(ReplyCode::critical())
            }
            (Some(true), Some(TransferEndReason::Timeout)) => {
                Step::Finish(ReplyCode::of_kind(ErrorKind::Timeout))
            }
            (Some(true), Some(TransferEndReason::Failed)) => Step::Finish(ReplyCode::error()),
            _ => Step::Wait,
        }
    }

    pub(super) fn rawtransfer_finished(&mut self, op: RawTransferOp, code: ReplyCode) {
        if !code.is_ok() && op.data_end.is_none() {
            self.core.emit(Outbound::CloseData);
        }
    }
}
