//! Worker startup and login: protocol version check, key files, `open`,
//! then whatever host key and password questions the worker asks.

use crate::constants::SFTP_PROTOCOL_VERSION;
use crate::core_engine::{AsyncRequest, Step};
use crate::core_error::{EngineError, ReplyCode};
use crate::core_server::LogonType;
use crate::core_sftp::control_socket::SftpControlSocket;
use crate::core_sftp::protocol::{parse_version, quote_filename, QuotaDirection, SftpRequest};
use crate::core_sftp::sftpcommand::SftpOp;
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    WaitGreeting,
    Keyfile,
    Open,
    WaitOpen,
}

#[derive(Debug)]
pub struct ConnectOp {
    state: ConnectState,
    keyfiles: VecDeque<PathBuf>,
    password_sent: bool,
}

impl ConnectOp {
    pub fn new(keyfiles: Vec<PathBuf>) -> Self {
        Self {
            state: ConnectState::WaitGreeting,
            keyfiles: keyfiles.into(),
            password_sent: false,
        }
    }

    pub fn awaits_greeting(&self) -> bool {
        self.state == ConnectState::WaitGreeting
    }
}

impl SftpControlSocket {
    pub(super) fn connect_send(&mut self, op: &mut ConnectOp) -> Step<SftpOp> {
        match op.state {
            ConnectState::WaitGreeting | ConnectState::WaitOpen => Step::Wait,
            ConnectState::Keyfile => match op.keyfiles.pop_front() {
                Some(keyfile) => Step::Send(format!(
                    "keyfile {}",
                    quote_filename(&keyfile.to_string_lossy())
                )),
                None => {
                    op.state = ConnectState::Open;
                    Step::Continue
                }
            },
            ConnectState::Open => {
                let Some(server) = self.core.server() else {
                    return Step::Finish(ReplyCode::internal());
                };
                let target = format!("{}@{}", server.user, server.host);
                let command = format!("open {} {}", quote_filename(&target), server.port);
                op.state = ConnectState::WaitOpen;
                Step::Send(command)
            }
        }
    }

    pub(super) fn connect_greeting(&mut self, op: &mut ConnectOp, greeting: &str) -> Step<SftpOp> {
        let version = match parse_version(greeting) {
            Ok(version) => version,
            Err(e) => {
                error!("{}", e);
                return Step::Finish(e.to_reply_code());
            }
        };
        if version != SFTP_PROTOCOL_VERSION {
            let err = EngineError::WorkerVersion {
                expected: SFTP_PROTOCOL_VERSION,
                actual: version,
            };
            error!("{}", err);
            return Step::Finish(err.to_reply_code());
        }
        debug!("Worker speaks protocol version {}", version);
        self.grant_quota(QuotaDirection::Receive);
        self.grant_quota(QuotaDirection::Send);
        op.state = ConnectState::Keyfile;
        Step::Continue
    }

    pub(super) fn connect_parse(&mut self, op: &mut ConnectOp, code: ReplyCode) -> Step<SftpOp> {
        match op.state {
            ConnectState::Keyfile => {
                if !code.is_ok() {
                    warn!("Worker rejected a key file");
                }
                Step::Continue
            }
            ConnectState::WaitOpen => {
                if !code.is_ok() {
                    let mut failure = ReplyCode::critical().with_disconnected();
                    if op.password_sent {
                        failure = failure.with_password_failed();
                    }
                    return Step::Finish(failure);
                }
                self.logged_on = true;
                info!("Connected to {}", self.server().map(|s| s.display_name()).unwrap_or_default());
                Step::Finish(ReplyCode::Ok)
            }
            ConnectState::WaitGreeting | ConnectState::Open => Step::Finish(ReplyCode::internal()),
        }
    }

    pub(super) fn connect_request(&mut self, op: &mut ConnectOp, request: SftpRequest) -> Step<SftpOp> {
        match request {
            SftpRequest::HostKey {
                host,
                port,
                fingerprint,
                changed,
            } => {
                if changed {
                    warn!("Host key of {}:{} has changed", host, port);
                }
                self.core.send_async_request(AsyncRequest::HostKeyTrust {
                    host,
                    port,
                    fingerprint,
                    changed,
                });
                Step::Wait
            }
            SftpRequest::Password { challenge } => {
                let stored = self.server().and_then(|s| {
                    (s.logon_type == LogonType::Normal || s.logon_type == LogonType::Ask)
                        .then(|| s.password.clone())
                });
                match stored {
                    Some(password) if !op.password_sent && !password.is_empty() => {
                        op.password_sent = true;
                        self.write_line(&password, true);
                    }
                    _ => {
                        self.core
                            .send_async_request(AsyncRequest::InteractiveLogin { challenge });
                    }
                }
                Step::Wait
            }
        }
    }

    pub(super) fn connect_trust_reply(&mut self, _op: &mut ConnectOp, trusted: bool) -> Step<SftpOp> {
        if !trusted {
            info!("Host key rejected");
        }
        self.write_line(if trusted { "y" } else { "n" }, false);
        Step::Wait
    }

    pub(super) fn connect_password_reply(
        &mut self,
        op: &mut ConnectOp,
        password: Option<String>,
    ) -> Step<SftpOp> {
        let Some(password) = password else {
            info!("Login canceled");
            return Step::Finish(ReplyCode::canceled());
        };
        op.password_sent = true;
        self.write_line(&password, true);
        Step::Wait
    }
}
