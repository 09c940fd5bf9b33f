// Drivers binding the control sockets to tokio sockets, timers and processes
pub mod data;
pub mod network;
pub mod pasv;
pub mod port;
pub mod worker;

pub use network::FtpConnection;
pub use worker::SftpConnection;

use crate::config::EngineConfig;
use crate::core_engine::{
    AsyncReply, AsyncRequest, ControlSocket, FileExistsAction, Notification, SessionContext,
};
use crate::core_error::ReplyCode;
use crate::core_server::{Protocol, ServerPath};
use log::{debug, info, warn};
use std::time::Duration;

/// How often the drivers run the timeout and keepalive checks.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Answers the questions a control socket asks while an operation runs.
pub trait RequestHandler {
    fn answer(&mut self, request: &AsyncRequest) -> AsyncReply;
}

/// Answers for unattended use: trusts every key and certificate with a
/// warning, overwrites existing files and never types a password.
#[derive(Debug, Default)]
pub struct AutoAnswer {
    pub overwrite: FileExistsAction,
}

impl RequestHandler for AutoAnswer {
    fn answer(&mut self, request: &AsyncRequest) -> AsyncReply {
        match request {
            AsyncRequest::FileExists(req) => {
                info!("{} already exists", req.local_path.display());
                AsyncReply::FileExists(self.overwrite.clone())
            }
            AsyncRequest::CertificateTrust {
                host, fingerprint, ..
            } => {
                warn!("Trusting certificate of {} ({})", host, fingerprint);
                AsyncReply::Trust(true)
            }
            AsyncRequest::HostKeyTrust {
                host,
                fingerprint,
                changed,
                ..
            } => {
                if *changed {
                    warn!("Host key of {} has CHANGED, trusting {}", host, fingerprint);
                } else {
                    warn!("Trusting unknown host key of {} ({})", host, fingerprint);
                }
                AsyncReply::Trust(true)
            }
            AsyncRequest::InteractiveLogin { challenge } => {
                warn!("Server asked for a password: {}", challenge);
                AsyncReply::Password(None)
            }
        }
    }
}

/// A driven control socket of either kind.
pub enum Connection {
    Ftp(FtpConnection),
    Sftp(SftpConnection),
}

impl Connection {
    pub fn new(ctx: SessionContext, config: &EngineConfig, protocol: Protocol) -> Self {
        if protocol.is_ftp() {
            Connection::Ftp(FtpConnection::new(ctx, config))
        } else {
            Connection::Sftp(SftpConnection::new(ctx, config))
        }
    }

    /// Starts an operation with `start` and drives the socket until it
    /// finishes.
    pub async fn run<F>(&mut self, handler: &mut dyn RequestHandler, start: F) -> ReplyCode
    where
        F: FnOnce(&mut dyn ControlSocket) -> ReplyCode,
    {
        match self {
            Connection::Ftp(conn) => conn.run(handler, |socket| start(socket)).await,
            Connection::Sftp(conn) => conn.run(handler, |socket| start(socket)).await,
        }
    }

    pub fn current_path(&self) -> &ServerPath {
        match self {
            Connection::Ftp(conn) => conn.socket().current_path(),
            Connection::Sftp(conn) => conn.socket().current_path(),
        }
    }
}

/// What draining a socket's notifications turned up.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Drained {
    Finished(ReplyCode),
    /// A request was answered, which may have queued more work.
    Answered,
    Idle,
}

pub(crate) fn handle_notifications<S: ControlSocket>(
    socket: &mut S,
    handler: &mut dyn RequestHandler,
) -> Drained {
    let mut answered = false;
    for notification in socket.drain_notifications() {
        match notification {
            Notification::OperationFinished(code) => return Drained::Finished(code),
            Notification::AsyncRequest { id, request } => {
                let reply = handler.answer(&request);
                socket.set_async_request_reply(id, reply);
                answered = true;
            }
            Notification::DirectoryListing { path, failed, .. } => {
                debug!("Listing of {} available (failed: {})", path, failed);
            }
            Notification::TransferStatus { bytes } => debug!("{} bytes transferred", bytes),
            Notification::LocksReleased(waiting) => {
                if waiting.contains(&socket.socket_id()) {
                    socket.on_lock_available();
                }
            }
        }
    }
    if answered {
        Drained::Answered
    } else {
        Drained::Idle
    }
}

#[cfg(test)]
mod test_driver;
