//! Everything a control socket hands back to its driver.
//!
//! Sockets never perform I/O themselves. They queue [`Outbound`] actions for
//! the driver to carry out and [`Notification`]s for whoever watches the
//! session.

use crate::core_cache::RemoteTime;
use crate::core_error::ReplyCode;
use crate::core_server::ServerPath;
use crate::core_engine::locks::SocketId;
use chrono::{DateTime, Utc};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

pub type RequestId = u64;

/// What a data connection carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataTask {
    /// Listing bytes, fed back through `on_listing_data`.
    Listing,
    /// Write into `local_path`, starting at `offset`.
    Download { local_path: PathBuf, offset: u64 },
    /// Read from `local_path`, starting at `offset`.
    Upload { local_path: PathBuf, offset: u64 },
    /// Count the bytes and throw them away.
    Discard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Connect { host: String, port: u16 },
    StartTls,
    Disconnect,
    /// An encoded command line, CRLF included.
    Send(Vec<u8>),
    OpenDataConnection { addr: SocketAddr, task: DataTask },
    ListenForData { ip: IpAddr, task: DataTask },
    CloseData,
    SpawnWorker { program: PathBuf, args: Vec<String> },
    /// One line for the SFTP worker's stdin, without terminator.
    WorkerLine(String),
    DiscardLocalFile(PathBuf),
    SetLocalFileTime { path: PathBuf, time: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEndReason {
    Successful,
    Failed,
    /// The local side cannot continue, e.g. the target file is not writable.
    FailedCritical,
    Timeout,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FileExistsAction {
    #[default]
    Overwrite,
    OverwriteNewer,
    OverwriteSize,
    Resume,
    Rename(String),
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileExistsRequest {
    pub download: bool,
    pub local_path: PathBuf,
    pub local_size: Option<u64>,
    pub local_time: Option<DateTime<Utc>>,
    pub remote_path: ServerPath,
    pub remote_file: String,
    pub remote_size: Option<u64>,
    pub remote_time: Option<RemoteTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncRequest {
    FileExists(FileExistsRequest),
    CertificateTrust {
        host: String,
        port: u16,
        fingerprint: String,
    },
    HostKeyTrust {
        host: String,
        port: u16,
        fingerprint: String,
        changed: bool,
    },
    InteractiveLogin {
        challenge: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncReply {
    FileExists(FileExistsAction),
    Trust(bool),
    /// `None` cancels the login.
    Password(Option<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    DirectoryListing {
        path: ServerPath,
        primary: bool,
        failed: bool,
    },
    AsyncRequest {
        id: RequestId,
        request: AsyncRequest,
    },
    OperationFinished(ReplyCode),
    /// These sockets were waiting for a lock that has been released.
    LocksReleased(Vec<SocketId>),
    TransferStatus {
        bytes: u64,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListFlags {
    /// Ignore a cached listing that is still fresh.
    pub refresh: bool,
    /// A failed `CWD` into the subdir means it is a link to a file.
    pub link_discovery: bool,
}

/// A file transfer request. Local file facts are supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCommand {
    pub download: bool,
    pub local_path: PathBuf,
    /// `None` if the local file does not exist.
    pub local_size: Option<u64>,
    pub local_time: Option<DateTime<Utc>>,
    pub remote_path: ServerPath,
    pub remote_file: String,
}
