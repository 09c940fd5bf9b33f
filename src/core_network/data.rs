//! FTP data connections and the local file actions sockets ask for.
//!
//! Each data connection runs as its own task and reports back over a
//! channel. Messages carry the generation of the connection they belong to
//! so the driver can drop events from one it already closed.

use crate::core_engine::{DataTask, TransferEndReason};
use crate::core_network::pasv::connect_passive;
use crate::core_network::port::accept_active_connection;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use log::{debug, error, warn};
use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

const BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataEvent {
    Listing(Vec<u8>),
    /// Total bytes moved over this connection so far.
    Progress(u64),
    End {
        reason: TransferEndReason,
        bytes: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    pub generation: u64,
    pub event: DataEvent,
}

/// Where the data connection comes from.
#[derive(Debug)]
pub enum DataChannel {
    Passive(SocketAddr),
    Active(TcpListener),
}

struct Reporter {
    generation: u64,
    tx: UnboundedSender<DataMessage>,
}

impl Reporter {
    fn send(&self, event: DataEvent) {
        if self
            .tx
            .send(DataMessage {
                generation: self.generation,
                event,
            })
            .is_err()
        {
            debug!("Driver gone, dropping data event");
        }
    }
}

/// Opens the data connection and runs `task` over it.
pub fn spawn_data_task(
    channel: DataChannel,
    task: DataTask,
    generation: u64,
    tx: UnboundedSender<DataMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reporter = Reporter { generation, tx };
        let stream = match channel {
            DataChannel::Passive(addr) => connect_passive(addr).await,
            DataChannel::Active(listener) => accept_active_connection(listener).await,
        };
        let (reason, bytes) = match stream {
            Ok(stream) => run_task(stream, task, &reporter).await,
            Err(e) => {
                warn!("Could not establish data connection: {}", e);
                (TransferEndReason::Failed, 0)
            }
        };
        debug!("Data connection closed after {} bytes ({:?})", bytes, reason);
        reporter.send(DataEvent::End { reason, bytes });
    })
}

async fn run_task(
    stream: TcpStream,
    task: DataTask,
    reporter: &Reporter,
) -> (TransferEndReason, u64) {
    match task {
        DataTask::Listing => receive(stream, None, reporter, true).await,
        DataTask::Discard => receive(stream, None, reporter, false).await,
        DataTask::Download { local_path, offset } => {
            match open_download(&local_path, offset).await {
                Ok(file) => receive(stream, Some(file), reporter, false).await,
                Err(e) => {
                    error!("Cannot write {}: {}", local_path.display(), e);
                    (TransferEndReason::FailedCritical, 0)
                }
            }
        }
        DataTask::Upload { local_path, offset } => {
            match open_upload(&local_path, offset).await {
                Ok(file) => send(stream, file, reporter).await,
                Err(e) => {
                    error!("Cannot read {}: {}", local_path.display(), e);
                    (TransferEndReason::FailedCritical, 0)
                }
            }
        }
    }
}

async fn open_download(path: &Path, offset: u64) -> std::io::Result<File> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(offset == 0)
        .open(path)
        .await?;
    if offset > 0 {
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;
    }
    Ok(file)
}

async fn open_upload(path: &Path, offset: u64) -> std::io::Result<File> {
    let mut file = File::open(path).await?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset)).await?;
    }
    Ok(file)
}

/// Reads the connection to its end. Bytes go to `file` if there is one, to
/// the socket as listing data if `listing` is set, or nowhere.
async fn receive(
    mut stream: TcpStream,
    mut file: Option<File>,
    reporter: &Reporter,
    listing: bool,
) -> (TransferEndReason, u64) {
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("Data connection broke: {}", e);
                return (TransferEndReason::Failed, total);
            }
        };
        if let Some(file) = file.as_mut() {
            if let Err(e) = file.write_all(&buf[..n]).await {
                error!("Writing local file failed: {}", e);
                return (TransferEndReason::FailedCritical, total);
            }
        }
        if listing {
            reporter.send(DataEvent::Listing(buf[..n].to_vec()));
        }
        total += n as u64;
        reporter.send(DataEvent::Progress(total));
    }
    if let Some(file) = file.as_mut() {
        if let Err(e) = file.flush().await {
            error!("Writing local file failed: {}", e);
            return (TransferEndReason::FailedCritical, total);
        }
    }
    (TransferEndReason::Successful, total)
}

async fn send(mut stream: TcpStream, mut file: File, reporter: &Reporter) -> (TransferEndReason, u64) {
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match file.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                error!("Reading local file failed: {}", e);
                return (TransferEndReason::FailedCritical, total);
            }
        };
        if let Err(e) = stream.write_all(&buf[..n]).await {
            warn!("Data connection broke: {}", e);
            return (TransferEndReason::Failed, total);
        }
        total += n as u64;
        reporter.send(DataEvent::Progress(total));
    }
    if let Err(e) = stream.shutdown().await {
        warn!("Closing data connection failed: {}", e);
        return (TransferEndReason::Failed, total);
    }
    (TransferEndReason::Successful, total)
}

/// Removes a download that failed before writing anything.
pub async fn discard_local_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) => debug!("Could not remove {}: {}", path.display(), e),
    }
}

pub fn set_local_file_time(path: &Path, time: DateTime<Utc>) {
    let mtime = FileTime::from_unix_time(time.timestamp(), 0);
    if let Err(e) = filetime::set_file_mtime(path, mtime) {
        warn!("Could not set modification time of {}: {}", path.display(), e);
    }
}
