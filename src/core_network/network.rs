//! Runs an [`FtpControlSocket`] over real TCP.
//!
//! The socket decides, the driver performs: every queued [`Outbound`] action
//! becomes socket or file I/O, and every byte, data event and timer tick is
//! fed back through the socket's `on_*` methods. TLS is not available, so an
//! upgrade request is answered with a handshake failure.

use crate::config::EngineConfig;
use crate::core_engine::{ControlSocket, DataTask, Outbound, SessionContext, TransferEndReason};
use crate::core_error::ReplyCode;
use crate::core_ftpcommand::FtpControlSocket;
use crate::core_network::data::{
    discard_local_file, set_local_file_time, spawn_data_task, DataChannel, DataEvent, DataMessage,
};
use crate::core_network::port::setup_active_listener;
use crate::core_network::{handle_notifications, Drained, RequestHandler, TICK_INTERVAL};
use log::{debug, error, warn};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

const READ_BUFFER_SIZE: usize = 8192;

enum FtpEvent {
    Control(std::io::Result<usize>),
    Data(DataMessage),
    Tick,
}

pub struct FtpConnection {
    socket: FtpControlSocket,
    connect_timeout: Duration,
    reader: Option<OwnedReadHalf>,
    writer: Option<OwnedWriteHalf>,
    data_task: Option<JoinHandle<()>>,
    data_generation: u64,
    data_tx: UnboundedSender<DataMessage>,
    data_rx: UnboundedReceiver<DataMessage>,
}

impl FtpConnection {
    pub fn new(ctx: SessionContext, config: &EngineConfig) -> Self {
        let (data_tx, data_rx) = unbounded_channel();
        Self {
            socket: FtpControlSocket::new(ctx, config),
            connect_timeout: config.engine.timeout(),
            reader: None,
            writer: None,
            data_task: None,
            data_generation: 0,
            data_tx,
            data_rx,
        }
    }

    pub fn socket(&self) -> &FtpControlSocket {
        &self.socket
    }

    /// Starts an operation with `start` and drives the socket until it
    /// finishes.
    pub async fn run<F>(&mut self, handler: &mut dyn RequestHandler, start: F) -> ReplyCode
    where
        F: FnOnce(&mut FtpControlSocket) -> ReplyCode,
    {
        let code = start(&mut self.socket);
        if !code.is_would_block() {
            self.flush().await;
            self.socket.drain_notifications();
            return code;
        }

        let mut ticker = interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            self.flush().await;
            match handle_notifications(&mut self.socket, handler) {
                Drained::Finished(code) => {
                    self.flush().await;
                    return code;
                }
                Drained::Answered => continue,
                Drained::Idle => {}
            }

            let event = tokio::select! {
                read = read_control(&mut self.reader, &mut buf) => FtpEvent::Control(read),
                Some(message) = self.data_rx.recv() => FtpEvent::Data(message),
                _ = ticker.tick() => FtpEvent::Tick,
            };
            match event {
                FtpEvent::Control(Ok(0)) => {
                    debug!("Control connection closed by peer");
                    self.close_control();
                    self.socket.on_disconnected();
                }
                FtpEvent::Control(Ok(n)) => self.socket.on_control_data(&buf[..n]),
                FtpEvent::Control(Err(e)) => {
                    warn!("Reading control connection failed: {}", e);
                    self.close_control();
                    self.socket.on_disconnected();
                }
                FtpEvent::Data(message) => self.on_data_message(message),
                FtpEvent::Tick => {
                    let now = Instant::now();
                    self.socket.check_timeout(now);
                    self.socket.on_keepalive_timer(now);
                }
            }
        }
    }

    fn on_data_message(&mut self, message: DataMessage) {
        if message.generation != self.data_generation {
            debug!("Dropping event of a closed data connection");
            return;
        }
        match message.event {
            DataEvent::Listing(chunk) => self.socket.on_listing_data(&chunk),
            DataEvent::Progress(bytes) => self.socket.on_transfer_progress(bytes),
            DataEvent::End { reason, bytes } => {
                self.data_task = None;
                self.socket.on_transfer_end(reason, bytes);
            }
        }
    }

    /// Performs queued actions until the socket has nothing left to say.
    async fn flush(&mut self) {
        loop {
            let actions = self.socket.drain_outbound();
            if actions.is_empty() {
                return;
            }
            for action in actions {
                self.perform(action).await;
            }
        }
    }

    async fn perform(&mut self, action: Outbound) {
        match action {
            Outbound::Connect { host, port } => {
                match timeout(self.connect_timeout, open_control(&host, port)).await {
                    Ok(Ok((stream, local, peer))) => {
                        let (reader, writer) = stream.into_split();
                        self.reader = Some(reader);
                        self.writer = Some(writer);
                        self.socket.on_connected(local, peer);
                    }
                    Ok(Err(e)) => {
                        error!("Could not connect to {}:{}: {}", host, port, e);
                        self.socket.on_disconnected();
                    }
                    Err(_) => {
                        error!("Connection to {}:{} timed out", host, port);
                        self.socket.on_disconnected();
                    }
                }
            }
            Outbound::StartTls => self
                .socket
                .on_tls_failed("TLS is not supported by this client"),
            Outbound::Disconnect => {
                self.close_data();
                self.close_control();
                debug!("Control connection closed");
            }
            Outbound::Send(bytes) => {
                let Some(writer) = self.writer.as_mut() else {
                    warn!("Dropping command, not connected");
                    return;
                };
                if let Err(e) = writer.write_all(&bytes).await {
                    warn!("Writing control connection failed: {}", e);
                    self.close_control();
                    self.socket.on_disconnected();
                }
            }
            Outbound::OpenDataConnection { addr, task } => {
                self.start_data(DataChannel::Passive(addr), task);
            }
            Outbound::ListenForData { ip, task } => match setup_active_listener(ip).await {
                Ok((listener, addr)) => {
                    self.start_data(DataChannel::Active(listener), task);
                    self.socket.on_data_listening(addr);
                }
                Err(e) => {
                    error!("Could not listen for a data connection on {}: {}", ip, e);
                    self.socket.on_transfer_end(TransferEndReason::Failed, 0);
                }
            },
            Outbound::CloseData => self.close_data(),
            Outbound::SpawnWorker { .. } | Outbound::WorkerLine(_) => {
                warn!("FTP sessions have no worker process");
            }
            Outbound::DiscardLocalFile(path) => discard_local_file(&path).await,
            Outbound::SetLocalFileTime { path, time } => set_local_file_time(&path, time),
        }
    }

    fn start_data(&mut self, channel: DataChannel, task: DataTask) {
        self.close_data();
        self.data_generation += 1;
        self.data_task = Some(spawn_data_task(
            channel,
            task,
            self.data_generation,
            self.data_tx.clone(),
        ));
    }

    fn close_data(&mut self) {
        if let Some(task) = self.data_task.take() {
            task.abort();
        }
        self.data_generation += 1;
    }

    fn close_control(&mut self) {
        self.reader = None;
        self.writer = None;
    }
}

impl Drop for FtpConnection {
    fn drop(&mut self) {
        self.close_data();
    }
}

async fn open_control(host: &str, port: u16) -> std::io::Result<(TcpStream, SocketAddr, SocketAddr)> {
    let stream = TcpStream::connect((host, port)).await?;
    let local = stream.local_addr()?;
    let peer = stream.peer_addr()?;
    Ok((stream, local, peer))
}

async fn read_control(reader: &mut Option<OwnedReadHalf>, buf: &mut [u8]) -> std::io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}
