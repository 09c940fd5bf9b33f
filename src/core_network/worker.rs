//! Runs an [`SftpControlSocket`] against a spawned worker process.
//!
//! Commands go to the worker's stdin one line at a time. Its stdout is
//! framed into messages by [`spawn_reader`] on a separate thread.

use crate::config::EngineConfig;
use crate::core_engine::{ControlSocket, Outbound, SessionContext};
use crate::core_error::{EngineError, ReplyCode};
use crate::core_network::data::{discard_local_file, set_local_file_time};
use crate::core_network::{handle_notifications, Drained, RequestHandler, TICK_INTERVAL};
use crate::core_sftp::reader::WorkerEvent;
use crate::core_sftp::{spawn_reader, SftpControlSocket};
use log::{debug, warn};
use std::io::{BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::Instant;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{interval, MissedTickBehavior};

pub struct SftpConnection {
    socket: SftpControlSocket,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    events: Option<UnboundedReceiver<WorkerEvent>>,
}

impl SftpConnection {
    pub fn new(ctx: SessionContext, config: &EngineConfig) -> Self {
        Self {
            socket: SftpControlSocket::new(ctx, config),
            child: None,
            stdin: None,
            events: None,
        }
    }

    pub fn socket(&self) -> &SftpControlSocket {
        &self.socket
    }

    /// Starts an operation with `start` and drives the socket until it
    /// finishes.
    pub async fn run<F>(&mut self, handler: &mut dyn RequestHandler, start: F) -> ReplyCode
    where
        F: FnOnce(&mut SftpControlSocket) -> ReplyCode,
    {
        let code = start(&mut self.socket);
        if !code.is_would_block() {
            self.flush().await;
            self.socket.drain_notifications();
            return code;
        }

        let mut ticker = interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
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
                event = next_worker_event(&mut self.events) => Some(event),
                _ = ticker.tick() => None,
            };
            match event {
                Some(Ok(message)) => self.socket.on_worker_message(message),
                Some(Err(e)) => {
                    self.events = None;
                    self.socket.on_worker_error(e);
                }
                None => self.socket.check_timeout(Instant::now()),
            }
        }
    }

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
            Outbound::SpawnWorker { program, args } => {
                self.stop_worker();
                if let Err(e) = self.spawn_worker(&program, &args) {
                    self.socket.on_worker_error(EngineError::Io(e));
                }
            }
            Outbound::WorkerLine(line) => {
                let Some(stdin) = self.stdin.as_mut() else {
                    warn!("Dropping worker command, no worker running");
                    return;
                };
                if let Err(e) = write_line(stdin, &line) {
                    self.stop_worker();
                    self.socket.on_worker_error(EngineError::Io(e));
                }
            }
            Outbound::Disconnect => {
                self.stop_worker();
                debug!("Worker stopped");
            }
            Outbound::DiscardLocalFile(path) => discard_local_file(&path).await,
            Outbound::SetLocalFileTime { path, time } => set_local_file_time(&path, time),
            other => warn!("SFTP sessions cannot perform {:?}", other),
        }
    }

    fn spawn_worker(&mut self, program: &Path, args: &[String]) -> std::io::Result<()> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        debug!("Started {} (pid {})", program.display(), child.id());
        if let Some(stdout) = child.stdout.take() {
            let (events, _reader) = spawn_reader(BufReader::new(stdout));
            self.events = Some(events);
        }
        self.stdin = child.stdin.take();
        self.child = Some(child);
        Ok(())
    }

    fn stop_worker(&mut self) {
        self.stdin = None;
        self.events = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!("Worker already gone: {}", e);
            }
            if let Err(e) = child.wait() {
                debug!("Could not reap worker: {}", e);
            }
        }
    }
}

impl Drop for SftpConnection {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes())?;
    stdin.write_all(b"\n")?;
    stdin.flush()
}

async fn next_worker_event(events: &mut Option<UnboundedReceiver<WorkerEvent>>) -> WorkerEvent {
    match events {
        Some(rx) => rx.recv().await.unwrap_or(Err(EngineError::WorkerGone)),
        None => std::future::pending().await,
    }
}
