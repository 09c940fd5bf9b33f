//! Reads the worker's stdout on its own thread so the pipe never fills up.
//!
//! The thread only frames lines into messages. Everything else happens on
//! the thread that owns the [`SftpControlSocket`](super::SftpControlSocket).

use crate::core_error::EngineError;
use crate::core_sftp::protocol::{MessageDecoder, SftpMessage};
use log::{debug, error};
use std::io::BufRead;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

pub type WorkerEvent = Result<SftpMessage, EngineError>;

/// Starts the reader thread. The channel yields one event per decoded
/// message, then an `Err` when the stream ends or breaks.
pub fn spawn_reader<R>(input: R) -> (UnboundedReceiver<WorkerEvent>, JoinHandle<()>)
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = unbounded_channel();
    let handle = thread::spawn(move || read_messages(input, tx));
    (rx, handle)
}

fn read_messages<R: BufRead>(mut input: R, tx: UnboundedSender<WorkerEvent>) {
    let mut decoder = MessageDecoder::new();
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match input.read_until(b'\n', &mut raw) {
            Ok(0) => {
                debug!("Worker closed its output");
                let _ = tx.send(Err(EngineError::WorkerGone));
                return;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Reading from worker failed: {}", e);
                let _ = tx.send(Err(EngineError::Io(e)));
                return;
            }
        }
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim_end_matches(['\r', '\n']);
        let event = match decoder.feed_line(line) {
            Ok(None) => continue,
            Ok(Some(message)) => Ok(message),
            Err(e) => Err(e),
        };
        let fatal = event.is_err();
        if tx.send(event).is_err() || fatal {
            return;
        }
    }
}
