//! Framing of the SFTP worker's stdout.
//!
//! Every message starts with a one digit tag followed by its payload on the
//! same line. `listentry` and `request` messages continue on the lines that
//! follow, so the decoder keeps a partial message between calls.

use crate::core_error::{EngineError, ReplyCode};
use log::trace;

/// What the worker wants the user to decide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SftpRequest {
    HostKey {
        host: String,
        port: u16,
        fingerprint: String,
        changed: bool,
    },
    Password {
        challenge: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDirection {
    Receive,
    Send,
}

impl QuotaDirection {
    /// Digit used in the `-<direction><bytes>` quota grant line.
    pub fn digit(self) -> char {
        match self {
            QuotaDirection::Receive => '0',
            QuotaDirection::Send => '1',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SftpMessage {
    /// Result text of the running command, e.g. the path after `cd`.
    Reply(String),
    /// The running command is over.
    Done(ReplyCode),
    Error(String),
    Verbose(String),
    Status(String),
    /// Bytes moved since the previous progress message.
    Transfer(u64),
    ListEntry {
        line: String,
        mtime: Option<i64>,
        name: String,
    },
    Request(SftpRequest),
    UsedQuota {
        direction: QuotaDirection,
        bytes: u64,
    },
    CryptoParameter {
        name: String,
        value: String,
    },
}

#[derive(Debug)]
enum Partial {
    ListEntry { line: String, mtime: Option<Option<i64>> },
    HostKey { changed: bool, fields: Vec<String> },
    Password,
}

#[derive(Debug, Default)]
pub struct MessageDecoder {
    partial: Option<Partial>,
}

fn malformed(line: &str) -> EngineError {
    EngineError::WorkerProtocol(line.to_string())
}

fn parse_mtime(text: &str) -> Result<Option<i64>, EngineError> {
    let text = text.trim();
    if text.is_empty() || text == "-1" {
        return Ok(None);
    }
    text.parse().map(Some).map_err(|_| malformed(text))
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a multi-line message is half read.
    pub fn is_partial(&self) -> bool {
        self.partial.is_some()
    }

    /// Feeds one line without its terminator. Returns a message once one is
    /// complete.
    pub fn feed_line(&mut self, line: &str) -> Result<Option<SftpMessage>, EngineError> {
        trace!("Worker line: {}", line);
        if let Some(partial) = self.partial.take() {
            return self.continue_partial(partial, line);
        }

        let mut chars = line.chars();
        let tag = chars.next().ok_or_else(|| malformed(line))?;
        let payload = chars.as_str();
        let message = match tag {
            '0' => SftpMessage::Reply(payload.to_string()),
            '1' => SftpMessage::Done(match payload.trim() {
                "0" => ReplyCode::Ok,
                "1" => ReplyCode::error(),
                "2" => ReplyCode::critical().with_disconnected(),
                _ => return Err(malformed(line)),
            }),
            '2' => SftpMessage::Error(payload.to_string()),
            '3' => SftpMessage::Verbose(payload.to_string()),
            '4' => SftpMessage::Status(payload.to_string()),
            '5' => SftpMessage::Transfer(payload.trim().parse().map_err(|_| malformed(line))?),
            '6' => {
                self.partial = Some(Partial::ListEntry {
                    line: payload.to_string(),
                    mtime: None,
                });
                return Ok(None);
            }
            '7' => {
                self.partial = Some(match payload.trim() {
                    "hostkey" => Partial::HostKey {
                        changed: false,
                        fields: Vec::new(),
                    },
                    "hostkey_changed" => Partial::HostKey {
                        changed: true,
                        fields: Vec::new(),
                    },
                    "password" => Partial::Password,
                    _ => return Err(malformed(line)),
                });
                return Ok(None);
            }
            '8' => {
                let mut chars = payload.chars();
                let direction = match chars.next() {
                    Some('r') => QuotaDirection::Receive,
                    Some('s') => QuotaDirection::Send,
                    _ => return Err(malformed(line)),
                };
                let bytes = chars.as_str().trim().parse().map_err(|_| malformed(line))?;
                SftpMessage::UsedQuota { direction, bytes }
            }
            '9' => {
                let (name, value) = payload.split_once(' ').ok_or_else(|| malformed(line))?;
                SftpMessage::CryptoParameter {
                    name: name.to_string(),
                    value: value.to_string(),
                }
            }
            _ => return Err(malformed(line)),
        };
        Ok(Some(message))
    }

    fn continue_partial(
        &mut self,
        partial: Partial,
        line: &str,
    ) -> Result<Option<SftpMessage>, EngineError> {
        match partial {
            Partial::ListEntry { line: entry, mtime: None } => {
                self.partial = Some(Partial::ListEntry {
                    line: entry,
                    mtime: Some(parse_mtime(line)?),
                });
                Ok(None)
            }
            Partial::ListEntry {
                line: entry,
                mtime: Some(mtime),
            } => Ok(Some(SftpMessage::ListEntry {
                line: entry,
                mtime,
                name: line.to_string(),
            })),
            Partial::HostKey { changed, mut fields } => {
                fields.push(line.to_string());
                if fields.len() < 3 {
                    self.partial = Some(Partial::HostKey { changed, fields });
                    return Ok(None);
                }
                let port = fields[1].trim().parse().map_err(|_| malformed(line))?;
                Ok(Some(SftpMessage::Request(SftpRequest::HostKey {
                    host: fields[0].clone(),
                    port,
                    fingerprint: fields[2].clone(),
                    changed,
                })))
            }
            Partial::Password => Ok(Some(SftpMessage::Request(SftpRequest::Password {
                challenge: line.to_string(),
            }))),
        }
    }
}

/// Reads the protocol version out of the worker's greeting,
/// `fzSftp started, protocol_version=N`.
pub fn parse_version(greeting: &str) -> Result<u32, EngineError> {
    let (prefix, version) = greeting
        .split_once("protocol_version=")
        .ok_or_else(|| malformed(greeting))?;
    if !prefix.starts_with("fzSftp started") {
        return Err(malformed(greeting));
    }
    version.trim().parse().map_err(|_| malformed(greeting))
}

/// Quotes an argument for the worker's command line. Embedded quotes are
/// doubled.
pub fn quote_filename(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
