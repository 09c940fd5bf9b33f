// Library-level errors (configuration, URLs, worker framing)
use crate::core_error::reply::ReplyCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to read configuration file {0}: {1}")]
    ConfigRead(String, std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Invalid server path: {0}")]
    InvalidPath(String),

    #[error("Malformed worker message: {0}")]
    WorkerProtocol(String),

    #[error("Worker protocol version mismatch: expected {expected}, got {actual}")]
    WorkerVersion { expected: u32, actual: u32 },

    #[error("Worker channel closed")]
    WorkerGone,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Maps a library error onto the reply code an operation finishes with.
    pub fn to_reply_code(&self) -> ReplyCode {
        match self {
            EngineError::WorkerProtocol(_)
            | EngineError::WorkerVersion { .. }
            | EngineError::WorkerGone
            | EngineError::Io(_) => ReplyCode::critical().with_disconnected(),
            EngineError::InvalidPath(_) => ReplyCode::internal(),
            _ => ReplyCode::error(),
        }
    }
}
