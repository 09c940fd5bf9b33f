// Error types shared by the whole engine

pub mod error;
pub mod reply;

pub use error::EngineError;
pub use reply::{ErrorKind, Failure, ReplyCode};
