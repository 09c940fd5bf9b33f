//! Client-side FTP and SFTP session engine.
//!
//! Control sockets ([`core_ftpcommand::FtpControlSocket`],
//! [`core_sftp::SftpControlSocket`]) run every operation as a stack of
//! state machines and never touch the network themselves. The drivers in
//! [`core_network`] bind them to tokio sockets and worker processes.

pub mod config;
pub mod constants;
pub mod core_cache;
pub mod core_cli;
pub mod core_engine;
pub mod core_error;
pub mod core_ftpcommand;
pub mod core_listing;
pub mod core_network;
pub mod core_server;
pub mod core_sftp;

pub use config::EngineConfig;
pub use core_engine::{ControlSocket, SessionContext};
pub use core_error::{EngineError, ReplyCode};
