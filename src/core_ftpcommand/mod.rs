// The FTP control connection and its operation state machines
pub mod control_socket;
pub mod ftpcommand;

// One module per operation
pub mod chmod;
pub mod cwd;
pub mod dele;
pub mod list;
pub mod logon;
pub mod mkd;
pub mod raw;
pub mod rawtransfer;
pub mod rename;
pub mod rmd;
pub mod transfer;

pub use control_socket::FtpControlSocket;
pub use ftpcommand::FtpOp;

#[cfg(test)]
mod test_ftp_session;
