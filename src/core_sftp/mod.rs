// The SFTP control socket, driving an external worker process
pub mod control_socket;
pub mod protocol;
pub mod reader;
pub mod sftpcommand;

// Operations
pub mod connect;
pub mod cwd;
pub mod fileops;
pub mod list;
pub mod transfer;

pub use control_socket::{CryptoParameters, SftpControlSocket};
pub use protocol::{MessageDecoder, SftpMessage, SftpRequest};
pub use reader::spawn_reader;
pub use sftpcommand::SftpOp;

#[cfg(test)]
mod test_sftp_session;
