//! The operations an SFTP control socket can have on its stack.

use crate::core_engine::OpKind;
use crate::core_sftp::connect::ConnectOp;
use crate::core_sftp::cwd::CwdOp;
use crate::core_sftp::fileops::{ChmodOp, DeleteOp, MkdirOp, RemoveDirOp, RenameOp};
use crate::core_sftp::list::ListOp;
use crate::core_sftp::transfer::TransferOp;

#[derive(Debug)]
pub enum SftpOp {
    Connect(ConnectOp),
    ChangeDir(CwdOp),
    List(ListOp),
    Transfer(TransferOp),
    Mkdir(MkdirOp),
    Delete(DeleteOp),
    RemoveDir(RemoveDirOp),
    Rename(RenameOp),
    Chmod(ChmodOp),
}

impl SftpOp {
    pub fn kind(&self) -> OpKind {
        match self {
            SftpOp::Connect(_) => OpKind::Connect,
            SftpOp::ChangeDir(_) => OpKind::ChangeDir,
            SftpOp::List(_) => OpKind::List,
            SftpOp::Transfer(_) => OpKind::Transfer,
            SftpOp::Mkdir(_) => OpKind::Mkdir,
            SftpOp::Delete(_) => OpKind::Delete,
            SftpOp::RemoveDir(_) => OpKind::RemoveDir,
            SftpOp::Rename(_) => OpKind::Rename,
            SftpOp::Chmod(_) => OpKind::Chmod,
        }
    }
}
