//! The operations an FTP control socket can have on its stack.

use crate::core_engine::OpKind;
use crate::core_ftpcommand::chmod::ChmodOp;
use crate::core_ftpcommand::cwd::CwdOp;
use crate::core_ftpcommand::dele::DeleteOp;
use crate::core_ftpcommand::list::ListOp;
use crate::core_ftpcommand::logon::LogonOp;
use crate::core_ftpcommand::mkd::MkdirOp;
use crate::core_ftpcommand::raw::RawCommandOp;
use crate::core_ftpcommand::rawtransfer::RawTransferOp;
use crate::core_ftpcommand::rename::RenameOp;
use crate::core_ftpcommand::rmd::RemoveDirOp;
use crate::core_ftpcommand::transfer::TransferOp;

#[derive(Debug)]
pub enum FtpOp {
    Logon(LogonOp),
    ChangeDir(CwdOp),
    List(ListOp),
    RawTransfer(RawTransferOp),
    Transfer(TransferOp),
    Mkdir(MkdirOp),
    Delete(DeleteOp),
    RemoveDir(RemoveDirOp),
    Rename(RenameOp),
    Chmod(ChmodOp),
    Raw(RawCommandOp),
}

impl FtpOp {
    pub fn kind(&self) -> OpKind {
        match self {
            FtpOp::Logon(_) => OpKind::Connect,
            FtpOp::ChangeDir(_) => OpKind::ChangeDir,
            FtpOp::List(_) => OpKind::List,
            FtpOp::RawTransfer(_) => OpKind::RawTransfer,
            FtpOp::Transfer(_) => OpKind::Transfer,
            FtpOp::Mkdir(_) => OpKind::Mkdir,
            FtpOp::Delete(_) => OpKind::Delete,
            FtpOp::RemoveDir(_) => OpKind::RemoveDir,
            FtpOp::Rename(_) => OpKind::Rename,
            FtpOp::Chmod(_) => OpKind::Chmod,
            FtpOp::Raw(_) => OpKind::RawCommand,
        }
    }
}
