// Module shared by the FTP and SFTP control sockets: the operation stack,
// the session context, path locks and the events a socket emits.

pub mod context;
pub mod locks;
pub mod notification;
pub mod operation;
pub mod socket_core;
pub mod timezone;

pub use context::SessionContext;
pub use locks::{LockReason, PathLocks, SocketId};
pub use notification::{
    AsyncReply, AsyncRequest, DataTask, FileExistsAction, FileExistsRequest, ListFlags,
    Notification, Outbound, RequestId, TransferCommand, TransferEndReason,
};
pub use operation::{OpKind, OpStack, Step};
pub use socket_core::{ControlSocket, OpDispatch, SocketCore};
