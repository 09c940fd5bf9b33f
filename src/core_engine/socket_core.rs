//! State and behaviour common to the FTP and SFTP control sockets.

use crate::config::EngineOptions;
use crate::core_error::ReplyCode;
use crate::core_engine::context::SessionContext;
use crate::core_engine::locks::{LockReason, SocketId};
use crate::core_engine::notification::{
    AsyncReply, AsyncRequest, ListFlags, Notification, Outbound, RequestId, TransferCommand,
};
use crate::core_engine::operation::{OpStack, Step};
use crate::core_server::{Server, ServerPath};
use log::{debug, error, warn};
use std::time::{Duration, Instant};

/// The operations a caller can start on a connection, whatever the protocol.
///
/// Every initiator returns `Ok` when the request was satisfied without any
/// round trip, `WouldBlock` when the result will arrive later as a
/// [`Notification::OperationFinished`], or a failure right away.
pub trait ControlSocket {
    fn socket_id(&self) -> SocketId;
    fn connect(&mut self, server: Server) -> ReplyCode;
    fn list(&mut self, path: ServerPath, subdir: &str, flags: ListFlags) -> ReplyCode;
    fn file_transfer(&mut self, command: TransferCommand) -> ReplyCode;
    fn delete(&mut self, path: ServerPath, files: Vec<String>) -> ReplyCode;
    fn remove_dir(&mut self, path: ServerPath, subdir: &str) -> ReplyCode;
    fn mkdir(&mut self, path: ServerPath) -> ReplyCode;
    fn rename(
        &mut self,
        from_path: ServerPath,
        from_file: &str,
        to_path: ServerPath,
        to_file: &str,
    ) -> ReplyCode;
    fn chmod(&mut self, path: ServerPath, file: &str, permissions: &str) -> ReplyCode;
    fn raw_command(&mut self, command: &str) -> ReplyCode;

    fn cancel(&mut self);
    fn set_async_request_reply(&mut self, id: RequestId, reply: AsyncReply);
    /// A lock this socket was waiting for has been released.
    fn on_lock_available(&mut self);
    fn check_timeout(&mut self, now: Instant);

    fn drain_outbound(&mut self) -> Vec<Outbound>;
    fn drain_notifications(&mut self) -> Vec<Notification>;
    fn current_path(&self) -> &ServerPath;
}

/// The dispatcher both control sockets run on. A socket supplies its stack
/// and its per-protocol handlers. The provided methods run the handlers,
/// apply the steps they return and unwind the stack.
pub trait OpDispatch {
    type Op;

    fn core_mut(&mut self) -> &mut SocketCore<Self::Op>;
    /// False while the connection cannot take another command.
    fn ready_to_send(&self) -> bool;
    fn send_command(&mut self, command: &str);
    fn op_send(&mut self, op: &mut Self::Op) -> Step<Self::Op>;
    fn op_subcommand_result(&mut self, op: &mut Self::Op, code: ReplyCode) -> Step<Self::Op>;
    /// Side effects of an operation leaving the stack.
    fn finish_op(&mut self, op: Self::Op, code: ReplyCode);
    fn close_connection(&mut self);

    /// Runs right before the outermost operation reports its result.
    fn before_operation_finished(&mut self) {}

    /// Drives the top operation until it waits for something.
    fn send_next_command(&mut self) {
        while self.ready_to_send() {
            let Some(mut op) = self.core_mut().ops.pop() else {
                return;
            };
            let step = self.op_send(&mut op);
            self.core_mut().ops.push(op);
            if !self.apply_step(step) {
                return;
            }
        }
    }

    /// Runs `handler` on the top operation and applies the resulting step.
    fn dispatch<F>(&mut self, handler: F)
    where
        F: FnOnce(&mut Self, &mut Self::Op) -> Step<Self::Op>,
    {
        let Some(mut op) = self.core_mut().ops.pop() else {
            return;
        };
        let step = handler(self, &mut op);
        self.core_mut().ops.push(op);
        if self.apply_step(step) {
            self.send_next_command();
        }
    }

    /// Applies a handler's step. Returns true if the send handler of the
    /// (possibly new) top operation should run next.
    fn apply_step(&mut self, step: Step<Self::Op>) -> bool {
        match step {
            Step::Send(command) => {
                self.send_command(&command);
                false
            }
            Step::Continue => true,
            Step::Push(op) => {
                self.core_mut().ops.push(op);
                true
            }
            Step::Wait => false,
            Step::Finish(code) => {
                self.reset_operation(code);
                false
            }
        }
    }

    /// Finishes the innermost operation and hands `code` to its caller.
    fn reset_operation(&mut self, code: ReplyCode) {
        let Some(op) = self.core_mut().ops.pop() else {
            return;
        };
        self.finish_op(op, code);

        if code.terminates_stack() {
            while let Some(caller) = self.core_mut().ops.pop() {
                self.finish_op(caller, code);
            }
        }

        match self.core_mut().ops.pop() {
            Some(mut caller) => {
                let step = self.op_subcommand_result(&mut caller, code);
                self.core_mut().ops.push(caller);
                if self.apply_step(step) {
                    self.send_next_command();
                }
            }
            None => self.operation_finished(code),
        }
    }

    fn operation_finished(&mut self, code: ReplyCode) {
        self.before_operation_finished();
        let core = self.core_mut();
        core.clear_async_request();
        if code.is_error() && !code.is_canceled() {
            error!("Operation failed: {}", code);
        }
        core.notify(Notification::OperationFinished(code));
        if code.is_disconnected() {
            self.close_connection();
        }
    }
}

pub struct SocketCore<Op> {
    pub id: SocketId,
    pub ctx: SessionContext,
    pub options: EngineOptions,
    pub server: Option<Server>,
    pub current_path: ServerPath,
    pub ops: OpStack<Op>,
    outbound: Vec<Outbound>,
    notifications: Vec<Notification>,
    next_request: RequestId,
    pending_request: Option<RequestId>,
    waiting_for_lock: bool,
    last_activity: Instant,
}

impl<Op> SocketCore<Op> {
    pub fn new(ctx: SessionContext, options: EngineOptions) -> Self {
        Self {
            id: ctx.next_socket_id(),
            ctx,
            options,
            server: None,
            current_path: ServerPath::default(),
            ops: OpStack::new(),
            outbound: Vec::new(),
            notifications: Vec::new(),
            next_request: 0,
            pending_request: None,
            waiting_for_lock: false,
            last_activity: Instant::now(),
        }
    }

    pub fn emit(&mut self, action: Outbound) {
        self.outbound.push(action);
    }

    pub fn notify(&mut self, notification: Notification) {
        self.notifications.push(notification);
    }

    pub fn drain_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbound)
    }

    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// True while the socket waits on the user or on another socket, which
    /// never counts against the timeout.
    pub fn is_waiting_externally(&self) -> bool {
        self.pending_request.is_some() || self.waiting_for_lock
    }

    pub fn send_async_request(&mut self, request: AsyncRequest) -> RequestId {
        self.next_request += 1;
        let id = self.next_request;
        self.pending_request = Some(id);
        debug!("Async request {}: {:?}", id, request);
        self.notify(Notification::AsyncRequest { id, request });
        id
    }

    /// Accepts a reply only if it answers the outstanding request.
    pub fn take_async_reply(&mut self, id: RequestId) -> bool {
        if self.pending_request != Some(id) {
            warn!("Ignoring reply to stale async request {}", id);
            return false;
        }
        self.pending_request = None;
        self.touch();
        true
    }

    pub fn clear_async_request(&mut self) {
        self.pending_request = None;
    }

    pub fn server(&self) -> Option<&Server> {
        self.server.as_ref()
    }

    pub fn try_lock(&mut self, path: &ServerPath, reason: LockReason) -> bool {
        let Some(server) = self.server.as_ref() else {
            return true;
        };
        let granted = self.ctx.locks.try_lock(self.id, server, path, reason);
        self.waiting_for_lock = !granted;
        granted
    }

    pub fn release_lock(&mut self, reason: LockReason) {
        self.waiting_for_lock = false;
        let woken = self.ctx.locks.release(self.id, reason);
        if !woken.is_empty() {
            self.notify(Notification::LocksReleased(woken));
        }
    }

    /// Called when an operation that may hold a lock ends. Releases the
    /// lock if it was granted, otherwise leaves the wait queue.
    pub fn release_if_held(&mut self, held: bool, reason: LockReason) {
        if held {
            self.release_lock(reason);
        } else if self.waiting_for_lock {
            self.waiting_for_lock = false;
            self.ctx.locks.stop_waiting(self.id);
        }
    }

    pub fn forget_locks(&mut self) {
        self.waiting_for_lock = false;
        let woken = self.ctx.locks.forget(self.id);
        if !woken.is_empty() {
            self.notify(Notification::LocksReleased(woken));
        }
    }

    pub fn listing_notification(&mut self, path: ServerPath, primary: bool, failed: bool) {
        self.notify(Notification::DirectoryListing {
            path,
            primary,
            failed,
        });
    }

    /// Minutes to add to listed times for the connected server: the detected
    /// offset plus any manual adjustment from the server entry.
    pub fn timezone_offset(&self) -> i64 {
        let Some(server) = self.server.as_ref() else {
            return 0;
        };
        let (_, detected) = self
            .ctx
            .capabilities()
            .get_number(server, crate::core_server::Capability::TimezoneOffset);
        detected.unwrap_or(0) + i64::from(server.timezone_offset)
    }
}
