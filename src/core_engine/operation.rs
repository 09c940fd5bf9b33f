//! The nested operation stack both control sockets run on.
//!
//! An operation is one variant of a per-protocol enum. Its handlers return a
//! [`Step`] telling the socket what to do next; the socket owns the stack and
//! applies the step, so handlers never touch the stack themselves.

use crate::core_error::ReplyCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Connect,
    List,
    ChangeDir,
    Transfer,
    RawTransfer,
    Delete,
    RemoveDir,
    Mkdir,
    Rename,
    Chmod,
    RawCommand,
}

#[derive(Debug)]
pub enum Step<T> {
    /// Issue one command and wait for its reply.
    Send(String),
    /// State advanced without wire traffic; run the send handler again.
    Continue,
    /// Start a nested operation on top of this one.
    Push(T),
    /// Wait for an outside event (data channel, user reply, lock).
    Wait,
    /// This operation is done.
    Finish(ReplyCode),
}

#[derive(Debug)]
pub struct OpStack<T> {
    ops: Vec<T>,
}

impl<T> Default for OpStack<T> {
    fn default() -> Self {
        Self { ops: Vec::new() }
    }
}

impl<T> OpStack<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: T) {
        self.ops.push(op);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.ops.pop()
    }

    pub fn top(&self) -> Option<&T> {
        self.ops.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut T> {
        self.ops.last_mut()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Outermost first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.ops.iter()
    }
}
