//! Advisory locks that keep several connections to the same server from
//! listing or creating the same path at once.

use crate::core_server::{Server, ServerPath};
use log::debug;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockReason {
    List,
    Mkdir,
}

#[derive(Debug, Clone)]
struct Lock {
    socket: SocketId,
    server: Server,
    path: String,
    reason: LockReason,
}

impl Lock {
    fn same_target(&self, other: &Lock) -> bool {
        self.reason == other.reason && self.server == other.server && self.path == other.path
    }
}

#[derive(Default)]
struct Inner {
    held: Vec<Lock>,
    waiting: Vec<Lock>,
}

#[derive(Default)]
pub struct PathLocks {
    inner: Mutex<Inner>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the lock or registers `socket` as a waiter. Re-entrant per socket.
    pub fn try_lock(
        &self,
        socket: SocketId,
        server: &Server,
        path: &ServerPath,
        reason: LockReason,
    ) -> bool {
        let wanted = Lock {
            socket,
            server: server.clone(),
            path: path.cache_key(),
            reason,
        };
        let mut inner = self.lock();
        match inner.held.iter().find(|l| l.same_target(&wanted)) {
            Some(holder) if holder.socket == socket => true,
            Some(holder) => {
                debug!(
                    "Waiting for {:?} lock on {} held by socket {}",
                    reason, wanted.path, holder.socket.0
                );
                if !inner
                    .waiting
                    .iter()
                    .any(|w| w.socket == socket && w.same_target(&wanted))
                {
                    inner.waiting.push(wanted);
                }
                false
            }
            None => {
                inner
                    .waiting
                    .retain(|w| !(w.socket == socket && w.same_target(&wanted)));
                inner.held.push(wanted);
                true
            }
        }
    }

    pub fn is_locked(&self, server: &Server, path: &ServerPath, reason: LockReason) -> bool {
        let key = path.cache_key();
        self.lock()
            .held
            .iter()
            .any(|l| l.reason == reason && &l.server == server && l.path == key)
    }

    /// Releases every lock `socket` holds for `reason` and returns the
    /// sockets that were waiting on any of them.
    pub fn release(&self, socket: SocketId, reason: LockReason) -> Vec<SocketId> {
        let mut inner = self.lock();
        let (released, kept): (Vec<Lock>, Vec<Lock>) = inner
            .held
            .drain(..)
            .partition(|l| l.socket == socket && l.reason == reason);
        inner.held = kept;
        let mut woken: Vec<SocketId> = Vec::new();
        for lock in &released {
            for waiter in inner.waiting.iter().filter(|w| w.same_target(lock)) {
                if !woken.contains(&waiter.socket) {
                    woken.push(waiter.socket);
                }
            }
        }
        woken
    }

    /// Drops `socket` from every wait queue without touching held locks.
    pub fn stop_waiting(&self, socket: SocketId) {
        self.lock().waiting.retain(|w| w.socket != socket);
    }

    /// Forgets everything about `socket`, e.g. when it disconnects.
    pub fn forget(&self, socket: SocketId) -> Vec<SocketId> {
        let mut woken = self.release(socket, LockReason::List);
        for id in self.release(socket, LockReason::Mkdir) {
            if !woken.contains(&id) {
                woken.push(id);
            }
        }
        self.lock().waiting.retain(|w| w.socket != socket);
        woken
    }
}
