use crate::core_cache::{DirectoryCache, PathCache};
use crate::core_engine::locks::{PathLocks, SocketId};
use crate::core_server::ServerCapabilities;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// State shared by every control socket of one engine instance.
#[derive(Clone)]
pub struct SessionContext {
    pub cache: Arc<DirectoryCache>,
    pub capabilities: Arc<Mutex<ServerCapabilities>>,
    pub path_cache: Arc<PathCache>,
    pub locks: Arc<PathLocks>,
    next_socket: Arc<AtomicU64>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    pub fn new() -> Self {
        Self::with_cache(DirectoryCache::new())
    }

    pub fn with_cache_timeout(timeout: Duration) -> Self {
        Self::with_cache(DirectoryCache::with_timeout(timeout))
    }

    fn with_cache(cache: DirectoryCache) -> Self {
        Self {
            cache: Arc::new(cache),
            capabilities: Arc::new(Mutex::new(ServerCapabilities::new())),
            path_cache: Arc::new(PathCache::new()),
            locks: Arc::new(PathLocks::new()),
            next_socket: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn capabilities(&self) -> MutexGuard<'_, ServerCapabilities> {
        self.capabilities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn next_socket_id(&self) -> SocketId {
        SocketId(self.next_socket.fetch_add(1, Ordering::Relaxed))
    }
}
