//! Memo of where `CWD subdir` from a known directory actually ends up.

use crate::core_server::{Server, ServerPath};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SourceKey {
    path: String,
    subdir: String,
}

#[derive(Default)]
pub struct PathCache {
    servers: Mutex<HashMap<Server, HashMap<SourceKey, (ServerPath, ServerPath)>>>,
}

impl PathCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Server, HashMap<SourceKey, (ServerPath, ServerPath)>>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(source: &ServerPath, subdir: &str) -> SourceKey {
        SourceKey {
            path: source.cache_key(),
            subdir: subdir.to_string(),
        }
    }

    /// Remembers that entering `subdir` from `source` led to `target`.
    /// An empty `subdir` records the canonical form of `source` itself.
    pub fn store(&self, server: &Server, target: &ServerPath, source: &ServerPath, subdir: &str) {
        if target.is_empty() || source.is_empty() {
            return;
        }
        self.lock()
            .entry(server.clone())
            .or_default()
            .insert(Self::key(source, subdir), (source.clone(), target.clone()));
    }

    pub fn lookup(&self, server: &Server, source: &ServerPath, subdir: &str) -> Option<ServerPath> {
        self.lock()
            .get(server)?
            .get(&Self::key(source, subdir))
            .map(|(_, target)| target.clone())
    }

    /// Forgets every memo that starts in or resolves into `path/subdir`.
    pub fn invalidate_path(&self, server: &Server, path: &ServerPath, subdir: &str) {
        let Some(gone) = (if subdir.is_empty() {
            Some(path.clone())
        } else {
            path.change_path(subdir)
        }) else {
            return;
        };
        let mut servers = self.lock();
        let Some(entries) = servers.get_mut(server) else {
            return;
        };
        entries.retain(|_, (source, target)| {
            let under = |p: &ServerPath| p.eq_no_case(&gone) || gone.is_parent_of(p, true);
            !under(source) && !under(target)
        });
    }

    pub fn invalidate_server(&self, server: &Server) {
        self.lock().remove(server);
    }
}
