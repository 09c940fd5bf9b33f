//! Process-wide cache of directory listings.
//!
//! Listings are keyed by server and case-folded path. Entries live in a slab
//! threaded onto an intrusive LRU list so that a hit can be moved to the
//! recent end in constant time, and pruning always evicts the oldest first.

use crate::constants::{
    CACHE_ENTRY_FLOOR, CACHE_FILE_LIMIT, CACHE_HARD_LIMIT, CACHE_SOFT_ENTRY_FLOOR,
    CACHE_SOFT_FILE_LIMIT, DEFAULT_CACHE_TIMEOUT_SECS,
};
use crate::core_cache::listing::{DirectoryListing, Dirent, UnsureFlags};
use crate::core_server::{Server, ServerPath};
use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// What a mutation knows about the kind of entry it touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Unknown,
    File,
    Dir,
}

/// Result of [`DirectoryCache::lookup_file`].
#[derive(Debug, Clone, PartialEq)]
pub enum FileLookup {
    /// The containing directory is not cached.
    NoDirectory,
    /// The directory is cached but has no such entry.
    NotFound,
    Found { entry: Dirent, matched_case: bool },
}

struct CacheEntry {
    listing: DirectoryListing,
    modification_time: Instant,
    server: Server,
    key: String,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Default)]
struct Inner {
    slots: Vec<Option<CacheEntry>>,
    free: Vec<usize>,
    servers: HashMap<Server, BTreeMap<String, usize>>,
    // oldest end
    head: Option<usize>,
    // most recently used end
    tail: Option<usize>,
    len: usize,
    total_file_count: usize,
}

impl Inner {
    fn entry(&self, idx: usize) -> Option<&CacheEntry> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    fn entry_mut(&mut self, idx: usize) -> Option<&mut CacheEntry> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    fn find(&self, server: &Server, path: &ServerPath) -> Option<usize> {
        self.servers.get(server)?.get(&path.cache_key()).copied()
    }

    fn unlink(&mut self, idx: usize) {
        let Some((prev, next)) = self.entry(idx).map(|e| (e.prev, e.next)) else {
            return;
        };
        match prev {
            Some(p) => {
                if let Some(e) = self.entry_mut(p) {
                    e.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(e) = self.entry_mut(n) {
                    e.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(e) = self.entry_mut(idx) {
            e.prev = None;
            e.next = None;
        }
    }

    fn push_back(&mut self, idx: usize) {
        let old_tail = self.tail;
        if let Some(e) = self.entry_mut(idx) {
            e.prev = old_tail;
            e.next = None;
        }
        match old_tail {
            Some(t) => {
                if let Some(e) = self.entry_mut(t) {
                    e.next = Some(idx);
                }
            }
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    fn touch(&mut self, idx: usize) {
        if self.tail != Some(idx) {
            self.unlink(idx);
            self.push_back(idx);
        }
    }

    fn insert(&mut self, server: &Server, listing: DirectoryListing) {
        let key = listing.path.cache_key();
        self.total_file_count += listing.len();
        let entry = CacheEntry {
            listing,
            modification_time: Instant::now(),
            server: server.clone(),
            key: key.clone(),
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(entry);
                idx
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.servers.entry(server.clone()).or_default().insert(key, idx);
        self.len += 1;
        self.push_back(idx);
    }

    fn remove(&mut self, idx: usize) {
        self.unlink(idx);
        let Some(entry) = self.slots.get_mut(idx).and_then(Option::take) else {
            return;
        };
        self.free.push(idx);
        self.len -= 1;
        self.total_file_count -= entry.listing.len();
        if let Some(paths) = self.servers.get_mut(&entry.server) {
            paths.remove(&entry.key);
            if paths.is_empty() {
                self.servers.remove(&entry.server);
            }
        }
    }

    fn over_limit(&self) -> bool {
        self.len > CACHE_HARD_LIMIT
            || (self.total_file_count > CACHE_SOFT_FILE_LIMIT && self.len > CACHE_SOFT_ENTRY_FLOOR)
            || (self.total_file_count > CACHE_FILE_LIMIT && self.len > CACHE_ENTRY_FLOOR)
    }

    fn prune(&mut self) {
        while self.over_limit() {
            match self.head {
                Some(oldest) => self.remove(oldest),
                None => break,
            }
        }
    }

    /// Drops `path` and every cached listing below it.
    fn remove_subtree(&mut self, server: &Server, path: &ServerPath) {
        let Some(paths) = self.servers.get(server) else {
            return;
        };
        let doomed: Vec<usize> = paths
            .values()
            .copied()
            .filter(|&idx| {
                self.entry(idx).is_some_and(|e| {
                    e.listing.path.eq_no_case(path) || path.is_parent_of(&e.listing.path, true)
                })
            })
            .collect();
        for idx in doomed {
            self.remove(idx);
        }
    }

    /// Applies `apply` to a cached listing, keeping the running file count in
    /// step and stamping the modification time. Returns false on a miss.
    fn modify(
        &mut self,
        server: &Server,
        path: &ServerPath,
        apply: impl FnOnce(&mut DirectoryListing),
    ) -> bool {
        let Some(idx) = self.find(server, path) else {
            return false;
        };
        let Some(entry) = self.entry_mut(idx) else {
            return false;
        };
        let before = entry.listing.len();
        apply(&mut entry.listing);
        let after = entry.listing.len();
        entry.modification_time = Instant::now();
        self.total_file_count = self.total_file_count + after - before;
        true
    }
}

fn changed_flag(is_dir: bool) -> UnsureFlags {
    if is_dir {
        UnsureFlags::DIR_CHANGED
    } else {
        UnsureFlags::FILE_CHANGED
    }
}

pub struct DirectoryCache {
    inner: Mutex<Inner>,
    timeout: Duration,
}

impl Default for DirectoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryCache {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_CACHE_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_outdated(&self, listing: &DirectoryListing) -> bool {
        listing.first_list_time.elapsed() > self.timeout
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_file_count(&self) -> usize {
        self.lock().total_file_count
    }

    /// Inserts or replaces the listing for `listing.path`, then prunes.
    pub fn store(&self, listing: DirectoryListing, server: &Server) {
        let mut inner = self.lock();
        if let Some(idx) = inner.find(server, &listing.path) {
            let old = inner.entry(idx).map_or(0, |e| e.listing.len());
            let new = listing.len();
            if let Some(entry) = inner.entry_mut(idx) {
                entry.listing = listing;
                entry.modification_time = Instant::now();
            }
            inner.total_file_count = inner.total_file_count + new - old;
            inner.touch(idx);
        } else {
            inner.insert(server, listing);
        }
        inner.prune();
        debug!(
            "Directory cache holds {} listings with {} entries",
            inner.len, inner.total_file_count
        );
    }

    /// Returns the cached listing and whether it is outdated.
    ///
    /// Any match refreshes the LRU position, even one rejected because it has
    /// unsure entries and `allow_unsure` is false.
    pub fn lookup(
        &self,
        server: &Server,
        path: &ServerPath,
        allow_unsure: bool,
    ) -> Option<(DirectoryListing, bool)> {
        let mut inner = self.lock();
        let idx = inner.find(server, path)?;
        inner.touch(idx);
        let listing = &inner.entry(idx)?.listing;
        if !allow_unsure && listing.has_unsure_entries() {
            return None;
        }
        Some((listing.clone(), self.is_outdated(listing)))
    }

    /// Returns `(has_unsure_entries, is_outdated)` if the path is cached.
    pub fn does_exist(&self, server: &Server, path: &ServerPath) -> Option<(bool, bool)> {
        let inner = self.lock();
        let listing = &inner.entry(inner.find(server, path)?)?.listing;
        Some((listing.has_unsure_entries(), self.is_outdated(listing)))
    }

    pub fn lookup_file(&self, server: &Server, path: &ServerPath, file: &str) -> FileLookup {
        let mut inner = self.lock();
        let Some(idx) = inner.find(server, path) else {
            return FileLookup::NoDirectory;
        };
        inner.touch(idx);
        let Some(entry) = inner.entry(idx) else {
            return FileLookup::NoDirectory;
        };
        match entry.listing.find(file) {
            Some((i, matched_case)) => FileLookup::Found {
                entry: entry.listing.entries()[i].clone(),
                matched_case,
            },
            None => FileLookup::NotFound,
        }
    }

    /// Marks `file` in `path` as possibly stale. Returns false on a miss.
    pub fn invalidate_file(
        &self,
        server: &Server,
        path: &ServerPath,
        file: &str,
        kind: EntryKind,
    ) -> bool {
        self.lock().modify(server, path, |listing| match listing.find(file) {
            Some((i, _)) => {
                let entry = &mut listing.entries_mut()[i];
                if kind != EntryKind::Unknown {
                    entry.flags.dir = kind == EntryKind::Dir;
                }
                entry.flags.unsure = true;
                let is_dir = entry.flags.dir;
                listing.unsure.insert(changed_flag(is_dir));
            }
            None => listing.unsure.insert(UnsureFlags::UNKNOWN),
        })
    }

    /// Records our own change to `file`, creating the entry when allowed and
    /// the kind is known.
    pub fn update_file(
        &self,
        server: &Server,
        path: &ServerPath,
        file: &str,
        may_create: bool,
        kind: EntryKind,
        size: Option<u64>,
    ) -> bool {
        self.lock().modify(server, path, |listing| match listing.find(file) {
            Some((i, _)) => {
                let entry = &mut listing.entries_mut()[i];
                let was_dir = entry.flags.dir;
                if kind != EntryKind::Unknown {
                    entry.flags.dir = kind == EntryKind::Dir;
                }
                if kind == EntryKind::File {
                    entry.size = size;
                }
                entry.flags.unsure = true;
                let is_dir = entry.flags.dir;
                listing.unsure.insert(changed_flag(is_dir));
                if was_dir != is_dir {
                    listing.unsure.insert(changed_flag(was_dir));
                }
            }
            None if may_create && kind != EntryKind::Unknown => {
                let mut entry = match kind {
                    EntryKind::Dir => Dirent::dir(file),
                    _ => Dirent::file(file, size),
                };
                entry.flags.unsure = true;
                listing.entries_mut().push(entry);
                listing.unsure.insert(if kind == EntryKind::Dir {
                    UnsureFlags::DIR_ADDED
                } else {
                    UnsureFlags::FILE_ADDED
                });
            }
            None => listing.unsure.insert(UnsureFlags::UNKNOWN),
        })
    }

    pub fn remove_file(&self, server: &Server, path: &ServerPath, file: &str) -> bool {
        self.lock().modify(server, path, |listing| match listing.find(file) {
            Some((i, _)) => {
                let removed = listing.entries_mut().remove(i);
                listing.unsure.insert(if removed.is_dir() {
                    UnsureFlags::DIR_REMOVED
                } else {
                    UnsureFlags::FILE_REMOVED
                });
            }
            None => listing.unsure.insert(UnsureFlags::UNKNOWN),
        })
    }

    /// Forgets the listing of `path/subdir` and everything below it, drops
    /// `subdir` from the parent listing and, if non-empty, forgets `target`
    /// as well (the resolved location of a symlinked directory).
    pub fn remove_dir(&self, server: &Server, path: &ServerPath, subdir: &str, target: &ServerPath) {
        let mut inner = self.lock();
        if let Some(full) = path.change_path(subdir) {
            inner.remove_subtree(server, &full);
        }
        if !target.is_empty() {
            inner.remove_subtree(server, target);
        }
        inner.modify(server, path, |listing| {
            if let Some((i, _)) = listing.find(subdir) {
                listing.entries_mut().remove(i);
                listing.unsure.insert(UnsureFlags::DIR_REMOVED);
            }
        });
    }

    pub fn rename(
        &self,
        server: &Server,
        from_path: &ServerPath,
        from_file: &str,
        to_path: &ServerPath,
        to_file: &str,
    ) {
        let mut inner = self.lock();
        if inner.find(server, from_path).is_none() {
            drop(inner);
            self.invalidate_server(server);
            return;
        }

        let mut moved: Option<Dirent> = None;
        let same_dir = from_path.eq_no_case(to_path);
        inner.modify(server, from_path, |listing| {
            let Some((i, _)) = listing.find(from_file) else {
                listing.unsure.insert(UnsureFlags::UNKNOWN);
                return;
            };
            if same_dir {
                let source = listing.entries()[i].name.clone();
                if let Some((j, _)) = listing.find(to_file) {
                    if j != i {
                        listing.entries_mut().remove(j);
                    }
                }
                if let Some(entry) = listing.entries_mut().iter_mut().find(|e| e.name == source) {
                    entry.name = to_file.to_string();
                    moved = Some(entry.clone());
                }
            } else {
                let entry = listing.entries_mut().remove(i);
                listing.unsure.insert(if entry.is_dir() {
                    UnsureFlags::DIR_REMOVED
                } else {
                    UnsureFlags::FILE_REMOVED
                });
                moved = Some(entry);
            }
        });

        let Some(entry) = moved else {
            return;
        };
        if entry.is_dir() {
            if let Some(old) = from_path.change_path(from_file) {
                inner.remove_subtree(server, &old);
            }
        }
        if same_dir {
            return;
        }
        drop(inner);
        let kind = if entry.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };
        self.update_file(server, to_path, to_file, true, kind, entry.size);
    }

    pub fn invalidate_server(&self, server: &Server) {
        let mut inner = self.lock();
        let Some(paths) = inner.servers.get(server) else {
            return;
        };
        let doomed: Vec<usize> = paths.values().copied().collect();
        debug!(
            "Invalidating {} cached listings of {}",
            doomed.len(),
            server.display_name()
        );
        for idx in doomed {
            inner.remove(idx);
        }
    }

    /// When the cached listing for `path` was last stored or modified.
    pub fn get_change_time(&self, server: &Server, path: &ServerPath) -> Option<Instant> {
        let inner = self.lock();
        inner
            .entry(inner.find(server, path)?)
            .map(|e| e.modification_time)
    }

    /// Cached paths of `server` from oldest to newest use.
    pub fn lru_order(&self, server: &Server) -> Vec<ServerPath> {
        let inner = self.lock();
        let mut out = Vec::new();
        let mut cursor = inner.head;
        while let Some(idx) = cursor {
            let Some(entry) = inner.entry(idx) else {
                break;
            };
            if &entry.server == server {
                out.push(entry.listing.path.clone());
            }
            cursor = entry.next;
        }
        out
    }
}
