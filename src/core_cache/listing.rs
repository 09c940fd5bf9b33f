//! Structured directory listings.

use crate::core_server::ServerPath;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::ops::BitOr;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimePrecision {
    Days,
    Minutes,
    Seconds,
}

/// A modification time together with how much of it the server told us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteTime {
    pub time: DateTime<Utc>,
    pub precision: TimePrecision,
}

impl RemoteTime {
    pub fn new(time: DateTime<Utc>, precision: TimePrecision) -> Self {
        Self { time, precision }
    }

    pub fn has_seconds(&self) -> bool {
        self.precision == TimePrecision::Seconds
    }

    pub fn adjusted(&self, minutes: i64) -> Self {
        if self.precision == TimePrecision::Days {
            return *self;
        }
        Self {
            time: self.time + ChronoDuration::minutes(minutes),
            precision: self.precision,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct EntryFlags {
    pub dir: bool,
    pub link: bool,
    /// Possibly stale because of one of our own unconfirmed changes.
    pub unsure: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub name: String,
    pub size: Option<u64>,
    pub permissions: String,
    pub owner_group: String,
    pub flags: EntryFlags,
    pub time: Option<RemoteTime>,
    pub target: Option<String>,
}

impl Dirent {
    pub fn file(name: &str, size: Option<u64>) -> Self {
        Self {
            name: name.to_string(),
            size,
            permissions: String::new(),
            owner_group: String::new(),
            flags: EntryFlags::default(),
            time: None,
            target: None,
        }
    }

    pub fn dir(name: &str) -> Self {
        let mut entry = Self::file(name, None);
        entry.flags.dir = true;
        entry
    }

    pub fn with_time(mut self, time: RemoteTime) -> Self {
        self.time = Some(time);
        self
    }

    pub fn is_dir(&self) -> bool {
        self.flags.dir
    }

    pub fn is_link(&self) -> bool {
        self.flags.link
    }

    pub fn is_unsure(&self) -> bool {
        self.flags.unsure
    }
}

/// Bitmask describing in which way a cached listing may be out of date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct UnsureFlags(u8);

impl UnsureFlags {
    pub const NONE: UnsureFlags = UnsureFlags(0);
    pub const INVALID: UnsureFlags = UnsureFlags(1);
    pub const UNKNOWN: UnsureFlags = UnsureFlags(1 << 1);
    pub const DIR_ADDED: UnsureFlags = UnsureFlags(1 << 2);
    pub const FILE_ADDED: UnsureFlags = UnsureFlags(1 << 3);
    pub const DIR_CHANGED: UnsureFlags = UnsureFlags(1 << 4);
    pub const FILE_CHANGED: UnsureFlags = UnsureFlags(1 << 5);
    pub const DIR_REMOVED: UnsureFlags = UnsureFlags(1 << 6);
    pub const FILE_REMOVED: UnsureFlags = UnsureFlags(1 << 7);

    pub fn contains(self, other: UnsureFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: UnsureFlags) {
        self.0 |= other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for UnsureFlags {
    type Output = UnsureFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        UnsureFlags(self.0 | rhs.0)
    }
}

/// One directory's contents. Entries are shared copy-on-write, so handing
/// a listing out of the cache does not copy them.
#[derive(Debug, Clone)]
pub struct DirectoryListing {
    pub path: ServerPath,
    entries: Arc<Vec<Dirent>>,
    pub first_list_time: Instant,
    pub unsure: UnsureFlags,
    pub failed: bool,
}

impl PartialEq for DirectoryListing {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
            && self.entries == other.entries
            && self.unsure == other.unsure
            && self.failed == other.failed
    }
}

impl DirectoryListing {
    pub fn new(path: ServerPath) -> Self {
        Self::with_entries(path, Vec::new())
    }

    pub fn with_entries(path: ServerPath, entries: Vec<Dirent>) -> Self {
        Self {
            path,
            entries: Arc::new(entries),
            first_list_time: Instant::now(),
            unsure: UnsureFlags::NONE,
            failed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Dirent] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut Vec<Dirent> {
        Arc::make_mut(&mut self.entries)
    }

    pub fn has_unsure_entries(&self) -> bool {
        !self.unsure.is_empty()
    }

    /// Finds `name` by exact case first, then case-insensitively.
    /// The flag tells whether the case matched.
    pub fn find(&self, name: &str) -> Option<(usize, bool)> {
        if let Some(i) = self.entries.iter().position(|e| e.name == name) {
            return Some((i, true));
        }
        let lower = name.to_lowercase();
        self.entries
            .iter()
            .position(|e| e.name.to_lowercase() == lower)
            .map(|i| (i, false))
    }

    /// True if every name of `other` appears here and this listing is larger.
    pub fn is_strict_superset_of(&self, other: &DirectoryListing) -> bool {
        if self.len() <= other.len() {
            return false;
        }
        other
            .entries
            .iter()
            .all(|o| self.entries.iter().any(|e| e.name == o.name))
    }

    /// Shifts every timestamp by `minutes`, used once a server's timezone is known.
    pub fn apply_timezone_offset(&mut self, minutes: i64) {
        if minutes == 0 {
            return;
        }
        for entry in self.entries_mut() {
            if let Some(time) = entry.time {
                entry.time = Some(time.adjusted(minutes));
            }
        }
    }
}
