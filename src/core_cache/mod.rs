// Directory listings and the caches shared by every control socket

pub mod directory_cache;
pub mod listing;
pub mod path_cache;


pub use directory_cache::{DirectoryCache, EntryKind, FileLookup};
pub use listing::{DirectoryListing, Dirent, EntryFlags, RemoteTime, TimePrecision, UnsureFlags};
pub use path_cache::PathCache;
