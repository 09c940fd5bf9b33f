// src/constants.rs

/// Upper bound on cached listings regardless of their size.
pub const CACHE_HARD_LIMIT: usize = 50_000;
/// Listings may use at most this many cached entries in total before pruning...
pub const CACHE_SOFT_FILE_LIMIT: usize = 1_000_000;
/// ...unless fewer than this many listings are cached.
pub const CACHE_SOFT_ENTRY_FLOOR: usize = 1_000;
pub const CACHE_FILE_LIMIT: usize = 5_000_000;
pub const CACHE_ENTRY_FLOOR: usize = 100;

pub const DEFAULT_CACHE_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 30;

/// Timezone offsets beyond a day mean the server clock is simply wrong.
pub const MAX_TIMEZONE_OFFSET_SECS: i64 = 24 * 60 * 60;

pub const DEFAULT_CLIENT_NAME: &str = "rouillesync";
pub const DEFAULT_SFTP_WORKER: &str = "fzsftp";
pub const SFTP_PROTOCOL_VERSION: u32 = 11;

/// Replies that some servers send instead of an empty listing.
pub const EMPTY_LISTING_REPLIES: [&str; 3] = [
    "550 no members found.",
    "550 no data sets found.",
    "550 no files found.",
];
