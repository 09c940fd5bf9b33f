//! Server timezone detection.
//!
//! Listings from servers without MLSD carry local server times. Comparing one
//! listed time with the exact UTC time from `MDTM` (or the SFTP worker's
//! `mtime`) yields the offset to apply to every later listing.

use crate::constants::MAX_TIMEZONE_OFFSET_SECS;
use crate::core_cache::{DirectoryListing, Dirent, RemoteTime, TimePrecision};
use chrono::{DateTime, NaiveDateTime, TimeZone, Timelike, Utc};

/// The first file whose listed time is precise enough to compare against.
pub fn probe_candidate(listing: &DirectoryListing) -> Option<&Dirent> {
    listing.entries().iter().find(|e| {
        !e.is_dir()
            && e
                .time
                .is_some_and(|t| t.precision >= TimePrecision::Minutes)
    })
}

/// Offset in minutes to add to listed times, or `None` if the difference is
/// beyond what any timezone explains.
pub fn compute_offset(listed: &RemoteTime, exact: DateTime<Utc>) -> Option<i64> {
    let exact = if listed.has_seconds() {
        exact
    } else {
        exact.with_second(0)?.with_nanosecond(0)?
    };
    let seconds = (exact - listed.time).num_seconds();
    if seconds.abs() > MAX_TIMEZONE_OFFSET_SECS {
        return None;
    }
    let minutes = if seconds >= 0 {
        (seconds + 30) / 60
    } else {
        (seconds - 30) / 60
    };
    Some(minutes)
}

/// Parses an `MDTM`/`MFMT` style `YYYYMMDDHHMMSS[.sss]` UTC time.
pub fn parse_timeval(text: &str) -> Option<DateTime<Utc>> {
    let digits = text.trim().split('.').next()?;
    if digits.len() != 14 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDateTime::parse_from_str(digits, "%Y%m%d%H%M%S")
        .ok()
        .map(|dt| Utc.from_utc_datetime(&dt))
}

pub fn format_timeval(time: DateTime<Utc>) -> String {
    time.format("%Y%m%d%H%M%S").to_string()
}
