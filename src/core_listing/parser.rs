//! Incremental LIST / MLSD output parser.
//!
//! Recognised formats:
//! 1. **Unix** `ls -l`, with symlink targets and both the time and the year form
//! 2. **DOS/IIS**: `01-31-24  02:05PM       <DIR> name`
//! 3. **MLSD/MLST facts** (RFC 3659): `type=file;size=1;modify=20240131140500; name`
//! 4. **EPLF**: `+i8388621.29609,m824255902,/,\tname`
//!
//! Data may arrive in arbitrary chunks; incomplete lines are buffered until
//! their terminator shows up or [`DirectoryListingParser::parse`] is called.
//! A line that matches nothing is held back once and retried joined with its
//! successor, which recovers entries some servers wrap across two lines.

use crate::core_cache::{DirectoryListing, Dirent, RemoteTime, TimePrecision};
use crate::core_server::ServerPath;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use log::trace;
use once_cell::sync::Lazy;
use regex::Regex;

static UNIX_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        ^([dlcbps-][rwxsStTlL-]{9})[+.@]?\s+  # permissions
        (?:\d+\s+)?                         # link count
        (\S+)\s+                            # owner
        (?:(\S+)\s+)?                       # group
        (\d+)\s+                            # size
        ([A-Za-z]{3})\s+(\d{1,2})\s+        # month day
        (\d{1,2}:\d{2}(?::\d{2})?|\d{4})\s  # time or year
        (.+)$                               # name (possibly with -> target)
        ",
    )
    .ok()
});

static DOS_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        ^(\d{2})-(\d{2})-(\d{2}|\d{4})\s+   # date
        (\d{1,2}):(\d{2})\s*([AaPp][Mm])?\s+  # time
        (<DIR>|\d+)\s+                      # size or <DIR>
        (.+)$                               # name
        ",
    )
    .ok()
});

pub struct DirectoryListingParser {
    partial: Vec<u8>,
    held_back: Option<String>,
    entries: Vec<Dirent>,
    timezone_offset: i64,
    now: DateTime<Utc>,
}

impl Default for DirectoryListingParser {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryListingParser {
    pub fn new() -> Self {
        Self {
            partial: Vec::new(),
            held_back: None,
            entries: Vec::new(),
            timezone_offset: 0,
            now: Utc::now(),
        }
    }

    /// Reference time used to infer the year of `Mon DD HH:MM` entries.
    pub fn with_reference_time(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Offset in minutes added to server local times with at least minute
    /// precision. Set it before feeding data.
    pub fn set_timezone_offset(&mut self, minutes: i64) {
        self.timezone_offset = minutes;
    }

    pub fn add_data(&mut self, data: &[u8]) {
        self.partial.extend_from_slice(data);
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            self.add_line(text.trim_end_matches(['\r', '\n']));
        }
    }

    pub fn add_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        if let Some(previous) = self.held_back.take() {
            let joined = format!("{} {}", previous, line.trim_start());
            if let Some((entry, utc)) = self.parse_line_tagged(&joined) {
                self.push(entry, utc);
                return;
            }
            trace!("Discarding unparsable listing line: {}", previous);
        }
        match self.parse_line_tagged(line) {
            Some((entry, utc)) => self.push(entry, utc),
            None => {
                if !line.starts_with("total ") {
                    self.held_back = Some(line.to_string());
                }
            }
        }
    }

    /// Parses an `ls -l` line whose modification time and name are known
    /// separately, as the SFTP worker reports them. `name` wins over the
    /// name parsed from the line, which may be mangled by odd characters.
    pub fn add_line_with_time(&mut self, line: &str, mtime: Option<i64>, name: Option<&str>) {
        let Some((mut entry, utc)) = self.parse_line_tagged(line) else {
            trace!("Discarding unparsable listing line: {}", line);
            return;
        };
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            entry.name = name.to_string();
        }
        let exact = mtime.and_then(|secs| Utc.timestamp_opt(secs, 0).single());
        match exact {
            Some(time) => {
                entry.time = Some(RemoteTime::new(time, TimePrecision::Seconds));
                self.push(entry, true);
            }
            None => self.push(entry, utc),
        }
    }

    /// Server local times get the timezone offset, UTC times are kept.
    fn push(&mut self, mut entry: Dirent, utc: bool) {
        if entry.name == "." || entry.name == ".." {
            return;
        }
        if !utc && self.timezone_offset != 0 {
            entry.time = entry.time.map(|t| t.adjusted(self.timezone_offset));
        }
        self.entries.push(entry);
    }

    /// Finishes the listing for `path` and resets the parser.
    pub fn parse(&mut self, path: &ServerPath) -> DirectoryListing {
        if !self.partial.is_empty() {
            let line = String::from_utf8_lossy(&self.partial).into_owned();
            self.partial.clear();
            self.add_line(line.trim_end_matches('\r'));
        }
        self.held_back = None;
        DirectoryListing::with_entries(path.clone(), std::mem::take(&mut self.entries))
    }

    pub fn reset(&mut self) {
        self.partial.clear();
        self.held_back = None;
        self.entries.clear();
    }

    pub fn parse_line(&self, line: &str) -> Option<Dirent> {
        self.parse_line_tagged(line).map(|(entry, _)| entry)
    }

    /// Also tells whether the entry's time is UTC (EPLF and MLSD facts)
    /// rather than server local time.
    fn parse_line_tagged(&self, line: &str) -> Option<(Dirent, bool)> {
        if line.starts_with('+') {
            if let Some(entry) = parse_eplf(line) {
                return Some((entry, true));
            }
        }
        if line.contains('=') && line.contains(';') {
            if let Some(entry) = parse_mlsd(line) {
                return Some((entry, true));
            }
        }
        self.parse_unix(line)
            .or_else(|| parse_dos(line))
            .map(|entry| (entry, false))
    }

    fn parse_unix(&self, line: &str) -> Option<Dirent> {
        let caps = UNIX_RE.as_ref()?.captures(line)?;
        let perms = caps.get(1)?.as_str();
        let owner = caps.get(2)?.as_str();
        let group = caps.get(3).map(|m| m.as_str());
        let size = caps.get(4)?.as_str().parse::<u64>().ok();
        let month = month_number(caps.get(5)?.as_str())?;
        let day: u32 = caps.get(6)?.as_str().parse().ok()?;
        let time = self.unix_time(month, day, caps.get(7)?.as_str())?;
        let raw_name = caps.get(8)?.as_str();

        let kind = perms.as_bytes()[0];
        let mut entry = Dirent::file(raw_name, size);
        entry.permissions = perms.to_string();
        entry.owner_group = match group {
            Some(g) => format!("{} {}", owner, g),
            None => owner.to_string(),
        };
        entry.time = Some(time);
        match kind {
            b'd' => {
                entry.flags.dir = true;
                entry.size = None;
            }
            b'l' => {
                entry.flags.link = true;
                if let Some((name, target)) = raw_name.split_once(" -> ") {
                    entry.name = name.to_string();
                    entry.target = Some(target.to_string());
                }
            }
            _ => {}
        }
        Some(entry)
    }

    fn unix_time(&self, month: u32, day: u32, year_or_time: &str) -> Option<RemoteTime> {
        if !year_or_time.contains(':') {
            let year: i32 = year_or_time.parse().ok()?;
            let date = NaiveDate::from_ymd_opt(year, month, day)?;
            return Some(RemoteTime::new(
                Utc.from_utc_datetime(&date.and_time(NaiveTime::from_hms_opt(0, 0, 0)?)),
                TimePrecision::Days,
            ));
        }
        let (precision, format) = if year_or_time.matches(':').count() == 2 {
            (TimePrecision::Seconds, "%H:%M:%S")
        } else {
            (TimePrecision::Minutes, "%H:%M")
        };
        let clock = NaiveTime::parse_from_str(year_or_time, format).ok()?;
        // no year given: the most recent such date not more than a day ahead
        let mut year = self.now.year();
        loop {
            let date = NaiveDate::from_ymd_opt(year, month, day)?;
            let time = Utc.from_utc_datetime(&date.and_time(clock));
            if time <= self.now + Duration::days(1) || year < self.now.year() - 1 {
                return Some(RemoteTime::new(time, precision));
            }
            year -= 1;
        }
    }
}

fn month_number(name: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let lower = name.to_lowercase();
    MONTHS
        .iter()
        .position(|m| *m == lower)
        .map(|i| i as u32 + 1)
}

fn parse_dos(line: &str) -> Option<Dirent> {
    let caps = DOS_RE.as_ref()?.captures(line)?;
    let month: u32 = caps.get(1)?.as_str().parse().ok()?;
    let day: u32 = caps.get(2)?.as_str().parse().ok()?;
    let year_text = caps.get(3)?.as_str();
    let mut year: i32 = year_text.parse().ok()?;
    if year_text.len() == 2 {
        year += if year < 70 { 2000 } else { 1900 };
    }
    let mut hour: u32 = caps.get(4)?.as_str().parse().ok()?;
    let minute: u32 = caps.get(5)?.as_str().parse().ok()?;
    if let Some(ampm) = caps.get(6) {
        let pm = ampm.as_str().eq_ignore_ascii_case("pm");
        hour %= 12;
        if pm {
            hour += 12;
        }
    }
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    let clock = NaiveTime::from_hms_opt(hour, minute, 0)?;
    let time = RemoteTime::new(
        Utc.from_utc_datetime(&date.and_time(clock)),
        TimePrecision::Minutes,
    );
    let name = caps.get(8)?.as_str();
    let entry = match caps.get(7)?.as_str() {
        "<DIR>" => Dirent::dir(name),
        size => Dirent::file(name, size.parse().ok()),
    };
    Some(entry.with_time(time))
}

fn parse_mlsd(line: &str) -> Option<Dirent> {
    let (facts, name) = line.split_once(' ')?;
    if name.is_empty() {
        return None;
    }
    let mut entry = Dirent::file(name, None);
    let mut saw_type = false;
    for fact in facts.split(';').filter(|f| !f.is_empty()) {
        let (key, value) = fact.split_once('=')?;
        match key.to_lowercase().as_str() {
            "type" => {
                saw_type = true;
                let lower = value.to_lowercase();
                match lower.as_str() {
                    "cdir" | "pdir" => return None,
                    "dir" => entry.flags.dir = true,
                    "file" => {}
                    _ if lower.starts_with("os.unix=slink") || lower.starts_with("os.unix=symlink") => {
                        entry.flags.dir = true;
                        entry.flags.link = true;
                        if let Some((_, target)) = value.split_once(':') {
                            if !target.is_empty() {
                                entry.target = Some(target.to_string());
                            }
                        }
                    }
                    _ => {}
                }
            }
            "size" => entry.size = value.parse().ok(),
            "modify" => entry.time = parse_mlsd_time(value),
            "unix.mode" => entry.permissions = value.to_string(),
            "perm" if entry.permissions.is_empty() => entry.permissions = value.to_string(),
            "unix.owner" | "unix.user" => {
                entry.owner_group = join_owner(&entry.owner_group, value, true)
            }
            "unix.group" => entry.owner_group = join_owner(&entry.owner_group, value, false),
            _ => {}
        }
    }
    if !saw_type {
        return None;
    }
    if entry.flags.dir && !entry.flags.link {
        entry.size = None;
    }
    Some(entry)
}

fn join_owner(current: &str, value: &str, is_owner: bool) -> String {
    match (current.is_empty(), is_owner) {
        (true, _) => value.to_string(),
        (false, true) => format!("{} {}", value, current),
        (false, false) => format!("{} {}", current, value),
    }
}

/// `YYYYMMDD[HHMM[SS[.sss]]]`
fn parse_mlsd_time(value: &str) -> Option<RemoteTime> {
    let digits = value.split('.').next()?;
    let (format, precision, text) = match digits.len() {
        14 => ("%Y%m%d%H%M%S", TimePrecision::Seconds, digits.to_string()),
        12 => ("%Y%m%d%H%M%S", TimePrecision::Minutes, format!("{}00", digits)),
        8 => ("%Y%m%d%H%M%S", TimePrecision::Days, format!("{}000000", digits)),
        _ => return None,
    };
    NaiveDateTime::parse_from_str(&text, format)
        .ok()
        .map(|dt| RemoteTime::new(Utc.from_utc_datetime(&dt), precision))
}

fn parse_eplf(line: &str) -> Option<Dirent> {
    let (facts, name) = line.strip_prefix('+')?.split_once('\t')?;
    if name.is_empty() {
        return None;
    }
    let mut entry = Dirent::file(name, None);
    let mut kind_known = false;
    for fact in facts.split(',').filter(|f| !f.is_empty()) {
        let mut chars = fact.chars();
        let tag = chars.next()?;
        let value = chars.as_str();
        match tag {
            '/' => {
                entry.flags.dir = true;
                kind_known = true;
            }
            'r' => kind_known = true,
            's' => entry.size = value.parse().ok(),
            'm' => {
                entry.time = value
                    .parse::<i64>()
                    .ok()
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                    .map(|t| RemoteTime::new(t, TimePrecision::Seconds))
            }
            'u' if value.starts_with('p') => entry.permissions = value[1..].to_string(),
            _ => {}
        }
    }
    kind_known.then_some(entry)
}
