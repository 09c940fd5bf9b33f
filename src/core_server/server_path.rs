//! Hierarchical remote paths.
//!
//! A [`ServerPath`] is a prefix (drive, VMS device) plus a list of segments,
//! formatted according to the server's dialect. Cache lookups compare paths
//! case-insensitively through [`ServerPath::cache_key`].

use crate::core_server::server::ServerType;
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PathData {
    prefix: Option<String>,
    segments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ServerPath {
    kind: ServerType,
    data: Option<PathData>,
}

impl ServerPath {
    /// Guesses the dialect from the shape of an absolute path.
    pub fn guess_type(path: &str) -> ServerType {
        let bytes = path.as_bytes();
        if path.starts_with('/') {
            ServerType::Unix
        } else if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
            ServerType::Dos
        } else if path.contains('[') && path.ends_with(']') {
            ServerType::Vms
        } else if path.len() >= 2 && path.starts_with('\'') && path.ends_with('\'') {
            ServerType::Mvs
        } else {
            ServerType::Default
        }
    }

    /// Parses an absolute path. `ServerType::Default` guesses the dialect.
    pub fn parse(path: &str, kind: ServerType) -> Option<Self> {
        let kind = match kind {
            ServerType::Default => Self::guess_type(path),
            other => other,
        };
        let data = match kind {
            ServerType::Default => return None,
            ServerType::Unix => {
                if !path.starts_with('/') {
                    return None;
                }
                PathData {
                    prefix: None,
                    segments: normalize(path.split('/'))?,
                }
            }
            ServerType::Dos => {
                let bytes = path.as_bytes();
                if bytes.len() < 2 || !bytes[0].is_ascii_alphabetic() || bytes[1] != b':' {
                    return None;
                }
                PathData {
                    prefix: Some(path[..2].to_string()),
                    segments: normalize(path[2..].split(['/', '\\']))?,
                }
            }
            ServerType::Vms => {
                let open = path.find('[')?;
                let inner = path[open + 1..].strip_suffix(']')?;
                let prefix = (open > 0).then(|| path[..open].to_string());
                let segments = if inner == "000000" || inner.is_empty() {
                    Vec::new()
                } else {
                    inner.split('.').map(str::to_string).collect()
                };
                if segments.iter().any(|s| s.is_empty()) {
                    return None;
                }
                PathData { prefix, segments }
            }
            ServerType::Mvs => {
                let inner = path.strip_prefix('\'')?.strip_suffix('\'')?;
                PathData {
                    prefix: None,
                    segments: inner
                        .split('.')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect(),
                }
            }
        };
        Some(Self {
            kind,
            data: Some(data),
        })
    }

    pub fn kind(&self) -> ServerType {
        self.kind
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_none()
    }

    pub fn segment_count(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.segments.len())
    }

    pub fn get_path(&self) -> String {
        let Some(data) = &self.data else {
            return String::new();
        };
        match self.kind {
            ServerType::Dos => {
                let prefix = data.prefix.as_deref().unwrap_or("");
                format!("{}\\{}", prefix, data.segments.join("\\"))
            }
            ServerType::Vms => {
                let prefix = data.prefix.as_deref().unwrap_or("");
                if data.segments.is_empty() {
                    format!("{}[000000]", prefix)
                } else {
                    format!("{}[{}]", prefix, data.segments.join("."))
                }
            }
            ServerType::Mvs => format!("'{}'", data.segments.join(".")),
            _ => format!("/{}", data.segments.join("/")),
        }
    }

    /// Full remote name of `file` inside this directory. With `omit_path`
    /// the bare name is returned, for commands issued from inside the
    /// directory itself.
    pub fn format_filename(&self, file: &str, omit_path: bool) -> String {
        if omit_path || self.data.is_none() {
            return file.to_string();
        }
        let Some(data) = &self.data else {
            return file.to_string();
        };
        match self.kind {
            ServerType::Dos => {
                let dir = self.get_path();
                if dir.ends_with('\\') {
                    format!("{}{}", dir, file)
                } else {
                    format!("{}\\{}", dir, file)
                }
            }
            ServerType::Vms => format!("{}{}", self.get_path(), file),
            ServerType::Mvs => {
                if data.segments.is_empty() {
                    format!("'{}'", file)
                } else {
                    format!("'{}.{}'", data.segments.join("."), file)
                }
            }
            _ => {
                if data.segments.is_empty() {
                    format!("/{}", file)
                } else {
                    format!("{}/{}", self.get_path(), file)
                }
            }
        }
    }

    /// Argument for a relative `CWD` into `subdir`.
    pub fn format_subdir(&self, subdir: &str) -> String {
        match self.kind {
            ServerType::Vms => format!("[.{}]", subdir),
            _ => subdir.to_string(),
        }
    }

    pub fn has_parent(&self) -> bool {
        match (&self.data, self.kind) {
            (None, _) => false,
            (Some(d), ServerType::Mvs) => d.segments.len() > 1,
            (Some(d), _) => !d.segments.is_empty(),
        }
    }

    pub fn parent(&self) -> Option<ServerPath> {
        if !self.has_parent() {
            return None;
        }
        let mut parent = self.clone();
        if let Some(d) = parent.data.as_mut() {
            d.segments.pop();
        }
        Some(parent)
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.segments.last())
            .map(String::as_str)
    }

    pub fn add_segment(&mut self, segment: &str) -> bool {
        if segment.is_empty() || segment.contains(self.separator()) {
            return false;
        }
        match self.data.as_mut() {
            Some(d) => {
                d.segments.push(segment.to_string());
                true
            }
            None => false,
        }
    }

    pub fn with_segment(&self, segment: &str) -> Option<ServerPath> {
        let mut path = self.clone();
        path.add_segment(segment).then_some(path)
    }

    fn separator(&self) -> char {
        match self.kind {
            ServerType::Dos => '\\',
            ServerType::Vms | ServerType::Mvs => '.',
            _ => '/',
        }
    }

    fn is_absolute_in_dialect(&self, subdir: &str) -> bool {
        match self.kind {
            ServerType::Dos => {
                let b = subdir.as_bytes();
                b.len() >= 2 && b[0].is_ascii_alphabetic() && b[1] == b':'
            }
            ServerType::Vms => subdir.contains('[') && !subdir.starts_with("[."),
            ServerType::Mvs => subdir.starts_with('\''),
            _ => subdir.starts_with('/'),
        }
    }

    /// Resolves `subdir` against this path, as a `CWD subdir` would.
    pub fn change_path(&self, subdir: &str) -> Option<ServerPath> {
        if subdir.is_empty() {
            return None;
        }
        if self.is_absolute_in_dialect(subdir) {
            return ServerPath::parse(subdir, self.kind);
        }
        let data = self.data.as_ref()?;
        let mut segments = data.segments.clone();
        let parts: Vec<&str> = match self.kind {
            ServerType::Vms => {
                let inner = subdir
                    .strip_prefix("[.")
                    .and_then(|s| s.strip_suffix(']'))
                    .unwrap_or(subdir);
                inner.split('.').collect()
            }
            ServerType::Mvs => subdir.split('.').collect(),
            ServerType::Dos => subdir.split(['/', '\\']).collect(),
            _ => subdir.split('/').collect(),
        };
        for part in parts {
            match part {
                "" | "." => {}
                ".." => {
                    segments.pop()?;
                }
                name => segments.push(name.to_string()),
            }
        }
        Some(ServerPath {
            kind: self.kind,
            data: Some(PathData {
                prefix: data.prefix.clone(),
                segments,
            }),
        })
    }

    fn same_root(&self, other: &ServerPath, cmp_no_case: bool) -> bool {
        let (Some(a), Some(b)) = (&self.data, &other.data) else {
            return false;
        };
        if self.kind != other.kind {
            return false;
        }
        match (&a.prefix, &b.prefix) {
            (None, None) => true,
            (Some(x), Some(y)) => eq_segment(x, y, cmp_no_case),
            _ => false,
        }
    }

    /// True if `child` lies strictly below this path.
    pub fn is_parent_of(&self, child: &ServerPath, cmp_no_case: bool) -> bool {
        if !self.same_root(child, cmp_no_case) {
            return false;
        }
        let (Some(a), Some(b)) = (&self.data, &child.data) else {
            return false;
        };
        b.segments.len() > a.segments.len()
            && a
                .segments
                .iter()
                .zip(&b.segments)
                .all(|(x, y)| eq_segment(x, y, cmp_no_case))
    }

    pub fn is_subdir_of(&self, parent: &ServerPath, cmp_no_case: bool) -> bool {
        parent.is_parent_of(self, cmp_no_case)
    }

    pub fn eq_no_case(&self, other: &ServerPath) -> bool {
        self.cmp_no_case(other) == Ordering::Equal
    }

    pub fn cmp_no_case(&self, other: &ServerPath) -> Ordering {
        self.cache_key().cmp(&other.cache_key())
    }

    /// Case-folded key used by the directory and path caches.
    pub fn cache_key(&self) -> String {
        self.get_path().to_lowercase()
    }
}

impl fmt::Display for ServerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.get_path())
    }
}

fn eq_segment(a: &str, b: &str, cmp_no_case: bool) -> bool {
    if cmp_no_case {
        a.to_lowercase() == b.to_lowercase()
    } else {
        a == b
    }
}

fn normalize<'a>(parts: impl Iterator<Item = &'a str>) -> Option<Vec<String>> {
    let mut segments = Vec::new();
    for part in parts {
        match part {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            name => segments.push(name.to_string()),
        }
    }
    Some(segments)
}
