//! Hostname patterns with `*` wildcards
//!
//! A pattern is either a literal hostname or a hostname containing one or
//! more `*`. Each `*` matches any substring (including the empty one) and
//! every other character is compared literally, so dots, dashes and any
//! regex metacharacters carry no special meaning. Matches are anchored to
//! the whole hostname and are case-sensitive.

use std::fmt;

/// A hostname pattern, split into literal segments once at construction
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPattern {
    raw: String,
    /// Literal pieces between `*`s; `None` for patterns without a wildcard
    segments: Option<Vec<String>>,
}

impl HostPattern {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let segments = if raw.contains('*') {
            Some(raw.split('*').map(str::to_string).collect())
        } else {
            None
        };
        Self { raw, segments }
    }

    /// The pattern exactly as it was declared
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_wildcard(&self) -> bool {
        self.segments.is_some()
    }

    /// Literal, whole-string equality
    pub fn matches_exact(&self, hostname: &str) -> bool {
        self.raw == hostname
    }

    /// Wildcard match; always false for patterns without `*`
    pub fn matches_wildcard(&self, hostname: &str) -> bool {
        match &self.segments {
            Some(segments) => glob_match(segments, hostname),
            None => false,
        }
    }

    /// Exact or wildcard match
    pub fn matches(&self, hostname: &str) -> bool {
        self.matches_exact(hostname) || self.matches_wildcard(hostname)
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for HostPattern {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// `segments` always has at least two elements (one `*` splits in two).
fn glob_match(segments: &[String], hostname: &str) -> bool {
    let (first, rest) = match segments.split_first() {
        Some(split) => split,
        None => return false,
    };
    let (last, middle) = match rest.split_last() {
        Some(split) => split,
        None => return hostname == first,
    };

    // Prefix and suffix must not overlap
    if hostname.len() < first.len() + last.len() {
        return false;
    }
    let Some(remaining) = hostname.strip_prefix(first.as_str()) else {
        return false;
    };
    let Some(mut remaining) = remaining.strip_suffix(last.as_str()) else {
        return false;
    };

    // Leftmost placement of each middle segment leaves the most room for the next
    for segment in middle {
        match remaining.find(segment.as_str()) {
            Some(idx) => remaining = &remaining[idx + segment.len()..],
            None => return false,
        }
    }

    true
}
