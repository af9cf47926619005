//! Version strings, filters and ordering.
//!
//! A version is one or more dot-separated runs of ASCII digits (`1`, `1.4.2`).
//! Anything else found in the registry is ignored.

use std::cmp::Ordering;

use serde::Deserialize;
use serde::Serialize;

pub fn is_valid_version(version: &str) -> bool {
    !version.is_empty()
        && version
            .split('.')
            .all(|seg| !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_digit()))
}

/// Which registered versions may serve a call.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum VersionFilter {
    #[default]
    Any,
    Exact(String),
    /// Segment-wise prefix: `1` matches `1` and `1.4.2` but not `10.0`.
    Prefix(String),
}

impl VersionFilter {
    pub fn matches(&self, version: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(v) => v == version,
            Self::Prefix(prefix) => {
                let mut have = version.split('.');
                prefix.split('.').all(|want| have.next() == Some(want))
            }
        }
    }
}

/// How versions are compared when picking the latest.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionOrder {
    /// Numeric, segment by segment: `10.0.0` > `2.0.0`.
    Semantic,
    /// Plain string order: `2.0.0` > `10.0.0`.
    #[default]
    Lexicographic,
}

impl VersionOrder {
    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        match self {
            Self::Lexicographic => a.cmp(b),
            Self::Semantic => {
                let mut left = a.split('.');
                let mut right = b.split('.');
                loop {
                    match (left.next(), right.next()) {
                        (Some(x), Some(y)) => match compare_digits(x, y) {
                            Ordering::Equal => continue,
                            unequal => return unequal,
                        },
                        (Some(_), None) => return Ordering::Greater,
                        (None, Some(_)) => return Ordering::Less,
                        (None, None) => return a.cmp(b),
                    }
                }
            }
        }
    }

    /// The greatest valid version accepted by `filter`.
    pub fn latest<'a, I>(&self, versions: I, filter: &VersionFilter) -> Option<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        versions
            .into_iter()
            .filter(|v| is_valid_version(v) && filter.matches(v))
            .max_by(|a, b| self.compare(a, b))
    }
}

/// Compares two runs of digits as numbers of any width.
fn compare_digits(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

impl std::str::FromStr for VersionOrder {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "semantic" => Ok(Self::Semantic),
            "lexicographic" => Ok(Self::Lexicographic),
            other => Err(format!("unknown version order '{}'", other)),
        }
    }
}
