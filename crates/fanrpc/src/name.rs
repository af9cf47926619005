//! Hierarchical service names.

use crate::Error;
use crate::Result;

/// A dotted service name such as `billing.invoices`.
///
/// Names are the discovery key, so empty names and empty segments are rejected
/// up front.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServiceName {
    segments: Vec<String>,
}

impl ServiceName {
    pub fn parse(name: &str) -> Result<Self> {
        Self::from_segments(name.split('.'))
    }

    pub fn from_segments<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() || segments.iter().any(|s| s.is_empty() || s.contains('/')) {
            return Err(Error::InvalidName(segments.join(".")));
        }
        Ok(Self { segments })
    }

    /// Splits `a.b.method` into the service `a.b` and the method name.
    pub fn split_method(path: &str) -> Result<(Self, String)> {
        match path.rsplit_once('.') {
            Some((service, method)) if !method.is_empty() => Ok((Self::parse(service)?, method.to_string())),
            _ => Err(Error::InvalidName(path.to_string())),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The name as a store path relative to a registry root: `a/b`.
    pub fn as_path(&self) -> String {
        self.segments.join("/")
    }
}

impl std::fmt::Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl std::str::FromStr for ServiceName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
