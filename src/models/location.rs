//! Destination locations of the form `sj://<bucket>[/<key>]`.

use std::{fmt, str::FromStr};
use thiserror::Error;

/// Scheme prefix accepted for destination identifiers.
pub const SCHEME: &str = "sj://";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid remote location `{0}`: expected `{SCHEME}<bucket>[/<key>]`")]
    InvalidScheme(String),
    #[error("invalid path: empty bucket in path")]
    EmptyBucket,
}

/// A validated (bucket, key) pair.
///
/// `bucket` is never empty. An empty `key` asks the store to pick its
/// default object name for the bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    bucket: String,
    key: String,
}

impl Location {
    /// Parse a raw destination identifier.
    ///
    /// Bytes after the first `/` are passed through untouched: no
    /// percent-decoding, no case folding.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let rest = raw
            .strip_prefix(SCHEME)
            .ok_or_else(|| ParseError::InvalidScheme(raw.to_string()))?;

        if rest.is_empty() {
            return Err(ParseError::EmptyBucket);
        }

        match rest.find('/') {
            None => Ok(Self {
                bucket: rest.to_string(),
                key: String::new(),
            }),
            // `sj:///key` has nothing before the separator
            Some(0) => Err(ParseError::EmptyBucket),
            Some(idx) => Ok(Self {
                bucket: rest[..idx].to_string(),
                key: rest[idx + 1..].to_string(),
            }),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl FromStr for Location {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            write!(f, "{}{}", SCHEME, self.bucket)
        } else {
            write!(f, "{}{}/{}", SCHEME, self.bucket, self.key)
        }
    }
}
