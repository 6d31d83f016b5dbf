//! Partition keys with a canonical, path-safe encoding.
//!
//! A partition key is an ordered list of `key=value` dimensions rendered as
//! path segments, the layout export consumers use for partition pruning:
//!
//! ```text
//! GRAMMAR:
//!   PARTITION_PATH ::= dimension ("/" dimension)*
//!   dimension      ::= key "=" value
//!   key            ::= [a-z][a-z0-9_]*
//!   value          ::= [A-Za-z0-9_.:-]+
//! ```
//!
//! Dimension order is significant and preserved. The well-known layouts are
//! built by [`PartitionKey::hourly`] (landing tier), [`PartitionKey::monthly`]
//! (encounter facts and marts) and [`PartitionKey::unpartitioned`]
//! (dimension entities).
//!
//! # Examples
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use strata_core::partition::PartitionKey;
//!
//! let ts = Utc.with_ymd_and_hms(2025, 1, 15, 5, 30, 0).unwrap();
//! assert_eq!(PartitionKey::hourly(ts).to_string(), "date=2025-01-15/hour=05");
//! assert_eq!(PartitionKey::monthly(ts).to_string(), "month=2025-01");
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Multi-dimensional partition key with a deterministic path form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartitionKey(Vec<(String, String)>);

impl PartitionKey {
    /// Creates a new empty partition key.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a dimension, validating key and value.
    ///
    /// # Errors
    ///
    /// Returns an error if the key or value contains characters outside the
    /// canonical grammar, or if the key is already present.
    pub fn with(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, PartitionKeyParseError> {
        let key = key.into();
        let value = value.into();
        validate_key(&key)?;
        validate_value(&value)?;
        if self.get(&key).is_some() {
            return Err(PartitionKeyParseError::DuplicateKey(key));
        }
        self.0.push((key, value));
        Ok(self)
    }

    /// Landing-tier partition for an arrival timestamp: `date=YYYY-MM-DD/hour=HH`.
    #[must_use]
    pub fn hourly(ts: DateTime<Utc>) -> Self {
        Self(vec![
            ("date".to_string(), ts.format("%Y-%m-%d").to_string()),
            ("hour".to_string(), ts.format("%H").to_string()),
        ])
    }

    /// Month partition for facts and marts: `month=YYYY-MM`.
    #[must_use]
    pub fn monthly(ts: DateTime<Utc>) -> Self {
        Self(vec![("month".to_string(), ts.format("%Y-%m").to_string())])
    }

    /// Single partition used by small dimension entities: `bucket=all`.
    #[must_use]
    pub fn unpartitioned() -> Self {
        Self(vec![("bucket".to_string(), "all".to_string())])
    }

    /// Gets a dimension value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns true if the partition key has no dimensions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns an iterator over dimensions in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the start of the hour for an hourly partition.
    ///
    /// Returns `None` for keys without `date` and `hour` dimensions.
    #[must_use]
    pub fn hour_start(&self) -> Option<DateTime<Utc>> {
        let date = NaiveDate::parse_from_str(self.get("date")?, "%Y-%m-%d").ok()?;
        let hour: u32 = self.get("hour")?.parse().ok()?;
        let naive = date.and_hms_opt(hour, 0, 0)?;
        Some(Utc.from_utc_datetime(&naive))
    }

    /// Parses the path form back into a `PartitionKey`.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is malformed.
    pub fn parse(s: &str) -> Result<Self, PartitionKeyParseError> {
        let mut pk = Self::new();
        if s.is_empty() {
            return Ok(pk);
        }
        for segment in s.split('/') {
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| PartitionKeyParseError::MissingEquals(segment.to_string()))?;
            pk = pk.with(key, value)?;
        }
        Ok(pk)
    }
}

fn validate_key(key: &str) -> Result<(), PartitionKeyParseError> {
    let valid = key.chars().next().is_some_and(|c| c.is_ascii_lowercase())
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(PartitionKeyParseError::InvalidKey(key.to_string()))
    }
}

fn validate_value(value: &str) -> Result<(), PartitionKeyParseError> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'));
    if valid {
        Ok(())
    } else {
        Err(PartitionKeyParseError::InvalidValue(value.to_string()))
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

impl FromStr for PartitionKey {
    type Err = PartitionKeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PartitionKey {
    type Error = PartitionKeyParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PartitionKey> for String {
    fn from(value: PartitionKey) -> Self {
        value.to_string()
    }
}

/// Errors from parsing or building partition keys.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionKeyParseError {
    /// A segment had no `=` separator.
    #[error("missing '=' in partition segment: {0}")]
    MissingEquals(String),
    /// Dimension key is not `[a-z][a-z0-9_]*`.
    #[error("invalid partition key name: {0}")]
    InvalidKey(String),
    /// Dimension value is empty or has path-unsafe characters.
    #[error("invalid partition value: {0}")]
    InvalidValue(String),
    /// The same dimension appeared twice.
    #[error("duplicate partition dimension: {0}")]
    DuplicateKey(String),
}
