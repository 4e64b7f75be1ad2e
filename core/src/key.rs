//! Key and partition identification types.
//!
//! This module defines strong types for match keys (`Key`) and partition
//! identifiers (`PartitionId`) used throughout the matching engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `Key` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid key: {0}")]
pub struct ParseKeyError(String);

/// Deterministic identifier for one logical payment.
///
/// A key uniquely identifies a logical payment within its partition. The same
/// raw record always yields the same key, including on redelivery, which is
/// what makes duplicate detection possible. For example:
/// - `"INV-2024-00017"` (business key from payload fields)
/// - `"3:48211"` (technical key from stream coordinates)
///
/// # Design
///
/// `Key` is a newtype wrapper around `String` that provides:
/// - Type safety (can't accidentally use a regular string)
/// - Clear intent in function signatures
/// - Serialization support for storage
///
/// # Validation
///
/// - `FromStr::from_str()`: Validates input (rejects empty strings)
/// - `From::from()` and `new()`: No validation (for internal use with trusted input)
///
/// Use `FromStr` when parsing external input. Use `new()` or `From` when
/// constructing keys from extractor-controlled data.
///
/// # Examples
///
/// ```
/// use settlematch_core::key::Key;
///
/// let key = Key::new("INV-2024-00017");
/// assert_eq!(key.as_str(), "INV-2024-00017");
///
/// let parsed: Key = "INV-2024-00018".parse().unwrap();
/// assert_eq!(parsed, Key::new("INV-2024-00018"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key(String);

impl Key {
    /// Create a new `Key` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the key as raw bytes, as fed to the partition router.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Convert the `Key` into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Key {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseKeyError("Key cannot be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Index of the partition that owns a key.
///
/// Partition assignment is a pure function of key bytes (see
/// [`crate::route::PartitionRouter`]), so the same key always lands on the
/// same partition across both streams and across restarts.
///
/// # Examples
///
/// ```
/// use settlematch_core::key::PartitionId;
///
/// let p = PartitionId::new(3);
/// assert_eq!(p.value(), 3);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(u32);

impl PartitionId {
    /// Create a new `PartitionId` with the given index.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Get the partition index.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PartitionId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<PartitionId> for u32 {
    fn from(id: PartitionId) -> Self {
        id.0
    }
}
