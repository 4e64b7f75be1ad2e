//! Key extraction strategies.
//!
//! A key extractor derives the deterministic [`Key`] for a raw record. The
//! same input always yields the same key, including on redelivery — this is
//! the property the whole duplicate-detection scheme rests on.
//!
//! Two strategies are provided:
//!
//! - [`FieldKeyExtractor`]: business key built from selected JSON payload
//!   fields (e.g. creditor reference + invoice number)
//! - [`OffsetKeyExtractor`]: technical key from the pending record's stream
//!   coordinates; done records reference it through a configured payload field
//!
//! Extraction failure is a terminal per-record condition (`InvalidKey`
//! anomaly), never fatal to the partition.

use crate::key::Key;
use crate::record::{RawRecord, StreamKind};
use thiserror::Error;

/// Errors that can occur during key extraction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    /// The record does not yield a usable key.
    ///
    /// Raised when the payload is not parseable or a required field is
    /// absent or empty. The ingester records an `InvalidKey` anomaly for the
    /// record and moves on.
    #[error("Invalid key: {reason}")]
    InvalidKey {
        /// Why extraction failed.
        reason: String,
    },
}

impl ExtractError {
    fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            reason: reason.into(),
        }
    }
}

/// Derives a deterministic key from a raw record.
///
/// # Purity
///
/// Implementations must be pure: no side effects, no state, and the same
/// `(record, kind)` input must always yield the same key. Replayed records
/// must extract to the same key as their original delivery.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; extractors are shared by the
/// per-partition workers without synchronization.
pub trait KeyExtractor: Send + Sync {
    /// Extract the key for a record from the given stream.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::InvalidKey`] when the record cannot yield a
    /// key (unparseable payload, missing or empty required field).
    fn extract(&self, record: &RawRecord, kind: StreamKind) -> Result<Key, ExtractError>;
}

/// Business-key extractor: joins selected JSON payload fields.
///
/// The payload is parsed as a JSON object and the configured fields are read
/// in order and joined with the separator. Both streams are expected to carry
/// the same business identifier fields.
///
/// # Examples
///
/// ```
/// use settlematch_core::extract::{FieldKeyExtractor, KeyExtractor};
/// use settlematch_core::key::{Key, PartitionId};
/// use settlematch_core::record::{Offset, RawRecord, StreamKind};
///
/// let extractor = FieldKeyExtractor::new(vec!["debtor".into(), "reference".into()]);
/// let record = RawRecord::new(
///     PartitionId::new(0),
///     Offset::new(0),
///     br#"{"debtor":"ACME","reference":"INV-17","amount":100}"#.to_vec(),
/// );
///
/// let key = extractor.extract(&record, StreamKind::Pending).unwrap();
/// assert_eq!(key, Key::new("ACME/INV-17"));
/// ```
#[derive(Debug, Clone)]
pub struct FieldKeyExtractor {
    fields: Vec<String>,
    separator: String,
}

impl FieldKeyExtractor {
    /// Default separator between field values.
    pub const DEFAULT_SEPARATOR: &'static str = "/";

    /// Create an extractor over the given payload fields with the default
    /// separator.
    #[must_use]
    pub fn new(fields: Vec<String>) -> Self {
        Self {
            fields,
            separator: Self::DEFAULT_SEPARATOR.to_string(),
        }
    }

    /// Create an extractor with an explicit separator.
    #[must_use]
    pub const fn with_separator(fields: Vec<String>, separator: String) -> Self {
        Self { fields, separator }
    }

    fn field_value(payload: &serde_json::Value, field: &str) -> Result<String, ExtractError> {
        let value = payload
            .get(field)
            .ok_or_else(|| ExtractError::invalid(format!("missing field '{field}'")))?;

        let text = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => {
                return Err(ExtractError::invalid(format!(
                    "field '{field}' is not a string or number"
                )));
            }
        };

        if text.is_empty() {
            return Err(ExtractError::invalid(format!("field '{field}' is empty")));
        }
        Ok(text)
    }
}

impl KeyExtractor for FieldKeyExtractor {
    fn extract(&self, record: &RawRecord, _kind: StreamKind) -> Result<Key, ExtractError> {
        if self.fields.is_empty() {
            return Err(ExtractError::invalid("no key fields configured"));
        }

        let payload: serde_json::Value = serde_json::from_slice(&record.payload)
            .map_err(|e| ExtractError::invalid(format!("payload is not JSON: {e}")))?;

        let parts = self
            .fields
            .iter()
            .map(|field| Self::field_value(&payload, field))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Key::new(parts.join(&self.separator)))
    }
}

/// Technical-key extractor: pending records are keyed by their own stream
/// coordinates; done records must name those coordinates in a reference
/// field.
///
/// A pending record delivered at partition 3, offset 48211 gets the key
/// `"3:48211"`. The matching done record must carry that string in the
/// configured reference field of its JSON payload.
#[derive(Debug, Clone)]
pub struct OffsetKeyExtractor {
    reference_field: String,
}

impl OffsetKeyExtractor {
    /// Create an extractor reading `reference_field` from done payloads.
    #[must_use]
    pub const fn new(reference_field: String) -> Self {
        Self { reference_field }
    }
}

impl KeyExtractor for OffsetKeyExtractor {
    fn extract(&self, record: &RawRecord, kind: StreamKind) -> Result<Key, ExtractError> {
        match kind {
            StreamKind::Pending => Ok(Key::new(format!(
                "{}:{}",
                record.partition.value(),
                record.offset.value()
            ))),
            StreamKind::Done => {
                let payload: serde_json::Value = serde_json::from_slice(&record.payload)
                    .map_err(|e| ExtractError::invalid(format!("payload is not JSON: {e}")))?;

                let reference = payload
                    .get(&self.reference_field)
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| {
                        ExtractError::invalid(format!(
                            "missing reference field '{}'",
                            self.reference_field
                        ))
                    })?;

                if reference.is_empty() {
                    return Err(ExtractError::invalid(format!(
                        "reference field '{}' is empty",
                        self.reference_field
                    )));
                }
                Ok(Key::new(reference))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use crate::key::PartitionId;
    use crate::record::Offset;

    fn record(payload: &[u8]) -> RawRecord {
        RawRecord::new(PartitionId::new(2), Offset::new(10), payload.to_vec())
    }

    mod field_extractor {
        use super::*;

        #[test]
        fn joins_fields_in_order() {
            let extractor = FieldKeyExtractor::new(vec!["a".into(), "b".into()]);
            let rec = record(br#"{"b":"second","a":"first"}"#);

            let key = extractor.extract(&rec, StreamKind::Pending).unwrap();
            assert_eq!(key, Key::new("first/second"));
        }

        #[test]
        fn numeric_fields_are_accepted() {
            let extractor = FieldKeyExtractor::new(vec!["id".into()]);
            let rec = record(br#"{"id":42}"#);

            let key = extractor.extract(&rec, StreamKind::Done).unwrap();
            assert_eq!(key, Key::new("42"));
        }

        #[test]
        fn deterministic_across_calls() {
            let extractor = FieldKeyExtractor::new(vec!["ref".into()]);
            let rec = record(br#"{"ref":"INV-17"}"#);

            let k1 = extractor.extract(&rec, StreamKind::Pending).unwrap();
            let k2 = extractor.extract(&rec, StreamKind::Pending).unwrap();
            assert_eq!(k1, k2);
        }

        #[test]
        fn missing_field_fails() {
            let extractor = FieldKeyExtractor::new(vec!["ref".into()]);
            let rec = record(br#"{"other":"x"}"#);

            let err = extractor.extract(&rec, StreamKind::Pending).unwrap_err();
            assert!(matches!(err, ExtractError::InvalidKey { .. }));
        }

        #[test]
        fn empty_field_fails() {
            let extractor = FieldKeyExtractor::new(vec!["ref".into()]);
            let rec = record(br#"{"ref":""}"#);

            assert!(extractor.extract(&rec, StreamKind::Pending).is_err());
        }

        #[test]
        fn non_json_payload_fails() {
            let extractor = FieldKeyExtractor::new(vec!["ref".into()]);
            let rec = record(b"not json at all");

            assert!(extractor.extract(&rec, StreamKind::Pending).is_err());
        }

        #[test]
        fn custom_separator() {
            let extractor =
                FieldKeyExtractor::with_separator(vec!["a".into(), "b".into()], "#".into());
            let rec = record(br#"{"a":"x","b":"y"}"#);

            let key = extractor.extract(&rec, StreamKind::Pending).unwrap();
            assert_eq!(key, Key::new("x#y"));
        }
    }

    mod offset_extractor {
        use super::*;

        #[test]
        fn pending_keyed_by_coordinates() {
            let extractor = OffsetKeyExtractor::new("settles".into());
            let rec = record(b"opaque");

            let key = extractor.extract(&rec, StreamKind::Pending).unwrap();
            assert_eq!(key, Key::new("2:10"));
        }

        #[test]
        fn done_reads_reference_field() {
            let extractor = OffsetKeyExtractor::new("settles".into());
            let rec = record(br#"{"settles":"2:10"}"#);

            let key = extractor.extract(&rec, StreamKind::Done).unwrap();
            assert_eq!(key, Key::new("2:10"));
        }

        #[test]
        fn done_missing_reference_fails() {
            let extractor = OffsetKeyExtractor::new("settles".into());
            let rec = record(br#"{"other":"x"}"#);

            assert!(extractor.extract(&rec, StreamKind::Done).is_err());
        }

        #[test]
        fn done_empty_reference_fails() {
            let extractor = OffsetKeyExtractor::new("settles".into());
            let rec = record(br#"{"settles":""}"#);

            assert!(extractor.extract(&rec, StreamKind::Done).is_err());
        }
    }
}
