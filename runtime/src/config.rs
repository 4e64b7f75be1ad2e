//! Runtime configuration surface.
//!
//! Configuration is values, not mechanism: which key strategy to use, how
//! many partitions, how hard to retry a done record with no matching
//! pending, and what to do when that budget runs out. Loading these values
//! from files or flags is the embedding application's concern.

use crate::retry::RetryPolicy;
use settlematch_core::extract::{FieldKeyExtractor, KeyExtractor, OffsetKeyExtractor};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while validating a configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Partition count must be non-zero.
    #[error("Partition count must be non-zero")]
    ZeroPartitions,

    /// The field strategy needs at least one field.
    #[error("Field key strategy requires at least one field")]
    NoKeyFields,

    /// The offset strategy needs a reference field for done records.
    #[error("Offset key strategy requires a non-empty reference field")]
    EmptyReferenceField,
}

/// Which key-extraction strategy the ingesters use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStrategy {
    /// Business key from selected JSON payload fields.
    Fields {
        /// Field names read in order.
        fields: Vec<String>,
        /// Separator joining the field values.
        separator: String,
    },
    /// Technical key from the pending record's stream coordinates; done
    /// records name the key in `reference_field`.
    StreamOffset {
        /// JSON field of done payloads carrying the referenced key.
        reference_field: String,
    },
}

impl KeyStrategy {
    /// Business-key strategy with the default separator.
    #[must_use]
    pub fn fields(fields: Vec<String>) -> Self {
        Self::Fields {
            fields,
            separator: FieldKeyExtractor::DEFAULT_SEPARATOR.to_string(),
        }
    }

    /// Build the extractor this strategy describes.
    #[must_use]
    pub fn build(&self) -> Arc<dyn KeyExtractor> {
        match self {
            Self::Fields { fields, separator } => Arc::new(FieldKeyExtractor::with_separator(
                fields.clone(),
                separator.clone(),
            )),
            Self::StreamOffset { reference_field } => {
                Arc::new(OffsetKeyExtractor::new(reference_field.clone()))
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Fields { fields, .. } if fields.is_empty() => Err(ConfigError::NoKeyFields),
            Self::StreamOffset { reference_field } if reference_field.is_empty() => {
                Err(ConfigError::EmptyReferenceField)
            }
            _ => Ok(()),
        }
    }
}

/// What to do with a done record whose retry budget is exhausted.
///
/// The choice trades partition liveness against at-least-once redelivery:
/// acknowledging keeps the cursor moving but relies on the quarantine copy
/// alone; withholding keeps the stream's redelivery guarantee but holds the
/// cursor back until the record is replayed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ExhaustionPolicy {
    /// Quarantine the record and acknowledge it (partition keeps moving).
    #[default]
    QuarantineAndAcknowledge,
    /// Quarantine the record and withhold acknowledgment (cursor blocked
    /// until `replay` resolves it).
    QuarantineAndWithhold,
}

/// Configuration for the ingestion runtime.
///
/// # Examples
///
/// ```
/// use settlematch_runtime::config::{ExhaustionPolicy, IngestConfig, KeyStrategy};
///
/// let config = IngestConfig::builder()
///     .partitions(8)
///     .key_strategy(KeyStrategy::fields(vec!["debtor".into(), "reference".into()]))
///     .exhaustion_policy(ExhaustionPolicy::QuarantineAndAcknowledge)
///     .build()
///     .unwrap();
///
/// assert_eq!(config.partitions, 8);
/// ```
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Number of partitions keys are routed over.
    pub partitions: u32,
    /// Key-extraction strategy.
    pub key_strategy: KeyStrategy,
    /// Backoff schedule and attempt limit for missing-input retries.
    pub retry: RetryPolicy,
    /// Policy applied when the retry budget is exhausted.
    pub exhaustion: ExhaustionPolicy,
    /// How long the run loop sleeps when both streams are drained and no
    /// retry is due.
    pub idle_backoff: Duration,
    /// How long the run loop waits before re-driving a record after the
    /// store reported itself unavailable.
    pub store_backoff: Duration,
}

impl IngestConfig {
    /// Create a new config builder.
    #[must_use]
    pub fn builder() -> IngestConfigBuilder {
        IngestConfigBuilder::default()
    }
}

/// Builder for [`IngestConfig`].
#[derive(Debug, Clone)]
pub struct IngestConfigBuilder {
    partitions: u32,
    key_strategy: KeyStrategy,
    retry: RetryPolicy,
    exhaustion: ExhaustionPolicy,
    idle_backoff: Duration,
    store_backoff: Duration,
}

impl Default for IngestConfigBuilder {
    fn default() -> Self {
        Self {
            partitions: 1,
            key_strategy: KeyStrategy::fields(vec!["reference".to_string()]),
            retry: RetryPolicy::default(),
            exhaustion: ExhaustionPolicy::default(),
            idle_backoff: Duration::from_millis(50),
            store_backoff: Duration::from_millis(500),
        }
    }
}

impl IngestConfigBuilder {
    /// Set the partition count.
    #[must_use]
    pub const fn partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    /// Set the key-extraction strategy.
    #[must_use]
    pub fn key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.key_strategy = strategy;
        self
    }

    /// Set the retry policy for missing-input retries.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the exhaustion policy.
    #[must_use]
    pub const fn exhaustion_policy(mut self, policy: ExhaustionPolicy) -> Self {
        self.exhaustion = policy;
        self
    }

    /// Set the idle backoff of the run loop.
    #[must_use]
    pub const fn idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    /// Set the pause applied when the store is unavailable.
    #[must_use]
    pub const fn store_backoff(mut self, backoff: Duration) -> Self {
        self.store_backoff = backoff;
        self
    }

    /// Validate and build the [`IngestConfig`].
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the partition count is zero or the key
    /// strategy is degenerate.
    pub fn build(self) -> Result<IngestConfig, ConfigError> {
        if self.partitions == 0 {
            return Err(ConfigError::ZeroPartitions);
        }
        self.key_strategy.validate()?;

        Ok(IngestConfig {
            partitions: self.partitions,
            key_strategy: self.key_strategy,
            retry: self.retry,
            exhaustion: self.exhaustion,
            idle_backoff: self.idle_backoff,
            store_backoff: self.store_backoff,
        })
    }
}
