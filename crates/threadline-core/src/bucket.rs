//! Time buckets.
//!
//! A bucket is `floor(ms_since_custom_epoch / bucket_size_ms)`. Buckets are
//! never stored on their own; they only partition message storage so that a
//! history scan touches a bounded range.

use crate::clock::{system_clock, SharedClock};
use crate::message::MessageId;
use crate::snowflake::{timestamp_of, IdGenerator};
use std::ops::RangeInclusive;
use thiserror::Error;

/// A bucket number.
pub type Bucket = i64;

/// Ten days.
pub const DEFAULT_BUCKET_SIZE_MS: i64 = 10 * 24 * 60 * 60 * 1000;

/// Invalid sizing passed at construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    /// Bucket size is zero or negative.
    #[error("Bucket size must be positive, got {0} ms")]
    InvalidBucketSize(i64),

    /// Page size is zero.
    #[error("Page size must be positive")]
    InvalidPageSize,
}

/// Maps ids and timestamps to buckets.
#[derive(Debug, Clone)]
pub struct BucketIndex {
    bucket_size_ms: i64,
    epoch_millis: i64,
    clock: SharedClock,
}

impl BucketIndex {
    /// Create an index for buckets of `bucket_size_ms` relative to
    /// `epoch_millis` (Unix ms).
    ///
    /// # Errors
    ///
    /// Returns an error if `bucket_size_ms` is not positive.
    pub fn new(bucket_size_ms: i64, epoch_millis: u64) -> Result<Self, ConfigurationError> {
        if bucket_size_ms <= 0 {
            return Err(ConfigurationError::InvalidBucketSize(bucket_size_ms));
        }
        Ok(Self {
            bucket_size_ms,
            epoch_millis: epoch_millis as i64,
            clock: system_clock(),
        })
    }

    /// Create an index sharing the generator's epoch.
    ///
    /// # Errors
    ///
    /// Returns an error if `bucket_size_ms` is not positive.
    pub fn for_generator(
        generator: &IdGenerator,
        bucket_size_ms: i64,
    ) -> Result<Self, ConfigurationError> {
        Self::new(bucket_size_ms, generator.epoch_millis())
    }

    /// Read "now" from `clock` instead of the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Bucket width in milliseconds.
    #[must_use]
    pub fn bucket_size_ms(&self) -> i64 {
        self.bucket_size_ms
    }

    /// The custom epoch in Unix milliseconds.
    #[must_use]
    pub fn epoch_millis(&self) -> u64 {
        self.epoch_millis as u64
    }

    /// Bucket holding the message with this id.
    #[must_use]
    pub fn bucket_for_id(&self, id: MessageId) -> Bucket {
        self.bucket_for_timestamp(timestamp_of(id) as i64)
    }

    /// Bucket for a timestamp already relative to the custom epoch.
    #[must_use]
    pub fn bucket_for_timestamp(&self, timestamp_ms: i64) -> Bucket {
        timestamp_ms.div_euclid(self.bucket_size_ms)
    }

    /// Bucket for the current time.
    #[must_use]
    pub fn bucket_for_now(&self) -> Bucket {
        self.bucket_for_timestamp(self.adjust_to_epoch(self.clock.now_millis()))
    }

    /// Convert Unix milliseconds to milliseconds since the custom epoch.
    #[must_use]
    pub fn adjust_to_epoch(&self, unix_millis: u64) -> i64 {
        unix_millis as i64 - self.epoch_millis
    }

    /// Every bucket from the one holding `start_id` to the one holding
    /// `end_id`, inclusive and ascending.
    #[must_use]
    pub fn buckets_between(
        &self,
        start_id: MessageId,
        end_id: MessageId,
    ) -> RangeInclusive<Bucket> {
        self.bucket_for_id(start_id)..=self.bucket_for_id(end_id)
    }

    /// Buckets from the one holding `timestamp_ms` (relative to the custom
    /// epoch) through `last_bucket`, ascending. Empty when the first bucket is
    /// already past `last_bucket`.
    #[must_use]
    pub fn buckets_from_timestamp_through(
        &self,
        timestamp_ms: i64,
        last_bucket: Bucket,
    ) -> RangeInclusive<Bucket> {
        self.bucket_for_timestamp(timestamp_ms)..=last_bucket
    }
}
