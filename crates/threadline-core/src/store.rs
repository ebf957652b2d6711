//! Storage collaborators.
//!
//! The core never talks to a database directly. History reads go through
//! [`PaginatedMessageStore`], thread creation times through [`ThreadLookup`].
//! [`MemoryMessageStore`] is an in-process implementation used by the server
//! and in tests.

use crate::bucket::Bucket;
use crate::message::{MessageEvent, MessageId, ThreadId};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::trace;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The continuation cursor could not be understood.
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    /// The thread id does not carry a creation timestamp.
    #[error("Thread id {0} has no embedded timestamp")]
    NoEmbeddedTimestamp(ThreadId),

    /// The backing store failed.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// A stored message, as seen by one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Snowflake id.
    pub message_id: MessageId,
    /// Thread.
    pub thread_id: ThreadId,
    /// Bucket the record lives in.
    pub bucket: Bucket,
    /// Sender.
    pub author_id: String,
    /// Message text.
    pub body: String,
    /// Whether the owning user has read it.
    pub read: bool,
    /// Whether the message was edited.
    pub edited: bool,
    /// Whether the message was generated by the system.
    pub system_message: bool,
}

impl MessageRecord {
    /// Create an unread record.
    #[must_use]
    pub fn new(
        message_id: MessageId,
        thread_id: ThreadId,
        bucket: Bucket,
        author_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            thread_id,
            bucket,
            author_id: author_id.into(),
            body: body.into(),
            read: false,
            edited: false,
            system_message: false,
        }
    }

    /// Build the record a recipient stores for an event.
    #[must_use]
    pub fn from_event(event: &MessageEvent) -> Self {
        Self::new(
            event.message_id,
            event.thread_id,
            event.bucket,
            event.author_id.clone(),
            event.body.clone(),
        )
    }

    /// Set the read flag.
    #[must_use]
    pub fn with_read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }
}

/// Opaque continuation token for one bucket query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    /// Wrap a store-specific token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Cursor {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Cursor {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One page of a single bucket, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketPage {
    /// Records, newest first.
    pub records: Vec<MessageRecord>,
    /// Where to resume in the same bucket; `None` when exhausted.
    pub next_cursor: Option<Cursor>,
}

/// Bucket-partitioned message storage with cursor pagination.
#[async_trait]
pub trait PaginatedMessageStore: Send + Sync {
    /// Up to `limit` records of one bucket, newest first, resuming at `cursor`.
    async fn query_bucket(
        &self,
        user_id: &str,
        thread_id: ThreadId,
        bucket: Bucket,
        limit: usize,
        cursor: Option<&Cursor>,
    ) -> Result<BucketPage, StoreError>;

    /// Up to `limit` records of one bucket with ids strictly below `before_id`.
    async fn query_bucket_before(
        &self,
        user_id: &str,
        thread_id: ThreadId,
        bucket: Bucket,
        limit: usize,
        before_id: MessageId,
    ) -> Result<BucketPage, StoreError>;

    /// Flag a message as read for `user_id`.
    async fn mark_read(
        &self,
        user_id: &str,
        thread_id: ThreadId,
        bucket: Bucket,
        message_id: MessageId,
    ) -> Result<(), StoreError>;
}

/// Resolves a thread to its creation time.
#[async_trait]
pub trait ThreadLookup: Send + Sync {
    /// Creation time of the thread in Unix milliseconds.
    async fn created_at_unix_millis(&self, thread_id: ThreadId) -> Result<u64, StoreError>;
}

/// 100 ns ticks from the Gregorian calendar reform (1582-10-15) to 1970.
const GREGORIAN_UNIX_OFFSET_TICKS: u64 = 0x01B2_1DD2_1381_4000;

/// Raw 60-bit Gregorian timestamp of a v1 or v6 UUID.
fn gregorian_ticks(thread_id: ThreadId) -> Option<u64> {
    let bytes = thread_id.as_bytes();
    let field = |from: usize, to: usize| {
        bytes[from..to]
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    };
    let version_word = field(6, 8) & 0x0fff;
    match thread_id.get_version_num() {
        1 => Some((version_word << 48) | (field(4, 6) << 32) | field(0, 4)),
        6 => Some((field(0, 4) << 28) | (field(4, 6) << 12) | version_word),
        _ => None,
    }
}

/// Reads the creation time embedded in time-based thread UUIDs (v1, v6, v7).
///
/// Gregorian timestamps before the Unix epoch count as missing.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidThreadLookup;

#[async_trait]
impl ThreadLookup for UuidThreadLookup {
    async fn created_at_unix_millis(&self, thread_id: ThreadId) -> Result<u64, StoreError> {
        if gregorian_ticks(thread_id).is_some_and(|ticks| ticks < GREGORIAN_UNIX_OFFSET_TICKS) {
            return Err(StoreError::NoEmbeddedTimestamp(thread_id));
        }
        let timestamp = thread_id
            .get_timestamp()
            .ok_or(StoreError::NoEmbeddedTimestamp(thread_id))?;
        let (secs, nanos) = timestamp.to_unix();
        Ok(secs * 1_000 + u64::from(nanos) / 1_000_000)
    }
}

type PartitionKey = (String, ThreadId, Bucket);

/// In-memory [`PaginatedMessageStore`].
///
/// Each (user, thread, bucket) partition is kept sorted newest first; cursors
/// are offsets into the partition.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    partitions: DashMap<PartitionKey, Vec<MessageRecord>>,
}

impl MemoryMessageStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `record` for `user_id`, replacing a record with the same id.
    pub fn insert(&self, user_id: &str, record: MessageRecord) {
        let key = (user_id.to_string(), record.thread_id, record.bucket);
        let mut partition = self.partitions.entry(key).or_default();
        match partition.binary_search_by(|r| record.message_id.cmp(&r.message_id)) {
            Ok(pos) => partition[pos] = record,
            Err(pos) => partition.insert(pos, record),
        }
    }

    /// Number of records stored for (user, thread, bucket).
    #[must_use]
    pub fn partition_len(&self, user_id: &str, thread_id: ThreadId, bucket: Bucket) -> usize {
        self.partitions
            .get(&(user_id.to_string(), thread_id, bucket))
            .map(|p| p.len())
            .unwrap_or(0)
    }

    fn page_from(
        &self,
        user_id: &str,
        thread_id: ThreadId,
        bucket: Bucket,
        limit: usize,
        offset: impl FnOnce(&[MessageRecord]) -> usize,
    ) -> BucketPage {
        let Some(partition) = self.partitions.get(&(user_id.to_string(), thread_id, bucket)) else {
            return BucketPage::default();
        };

        let start = offset(&partition).min(partition.len());
        let end = start.saturating_add(limit).min(partition.len());
        let records = partition[start..end].to_vec();
        let next_cursor = (end < partition.len()).then(|| Cursor::new(end.to_string()));

        trace!(
            user = %user_id,
            thread = %thread_id,
            bucket,
            start,
            returned = records.len(),
            "Memory store page"
        );

        BucketPage {
            records,
            next_cursor,
        }
    }
}

#[async_trait]
impl PaginatedMessageStore for MemoryMessageStore {
    async fn query_bucket(
        &self,
        user_id: &str,
        thread_id: ThreadId,
        bucket: Bucket,
        limit: usize,
        cursor: Option<&Cursor>,
    ) -> Result<BucketPage, StoreError> {
        let offset = match cursor {
            Some(c) => c
                .as_str()
                .parse::<usize>()
                .map_err(|_| StoreError::InvalidCursor(c.to_string()))?,
            None => 0,
        };
        Ok(self.page_from(user_id, thread_id, bucket, limit, |_| offset))
    }

    async fn query_bucket_before(
        &self,
        user_id: &str,
        thread_id: ThreadId,
        bucket: Bucket,
        limit: usize,
        before_id: MessageId,
    ) -> Result<BucketPage, StoreError> {
        Ok(self.page_from(user_id, thread_id, bucket, limit, |records| {
            records.partition_point(|r| r.message_id >= before_id)
        }))
    }

    async fn mark_read(
        &self,
        user_id: &str,
        thread_id: ThreadId,
        bucket: Bucket,
        message_id: MessageId,
    ) -> Result<(), StoreError> {
        if let Some(mut partition) = self
            .partitions
            .get_mut(&(user_id.to_string(), thread_id, bucket))
        {
            if let Some(record) = partition.iter_mut().find(|r| r.message_id == message_id) {
                record.read = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::{Timestamp, Uuid};

    fn fill(
        store: &MemoryMessageStore,
        thread: ThreadId,
        bucket: Bucket,
        ids: impl Iterator<Item = u64>,
    ) {
        for id in ids {
            let record = MessageRecord::new(id, thread, bucket, "bob", format!("m{id}"));
            store.insert("alice", record);
        }
    }

    #[tokio::test]
    async fn test_uuid_thread_lookup() {
        let ts = Timestamp::from_unix(uuid::NoContext, 1_640_995_200, 500_000_000);
        let thread = Uuid::new_v7(ts);

        let millis = UuidThreadLookup.created_at_unix_millis(thread).await.unwrap();
        assert_eq!(millis, 1_640_995_200_500);

        let random = Uuid::new_v4();
        assert!(matches!(
            UuidThreadLookup.created_at_unix_millis(random).await,
            Err(StoreError::NoEmbeddedTimestamp(_))
        ));
    }

    #[tokio::test]
    async fn test_uuid_thread_lookup_gregorian() {
        let v1 = Uuid::parse_str("c232ab00-9414-11ec-b3c8-9f6bdeced846").unwrap();
        let millis = UuidThreadLookup.created_at_unix_millis(v1).await.unwrap();
        assert_eq!(millis, 1_645_557_742_000);

        // 1582-10-15 predates the Unix epoch.
        let pre_unix = Uuid::parse_str("00000000-0000-1000-8000-000000000000").unwrap();
        assert!(matches!(
            UuidThreadLookup.created_at_unix_millis(pre_unix).await,
            Err(StoreError::NoEmbeddedTimestamp(id)) if id == pre_unix
        ));
        let pre_unix_v6 = Uuid::parse_str("00000000-0000-6000-8000-000000000000").unwrap();
        assert!(UuidThreadLookup
            .created_at_unix_millis(pre_unix_v6)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_memory_store_newest_first_with_cursor() {
        let store = MemoryMessageStore::new();
        let thread = Uuid::now_v7();
        fill(&store, thread, 3, 1..=5);

        let first = store.query_bucket("alice", thread, 3, 3, None).await.unwrap();
        let ids: Vec<_> = first.records.iter().map(|r| r.message_id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
        let cursor = first.next_cursor.unwrap();

        let second = store
            .query_bucket("alice", thread, 3, 3, Some(&cursor))
            .await
            .unwrap();
        let ids: Vec<_> = second.records.iter().map(|r| r.message_id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_memory_store_before_id() {
        let store = MemoryMessageStore::new();
        let thread = Uuid::now_v7();
        fill(&store, thread, 0, 1..=10);

        let page = store
            .query_bucket_before("alice", thread, 0, 3, 8)
            .await
            .unwrap();
        let ids: Vec<_> = page.records.iter().map(|r| r.message_id).collect();
        assert_eq!(ids, vec![7, 6, 5]);
        assert_eq!(page.next_cursor, Some(Cursor::new("6")));
    }

    #[tokio::test]
    async fn test_memory_store_invalid_cursor() {
        let store = MemoryMessageStore::new();
        let result = store
            .query_bucket("alice", Uuid::now_v7(), 0, 3, Some(&Cursor::new("nope")))
            .await;
        assert!(matches!(result, Err(StoreError::InvalidCursor(_))));
    }

    #[tokio::test]
    async fn test_memory_store_mark_read_and_replace() {
        let store = MemoryMessageStore::new();
        let thread = Uuid::now_v7();
        fill(&store, thread, 1, 1..=2);
        fill(&store, thread, 1, 2..=2);
        assert_eq!(store.partition_len("alice", thread, 1), 2);

        store.mark_read("alice", thread, 1, 2).await.unwrap();
        let page = store.query_bucket("alice", thread, 1, 10, None).await.unwrap();
        assert!(page.records[0].read);
        assert!(!page.records[1].read);
    }
}
