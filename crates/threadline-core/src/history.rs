//! Backward-scrolling chat history across time buckets.
//!
//! A page is first read from one bucket. When that bucket cannot fill the
//! page, older buckets are walked newest to oldest, down to the bucket the
//! thread was created in, each query asking only for what is still missing.
//! The walk is sequential: every step needs the previous step's count.

use crate::bucket::{Bucket, BucketIndex, ConfigurationError};
use crate::message::{MessageId, ThreadId};
use crate::store::{
    BucketPage, Cursor, MessageRecord, PaginatedMessageStore, StoreError, ThreadLookup,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Default number of messages per page.
pub const DEFAULT_PAGE_SIZE: usize = 25;

/// History aggregation failed; no partial page is returned.
#[derive(Debug, Error)]
pub enum HistoryQueryError {
    /// A bucket query failed.
    #[error("History query for bucket {bucket} failed: {source}")]
    Bucket {
        /// Bucket being read.
        bucket: Bucket,
        /// Store failure.
        #[source]
        source: StoreError,
    },

    /// The thread's creation time could not be resolved.
    #[error("Creation time lookup for thread {thread_id} failed: {source}")]
    ThreadLookup {
        /// Thread being read.
        thread_id: ThreadId,
        /// Lookup failure.
        #[source]
        source: StoreError,
    },
}

/// Where to start reading.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Bucket to start from; the current bucket when absent.
    pub bucket: Option<Bucket>,
    /// Exclusive upper bound on message ids (used with `bucket`).
    pub before_id: Option<MessageId>,
    /// Continuation cursor for `bucket`.
    pub cursor: Option<Cursor>,
}

impl HistoryQuery {
    /// The newest messages.
    #[must_use]
    pub fn latest() -> Self {
        Self::default()
    }

    /// Start in `bucket`.
    #[must_use]
    pub fn in_bucket(bucket: Bucket) -> Self {
        Self {
            bucket: Some(bucket),
            ..Self::default()
        }
    }

    /// Only messages older than `id`.
    #[must_use]
    pub fn before(mut self, id: MessageId) -> Self {
        self.before_id = Some(id);
        self
    }

    /// Resume from `cursor`.
    #[must_use]
    pub fn with_cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }
}

/// A page of history, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryPage {
    /// At most `page_size` records, newest first.
    pub records: Vec<MessageRecord>,
    /// Cursor of the last bucket query, if that bucket has more.
    pub cursor: Option<Cursor>,
    /// The bucket `cursor` belongs to.
    pub cursor_bucket: Option<Bucket>,
}

/// Assembles fixed-size history pages.
pub struct HistoryAggregator {
    store: Arc<dyn PaginatedMessageStore>,
    threads: Arc<dyn ThreadLookup>,
    index: BucketIndex,
    page_size: usize,
}

impl std::fmt::Debug for HistoryAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryAggregator")
            .field("index", &self.index)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl HistoryAggregator {
    /// Create an aggregator.
    ///
    /// # Errors
    ///
    /// Returns an error if `page_size` is zero.
    pub fn new(
        store: Arc<dyn PaginatedMessageStore>,
        threads: Arc<dyn ThreadLookup>,
        index: BucketIndex,
        page_size: usize,
    ) -> Result<Self, ConfigurationError> {
        if page_size == 0 {
            return Err(ConfigurationError::InvalidPageSize);
        }
        Ok(Self {
            store,
            threads,
            index,
            page_size,
        })
    }

    /// Messages per page.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Fetch one page of `thread_id` as seen by `user_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if any store query or the thread lookup fails.
    pub async fn fetch_page(
        &self,
        user_id: &str,
        thread_id: ThreadId,
        query: HistoryQuery,
    ) -> Result<HistoryPage, HistoryQueryError> {
        let (bucket, first) = match (query.bucket, query.before_id) {
            (Some(bucket), Some(before_id)) => {
                let page = self
                    .store
                    .query_bucket_before(user_id, thread_id, bucket, self.page_size, before_id)
                    .await
                    .map_err(|source| HistoryQueryError::Bucket { bucket, source })?;
                (bucket, page)
            }
            (Some(bucket), None) if bucket >= 0 => {
                let cursor = query.cursor.as_ref();
                let page = self
                    .query(user_id, thread_id, bucket, self.page_size, cursor)
                    .await?;
                (bucket, page)
            }
            _ => {
                let bucket = self.index.bucket_for_now();
                let page = self
                    .query(user_id, thread_id, bucket, self.page_size, None)
                    .await?;
                (bucket, page)
            }
        };

        let mut records = first.records;
        records.truncate(self.page_size);
        let mut page = HistoryPage {
            cursor_bucket: first.next_cursor.as_ref().map(|_| bucket),
            cursor: first.next_cursor,
            records,
        };

        let next_bucket = bucket - 1;
        if page.records.len() >= self.page_size || next_bucket < 0 {
            return Ok(page);
        }

        let created_at = self
            .threads
            .created_at_unix_millis(thread_id)
            .await
            .map_err(|source| HistoryQueryError::ThreadLookup { thread_id, source })?;
        let created_ts = self.index.adjust_to_epoch(created_at).max(0);

        for older in self
            .index
            .buckets_from_timestamp_through(created_ts, next_bucket)
            .rev()
        {
            let remaining = self.page_size - page.records.len();
            let older_page = self.query(user_id, thread_id, older, remaining, None).await?;

            page.records.extend(older_page.records.into_iter().take(remaining));
            page.cursor_bucket = older_page.next_cursor.as_ref().map(|_| older);
            page.cursor = older_page.next_cursor;

            if page.records.len() >= self.page_size {
                break;
            }
        }

        debug!(
            user = %user_id,
            thread = %thread_id,
            start_bucket = bucket,
            returned = page.records.len(),
            has_more = page.cursor.is_some(),
            "Aggregated history page"
        );

        Ok(page)
    }

    /// Fetch a page and, when it is the first page (no cursor), mark the newest
    /// message read.
    ///
    /// Marking the newest message acknowledges everything before it. A failed
    /// acknowledgement is logged and does not fail the page.
    ///
    /// # Errors
    ///
    /// Returns an error if the page itself cannot be fetched.
    pub async fn fetch_page_marking_read(
        &self,
        user_id: &str,
        thread_id: ThreadId,
        query: HistoryQuery,
    ) -> Result<HistoryPage, HistoryQueryError> {
        let first_page = query.cursor.is_none();
        let mut page = self.fetch_page(user_id, thread_id, query).await?;

        if !first_page {
            return Ok(page);
        }

        if let Some(newest) = page.records.first_mut() {
            if !newest.read {
                newest.read = true;
                if let Err(e) = self
                    .store
                    .mark_read(user_id, thread_id, newest.bucket, newest.message_id)
                    .await
                {
                    warn!(
                        user = %user_id,
                        thread = %thread_id,
                        message_id = newest.message_id,
                        error = %e,
                        "Failed to mark message as read"
                    );
                }
            }
        }

        Ok(page)
    }

    async fn query(
        &self,
        user_id: &str,
        thread_id: ThreadId,
        bucket: Bucket,
        limit: usize,
        cursor: Option<&Cursor>,
    ) -> Result<BucketPage, HistoryQueryError> {
        trace!(user = %user_id, thread = %thread_id, bucket, limit, "Querying bucket");
        self.store
            .query_bucket(user_id, thread_id, bucket, limit, cursor)
            .await
            .map_err(|source| HistoryQueryError::Bucket { bucket, source })
    }
}
