//! Message events and fanout.
//!
//! A message is minted once (one id, one bucket) and then fanned out into one
//! [`DeliveryMessage`] per recipient, all sharing the same event.

use crate::bucket::{Bucket, BucketIndex};
use crate::snowflake::{IdError, IdGenerator};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A snowflake message identifier.
pub type MessageId = u64;

/// A thread (conversation) identifier: a time-based UUID.
pub type ThreadId = Uuid;

/// A message before it has been assigned an id.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    /// Target thread.
    pub thread_id: ThreadId,
    /// Display name of the thread.
    pub thread_name: Option<String>,
    /// Sender.
    pub author_id: String,
    /// Display name of the sender.
    pub author_name: Option<String>,
    /// Message text.
    pub body: String,
}

impl MessageDraft {
    /// Create a draft.
    #[must_use]
    pub fn new(thread_id: ThreadId, author_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            thread_id,
            thread_name: None,
            author_id: author_id.into(),
            author_name: None,
            body: body.into(),
        }
    }

    /// Set the thread name.
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = Some(name.into());
        self
    }

    /// Set the author's display name.
    #[must_use]
    pub fn with_author_name(mut self, name: impl Into<String>) -> Self {
        self.author_name = Some(name.into());
        self
    }
}

/// A message on its way to recipients.
///
/// The creation time is not stored: it is embedded in `message_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    /// Snowflake id.
    pub message_id: MessageId,
    /// Thread the message belongs to.
    pub thread_id: ThreadId,
    /// Display name of the thread.
    pub thread_name: Option<String>,
    /// Storage bucket of the message.
    pub bucket: Bucket,
    /// Sender.
    pub author_id: String,
    /// Display name of the sender.
    pub author_name: Option<String>,
    /// Message text.
    pub body: String,
}

impl MessageEvent {
    /// Build an event from a draft and its assigned id and bucket.
    #[must_use]
    pub fn from_draft(message_id: MessageId, bucket: Bucket, draft: MessageDraft) -> Self {
        Self {
            message_id,
            thread_id: draft.thread_id,
            thread_name: draft.thread_name,
            bucket,
            author_id: draft.author_id,
            author_name: draft.author_name,
            body: draft.body,
        }
    }
}

/// An event addressed to one recipient.
#[derive(Debug, Clone)]
pub struct DeliveryMessage {
    /// The shared event.
    pub event: Arc<MessageEvent>,
    /// Recipient user id.
    pub target: String,
}

impl DeliveryMessage {
    /// Create a new delivery message.
    #[must_use]
    pub fn new(event: Arc<MessageEvent>, target: impl Into<String>) -> Self {
        Self {
            event,
            target: target.into(),
        }
    }
}

/// Result of fanning a message out to a thread's members.
#[derive(Debug, Clone)]
pub struct Fanout {
    /// The minted event.
    pub event: Arc<MessageEvent>,
    /// One delivery per member other than the author.
    pub deliveries: Vec<DeliveryMessage>,
}

/// Mint an id for `draft` and address it to every member except the author.
///
/// Duplicate member ids are delivered once.
///
/// # Errors
///
/// Returns an error if the generator cannot mint an id.
pub fn fanout(
    generator: &IdGenerator,
    index: &BucketIndex,
    draft: MessageDraft,
    members: &[String],
) -> Result<Fanout, IdError> {
    let message_id = generator.next_id()?;
    let bucket = index.bucket_for_id(message_id);
    let event = Arc::new(MessageEvent::from_draft(message_id, bucket, draft));

    let mut seen = HashSet::new();
    let mut deliveries = Vec::with_capacity(members.len());
    for member in members {
        if *member == event.author_id || !seen.insert(member.as_str()) {
            continue;
        }
        deliveries.push(DeliveryMessage::new(Arc::clone(&event), member.as_str()));
    }

    debug!(
        message_id,
        bucket,
        thread = %event.thread_id,
        recipients = deliveries.len(),
        "Fanned out message"
    );

    Ok(Fanout { event, deliveries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snowflake::NodeIdSource;

    fn members(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_draft_builder() {
        let thread = Uuid::now_v7();
        let draft = MessageDraft::new(thread, "alice", "hi")
            .with_thread_name("Bob")
            .with_author_name("Alice A.");

        assert_eq!(draft.thread_id, thread);
        assert_eq!(draft.thread_name.as_deref(), Some("Bob"));
        assert_eq!(draft.author_name.as_deref(), Some("Alice A."));
    }

    #[test]
    fn test_fanout_excludes_author_and_duplicates() {
        let generator = IdGenerator::new(0, NodeIdSource::Explicit(1)).unwrap();
        let index = BucketIndex::for_generator(&generator, 60_000).unwrap();
        let draft = MessageDraft::new(Uuid::now_v7(), "alice", "hello");

        let fanout = fanout(
            &generator,
            &index,
            draft,
            &members(&["alice", "bob", "carol", "bob"]),
        )
        .unwrap();

        let targets: Vec<_> = fanout.deliveries.iter().map(|d| d.target.as_str()).collect();
        assert_eq!(targets, vec!["bob", "carol"]);
        assert!(fanout
            .deliveries
            .iter()
            .all(|d| Arc::ptr_eq(&d.event, &fanout.event)));
    }

    #[test]
    fn test_fanout_bucket_matches_id() {
        let generator = IdGenerator::new(0, NodeIdSource::Explicit(1)).unwrap();
        let index = BucketIndex::for_generator(&generator, 60_000).unwrap();

        let fanout = fanout(
            &generator,
            &index,
            MessageDraft::new(Uuid::now_v7(), "alice", "x"),
            &members(&["bob"]),
        )
        .unwrap();

        assert_eq!(fanout.event.bucket, index.bucket_for_id(fanout.event.message_id));
        assert_eq!(fanout.event.body, "x");
    }

    #[test]
    fn test_event_json_shape() {
        let thread = Uuid::parse_str("0190a7e2-3c4d-7000-8000-000000000001").unwrap();
        let event = MessageEvent::from_draft(42 << 22, 3, MessageDraft::new(thread, "alice", "hi"));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "message_id": 42u64 << 22,
                "thread_id": "0190a7e2-3c4d-7000-8000-000000000001",
                "thread_name": null,
                "bucket": 3,
                "author_id": "alice",
                "author_name": null,
                "body": "hi"
            })
        );
    }
}
