//! Per-recipient delivery decisions.
//!
//! A recipient gets a message on the thread's own topic only if they are
//! watching the thread and were already watching when the message was
//! created. Otherwise a connected recipient gets a notification, and an
//! offline recipient gets nothing (history covers them).

use crate::message::{MessageEvent, MessageId, ThreadId};
use crate::session::SessionRegistry;
use crate::snowflake::{timestamp_of, IdGenerator};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Destination for notification deliveries.
pub const NOTIFICATION_TOPIC: &str = "/queue/notifications";

/// Destination for typing indicators.
pub const TYPING_TOPIC: &str = "/queue/typing";

/// Topic clients subscribe to in order to watch one thread.
#[must_use]
pub fn thread_topic(thread_id: ThreadId) -> String {
    format!("/queue/threads/{thread_id}")
}

/// What to do with one message for one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryDecision {
    /// Recipient is offline.
    Dropped,
    /// Send to the recipient's notification destination.
    DeliverAsNotification,
    /// Send on the thread topic; the caller may acknowledge it as read.
    DeliverDirect,
}

impl DeliveryDecision {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dropped => "dropped",
            Self::DeliverAsNotification => "notification",
            Self::DeliverDirect => "direct",
        }
    }
}

impl fmt::Display for DeliveryDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides delivery mode from live session state.
#[derive(Debug, Clone)]
pub struct DeliveryRouter {
    registry: Arc<SessionRegistry>,
    epoch_millis: u64,
}

impl DeliveryRouter {
    /// Create a router over `registry` for ids minted against `epoch_millis`.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, epoch_millis: u64) -> Self {
        Self {
            registry,
            epoch_millis,
        }
    }

    /// Create a router for ids minted by `generator`.
    #[must_use]
    pub fn for_generator(registry: Arc<SessionRegistry>, generator: &IdGenerator) -> Self {
        Self::new(registry, generator.epoch_millis())
    }

    /// Decide how `event` reaches `target_user`.
    #[must_use]
    pub fn route(&self, target_user: &str, event: &MessageEvent) -> DeliveryDecision {
        // One snapshot, so both checks see the same session.
        let Some(session) = self.registry.session(target_user) else {
            trace!(user = %target_user, message_id = event.message_id, "Recipient offline");
            return DeliveryDecision::Dropped;
        };

        let topic = thread_topic(event.thread_id);
        let decision = match session.subscription(&topic) {
            None => DeliveryDecision::DeliverAsNotification,
            Some(sub) if sub.joined_at > self.created_at(event.message_id) => {
                DeliveryDecision::DeliverAsNotification
            }
            Some(_) => DeliveryDecision::DeliverDirect,
        };

        trace!(
            user = %target_user,
            topic = %topic,
            message_id = event.message_id,
            decision = %decision,
            "Routed message"
        );
        decision
    }

    fn created_at(&self, id: MessageId) -> u64 {
        timestamp_of(id) + self.epoch_millis
    }
}
