//! Live session registry.
//!
//! Each user has at most one active session (last connect wins). A session's
//! subscriptions are an immutable snapshot; subscribe and unsubscribe build a
//! new set and swap it in under the user's map shard, so readers never see a
//! half-updated set and users never contend with each other.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A session's subscription to one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSubscription {
    /// Topic name.
    pub topic: String,
    /// When the subscription was made (Unix ms).
    pub joined_at: u64,
    /// Client-assigned subscription id.
    pub subscription_id: String,
}

impl TopicSubscription {
    /// Create a subscription.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        subscription_id: impl Into<String>,
        joined_at: u64,
    ) -> Self {
        Self {
            topic: topic.into(),
            joined_at,
            subscription_id: subscription_id.into(),
        }
    }
}

/// An authenticated live connection.
#[derive(Debug, Clone)]
pub struct Session {
    /// Owning user.
    pub user_id: String,
    /// Transport-level session id.
    pub session_id: String,
    /// Peer address, when known.
    pub remote_addr: Option<String>,
    /// When the session connected (Unix ms).
    pub connected_at: u64,
    subscriptions: Arc<HashMap<String, TopicSubscription>>,
}

impl Session {
    /// Create a session with no subscriptions.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        connected_at: u64,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            remote_addr: None,
            connected_at,
            subscriptions: Arc::default(),
        }
    }

    /// Set the peer address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    /// Subscription to `topic`, if any.
    #[must_use]
    pub fn subscription(&self, topic: &str) -> Option<&TopicSubscription> {
        self.subscriptions.get(topic)
    }

    /// Whether the session is subscribed to `topic`.
    #[must_use]
    pub fn is_subscribed_to(&self, topic: &str) -> bool {
        self.subscriptions.contains_key(topic)
    }

    /// Number of subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Connected users.
    pub sessions: usize,
    /// Subscriptions across all sessions.
    pub subscriptions: usize,
}

/// Maps user id to that user's single active session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session`, replacing any existing session of the same user.
    ///
    /// Returns the displaced session. Its subscriptions are not carried over.
    pub fn connect(&self, session: Session) -> Option<Session> {
        let user_id = session.user_id.clone();
        let session_id = session.session_id.clone();
        let displaced = self.sessions.insert(user_id.clone(), session);

        match &displaced {
            Some(old) => warn!(
                user = %user_id,
                session = %session_id,
                displaced = %old.session_id,
                "Session replaced by newer connection"
            ),
            None => debug!(user = %user_id, session = %session_id, "Session connected"),
        }

        displaced
    }

    /// Remove the user's session, whichever it is.
    pub fn disconnect(&self, user_id: &str) -> Option<Session> {
        let removed = self.sessions.remove(user_id).map(|(_, s)| s);
        if let Some(session) = &removed {
            debug!(user = %user_id, session = %session.session_id, "Session disconnected");
        }
        removed
    }

    /// Remove the user's session only if it is `session_id`.
    ///
    /// A transport closing after it was displaced leaves the newer session in
    /// place.
    pub fn disconnect_session(&self, user_id: &str, session_id: &str) -> Option<Session> {
        let removed = self
            .sessions
            .remove_if(user_id, |_, s| s.session_id == session_id)
            .map(|(_, s)| s);
        match &removed {
            Some(_) => debug!(user = %user_id, session = %session_id, "Session disconnected"),
            None => debug!(
                user = %user_id,
                session = %session_id,
                "Ignoring disconnect of stale session"
            ),
        }
        removed
    }

    /// Add `subscription`, replacing any existing one for the same topic.
    ///
    /// Returns `false` if the user is not connected.
    pub fn subscribe(&self, user_id: &str, subscription: TopicSubscription) -> bool {
        let Some(mut session) = self.sessions.get_mut(user_id) else {
            debug!(user = %user_id, topic = %subscription.topic, "Subscribe without session");
            return false;
        };

        let topic = subscription.topic.clone();
        let mut next = HashMap::clone(&session.subscriptions);
        next.insert(topic.clone(), subscription);
        session.subscriptions = Arc::new(next);

        debug!(user = %user_id, topic = %topic, "Subscribed");
        true
    }

    /// Remove the subscription to `topic`. No-op if absent.
    pub fn unsubscribe(&self, user_id: &str, topic: &str) {
        let Some(mut session) = self.sessions.get_mut(user_id) else {
            return;
        };
        if !session.subscriptions.contains_key(topic) {
            return;
        }

        let mut next = HashMap::clone(&session.subscriptions);
        next.remove(topic);
        session.subscriptions = Arc::new(next);

        debug!(user = %user_id, topic = %topic, "Unsubscribed");
    }

    /// Whether the user has an active session.
    #[must_use]
    pub fn is_connected(&self, user_id: &str) -> bool {
        self.sessions.contains_key(user_id)
    }

    /// Whether the user's active session is subscribed to `topic`.
    #[must_use]
    pub fn is_subscribed_to(&self, user_id: &str, topic: &str) -> bool {
        self.sessions
            .get(user_id)
            .is_some_and(|s| s.is_subscribed_to(topic))
    }

    /// The user's subscription to `topic`, if any.
    #[must_use]
    pub fn subscription_of(&self, user_id: &str, topic: &str) -> Option<TopicSubscription> {
        self.sessions
            .get(user_id)
            .and_then(|s| s.subscription(topic).cloned())
    }

    /// Snapshot of the user's session.
    #[must_use]
    pub fn session(&self, user_id: &str) -> Option<Session> {
        self.sessions.get(user_id).map(|s| s.clone())
    }

    /// Number of connected users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no user is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            sessions: self.sessions.len(),
            subscriptions: self
                .sessions
                .iter()
                .map(|s| s.subscription_count())
                .sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const TOPIC: &str = "/queue/threads/a";

    fn registry_with(user: &str, session_id: &str) -> SessionRegistry {
        let registry = SessionRegistry::new();
        registry.connect(Session::new(user, session_id, 1_000));
        registry
    }

    #[test]
    fn test_connect_and_disconnect() {
        let registry = SessionRegistry::new();
        assert!(!registry.is_connected("alice"));

        let session = Session::new("alice", "s1", 1_000).with_remote_addr("10.0.0.1:5000");
        let displaced = registry.connect(session);
        assert!(displaced.is_none());
        assert!(registry.is_connected("alice"));
        assert_eq!(registry.len(), 1);

        let session = registry.session("alice").unwrap();
        assert_eq!(session.remote_addr.as_deref(), Some("10.0.0.1:5000"));

        let removed = registry.disconnect("alice").unwrap();
        assert_eq!(removed.session_id, "s1");
        assert!(!registry.is_connected("alice"));
        assert!(registry.disconnect("alice").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_last_connect_wins_and_drops_subscriptions() {
        let registry = registry_with("alice", "s1");
        assert!(registry.subscribe("alice", TopicSubscription::new(TOPIC, "sub-0", 1_100)));

        let displaced = registry.connect(Session::new("alice", "s2", 2_000)).unwrap();
        assert_eq!(displaced.session_id, "s1");
        assert!(displaced.is_subscribed_to(TOPIC));

        assert_eq!(registry.session("alice").unwrap().session_id, "s2");
        assert!(!registry.is_subscribed_to("alice", TOPIC));
    }

    #[test]
    fn test_disconnect_session_ignores_stale_session() {
        let registry = registry_with("alice", "s1");
        registry.connect(Session::new("alice", "s2", 2_000));

        assert!(registry.disconnect_session("alice", "s1").is_none());
        assert!(registry.is_connected("alice"));

        assert!(registry.disconnect_session("alice", "s2").is_some());
        assert!(!registry.is_connected("alice"));
    }

    #[test]
    fn test_subscribe_requires_session() {
        let registry = SessionRegistry::new();
        assert!(!registry.subscribe("bob", TopicSubscription::new(TOPIC, "sub-0", 1)));
        assert!(!registry.is_subscribed_to("bob", TOPIC));
    }

    #[test]
    fn test_subscribe_replaces_same_topic() {
        let registry = registry_with("alice", "s1");
        assert!(registry.subscribe("alice", TopicSubscription::new(TOPIC, "sub-0", 1_100)));
        assert!(registry.subscribe("alice", TopicSubscription::new(TOPIC, "sub-1", 1_500)));

        let sub = registry.subscription_of("alice", TOPIC).unwrap();
        assert_eq!(sub.subscription_id, "sub-1");
        assert_eq!(sub.joined_at, 1_500);
        assert_eq!(registry.session("alice").unwrap().subscription_count(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let registry = registry_with("alice", "s1");
        registry.subscribe("alice", TopicSubscription::new(TOPIC, "sub-0", 1_100));
        registry.subscribe("alice", TopicSubscription::new("/queue/threads/b", "sub-1", 1_100));

        registry.unsubscribe("alice", TOPIC);
        assert!(!registry.is_subscribed_to("alice", TOPIC));
        assert!(registry.is_subscribed_to("alice", "/queue/threads/b"));

        // Unknown topic and unknown user are no-ops.
        registry.unsubscribe("alice", TOPIC);
        registry.unsubscribe("bob", TOPIC);
        assert_eq!(registry.stats().subscriptions, 1);
    }

    #[test]
    fn test_snapshot_is_stable() {
        let registry = registry_with("alice", "s1");
        registry.subscribe("alice", TopicSubscription::new(TOPIC, "sub-0", 1_100));

        let snapshot = registry.session("alice").unwrap();
        registry.unsubscribe("alice", TOPIC);

        assert!(snapshot.is_subscribed_to(TOPIC));
        assert!(!registry.is_subscribed_to("alice", TOPIC));
    }

    #[test]
    fn test_concurrent_subscribes_are_not_lost() {
        let registry = Arc::new(registry_with("alice", "s1"));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for i in 0..50 {
                        let topic = format!("/queue/threads/{t}-{i}");
                        registry.subscribe("alice", TopicSubscription::new(topic, "sub", 1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.session("alice").unwrap().subscription_count(), 400);
    }

    #[test]
    fn test_stats() {
        let registry = registry_with("alice", "s1");
        registry.connect(Session::new("bob", "s2", 1_000));
        registry.subscribe("alice", TopicSubscription::new(TOPIC, "sub-0", 1_100));
        registry.subscribe("bob", TopicSubscription::new(TOPIC, "sub-0", 1_100));
        registry.subscribe("bob", TopicSubscription::new("/queue/threads/b", "sub-1", 1_100));

        let stats = registry.stats();
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.subscriptions, 3);
    }
}
