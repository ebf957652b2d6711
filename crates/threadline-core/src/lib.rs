//! # threadline-core
//!
//! Core messaging primitives for the Threadline chat backend.
//!
//! This crate provides the building blocks behind message sending, history
//! and live delivery:
//!
//! - **IdGenerator** - Time-ordered 64-bit snowflake ids
//! - **BucketIndex** - Time-bucket partitioning of message storage
//! - **HistoryAggregator** - Fixed-size history pages spanning buckets
//! - **SessionRegistry** - Live sessions and their topic subscriptions
//! - **DeliveryRouter** - Direct, notification or drop, per recipient
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ IdGenerator │────▶│   fanout    │────▶│   Router    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                                       │
//!        ▼                                       ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ BucketIndex │────▶│   History   │     │  Sessions   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//! ```

pub mod bucket;
pub mod clock;
pub mod delivery;
pub mod history;
pub mod message;
pub mod session;
pub mod snowflake;
pub mod store;

pub use bucket::{Bucket, BucketIndex, ConfigurationError, DEFAULT_BUCKET_SIZE_MS};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use delivery::{
    thread_topic, DeliveryDecision, DeliveryRouter, NOTIFICATION_TOPIC, TYPING_TOPIC,
};
pub use history::{
    HistoryAggregator, HistoryPage, HistoryQuery, HistoryQueryError, DEFAULT_PAGE_SIZE,
};
pub use message::{
    fanout, DeliveryMessage, Fanout, MessageDraft, MessageEvent, MessageId, ThreadId,
};
pub use session::{RegistryStats, Session, SessionRegistry, TopicSubscription};
pub use snowflake::{GeneratorConfig, IdError, IdGenerator, InitializationError, NodeIdSource};
pub use store::{
    BucketPage, Cursor, MemoryMessageStore, MessageRecord, PaginatedMessageStore, StoreError,
    ThreadLookup, UuidThreadLookup,
};
