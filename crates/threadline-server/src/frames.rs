//! JSON frames exchanged over the WebSocket.
//!
//! Every frame is a JSON object tagged by `type`. Requests carry a client
//! chosen `id` that the matching `ack`, `error` or `history` reply echoes.

use serde::{Deserialize, Serialize};
use threadline_core::{Bucket, Cursor, MessageEvent, MessageId, MessageRecord, ThreadId};

/// Error codes carried by [`ServerFrame::Error`].
pub mod codes {
    /// The frame could not be parsed.
    pub const INVALID_FRAME: u16 = 1001;
    /// The session is no longer registered.
    pub const NOT_CONNECTED: u16 = 1002;
    /// No message id could be minted.
    pub const ID_UNAVAILABLE: u16 = 1003;
    /// History could not be assembled.
    pub const HISTORY_FAILED: u16 = 1004;
    /// Binary frames are not accepted.
    pub const UNSUPPORTED: u16 = 1005;
}

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Start watching a topic.
    Subscribe {
        /// Request id.
        id: u64,
        /// Topic name, usually `/queue/threads/{thread_id}`.
        topic: String,
    },

    /// Stop watching a topic.
    Unsubscribe {
        /// Request id.
        id: u64,
        /// Topic name.
        topic: String,
    },

    /// Post a message to a thread.
    Send {
        /// Request id.
        id: u64,
        /// Target thread.
        thread_id: ThreadId,
        /// Display name of the thread.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_name: Option<String>,
        /// Thread members; the sender is skipped.
        members: Vec<String>,
        /// Message text.
        body: String,
    },

    /// Read a page of history.
    History {
        /// Request id.
        id: u64,
        /// Thread to read.
        thread_id: ThreadId,
        /// Bucket to start from; the current one when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bucket: Option<Bucket>,
        /// Only messages older than this id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<MessageId>,
        /// Continuation cursor from a previous page.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<Cursor>,
    },

    /// Tell the other members of a thread that the sender is typing.
    Typing {
        /// Request id.
        id: u64,
        /// Thread being typed in.
        thread_id: ThreadId,
        /// Thread members; the sender is skipped.
        members: Vec<String>,
    },

    /// Keepalive ping.
    Ping {
        /// Optional timestamp.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Session registered.
    Connected {
        /// Session id assigned to this connection.
        session_id: String,
        /// Authenticated user.
        user_id: String,
    },

    /// Request succeeded.
    Ack {
        /// Request id.
        id: u64,
        /// Id minted for a `send`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
    },

    /// Request failed.
    Error {
        /// Request id (0 if not applicable).
        id: u64,
        /// Error code, see [`codes`].
        code: u16,
        /// Human-readable description.
        message: String,
    },

    /// A message on a watched thread topic.
    Message {
        /// Thread topic.
        destination: String,
        /// The message.
        event: MessageEvent,
    },

    /// A message for a thread the recipient is not watching.
    Notification {
        /// Notification destination.
        destination: String,
        /// The message.
        event: MessageEvent,
    },

    /// A page of history.
    History {
        /// Request id.
        id: u64,
        /// Records, newest first.
        records: Vec<MessageRecord>,
        /// Cursor for the next page.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<Cursor>,
        /// Bucket the cursor belongs to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bucket: Option<Bucket>,
    },

    /// Another member is typing in a thread.
    Typing {
        /// Typing destination.
        destination: String,
        /// Member who is typing.
        author_id: String,
        /// Thread being typed in.
        thread_id: ThreadId,
    },

    /// Keepalive pong.
    Pong {
        /// Echoed timestamp.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ServerFrame {
    /// Create an Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        ServerFrame::Ack {
            id,
            message_id: None,
        }
    }

    /// Create an Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Frame name, for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::Connected { .. } => "connected",
            ServerFrame::Ack { .. } => "ack",
            ServerFrame::Error { .. } => "error",
            ServerFrame::Message { .. } => "message",
            ServerFrame::Notification { .. } => "notification",
            ServerFrame::History { .. } => "history",
            ServerFrame::Typing { .. } => "typing",
            ServerFrame::Pong { .. } => "pong",
        }
    }
}

/// Decode a client frame from JSON text.
///
/// # Errors
///
/// Returns an error if the text is not a valid client frame.
pub fn decode(text: &str) -> Result<ClientFrame, serde_json::Error> {
    serde_json::from_str(text)
}

/// Encode a server frame as JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(frame: &ServerFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}
