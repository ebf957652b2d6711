//! Connection handlers for the Threadline server.
//!
//! This module handles the session lifecycle and client frame processing.

use crate::config::Config;
use crate::frames::{self, codes, ClientFrame, ServerFrame};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use threadline_core::clock::system_clock;
use threadline_core::{
    fanout, thread_topic, BucketIndex, DeliveryDecision, DeliveryRouter, HistoryAggregator,
    HistoryQuery, IdGenerator, MemoryMessageStore, MessageDraft, MessageEvent, MessageId,
    MessageRecord, PaginatedMessageStore, Session, SessionRegistry, SharedClock, ThreadId,
    TopicSubscription, UuidThreadLookup, NOTIFICATION_TOPIC, TYPING_TOPIC,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Outbound queue of one live connection.
struct Outbox {
    session_id: String,
    tx: mpsc::UnboundedSender<ServerFrame>,
}

/// Shared server state.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Message id generator.
    pub generator: IdGenerator,
    /// Bucket index sharing the generator's epoch.
    pub index: BucketIndex,
    /// Live sessions.
    pub registry: Arc<SessionRegistry>,
    /// Delivery decisions.
    pub router: DeliveryRouter,
    /// History pages.
    pub history: HistoryAggregator,
    /// Per-user message storage.
    pub store: Arc<MemoryMessageStore>,
    clock: SharedClock,
    outboxes: DashMap<String, Outbox>,
}

impl AppState {
    /// Create new app state.
    ///
    /// # Errors
    ///
    /// Returns an error if the id generator or history settings are invalid.
    pub fn new(config: Config) -> Result<Self> {
        let generator = IdGenerator::with_config(config.snowflake.to_generator_config())
            .context("Failed to initialize id generator")?;
        let index = BucketIndex::for_generator(&generator, config.history.bucket_size_ms)
            .context("Invalid history bucket size")?;
        let registry = Arc::new(SessionRegistry::new());
        let router = DeliveryRouter::for_generator(Arc::clone(&registry), &generator);
        let store = Arc::new(MemoryMessageStore::new());
        let history = HistoryAggregator::new(
            Arc::clone(&store) as Arc<dyn PaginatedMessageStore>,
            Arc::new(UuidThreadLookup),
            index.clone(),
            config.history.page_size,
        )
        .context("Invalid history page size")?;

        Ok(Self {
            config,
            generator,
            index,
            registry,
            router,
            history,
            store,
            clock: system_clock(),
            outboxes: DashMap::new(),
        })
    }

    /// Register a new connection for `user_id`, displacing any previous one.
    ///
    /// Returns the new session id and the queue of frames pushed to it. The
    /// displaced connection's queue is closed.
    pub fn open_session(
        &self,
        user_id: &str,
        remote_addr: Option<SocketAddr>,
    ) -> (String, mpsc::UnboundedReceiver<ServerFrame>) {
        let session_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut session = Session::new(user_id, session_id.clone(), self.clock.now_millis());
        if let Some(addr) = remote_addr {
            session = session.with_remote_addr(addr.to_string());
        }

        // The outbox entry guard serializes connects of the same user, so the
        // registry and the outbox always name the same session. Lock order is
        // outboxes, then registry.
        let entry = self.outboxes.entry(user_id.to_string());
        let displaced = self.registry.connect(session);
        entry.insert(Outbox {
            session_id: session_id.clone(),
            tx,
        });

        if displaced.is_some() {
            metrics::record_displaced();
        }

        (session_id, rx)
    }

    /// Unregister a connection. A no-op if it was already displaced.
    pub fn close_session(&self, user_id: &str, session_id: &str) {
        match self.outboxes.entry(user_id.to_string()) {
            Entry::Occupied(entry) if entry.get().session_id == session_id => {
                self.registry.disconnect_session(user_id, session_id);
                entry.remove();
            }
            _ => {
                self.registry.disconnect_session(user_id, session_id);
            }
        }
    }

    /// Handle one client frame from `user_id` and build the reply.
    pub async fn handle_frame(&self, user_id: &str, frame: ClientFrame) -> ServerFrame {
        match frame {
            ClientFrame::Subscribe { id, topic } => {
                let subscription =
                    TopicSubscription::new(topic, id.to_string(), self.clock.now_millis());
                if self.registry.subscribe(user_id, subscription) {
                    ServerFrame::ack(id)
                } else {
                    ServerFrame::error(id, codes::NOT_CONNECTED, "Session is not connected")
                }
            }

            ClientFrame::Unsubscribe { id, topic } => {
                self.registry.unsubscribe(user_id, &topic);
                ServerFrame::ack(id)
            }

            ClientFrame::Send {
                id,
                thread_id,
                thread_name,
                members,
                body,
            } => {
                let mut draft = MessageDraft::new(thread_id, user_id, body);
                if let Some(name) = thread_name {
                    draft = draft.with_thread_name(name);
                }
                match self.send_message(user_id, draft, &members).await {
                    Ok(message_id) => ServerFrame::Ack {
                        id,
                        message_id: Some(message_id),
                    },
                    Err(e) => {
                        error!(user = %user_id, error = %e, "Failed to mint message id");
                        metrics::record_error("id_generation");
                        ServerFrame::error(id, codes::ID_UNAVAILABLE, e.to_string())
                    }
                }
            }

            ClientFrame::History {
                id,
                thread_id,
                bucket,
                before,
                cursor,
            } => {
                let query = HistoryQuery {
                    bucket,
                    before_id: before,
                    cursor,
                };
                self.history_page(id, user_id, thread_id, query).await
            }

            ClientFrame::Typing {
                id,
                thread_id,
                members,
            } => {
                let notified = self.send_typing(user_id, thread_id, &members);
                debug!(user = %user_id, thread = %thread_id, notified, "Typing indicator");
                ServerFrame::ack(id)
            }

            ClientFrame::Ping { timestamp } => ServerFrame::Pong { timestamp },
        }
    }

    /// Push a typing indicator to every connected member but the author.
    ///
    /// Returns how many members were notified. Nothing is stored.
    fn send_typing(&self, user_id: &str, thread_id: ThreadId, members: &[String]) -> usize {
        let mut seen = HashSet::new();
        let mut notified = 0;
        for member in members {
            let member = member.as_str();
            if member == user_id || !seen.insert(member) || !self.registry.is_connected(member) {
                continue;
            }
            self.push(
                member,
                ServerFrame::Typing {
                    destination: TYPING_TOPIC.to_string(),
                    author_id: user_id.to_string(),
                    thread_id,
                },
            );
            notified += 1;
        }
        notified
    }

    /// Mint, store and route a message to every member but the author.
    async fn send_message(
        &self,
        user_id: &str,
        draft: MessageDraft,
        members: &[String],
    ) -> Result<MessageId, threadline_core::IdError> {
        let fanout = fanout(&self.generator, &self.index, draft, members)?;
        metrics::record_id_minted();
        let event = &fanout.event;

        self.store
            .insert(user_id, MessageRecord::from_event(event).with_read(true));

        for delivery in &fanout.deliveries {
            let target = delivery.target.as_str();
            self.store.insert(target, MessageRecord::from_event(event));

            let decision = self.router.route(target, event);
            metrics::record_delivery(decision);

            match decision {
                DeliveryDecision::Dropped => {}
                DeliveryDecision::DeliverAsNotification => {
                    self.push(
                        target,
                        ServerFrame::Notification {
                            destination: NOTIFICATION_TOPIC.to_string(),
                            event: MessageEvent::clone(event),
                        },
                    );
                }
                DeliveryDecision::DeliverDirect => {
                    self.push(
                        target,
                        ServerFrame::Message {
                            destination: thread_topic(event.thread_id),
                            event: MessageEvent::clone(event),
                        },
                    );
                    if let Err(e) = self
                        .store
                        .mark_read(target, event.thread_id, event.bucket, event.message_id)
                        .await
                    {
                        warn!(
                            user = %target,
                            message_id = event.message_id,
                            error = %e,
                            "Read acknowledgement failed"
                        );
                    }
                }
            }
        }

        Ok(event.message_id)
    }

    async fn history_page(
        &self,
        id: u64,
        user_id: &str,
        thread_id: ThreadId,
        query: HistoryQuery,
    ) -> ServerFrame {
        match self
            .history
            .fetch_page_marking_read(user_id, thread_id, query)
            .await
        {
            Ok(page) => {
                metrics::record_history_page(page.records.len());
                ServerFrame::History {
                    id,
                    records: page.records,
                    cursor: page.cursor,
                    bucket: page.cursor_bucket,
                }
            }
            Err(e) => {
                warn!(user = %user_id, thread = %thread_id, error = %e, "History query failed");
                metrics::record_error("history");
                ServerFrame::error(id, codes::HISTORY_FAILED, e.to_string())
            }
        }
    }

    /// Queue a frame for the user's live connection, if any.
    fn push(&self, user_id: &str, frame: ServerFrame) {
        if let Some(outbox) = self.outboxes.get(user_id) {
            let kind = frame.kind();
            if outbox.tx.send(frame).is_err() {
                debug!(user = %user_id, frame = kind, "Connection closed before push");
            }
        }
    }
}

/// Query parameters of the WebSocket upgrade.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    /// Authenticated user id.
    pub user: String,
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the state cannot be built or the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone())?);

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = Router::new()
        .route(&config.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Threadline server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, config.websocket_path);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "node_id": state.generator.node_id(),
        "sessions": state.registry.len(),
        "bucket_size_ms": state.index.bucket_size_ms(),
        "page_size": state.history.page_size(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if params.user.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "user must not be empty").into_response();
    }
    ws.on_upgrade(move |socket| handle_websocket(socket, params.user, addr, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    user_id: String,
    remote_addr: SocketAddr,
    state: Arc<AppState>,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (session_id, mut outbox) = state.open_session(&user_id, Some(remote_addr));
    debug!(user = %user_id, session = %session_id, addr = %remote_addr, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    let connected = ServerFrame::Connected {
        session_id: session_id.clone(),
        user_id: user_id.clone(),
    };
    if send_frame(&mut sender, &connected).await.is_err() {
        error!(user = %user_id, "Failed to send Connected frame");
        state.close_session(&user_id, &session_id);
        return;
    }

    loop {
        tokio::select! {
            biased;

            // Frames routed to this session by other connections
            pushed = outbox.recv() => {
                match pushed {
                    Some(frame) => {
                        if let Err(e) = send_frame(&mut sender, &frame).await {
                            debug!(
                                user = %user_id,
                                frame = frame.kind(),
                                error = %e,
                                "Push failed"
                            );
                            break;
                        }
                    }
                    None => {
                        // Outbox replaced by a newer connection of the same user
                        debug!(user = %user_id, session = %session_id, "Session displaced");
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        let reply = match frames::decode(&text) {
                            Ok(frame) => state.handle_frame(&user_id, frame).await,
                            Err(e) => {
                                warn!(user = %user_id, error = %e, "Invalid frame");
                                metrics::record_error("decode");
                                ServerFrame::error(0, codes::INVALID_FRAME, e.to_string())
                            }
                        };
                        metrics::record_frame_latency(start.elapsed().as_secs_f64());

                        if let Err(e) = send_frame(&mut sender, &reply).await {
                            warn!(
                                user = %user_id,
                                frame = reply.kind(),
                                error = %e,
                                "Failed to send reply"
                            );
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let reply = ServerFrame::error(
                            0,
                            codes::UNSUPPORTED,
                            "Binary frames are not supported",
                        );
                        if send_frame(&mut sender, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(user = %user_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(user = %user_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(user = %user_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    state.close_session(&user_id, &session_id);
    debug!(user = %user_id, session = %session_id, "WebSocket disconnected");
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &ServerFrame) -> Result<()> {
    let text = frames::encode(frame)?;
    sender.send(Message::Text(text)).await?;
    Ok(())
}
