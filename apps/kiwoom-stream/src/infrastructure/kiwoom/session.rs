//! Streaming Session
//!
//! The public face of the crate. A [`StreamingSession`] owns one
//! subscription registry, one callback dispatcher, and at most one live
//! connection at a time.
//!
//! # Lifecycle
//!
//! ```text
//! DISCONNECTED ─connect()─▶ CONNECTING ─login ack─▶ AUTHENTICATED ─replay─▶ STREAMING
//!                                                                               │
//!        ┌──────────────────────── link lost (auto-reconnect) ◀─────────────────┘
//!        ▼
//!   RECONNECTING ─backoff─▶ re-login ─▶ replay ─▶ STREAMING
//!        │
//!        └── budget spent / auth rejected / disconnect() ─▶ CLOSED
//! ```
//!
//! # Tasks
//!
//! Per `connect()` the session runs one dispatch worker and one supervisor,
//! both tracked and cancelled together by `disconnect()`. The supervisor
//! waits for the connection's disconnect report and drives the
//! [`ReconnectPolicy`].
//!
//! # Example
//!
//! ```rust,no_run
//! use kiwoom_stream::application::services::Callback;
//! use kiwoom_stream::domain::streaming::DataType;
//! use kiwoom_stream::domain::subscription::RefreshMode;
//! use kiwoom_stream::infrastructure::config::StreamConfig;
//! use kiwoom_stream::infrastructure::kiwoom::StreamingSession;
//!
//! async fn example(config: StreamConfig) -> Result<(), Box<dyn std::error::Error>> {
//!     let session = StreamingSession::new(config);
//!     session.add_callback(
//!         DataType::StockTrade,
//!         Callback::immediate(|event| {
//!             println!("{} {:?}", event.symbol(), event.field("10"));
//!             Ok(())
//!         }),
//!     );
//!
//!     session.connect().await?;
//!     session
//!         .subscribe(&["005930"], &[DataType::StockTrade], "1", RefreshMode::Replace)
//!         .await?;
//!
//!     session.closed().await?;
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc, oneshot, watch};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;
use uuid::Uuid;

use crate::application::ports::{Connector, TransportError};
use crate::application::services::{Callback, CallbackDispatcher, CallbackId};
use crate::domain::streaming::{DataType, RealtimeEvent, SessionState};
use crate::domain::subscription::{
    RefreshMode, SubscribeError, Subscription, SubscriptionRegistry, WILDCARD_SYMBOL,
};
use crate::infrastructure::config::StreamConfig;
use crate::infrastructure::metrics::{self, DropReason};

use super::auth::AuthError;
use super::codec::{CodecError, KiwoomCodec};
use super::connection::{
    ConnectError, ConnectionSettings, DisconnectReason, LiveConnection, establish,
};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::websocket::TungsteniteConnector;

// =============================================================================
// Constants
// =============================================================================

/// Capacity of the broadcast event stream.
pub const EVENT_BROADCAST_CAPACITY: usize = 1024;

/// Group used by [`StreamingSession::subscribe_stock_price`].
pub const STOCK_PRICE_GROUP: &str = "1";
/// Group used by [`StreamingSession::subscribe_order_book`].
pub const ORDER_BOOK_GROUP: &str = "2";
/// Group used by [`StreamingSession::subscribe_account_updates`].
pub const ACCOUNT_GROUP: &str = "3";
/// Group used by [`StreamingSession::subscribe_sector_index`].
pub const SECTOR_INDEX_GROUP: &str = "4";
/// Group used by [`StreamingSession::subscribe_etf_nav`].
pub const ETF_NAV_GROUP: &str = "5";
/// Group used by [`StreamingSession::subscribe_elw`].
pub const ELW_GROUP: &str = "6";

// =============================================================================
// Error Types
// =============================================================================

/// Session-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The token was rejected. Reconnecting with it cannot succeed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The reconnection budget was spent.
    #[error("connection lost after {attempts} reconnect attempts")]
    ConnectionLost {
        /// Reconnect attempts made before giving up.
        attempts: u32,
    },

    /// The request needs a live connection.
    #[error("session is not connected")]
    NotConnected,

    /// The frame could not be queued.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The request could not be encoded.
    #[error("failed to encode request: {0}")]
    Encode(String),
}

impl From<CodecError> for SessionError {
    fn from(err: CodecError) -> Self {
        Self::Encode(err.to_string())
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    /// Session identifier.
    pub session_id: String,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Subscription groups.
    pub groups: usize,
    /// Distinct `(symbol, data type)` pairs.
    pub pairs: usize,
    /// Pair ceiling.
    pub subscription_limit: usize,
    /// Registered callbacks.
    pub callbacks: usize,
    /// Callback errors and panics.
    pub callback_failures: u64,
    /// Events handed to the dispatcher.
    pub events_delivered: u64,
    /// Events dropped because no subscription covered them.
    pub events_unsubscribed: u64,
    /// Reconnect attempts across the session's lifetime.
    pub reconnect_attempts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    unsubscribed: AtomicU64,
    reconnects: AtomicU64,
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`StreamingSession`].
pub struct SessionBuilder {
    config: StreamConfig,
    connector: Option<Arc<dyn Connector>>,
}

impl fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("config", &self.config)
            .field("custom_connector", &self.connector.is_some())
            .finish()
    }
}

impl SessionBuilder {
    /// Use a custom transport instead of `tokio-tungstenite`.
    #[must_use]
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Build the session. Nothing connects until [`StreamingSession::connect`].
    #[must_use]
    pub fn build(self) -> StreamingSession {
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TungsteniteConnector::new()));
        let id = Uuid::new_v4();
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (outcome_tx, _) = watch::channel(None);
        let (events_tx, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);

        StreamingSession {
            inner: Arc::new(Inner {
                id,
                span: tracing::info_span!("session", session_id = %id),
                settings: ConnectionSettings::from_stream_config(&self.config),
                registry: SubscriptionRegistry::new(self.config.subscription_limit),
                config: self.config,
                connector,
                codec: KiwoomCodec::new(),
                dispatcher: CallbackDispatcher::new(),
                link: AsyncMutex::new(None),
                lifecycle: AsyncMutex::new(()),
                run: Mutex::new(None),
                state_tx,
                outcome_tx,
                events_tx,
                counters: Counters::default(),
            }),
        }
    }
}

// =============================================================================
// Streaming Session
// =============================================================================

/// A real-time streaming session.
///
/// Dropping the session stops its background tasks; call
/// [`Self::disconnect`] to also wait for in-flight callbacks.
pub struct StreamingSession {
    inner: Arc<Inner>,
}

type Outcome = Option<Result<(), SessionError>>;

struct Inner {
    id: Uuid,
    span: tracing::Span,
    config: StreamConfig,
    settings: ConnectionSettings,
    connector: Arc<dyn Connector>,
    codec: KiwoomCodec,
    registry: SubscriptionRegistry,
    dispatcher: CallbackDispatcher,
    /// Held while registry changes are mirrored to the wire and while a
    /// new connection is installed and replayed.
    link: AsyncMutex<Option<LiveConnection>>,
    /// Serialises connect and disconnect.
    lifecycle: AsyncMutex<()>,
    run: Mutex<Option<Run>>,
    state_tx: watch::Sender<SessionState>,
    outcome_tx: watch::Sender<Outcome>,
    events_tx: broadcast::Sender<RealtimeEvent>,
    counters: Counters,
}

/// Background tasks of one `connect()`.
struct Run {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl fmt::Debug for StreamingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingSession")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("groups", &self.inner.registry.group_count())
            .finish_non_exhaustive()
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        if let Some(run) = self.inner.run.lock().as_ref() {
            run.cancel.cancel();
        }
    }
}

impl StreamingSession {
    /// Start building a session.
    #[must_use]
    pub const fn builder(config: StreamConfig) -> SessionBuilder {
        SessionBuilder {
            config,
            connector: None,
        }
    }

    /// Create a session over `tokio-tungstenite`.
    #[must_use]
    pub fn new(config: StreamConfig) -> Self {
        Self::builder(config).build()
    }

    /// Session identifier, also recorded on the session's tracing span.
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.inner.id
    }

    /// Session configuration.
    #[must_use]
    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Connect, log in, and replay the registry.
    ///
    /// Returns once the session is STREAMING. A session that is already
    /// active is left alone. The first connection is not retried; only a
    /// link lost after this returns triggers reconnection.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError`] if the transport fails, the login is
    /// rejected, or no login ack arrives in time. The session is
    /// DISCONNECTED afterwards.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        Arc::clone(&self.inner)
            .connect()
            .instrument(self.inner.span.clone())
            .await
    }

    /// Stop everything and move to CLOSED.
    ///
    /// Cancels the connection loops, heartbeat, any pending backoff and the
    /// dispatch worker, then waits for already-running scheduled callbacks.
    /// Safe to call at any time, including during reconnection.
    pub async fn disconnect(&self) {
        self.inner
            .disconnect()
            .instrument(self.inner.span.clone())
            .await;
    }

    /// Connect, run `f`, then disconnect, even if `f` panics.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError`] if the connection cannot be established;
    /// `f` is not run in that case.
    pub async fn run_scoped<F, T>(&self, f: F) -> Result<T, ConnectError>
    where
        F: AsyncFnOnce(&Self) -> T,
    {
        self.connect().await?;
        let result = AssertUnwindSafe(f(self)).catch_unwind().await;
        self.disconnect().await;

        match result {
            Ok(output) => Ok(output),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Wait until the session closes.
    ///
    /// # Errors
    ///
    /// Returns the terminal error if the session closed because the
    /// reconnection budget ran out or the token was rejected. An explicit
    /// [`Self::disconnect`] yields `Ok(())`.
    pub async fn closed(&self) -> Result<(), SessionError> {
        let mut rx = self.inner.outcome_tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone().unwrap_or(Ok(())),
            Err(_) => Ok(()),
        }
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Subscribe the cross product of `symbols` and `data_types` under
    /// `group_id`.
    ///
    /// The registry is updated first; the `REG` frame is queued only if a
    /// connection is live. Otherwise the next connect replays it.
    ///
    /// # Errors
    ///
    /// Returns [`SubscribeError`] for invalid arguments or when the
    /// subscription ceiling would be exceeded. The registry is unchanged.
    pub async fn subscribe<S: AsRef<str>>(
        &self,
        symbols: &[S],
        data_types: &[DataType],
        group_id: &str,
        refresh_mode: RefreshMode,
    ) -> Result<(), SubscribeError> {
        let subscription = Subscription::new(group_id, symbols, data_types, refresh_mode)?;
        let frame = self.inner.codec.encode_subscribe(&subscription);

        let link = self.inner.link.lock().await;
        self.inner.registry.add(subscription)?;
        metrics::set_subscription_pairs(self.inner.registry.pair_count());

        tracing::info!(
            session_id = %self.inner.id,
            group_id,
            refresh = refresh_mode.code(),
            pairs = self.inner.registry.pair_count(),
            "Subscription registered"
        );

        send_if_live(link.as_ref(), frame).await;
        Ok(())
    }

    /// Remove a group. Returns `false` if it did not exist.
    pub async fn unsubscribe(&self, group_id: &str) -> bool {
        let link = self.inner.link.lock().await;
        let Some(removed) = self.inner.registry.remove(group_id) else {
            return false;
        };
        metrics::set_subscription_pairs(self.inner.registry.pair_count());
        tracing::info!(session_id = %self.inner.id, group_id, "Subscription removed");

        send_if_live(link.as_ref(), self.inner.codec.encode_remove(&removed)).await;
        true
    }

    /// Remove every group. Returns how many were removed.
    pub async fn unsubscribe_all(&self) -> usize {
        let link = self.inner.link.lock().await;
        let removed = self.inner.registry.remove_all();
        metrics::set_subscription_pairs(0);

        for group in &removed {
            send_if_live(link.as_ref(), self.inner.codec.encode_remove(group)).await;
        }

        tracing::info!(session_id = %self.inner.id, groups = removed.len(), "All subscriptions removed");
        removed.len()
    }

    /// Snapshot of the registry in group creation order.
    #[must_use]
    pub fn active_subscriptions(&self) -> Vec<Subscription> {
        self.inner.registry.snapshot()
    }

    /// Trade and quote ticks, group `"1"`, added to what is there.
    ///
    /// # Errors
    ///
    /// See [`Self::subscribe`].
    pub async fn subscribe_stock_price<S: AsRef<str>>(
        &self,
        symbols: &[S],
    ) -> Result<(), SubscribeError> {
        self.subscribe(
            symbols,
            &[DataType::StockTrade, DataType::StockPrice],
            STOCK_PRICE_GROUP,
            RefreshMode::Add,
        )
        .await
    }

    /// Order book and best quote, group `"2"`.
    ///
    /// # Errors
    ///
    /// See [`Self::subscribe`].
    pub async fn subscribe_order_book<S: AsRef<str>>(
        &self,
        symbols: &[S],
    ) -> Result<(), SubscribeError> {
        self.subscribe(
            symbols,
            &[DataType::OrderBook, DataType::BestQuote],
            ORDER_BOOK_GROUP,
            RefreshMode::Add,
        )
        .await
    }

    /// Account-wide order executions and balance, group `"3"`.
    ///
    /// # Errors
    ///
    /// See [`Self::subscribe`].
    pub async fn subscribe_account_updates(&self) -> Result<(), SubscribeError> {
        self.subscribe(
            &[WILDCARD_SYMBOL],
            &[DataType::OrderExecution, DataType::AccountBalance],
            ACCOUNT_GROUP,
            RefreshMode::Add,
        )
        .await
    }

    /// Sector index and sector change stats, group `"4"`.
    ///
    /// # Errors
    ///
    /// See [`Self::subscribe`].
    pub async fn subscribe_sector_index<S: AsRef<str>>(
        &self,
        sectors: &[S],
    ) -> Result<(), SubscribeError> {
        self.subscribe(
            sectors,
            &[DataType::SectorIndex, DataType::SectorChange],
            SECTOR_INDEX_GROUP,
            RefreshMode::Add,
        )
        .await
    }

    /// ETF NAV, group `"5"`.
    ///
    /// # Errors
    ///
    /// See [`Self::subscribe`].
    pub async fn subscribe_etf_nav<S: AsRef<str>>(
        &self,
        symbols: &[S],
    ) -> Result<(), SubscribeError> {
        self.subscribe(symbols, &[DataType::EtfNav], ETF_NAV_GROUP, RefreshMode::Add)
            .await
    }

    /// ELW theoretical price and indicators, group `"6"`.
    ///
    /// # Errors
    ///
    /// See [`Self::subscribe`].
    pub async fn subscribe_elw<S: AsRef<str>>(&self, symbols: &[S]) -> Result<(), SubscribeError> {
        self.subscribe(
            symbols,
            &[DataType::ElwTheory, DataType::ElwIndicator],
            ELW_GROUP,
            RefreshMode::Add,
        )
        .await
    }

    // -------------------------------------------------------------------------
    // Conditional search
    // -------------------------------------------------------------------------

    /// Ask for the saved condition list. Results arrive as
    /// [`DataType::ConditionList`] events.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConnected`] without a live connection.
    pub async fn request_condition_list(&self) -> Result<(), SessionError> {
        let frame = self.inner.codec.encode_condition_list()?;
        self.inner.send_request(frame).await
    }

    /// Run a saved condition once. Results arrive as
    /// [`DataType::ConditionResult`] events.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConnected`] without a live connection.
    pub async fn request_condition_search(&self, seq: &str) -> Result<(), SessionError> {
        let frame = self.inner.codec.encode_condition_search(seq)?;
        self.inner.send_request(frame).await
    }

    // -------------------------------------------------------------------------
    // Callbacks and events
    // -------------------------------------------------------------------------

    /// Register a callback for a data type.
    pub fn add_callback(&self, data_type: DataType, callback: Callback) -> CallbackId {
        self.inner.dispatcher.register(data_type, callback)
    }

    /// Remove a callback. Returns `false` if it was not registered.
    pub fn remove_callback(&self, data_type: DataType, id: CallbackId) -> bool {
        self.inner.dispatcher.unregister(data_type, id)
    }

    /// Receiver of every dispatched event. A lagging receiver loses the
    /// oldest events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.inner.events_tx.subscribe()
    }

    /// [`Self::events`] as a stream that skips over lag.
    pub fn event_stream(&self) -> impl Stream<Item = RealtimeEvent> + Send + 'static {
        BroadcastStream::new(self.events()).filter_map(Result::ok)
    }

    // -------------------------------------------------------------------------
    // Observation
    // -------------------------------------------------------------------------

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Point-in-time statistics.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        let inner = &self.inner;
        let registry = inner.registry.stats();
        SessionStats {
            session_id: inner.id.to_string(),
            state: inner.state(),
            groups: registry.group_count,
            pairs: registry.pair_count,
            subscription_limit: registry.limit,
            callbacks: inner.dispatcher.total_handlers(),
            callback_failures: inner.dispatcher.failure_count(),
            events_delivered: inner.counters.delivered.load(Ordering::Relaxed),
            events_unsubscribed: inner.counters.unsubscribed.load(Ordering::Relaxed),
            reconnect_attempts: inner.counters.reconnects.load(Ordering::Relaxed),
        }
    }
}

async fn send_if_live(link: Option<&LiveConnection>, frame: Result<String, CodecError>) {
    let Some(connection) = link else {
        tracing::debug!("No live connection, change will be replayed on connect");
        return;
    };

    match frame {
        Ok(frame) => {
            if let Err(e) = connection.send_text(frame).await {
                tracing::debug!(error = %e, "Link down, change will be replayed on reconnect");
            }
        }
        Err(e) => tracing::error!(error = %e, "Failed to encode subscription request"),
    }
}

// =============================================================================
// Session internals
// =============================================================================

impl Inner {
    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::info!(from = %previous, to = %state, "Session state changed");
        }
        metrics::set_connection_state(state);
    }

    async fn connect(self: Arc<Self>) -> Result<(), ConnectError> {
        let _lifecycle = self.lifecycle.lock().await;

        if self.state().is_active() {
            tracing::debug!(state = %self.state(), "Already connected");
            return Ok(());
        }

        // Leftovers of a run that ended on its own.
        self.stop_run().await;
        self.outcome_tx.send_replace(None);
        self.set_state(SessionState::Connecting);

        let cancel = CancellationToken::new();
        let (dispatch_tx, dispatch_rx) = mpsc::channel(self.config.dispatch_queue_capacity.max(1));

        let (connection, disconnected) =
            match establish(&*self.connector, &self.settings, dispatch_tx.clone(), &cancel).await {
                Ok(established) => established,
                Err(e) => {
                    tracing::error!(error = %e, "Connect failed");
                    self.set_state(SessionState::Disconnected);
                    return Err(e);
                }
            };

        let tracker = TaskTracker::new();
        tracker.spawn(
            dispatch_worker(Arc::clone(&self), dispatch_rx, cancel.clone())
                .instrument(self.span.clone()),
        );

        self.install(connection, &cancel).await;

        tracker.spawn(
            supervise(Arc::clone(&self), disconnected, dispatch_tx, cancel.clone())
                .instrument(self.span.clone()),
        );
        tracker.close();

        *self.run.lock() = Some(Run { cancel, tracker });
        Ok(())
    }

    async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        if let Some(run) = self.run.lock().as_ref() {
            run.cancel.cancel();
        }

        let connection = self.link.lock().await.take();
        if let Some(connection) = connection {
            connection.shutdown().await;
        }

        self.stop_run().await;
        self.dispatcher.drain().await;
        self.set_state(SessionState::Closed);
        self.outcome_tx.send_if_modified(|outcome| {
            if outcome.is_none() {
                *outcome = Some(Ok(()));
                true
            } else {
                false
            }
        });

        tracing::info!("Session disconnected");
    }

    async fn stop_run(&self) {
        let run = self.run.lock().take();
        if let Some(run) = run {
            run.cancel.cancel();
            run.tracker.close();
            run.tracker.wait().await;
        }
    }

    /// Replay the registry onto a fresh connection and make it current.
    ///
    /// Returns `false` if the run was cancelled meanwhile; the connection
    /// is shut down in that case.
    async fn install(&self, connection: LiveConnection, cancel: &CancellationToken) -> bool {
        let mut link = self.link.lock().await;
        if cancel.is_cancelled() {
            drop(link);
            connection.shutdown().await;
            return false;
        }

        self.set_state(SessionState::Authenticated);

        let groups = self.registry.snapshot();
        for group in &groups {
            match self.codec.encode_subscribe(group) {
                Ok(frame) => {
                    if let Err(e) = connection.send_text(frame).await {
                        tracing::warn!(error = %e, "Link lost during replay");
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(group_id = group.group_id(), error = %e, "Failed to encode replay");
                }
            }
        }
        if !groups.is_empty() {
            tracing::info!(groups = groups.len(), "Subscriptions replayed");
        }

        *link = Some(connection);
        self.set_state(SessionState::Streaming);
        true
    }

    async fn send_request(&self, frame: String) -> Result<(), SessionError> {
        let link = self.link.lock().await;
        let connection = link
            .as_ref()
            .filter(|c| !c.is_closed())
            .ok_or(SessionError::NotConnected)?;
        connection.send_text(frame).await?;
        Ok(())
    }

    /// Close the session for good with `error`.
    fn terminate(&self, cancel: &CancellationToken, error: SessionError) {
        tracing::error!(error = %error, "Session closed");
        self.outcome_tx.send_replace(Some(Err(error)));
        self.set_state(SessionState::Closed);
        cancel.cancel();
    }

    fn deliver(&self, event: RealtimeEvent) {
        let data_type = event.data_type();
        if data_type.is_subscribable() && !self.registry.covers(event.symbol(), data_type) {
            self.counters.unsubscribed.fetch_add(1, Ordering::Relaxed);
            metrics::record_event_dropped(data_type, DropReason::NotSubscribed);
            tracing::trace!(data_type = %data_type, symbol = event.symbol(), "Dropping unsubscribed event");
            return;
        }

        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        if self.events_tx.receiver_count() > 0 {
            let _ = self.events_tx.send(event.clone());
        }
        self.dispatcher.dispatch(event);
    }
}

// =============================================================================
// Background tasks
// =============================================================================

async fn dispatch_worker(
    inner: Arc<Inner>,
    mut events: mpsc::Receiver<RealtimeEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        let Some(event) = event else {
            break;
        };
        inner.deliver(event);
    }

    tracing::debug!("Dispatch worker stopped");
}

async fn supervise(
    inner: Arc<Inner>,
    mut disconnected: oneshot::Receiver<DisconnectReason>,
    dispatch_tx: mpsc::Sender<RealtimeEvent>,
    cancel: CancellationToken,
) {
    loop {
        let reason = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            reason = &mut disconnected => reason,
        };

        // No reason means the connection was shut down on purpose.
        let Ok(reason) = reason else {
            return;
        };
        tracing::warn!(reason = %reason, "Link lost");

        let dead = inner.link.lock().await.take();
        if let Some(connection) = dead {
            connection.shutdown().await;
        }

        if !inner.config.auto_reconnect {
            inner.terminate(&cancel, SessionError::ConnectionLost { attempts: 0 });
            return;
        }

        match reconnect(&inner, &dispatch_tx, &cancel).await {
            Some(next) => disconnected = next,
            None => return,
        }
    }
}

/// Back off and re-establish until a connection is installed, the budget
/// runs out, the token is rejected, or the run is cancelled.
async fn reconnect(
    inner: &Arc<Inner>,
    dispatch_tx: &mpsc::Sender<RealtimeEvent>,
    cancel: &CancellationToken,
) -> Option<oneshot::Receiver<DisconnectReason>> {
    inner.set_state(SessionState::Reconnecting);
    let mut policy = ReconnectPolicy::new(ReconnectConfig::from_stream_config(&inner.config));

    loop {
        let Some(delay) = policy.next_delay() else {
            inner.terminate(
                cancel,
                SessionError::ConnectionLost {
                    attempts: policy.attempt_count(),
                },
            );
            return None;
        };

        let attempt = policy.attempt_count();
        inner.counters.reconnects.fetch_add(1, Ordering::Relaxed);
        metrics::record_reconnect();
        tracing::info!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Reconnecting"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            () = tokio::time::sleep(delay) => {}
        }

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            result = establish(&*inner.connector, &inner.settings, dispatch_tx.clone(), cancel) => result,
        };

        match result {
            Ok((connection, disconnected)) => {
                if !inner.install(connection, cancel).await {
                    return None;
                }
                tracing::info!(attempt, "Reconnected");
                return Some(disconnected);
            }
            Err(ConnectError::Auth(e)) => {
                inner.terminate(cancel, SessionError::Auth(e));
                return None;
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "Reconnect attempt failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::infrastructure::kiwoom::auth::AccessToken;
    use crate::infrastructure::kiwoom::test_support::{FakeConnector, LOGIN_OK, next_server};

    fn config() -> StreamConfig {
        StreamConfig {
            reconnect_delay_initial: Duration::from_millis(10),
            reconnect_delay_max: Duration::from_millis(20),
            login_timeout: Duration::from_millis(200),
            ..StreamConfig::new(AccessToken::new("tok").unwrap())
        }
    }

    #[test]
    fn new_session_is_disconnected() {
        let (connector, _servers) = FakeConnector::new(&[LOGIN_OK]);
        let session = StreamingSession::builder(config()).connector(connector).build();

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.active_subscriptions().is_empty());

        let stats = session.stats();
        assert_eq!(stats.session_id, session.session_id().to_string());
        assert_eq!(stats.subscription_limit, 100);
    }

    #[tokio::test]
    async fn subscribe_before_connect_only_updates_registry() {
        let (connector, _servers) = FakeConnector::new(&[LOGIN_OK]);
        let session = StreamingSession::builder(config()).connector(connector.clone()).build();

        session
            .subscribe(&["005930"], &[DataType::StockTrade], "g1", RefreshMode::Replace)
            .await
            .unwrap();

        assert_eq!(connector.attempts(), 0);
        assert_eq!(session.active_subscriptions().len(), 1);
        assert!(session.unsubscribe("g1").await);
        assert!(!session.unsubscribe("g1").await);
    }

    #[tokio::test]
    async fn helpers_use_fixed_groups_in_add_mode() {
        let (connector, _servers) = FakeConnector::new(&[LOGIN_OK]);
        let session = StreamingSession::builder(config()).connector(connector).build();

        session.subscribe_stock_price(&["005930"]).await.unwrap();
        session.subscribe_stock_price(&["000660"]).await.unwrap();
        session.subscribe_order_book(&["005930"]).await.unwrap();
        session.subscribe_account_updates().await.unwrap();
        session.subscribe_sector_index(&["001"]).await.unwrap();
        session.subscribe_etf_nav(&["069500"]).await.unwrap();
        session.subscribe_elw(&["57JA01"]).await.unwrap();

        let groups: Vec<_> = session
            .active_subscriptions()
            .iter()
            .map(|s| (s.group_id().to_string(), s.refresh_mode(), s.pairs().len()))
            .collect();

        assert_eq!(
            groups,
            vec![
                ("1".to_string(), RefreshMode::Add, 4),
                ("2".to_string(), RefreshMode::Add, 2),
                ("3".to_string(), RefreshMode::Add, 2),
                ("4".to_string(), RefreshMode::Add, 2),
                ("5".to_string(), RefreshMode::Add, 1),
                ("6".to_string(), RefreshMode::Add, 2),
            ]
        );
        assert_eq!(session.unsubscribe_all().await, 6);
    }

    #[tokio::test]
    async fn condition_requests_need_a_connection() {
        let (connector, _servers) = FakeConnector::new(&[LOGIN_OK]);
        let session = StreamingSession::builder(config()).connector(connector).build();

        assert_eq!(
            session.request_condition_list().await,
            Err(SessionError::NotConnected)
        );
        assert_eq!(
            session.request_condition_search("1").await,
            Err(SessionError::NotConnected)
        );
    }

    #[tokio::test]
    async fn connect_replays_and_streams() {
        let (connector, mut servers) = FakeConnector::new(&[LOGIN_OK]);
        let session = StreamingSession::builder(config()).connector(connector).build();
        session
            .subscribe(&["005930"], &[DataType::StockTrade], "g1", RefreshMode::Replace)
            .await
            .unwrap();

        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Streaming);

        let mut server = next_server(&mut servers).await;
        assert!(server.recv_text().await.contains("LOGIN"));
        let reg = server.recv_text().await;
        assert!(reg.contains("\"REG\"") && reg.contains("005930"));

        session.request_condition_list().await.unwrap();
        assert_eq!(server.recv_text().await, r#"{"trnm":"CNSRLST"}"#);

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.closed().await, Ok(()));
    }

    #[tokio::test]
    async fn failed_connect_leaves_session_disconnected() {
        let (connector, _servers) = FakeConnector::new(&[LOGIN_OK]);
        connector.refuse(true);
        let session = StreamingSession::builder(config()).connector(connector.clone()).build();

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, ConnectError::Connection(_)));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn drop_without_auto_reconnect_closes_session() {
        let (connector, mut servers) = FakeConnector::new(&[LOGIN_OK]);
        let session = StreamingSession::builder(StreamConfig {
            auto_reconnect: false,
            ..config()
        })
        .connector(connector)
        .build();

        session.connect().await.unwrap();
        drop(next_server(&mut servers).await);

        let outcome = tokio::time::timeout(Duration::from_secs(1), session.closed())
            .await
            .unwrap();
        assert_eq!(outcome, Err(SessionError::ConnectionLost { attempts: 0 }));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn run_scoped_always_disconnects() {
        let (connector, _servers) = FakeConnector::new(&[LOGIN_OK]);
        let session = StreamingSession::builder(config()).connector(connector).build();

        let state_inside = session
            .run_scoped(async |s: &StreamingSession| s.state())
            .await
            .unwrap();

        assert_eq!(state_inside, SessionState::Streaming);
        assert_eq!(session.state(), SessionState::Closed);
    }
}
