//! Heartbeat Monitor
//!
//! Sends a `PING` at a fixed interval and reports a timeout when nothing
//! at all arrives from the server within the grace window that follows.
//! Any inbound frame counts as proof of life, not just `PONG`.
//!
//! A timeout is a disconnect: the connection reports it and the session
//! supervisor decides whether to reconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::config::StreamConfig;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// How long to wait for any inbound traffic after a ping.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
        }
    }

    /// Build from the stream configuration.
    #[must_use]
    pub const fn from_stream_config(config: &StreamConfig) -> Self {
        Self {
            ping_interval: config.heartbeat_interval,
            pong_timeout: config.heartbeat_timeout,
        }
    }
}

/// Events emitted by the heartbeat monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a ping now.
    SendPing,
    /// Nothing arrived within the grace window; the link is dead.
    Timeout {
        /// Time since the last inbound frame.
        silent_for: Duration,
    },
}

/// Liveness shared between the read loop and the monitor.
#[derive(Debug)]
pub struct HeartbeatState {
    last_activity: RwLock<Instant>,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create new heartbeat state, counting now as the last activity.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_activity: RwLock::new(Instant::now()),
        }
    }

    /// Record that a frame arrived.
    pub fn record_activity(&self) {
        *self.last_activity.write() = Instant::now();
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn silent_for(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    /// Whether anything arrived after `since`.
    #[must_use]
    pub fn active_since(&self, since: Instant) -> bool {
        *self.last_activity.read() >= since
    }
}

/// Heartbeat monitor for one connection.
///
/// # Example
///
/// ```rust,no_run
/// use kiwoom_stream::infrastructure::kiwoom::heartbeat::{
///     HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, HeartbeatState,
/// };
/// use std::sync::Arc;
/// use tokio::sync::mpsc;
/// use tokio_util::sync::CancellationToken;
///
/// async fn example() {
///     let state = Arc::new(HeartbeatState::new());
///     let (event_tx, mut event_rx) = mpsc::channel(4);
///     let cancel = CancellationToken::new();
///
///     let monitor = HeartbeatMonitor::new(HeartbeatConfig::default(), state.clone(), event_tx, cancel);
///     tokio::spawn(monitor.run());
///
///     while let Some(event) = event_rx.recv().await {
///         match event {
///             HeartbeatEvent::SendPing => { /* write {"trnm":"PING"} */ }
///             HeartbeatEvent::Timeout { .. } => break,
///         }
///     }
/// }
/// ```
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatMonitor {
    /// Create a new heartbeat monitor.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled, the event channel closes, or a timeout fires.
    pub async fn run(self) {
        let start = tokio::time::Instant::now() + self.config.ping_interval;
        let mut interval = tokio::time::interval_at(start, self.config.ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat monitor cancelled");
                    return;
                }
                _ = interval.tick() => {}
            }

            let sent_at = Instant::now();
            if self.event_tx.send(HeartbeatEvent::SendPing).await.is_err() {
                tracing::debug!("Heartbeat channel closed, stopping monitor");
                return;
            }

            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat monitor cancelled");
                    return;
                }
                () = tokio::time::sleep(self.config.pong_timeout) => {}
            }

            if !self.state.active_since(sent_at) {
                let silent_for = self.state.silent_for();
                tracing::warn!(
                    silent_ms = u64::try_from(silent_for.as_millis()).unwrap_or(u64::MAX),
                    timeout_ms = u64::try_from(self.config.pong_timeout.as_millis()).unwrap_or(u64::MAX),
                    "Heartbeat timeout detected"
                );
                let _ = self.event_tx.send(HeartbeatEvent::Timeout { silent_for }).await;
                return;
            }
        }
    }
}
