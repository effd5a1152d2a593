//! Prometheus Metrics Module
//!
//! Exposes streaming client metrics via Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Events**: Real-time events received and dropped, by data type
//! - **Frames**: Inbound frames rejected by the codec
//! - **Handlers**: Callback failures
//! - **Connection**: Session state and reconnection attempts
//! - **Subscriptions**: Registered `(symbol, data type)` pairs
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! functions are no-ops until a recorder is installed.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::streaming::{DataType, SessionState};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Safe to call more than once; later calls return the first handle.
///
/// # Errors
///
/// Returns an error if the global recorder cannot be installed (for
/// example when another recorder is already set).
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();

    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "kiwoom_stream_events_received_total",
        "Total real-time events decoded from the feed"
    );
    describe_counter!(
        "kiwoom_stream_events_dropped_total",
        "Total events dropped before dispatch"
    );
    describe_counter!(
        "kiwoom_stream_decode_errors_total",
        "Total inbound frames rejected by the codec"
    );
    describe_counter!(
        "kiwoom_stream_handler_failures_total",
        "Total callback errors and panics"
    );
    describe_counter!(
        "kiwoom_stream_reconnects_total",
        "Total reconnection attempts"
    );

    describe_gauge!(
        "kiwoom_stream_connection_state",
        "Current session state (1 for the active state label)"
    );
    describe_gauge!(
        "kiwoom_stream_subscription_pairs",
        "Registered (symbol, data type) pairs"
    );

    describe_histogram!(
        "kiwoom_stream_dispatch_seconds",
        "Time to run immediate callbacks for one event"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Why an event never reached the dispatcher.
#[derive(Debug, Clone, Copy)]
pub enum DropReason {
    /// Dispatch queue was full.
    QueueFull,
    /// No active subscription covers the event.
    NotSubscribed,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::NotSubscribed => "not_subscribed",
        }
    }
}

/// Record an event decoded from the feed.
pub fn record_event_received(data_type: DataType) {
    counter!(
        "kiwoom_stream_events_received_total",
        "data_type" => data_type.code()
    )
    .increment(1);
}

/// Record an event dropped before dispatch.
pub fn record_event_dropped(data_type: DataType, reason: DropReason) {
    counter!(
        "kiwoom_stream_events_dropped_total",
        "data_type" => data_type.code(),
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record a frame the codec rejected.
pub fn record_decode_error() {
    counter!("kiwoom_stream_decode_errors_total").increment(1);
}

/// Record a failed or panicked callback.
pub fn record_handler_failure(data_type: DataType) {
    counter!(
        "kiwoom_stream_handler_failures_total",
        "data_type" => data_type.code()
    )
    .increment(1);
}

/// Record a reconnection attempt.
pub fn record_reconnect() {
    counter!("kiwoom_stream_reconnects_total").increment(1);
}

/// Publish the session state, zeroing every other state label.
pub fn set_connection_state(state: SessionState) {
    for candidate in [
        SessionState::Disconnected,
        SessionState::Connecting,
        SessionState::Authenticated,
        SessionState::Streaming,
        SessionState::Reconnecting,
        SessionState::Closed,
    ] {
        let value = if candidate == state { 1.0 } else { 0.0 };
        gauge!(
            "kiwoom_stream_connection_state",
            "state" => candidate.as_str()
        )
        .set(value);
    }
}

/// Update the registered pair count.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscription_pairs(count: usize) {
    gauge!("kiwoom_stream_subscription_pairs").set(count as f64);
}

/// Record how long immediate callbacks took for one event.
pub fn record_dispatch_duration(data_type: DataType, duration: Duration) {
    histogram!(
        "kiwoom_stream_dispatch_seconds",
        "data_type" => data_type.code()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
