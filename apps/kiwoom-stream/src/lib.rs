#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Kiwoom Stream - Real-time Market Data Session
//!
//! Keeps one authenticated WebSocket session to Kiwoom's real-time feed,
//! remembers every subscription so it can be replayed after a reconnect,
//! and fans decoded events out to callbacks registered per data type.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Feed data types and subscription state
//!   - `streaming`: Data type codes, decoded events, session state
//!   - `subscription`: Subscription groups and the replay registry
//!
//! - **Application**: Ports and services
//!   - `ports`: Transport interfaces (`Connector`, frame sink/stream)
//!   - `services`: Callback dispatcher with per-handler isolation
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `kiwoom`: Codec, login, heartbeat, reconnect, the session itself
//!   - `config`: Environment-driven configuration
//!   - `health`: Health check HTTP endpoint
//!   - `metrics` / `telemetry`: Prometheus and OpenTelemetry
//!
//! # Data Flow
//!
//! ```text
//! Kiwoom WS ──► read loop ──► codec ──► dispatch queue ──► dispatcher ──► callbacks
//!     ▲                                        │
//!     │                                        └──────────► broadcast ──► event streams
//!     └── write loop ◄── REG / REMOVE / PING ◄── session + heartbeat
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Feed types with no network dependencies.
pub mod domain;

/// Application layer - Ports and dispatch services.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::streaming::{DataType, RealtimeEvent, SessionState};
pub use domain::subscription::{RefreshMode, SubscribeError, Subscription, SubscriptionRegistry};

// Application
pub use application::ports::{Connector, Frame, Link, TransportError};
pub use application::services::{Callback, CallbackId, HandlerError};

// Session
pub use infrastructure::kiwoom::{
    AccessToken, ConnectError, SessionBuilder, SessionError, SessionStats, StreamingSession,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, Environment, StreamConfig};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
