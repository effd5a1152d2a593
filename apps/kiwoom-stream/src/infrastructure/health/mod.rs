//! Session Health Endpoint
//!
//! Small axum server for orchestrators and scrapers. Everything it reports
//! is read from the shared [`StreamingSession`].
//!
//! | Route      | Body                              | Status                           |
//! |------------|-----------------------------------|----------------------------------|
//! | `/health`  | [`HealthResponse`] as JSON        | 503 when the session is down     |
//! | `/healthz` | `OK`                              | always 200                       |
//! | `/readyz`  | [`Readiness`] as JSON             | 200 only while STREAMING         |
//! | `/metrics` | Prometheus text                   | 503 before the recorder exists   |

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::domain::streaming::SessionState;
use crate::infrastructure::kiwoom::{SessionStats, StreamingSession};
use crate::infrastructure::metrics::get_metrics_handle;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

// =============================================================================
// Response Types
// =============================================================================

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Summary derived from the session state.
    pub status: HealthStatus,
    /// Crate version.
    pub version: String,
    /// Seconds since the server state was created.
    pub uptime_secs: u64,
    /// Time the response was built.
    pub current_time: DateTime<Utc>,
    /// Session snapshot.
    pub session: SessionStats,
}

/// Coarse session health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Streaming.
    Healthy,
    /// Connecting or recovering.
    Degraded,
    /// No connection and none being attempted.
    Unhealthy,
}

impl From<SessionState> for HealthStatus {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Streaming => Self::Healthy,
            SessionState::Connecting | SessionState::Authenticated | SessionState::Reconnecting => {
                Self::Degraded
            }
            SessionState::Disconnected | SessionState::Closed => Self::Unhealthy,
        }
    }
}

impl HealthStatus {
    const fn http_status(self) -> StatusCode {
        match self {
            Self::Healthy | Self::Degraded => StatusCode::OK,
            Self::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Body of `GET /readyz`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Readiness {
    /// Whether events are flowing.
    pub ready: bool,
    /// Current session state.
    pub state: SessionState,
}

// =============================================================================
// Server
// =============================================================================

/// What the handlers read from.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    session: Arc<StreamingSession>,
}

impl HealthServerState {
    /// Report on `session`, tagging responses with `version`.
    #[must_use]
    pub fn new(version: String, session: Arc<StreamingSession>) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            session,
        }
    }

    fn snapshot(&self) -> HealthResponse {
        let session = self.session.stats();
        HealthResponse {
            status: session.state.into(),
            version: self.version.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            current_time: Utc::now(),
            session,
        }
    }

    fn readiness(&self) -> Readiness {
        let state = self.session.state();
        Readiness {
            ready: state == SessionState::Streaming,
            state,
        }
    }
}

/// HTTP server for the routes above.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    shutdown: CancellationToken,
}

impl HealthServer {
    /// Serve on `0.0.0.0:port` until `shutdown` fires.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, shutdown: CancellationToken) -> Self {
        Self {
            port,
            state,
            shutdown,
        }
    }

    /// Bind and serve.
    ///
    /// # Errors
    ///
    /// [`HealthServerError::Bind`] if the port is taken,
    /// [`HealthServerError::Serve`] if axum fails afterwards.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let port = self.port;
        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port)))
            .await
            .map_err(|source| HealthServerError::Bind { port, source })?;

        tracing::info!(port, "Health endpoint listening");

        axum::serve(listener, routes(self.state))
            .with_graceful_shutdown(self.shutdown.cancelled_owned())
            .await
            .map_err(HealthServerError::Serve)?;

        tracing::info!(port, "Health endpoint stopped");
        Ok(())
    }
}

fn routes(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(session_health))
        .route("/healthz", get(alive))
        .route("/readyz", get(session_ready))
        .route("/metrics", get(prometheus))
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

async fn session_health(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let body = state.snapshot();
    (body.status.http_status(), Json(body))
}

async fn alive() -> &'static str {
    "OK"
}

async fn session_ready(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let body = state.readiness();
    let code = if body.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

async fn prometheus() -> impl IntoResponse {
    match get_metrics_handle() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", PROMETHEUS_CONTENT_TYPE)],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain")],
            "metrics recorder not installed".to_string(),
        ),
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health endpoint failures.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// The port could not be bound.
    #[error("cannot bind health endpoint on port {port}")]
    Bind {
        /// Requested port.
        port: u16,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// axum stopped with an error.
    #[error("health endpoint failed")]
    Serve(#[source] io::Error),
}
