//! Kiwoom Stream Binary
//!
//! Connects one streaming session, subscribes the configured symbols to
//! trade ticks and the order book, and logs what arrives.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin kiwoom-stream
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `KIWOOM_ACCESS_TOKEN`: OAuth access token
//!
//! ## Optional
//! - `KIWOOM_ENV`: SANDBOX | PRODUCTION (default: SANDBOX)
//! - `KIWOOM_WS_URL`: Override the WebSocket endpoint
//! - `KIWOOM_SYMBOLS`: Comma-separated symbols to subscribe (default: none)
//! - `KIWOOM_AUTO_RECONNECT`: Reconnect after a lost link (default: true)
//! - `KIWOOM_MAX_RECONNECT_ATTEMPTS`: Reconnect budget (default: 5)
//! - `KIWOOM_RECONNECT_DELAY_INITIAL_MS`: First backoff delay (default: 1000)
//! - `KIWOOM_RECONNECT_DELAY_MAX_SECS`: Backoff ceiling (default: 30)
//! - `KIWOOM_RECONNECT_DELAY_MULTIPLIER`: Backoff growth (default: 2.0)
//! - `KIWOOM_SUBSCRIPTION_LIMIT`: Max (symbol, type) pairs (default: 100)
//! - `KIWOOM_LOGIN_TIMEOUT_SECS`: Login ack deadline (default: 10)
//! - `KIWOOM_HEARTBEAT_INTERVAL_SECS`: Idle time before a PING (default: 30)
//! - `KIWOOM_HEARTBEAT_TIMEOUT_SECS`: Grace after a PING (default: 10)
//! - `KIWOOM_DISPATCH_QUEUE_CAPACITY`: Inbound event queue (default: 10000)
//! - `KIWOOM_HEALTH_PORT`: Health check HTTP port, 0 disables (default: 8083)
//! - `OTEL_ENABLED`: Enable OpenTelemetry export (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: kiwoom-stream)
//! - `RUST_LOG`: Log filter (default: `kiwoom_stream=info`)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use kiwoom_stream::infrastructure::config::load_dotenv;
use kiwoom_stream::infrastructure::health::{HealthServer, HealthServerState};
use kiwoom_stream::infrastructure::telemetry;
use kiwoom_stream::{Callback, DataType, StreamConfig, StreamingSession, init_metrics};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Already installed is fine.
    let _ = rustls::crypto::ring::default_provider().install_default();

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Kiwoom stream");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed");
    }

    let config = StreamConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    let symbols = config.symbols.clone();
    let health_port = config.health_port;
    let session = Arc::new(StreamingSession::new(config));

    if health_port != 0 {
        let health_state = Arc::new(HealthServerState::new(
            env!("CARGO_PKG_VERSION").to_string(),
            Arc::clone(&session),
        ));
        let health_server = HealthServer::new(health_port, health_state, shutdown_token.clone());
        tokio::spawn(async move {
            if let Err(e) = health_server.run().await {
                tracing::error!(error = %e, "Health server error");
            }
        });
    }

    register_logging_callbacks(&session);

    session
        .connect()
        .await
        .context("failed to open streaming session")?;

    if symbols.is_empty() {
        tracing::warn!("KIWOOM_SYMBOLS is empty, nothing to subscribe");
    } else {
        session.subscribe_stock_price(symbols.as_slice()).await?;
        session.subscribe_order_book(symbols.as_slice()).await?;
    }

    tracing::info!(session_id = %session.session_id(), "Kiwoom stream ready");

    let outcome = tokio::select! {
        () = await_shutdown(shutdown_token.clone()) => Ok(()),
        result = session.closed() => {
            shutdown_token.cancel();
            result
        }
    };

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, session.disconnect())
        .await
        .is_err()
    {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Session did not stop in time"
        );
    }

    let stats = session.stats();
    tracing::info!(
        events_delivered = stats.events_delivered,
        callback_failures = stats.callback_failures,
        reconnect_attempts = stats.reconnect_attempts,
        "Kiwoom stream stopped"
    );

    outcome.context("streaming session ended")
}

/// Log trade ticks and order book updates.
fn register_logging_callbacks(session: &StreamingSession) {
    session.add_callback(
        DataType::StockTrade,
        Callback::immediate(|event| {
            tracing::info!(
                symbol = event.symbol(),
                price = ?event.decimal("10"),
                volume = ?event.field("15"),
                time = ?event.trade_time(),
                "Trade"
            );
            Ok(())
        }),
    );

    session.add_callback(
        DataType::OrderBook,
        Callback::immediate(|event| {
            tracing::debug!(
                symbol = event.symbol(),
                best_ask = ?event.field("41"),
                best_bid = ?event.field("51"),
                "Order book"
            );
            Ok(())
        }),
    );
}

/// Log the parsed configuration.
fn log_config(config: &StreamConfig) {
    tracing::info!(
        environment = config.environment.as_str(),
        auto_reconnect = config.auto_reconnect,
        max_reconnect_attempts = config.max_reconnect_attempts,
        subscription_limit = config.subscription_limit,
        symbols = config.symbols.len(),
        health_port = config.health_port,
        "Configuration loaded"
    );
    tracing::debug!(url = %config.ws_url(), "WebSocket endpoint");
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
