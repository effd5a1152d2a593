//! Kiwoom WebSocket Adapters
//!
//! Everything that speaks Kiwoom's real-time protocol:
//!
//! - **codec** / **messages**: JSON wire format
//! - **auth**: bearer token and `LOGIN` exchange
//! - **connection**: one authenticated link with read/write tasks
//! - **heartbeat** / **reconnect**: liveness and backoff
//! - **websocket**: `tokio-tungstenite` transport
//! - **session**: the [`StreamingSession`] façade

pub mod auth;
pub mod codec;
pub mod connection;
pub mod heartbeat;
pub mod messages;
pub mod reconnect;
pub mod session;
pub mod websocket;

#[cfg(test)]
mod test_support;

pub use auth::{AccessToken, AuthError, LoginHandler, LoginState};
pub use codec::{Ack, CodecError, ControlMessage, DecodeError, Decoded, KiwoomCodec};
pub use connection::{ConnectError, ConnectionSettings, DisconnectReason, LiveConnection};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, HeartbeatState};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use session::{SessionBuilder, SessionError, SessionStats, StreamingSession};
pub use websocket::TungsteniteConnector;
