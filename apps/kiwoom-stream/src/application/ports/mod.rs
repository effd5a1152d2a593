//! Port Interfaces
//!
//! Defines the transport the streaming session is written against. The
//! session never touches a WebSocket library directly; it asks a
//! [`Connector`] for a split duplex link and talks [`Frame`]s over it.
//!
//! ## Driven Ports (Outbound)
//!
//! - `Connector`: opens a link to the feed endpoint
//! - `FrameSink`: write half of an open link
//! - `FrameStream`: read half of an open link

use async_trait::async_trait;

/// A single transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame (every feed message).
    Text(String),
    /// Binary frame; the feed never sends these.
    Binary(Vec<u8>),
    /// Transport-level ping.
    Ping(Vec<u8>),
    /// Transport-level pong.
    Pong(Vec<u8>),
    /// Close frame.
    Close,
}

impl Frame {
    /// Create a text frame.
    #[must_use]
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text(body.into())
    }
}

/// Transport failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Could not open the link (DNS, refused, TLS, handshake).
    #[error("connect failed: {0}")]
    Connect(String),

    /// Writing a frame failed.
    #[error("send failed: {0}")]
    Send(String),

    /// Reading a frame failed.
    #[error("receive failed: {0}")]
    Receive(String),

    /// The link is already closed.
    #[error("connection closed")]
    Closed,
}

/// Write half of an open link.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one frame.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Close the link, best effort.
    async fn close(&mut self);
}

/// Read half of an open link.
#[async_trait]
pub trait FrameStream: Send {
    /// Next inbound frame, or `None` once the peer has gone away.
    async fn next(&mut self) -> Option<Result<Frame, TransportError>>;
}

/// An open, split link.
pub type Link = (Box<dyn FrameSink>, Box<dyn FrameStream>);

/// Opens links to the feed.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a link to `url`, presenting `token` as a bearer credential
    /// on the upgrade request.
    async fn connect(&self, url: &str, token: &str) -> Result<Link, TransportError>;
}
