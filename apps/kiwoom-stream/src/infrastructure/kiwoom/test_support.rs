//! In-memory links for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc as fmpsc;
use tokio::sync::mpsc;

use crate::application::ports::{Connector, Frame, FrameSink, FrameStream, Link, TransportError};

pub const LOGIN_OK: &str = r#"{"trnm":"LOGIN","return_code":0,"return_msg":""}"#;
pub const LOGIN_REJECTED: &str = r#"{"trnm":"LOGIN","return_code":8005,"return_msg":"bad token"}"#;

struct ChannelSink(fmpsc::UnboundedSender<Frame>);

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.0.unbounded_send(frame).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) {
        let _ = self.0.unbounded_send(Frame::Close);
        self.0.close_channel();
    }
}

struct ChannelStream(fmpsc::UnboundedReceiver<Result<Frame, TransportError>>);

#[async_trait]
impl FrameStream for ChannelStream {
    async fn next(&mut self) -> Option<Result<Frame, TransportError>> {
        StreamExt::next(&mut self.0).await
    }
}

/// Server side of an in-memory link.
pub struct ServerEnd {
    pub from_client: fmpsc::UnboundedReceiver<Frame>,
    pub to_client: fmpsc::UnboundedSender<Result<Frame, TransportError>>,
}

impl ServerEnd {
    pub fn push(&self, text: &str) {
        let _ = self.to_client.unbounded_send(Ok(Frame::text(text)));
    }

    pub fn push_frame(&self, frame: Frame) {
        let _ = self.to_client.unbounded_send(Ok(frame));
    }

    pub async fn recv(&mut self) -> Frame {
        tokio::time::timeout(Duration::from_secs(2), self.from_client.next())
            .await
            .expect("client frame in time")
            .expect("client link open")
    }

    pub async fn recv_text(&mut self) -> String {
        match self.recv().await {
            Frame::Text(text) => text,
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

pub fn link_pair() -> (Link, ServerEnd) {
    let (client_tx, from_client) = fmpsc::unbounded();
    let (to_client, client_rx) = fmpsc::unbounded();
    let link: Link = (
        Box::new(ChannelSink(client_tx)),
        Box::new(ChannelStream(client_rx)),
    );
    (
        link,
        ServerEnd {
            from_client,
            to_client,
        },
    )
}

struct FakeState {
    greeting: Vec<String>,
    refuse: AtomicBool,
    attempts: AtomicU32,
    servers: mpsc::UnboundedSender<ServerEnd>,
}

/// Connector that opens in-memory links and hands the server side to the test.
#[derive(Clone)]
pub struct FakeConnector(Arc<FakeState>);

impl FakeConnector {
    /// Every link starts with `greeting` already queued for the client.
    pub fn new(greeting: &[&str]) -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let state = FakeState {
            greeting: greeting.iter().map(|s| (*s).to_string()).collect(),
            refuse: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            servers,
        };
        (Self(Arc::new(state)), rx)
    }

    pub fn refuse(&self, refuse: bool) {
        self.0.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.0.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _url: &str, _token: &str) -> Result<Link, TransportError> {
        self.0.attempts.fetch_add(1, Ordering::SeqCst);
        if self.0.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        let (link, server) = link_pair();
        for text in &self.0.greeting {
            server.push(text);
        }
        let _ = self.0.servers.send(server);
        Ok(link)
    }
}

pub async fn next_server(rx: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("link opened in time")
        .expect("connector alive")
}

/// Sink that takes the `LOGIN` frame and then hangs on every later write
/// and on close.
struct StallingSink {
    accepted: bool,
}

#[async_trait]
impl FrameSink for StallingSink {
    async fn send(&mut self, _frame: Frame) -> Result<(), TransportError> {
        if !self.accepted {
            self.accepted = true;
            return Ok(());
        }
        std::future::pending().await
    }

    async fn close(&mut self) {
        std::future::pending::<()>().await;
    }
}

/// Stream that acknowledges the login and then goes quiet.
struct QuietAfterLogin {
    acked: bool,
}

#[async_trait]
impl FrameStream for QuietAfterLogin {
    async fn next(&mut self) -> Option<Result<Frame, TransportError>> {
        if !self.acked {
            self.acked = true;
            return Some(Ok(Frame::text(LOGIN_OK)));
        }
        std::future::pending().await
    }
}

/// Connector whose links log in and then stop draining writes.
pub struct StallingConnector;

#[async_trait]
impl Connector for StallingConnector {
    async fn connect(&self, _url: &str, _token: &str) -> Result<Link, TransportError> {
        Ok((
            Box::new(StallingSink { accepted: false }),
            Box::new(QuietAfterLogin { acked: false }),
        ))
    }
}
