//! Local Kiwoom-like WebSocket server for integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;

use kiwoom_stream::application::services::Callback;
use kiwoom_stream::{AccessToken, RealtimeEvent, StreamConfig};

pub const TOKEN: &str = "test-token";
pub const LOGIN_OK: &str = r#"{"trnm":"LOGIN","return_code":0,"return_msg":""}"#;
pub const WAIT: Duration = Duration::from_secs(3);

/// Config pointed at `url` with fast backoff and a quiet heartbeat.
pub fn config(url: &str) -> StreamConfig {
    StreamConfig {
        url: Some(url.to_string()),
        reconnect_delay_initial: Duration::from_millis(20),
        reconnect_delay_max: Duration::from_millis(50),
        login_timeout: Duration::from_millis(500),
        heartbeat_interval: Duration::from_secs(60),
        heartbeat_timeout: Duration::from_secs(60),
        health_port: 0,
        ..StreamConfig::new(AccessToken::new(TOKEN).unwrap())
    }
}

/// A `REAL` frame carrying one stock trade tick.
pub fn trade_frame(symbol: &str, price: &str) -> String {
    format!(
        r#"{{"trnm":"REAL","data":[{{"type":"0B","name":"stock trade","item":"{symbol}","values":{{"10":"{price}","20":"090000"}}}}]}}"#
    )
}

/// Callback that records every event and wakes waiters.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<parking_lot::Mutex<Vec<RealtimeEvent>>>,
    count: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl Recorder {
    pub fn callback(&self) -> Callback {
        let recorder = self.clone();
        Callback::immediate(move |event| {
            recorder.events.lock().push(event.clone());
            recorder.count.fetch_add(1, Ordering::SeqCst);
            recorder.notify.notify_waiters();
            Ok(())
        })
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<RealtimeEvent> {
        self.events.lock().clone()
    }

    pub async fn wait_for(&self, n: usize) {
        timeout(WAIT, async {
            loop {
                let notified = self.notify.notified();
                if self.count() >= n {
                    return;
                }
                notified.await;
            }
        })
        .await
        .expect("events delivered in time");
    }
}

// =============================================================================
// Server
// =============================================================================

/// Accepts WebSocket connections and hands each one to the test.
pub struct MockKiwoom {
    addr: SocketAddr,
    conns: mpsc::UnboundedReceiver<ServerConn>,
    accept_task: JoinHandle<()>,
}

impl MockKiwoom {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, conns) = mpsc::unbounded_channel();

        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Some(conn) = ServerConn::accept(stream).await
                    && tx.send(conn).is_err()
                {
                    break;
                }
            }
        });

        Self {
            addr,
            conns,
            accept_task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn next_conn(&mut self) -> ServerConn {
        timeout(WAIT, self.conns.recv())
            .await
            .expect("client connected in time")
            .expect("server alive")
    }

    /// Stop listening. Later connection attempts are refused.
    pub fn stop(&self) {
        self.accept_task.abort();
    }
}

impl Drop for MockKiwoom {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Server side of one accepted connection.
pub struct ServerConn {
    ws: WebSocketStream<TcpStream>,
    pub authorization: Option<String>,
}

impl ServerConn {
    async fn accept(stream: TcpStream) -> Option<Self> {
        let mut authorization = None;
        let callback = |req: &Request, resp: Response| {
            authorization = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Ok::<Response, ErrorResponse>(resp)
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .ok()?;
        Some(Self { ws, authorization })
    }

    /// Next JSON frame from the client. Heartbeat `PING`s are skipped.
    pub async fn recv_json(&mut self) -> Value {
        timeout(WAIT, async {
            loop {
                let message = self
                    .ws
                    .next()
                    .await
                    .expect("client connection open")
                    .expect("client frame readable");
                if let Message::Text(text) = message {
                    let value: Value = serde_json::from_str(&text).expect("client sent JSON");
                    if value["trnm"] != "PING" {
                        return value;
                    }
                }
            }
        })
        .await
        .expect("client frame in time")
    }

    pub async fn send(&mut self, text: &str) {
        self.ws.send(Message::Text(text.into())).await.unwrap();
    }

    /// Read the `LOGIN` frame and acknowledge it.
    pub async fn accept_login(&mut self) -> Value {
        let login = self.recv_json().await;
        assert_eq!(login["trnm"], "LOGIN");
        self.send(LOGIN_OK).await;
        login
    }

    /// Read `n` `REG` frames, returning their group ids in arrival order.
    pub async fn recv_registrations(&mut self, n: usize) -> Vec<String> {
        let mut groups = Vec::with_capacity(n);
        for _ in 0..n {
            let frame = self.recv_json().await;
            assert_eq!(frame["trnm"], "REG", "unexpected frame {frame}");
            groups.push(frame["grp_no"].as_str().unwrap().to_string());
        }
        groups
    }

    /// Assert the client sends nothing besides heartbeats for `quiet`.
    pub async fn expect_no_more_frames(&mut self, quiet: Duration) {
        if let Ok(extra) = timeout(quiet, self.recv_json()).await {
            panic!("unexpected client frame {extra}");
        }
    }

    /// Close the connection from the server side.
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
