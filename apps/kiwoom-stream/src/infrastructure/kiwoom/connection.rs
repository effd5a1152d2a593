//! Connection Manager
//!
//! Owns one physical link to the feed: opens it through the [`Connector`]
//! port, performs the `LOGIN` exchange, then runs a read task and a write
//! task until either side fails or the owner shuts the link down.
//!
//! # Tasks
//!
//! - **read**: decodes inbound frames, forwards events to the dispatch
//!   queue, answers server `PING`s, records heartbeat activity
//! - **write**: serialises every outbound frame through one bounded channel;
//!   each socket write is bounded by `write_timeout` and abandoned on cancel
//! - **heartbeat**: the monitor plus a relay that queues pings and reports
//!   silence straight to the disconnect signal, so a stalled write cannot
//!   hide a dead link
//!
//! The first failure of any task is reported once through the
//! disconnect receiver returned by [`establish`]. An owner-initiated
//! [`LiveConnection::shutdown`] reports nothing.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::application::ports::{Connector, Frame, FrameSink, FrameStream, TransportError};
use crate::domain::streaming::RealtimeEvent;
use crate::infrastructure::config::StreamConfig;
use crate::infrastructure::metrics::{self, DropReason};

use super::auth::{AccessToken, AuthError, LoginHandler};
use super::codec::{CodecError, ControlMessage, Decoded, KiwoomCodec};
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, HeartbeatState};

/// Capacity of the outbound frame queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// How long a best-effort close frame may take.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Error Types
// =============================================================================

/// Failure to bring a link up to the authenticated state.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Transport failure before the login ack.
    #[error("connection failed: {0}")]
    Connection(#[from] TransportError),

    /// Login rejected.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// No login ack within the allowed time.
    #[error("login ack not received within {0:?}")]
    Timeout(Duration),

    /// Login frame could not be encoded.
    #[error("failed to encode login: {0}")]
    Codec(#[from] CodecError),
}

/// Why an established link went away.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DisconnectReason {
    /// No inbound traffic after a ping.
    #[error("heartbeat timeout after {silent_for:?} of silence")]
    HeartbeatTimeout {
        /// Time since the last inbound frame.
        silent_for: Duration,
    },

    /// The server sent a close frame.
    #[error("server closed the connection")]
    ClosedByServer,

    /// The inbound stream ended without a close frame.
    #[error("stream ended")]
    StreamEnded,

    /// A socket write did not complete in time.
    #[error("write stalled for {0:?}")]
    WriteStalled(Duration),

    /// Reading or writing failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

// =============================================================================
// Settings
// =============================================================================

/// Per-link settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Endpoint URL.
    pub url: String,
    /// Bearer token for the upgrade header and `LOGIN`.
    pub token: AccessToken,
    /// Time allowed for the login ack.
    pub login_timeout: Duration,
    /// Heartbeat timing.
    pub heartbeat: HeartbeatConfig,
    /// Capacity of the outbound frame queue.
    pub outbound_capacity: usize,
    /// Longest a single socket write may take.
    pub write_timeout: Duration,
}

impl ConnectionSettings {
    /// Build from the stream configuration.
    #[must_use]
    pub fn from_stream_config(config: &StreamConfig) -> Self {
        Self {
            url: config.ws_url().to_string(),
            token: config.token.clone(),
            login_timeout: config.login_timeout,
            heartbeat: HeartbeatConfig::from_stream_config(config),
            outbound_capacity: OUTBOUND_QUEUE_CAPACITY,
            write_timeout: config.heartbeat_timeout,
        }
    }
}

// =============================================================================
// Live Connection
// =============================================================================

/// Reports the first disconnect reason and stops the link.
struct DisconnectSignal {
    tx: Mutex<Option<oneshot::Sender<DisconnectReason>>>,
    cancel: CancellationToken,
}

impl DisconnectSignal {
    fn report(&self, reason: DisconnectReason) {
        if let Some(tx) = self.tx.lock().take() {
            tracing::warn!(reason = %reason, "Connection lost");
            let _ = tx.send(reason);
        }
        self.cancel.cancel();
    }

    fn silence(&self) {
        self.tx.lock().take();
    }
}

/// An authenticated link with its read and write tasks running.
pub struct LiveConnection {
    outbound: mpsc::Sender<Frame>,
    signal: Arc<DisconnectSignal>,
    tracker: TaskTracker,
}

impl std::fmt::Debug for LiveConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConnection")
            .field("closed", &self.is_closed())
            .field("tasks", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

impl LiveConnection {
    /// Queue a text frame for the write task.
    ///
    /// Waits while the queue is full, but never past the link stopping.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the link has stopped.
    pub async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            biased;
            () = self.signal.cancel.cancelled() => Err(TransportError::Closed),
            sent = self.outbound.send(Frame::Text(text)) => sent.map_err(|_| TransportError::Closed),
        }
    }

    /// Whether the link has stopped for any reason.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.signal.cancel.is_cancelled() || self.outbound.is_closed()
    }

    /// Stop both loops, send a close frame best-effort, and wait for the
    /// tasks. Nothing is reported on the disconnect receiver.
    pub async fn shutdown(self) {
        self.signal.silence();
        self.signal.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::debug!("Connection shut down");
    }
}

// =============================================================================
// Establish
// =============================================================================

/// Open a link, log in, and start the connection tasks.
///
/// Events decoded by the read task are pushed to `dispatch_tx` without
/// waiting; when the queue is full they are dropped and counted.
///
/// # Errors
///
/// - [`ConnectError::Connection`] if the transport fails before the ack
/// - [`ConnectError::Auth`] if the server rejects the token
/// - [`ConnectError::Timeout`] if no ack arrives within `login_timeout`
pub async fn establish(
    connector: &dyn Connector,
    settings: &ConnectionSettings,
    dispatch_tx: mpsc::Sender<RealtimeEvent>,
    parent: &CancellationToken,
) -> Result<(LiveConnection, oneshot::Receiver<DisconnectReason>), ConnectError> {
    tracing::info!(url = %settings.url, "Connecting to Kiwoom stream");

    let codec = KiwoomCodec::new();
    let (mut sink, mut stream) = connector
        .connect(&settings.url, settings.token.expose())
        .await?;

    let mut login = LoginHandler::new(settings.token.clone());
    let frame = login.login_frame(&codec)?;
    sink.send(Frame::Text(frame)).await?;

    let login_result = tokio::time::timeout(
        settings.login_timeout,
        await_login_ack(&codec, &mut login, sink.as_mut(), stream.as_mut()),
    )
    .await;

    match login_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            close_sink(sink.as_mut()).await;
            return Err(e);
        }
        Err(_) => {
            close_sink(sink.as_mut()).await;
            return Err(ConnectError::Timeout(settings.login_timeout));
        }
    }

    tracing::info!("Kiwoom stream authenticated");

    let cancel = parent.child_token();
    let (disconnect_tx, disconnect_rx) = oneshot::channel();
    let signal = Arc::new(DisconnectSignal {
        tx: Mutex::new(Some(disconnect_tx)),
        cancel: cancel.clone(),
    });

    let (outbound_tx, outbound_rx) = mpsc::channel(settings.outbound_capacity.max(1));
    let (heartbeat_tx, heartbeat_rx) = mpsc::channel(4);
    let heartbeat_state = Arc::new(HeartbeatState::new());

    let tracker = TaskTracker::new();
    let span = tracing::info_span!("connection", url = %settings.url);

    tracker.spawn(
        HeartbeatMonitor::new(
            settings.heartbeat.clone(),
            Arc::clone(&heartbeat_state),
            heartbeat_tx,
            cancel.clone(),
        )
        .run()
        .instrument(span.clone()),
    );

    tracker.spawn(
        relay_heartbeat(
            codec,
            heartbeat_rx,
            outbound_tx.clone(),
            Arc::clone(&signal),
        )
        .instrument(span.clone()),
    );

    tracker.spawn(
        WriteLoop {
            sink,
            outbound_rx,
            write_timeout: settings.write_timeout,
            signal: Arc::clone(&signal),
        }
        .run()
        .instrument(span.clone()),
    );

    tracker.spawn(
        ReadLoop {
            codec,
            stream,
            outbound_tx: outbound_tx.clone(),
            dispatch_tx,
            heartbeat: heartbeat_state,
            signal: Arc::clone(&signal),
        }
        .run()
        .instrument(span),
    );

    tracker.close();

    Ok((
        LiveConnection {
            outbound: outbound_tx,
            signal,
            tracker,
        },
        disconnect_rx,
    ))
}

/// Read until the `LOGIN` ack, answering pings on the way.
async fn await_login_ack(
    codec: &KiwoomCodec,
    login: &mut LoginHandler,
    sink: &mut dyn FrameSink,
    stream: &mut dyn FrameStream,
) -> Result<(), ConnectError> {
    loop {
        let frame = match stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(ConnectError::Connection(e)),
            None => return Err(ConnectError::Connection(TransportError::Closed)),
        };

        match frame {
            Frame::Text(text) => match codec.decode(&text) {
                Ok(Decoded::Control(ControlMessage::LoginAck(ack))) => {
                    login.on_ack(&ack)?;
                    return Ok(());
                }
                Ok(Decoded::Control(ControlMessage::Ping)) => {
                    sink.send(Frame::Text(codec.encode_pong()?)).await?;
                }
                Ok(other) => {
                    tracing::debug!(message = ?other, "Ignoring message before login ack");
                }
                Err(e) => {
                    metrics::record_decode_error();
                    tracing::warn!(error = %e, "Undecodable frame before login ack");
                }
            },
            Frame::Ping(payload) => sink.send(Frame::Pong(payload)).await?,
            Frame::Close => return Err(ConnectError::Connection(TransportError::Closed)),
            Frame::Pong(_) | Frame::Binary(_) => {}
        }
    }
}

async fn close_sink(sink: &mut dyn FrameSink) {
    if tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
        tracing::debug!("Close frame timed out");
    }
}

// =============================================================================
// Heartbeat Relay
// =============================================================================

/// Turn monitor ticks into queued pings and silence into a disconnect.
///
/// Never waits on the write task: a ping that does not fit in the queue is
/// skipped, and a timeout is reported directly.
async fn relay_heartbeat(
    codec: KiwoomCodec,
    mut events: mpsc::Receiver<HeartbeatEvent>,
    outbound_tx: mpsc::Sender<Frame>,
    signal: Arc<DisconnectSignal>,
) {
    let cancel = signal.cancel.clone();

    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Some(HeartbeatEvent::SendPing) => match codec.encode_ping() {
                Ok(ping) => {
                    tracing::trace!("Queueing heartbeat ping");
                    if outbound_tx.try_send(Frame::Text(ping)).is_err() {
                        tracing::debug!("Outbound queue full, skipping ping");
                    }
                }
                Err(e) => tracing::error!(error = %e, "Failed to encode ping"),
            },
            Some(HeartbeatEvent::Timeout { silent_for }) => {
                signal.report(DisconnectReason::HeartbeatTimeout { silent_for });
                break;
            }
            None => break,
        }
    }
}

// =============================================================================
// Write Loop
// =============================================================================

struct WriteLoop {
    sink: Box<dyn FrameSink>,
    outbound_rx: mpsc::Receiver<Frame>,
    write_timeout: Duration,
    signal: Arc<DisconnectSignal>,
}

impl WriteLoop {
    async fn run(mut self) {
        let cancel = self.signal.cancel.clone();
        // False once a write was abandoned mid-flight; the sink is then in
        // an unknown state and gets no close frame.
        let mut sink_usable = true;

        loop {
            let frame = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                frame = self.outbound_rx.recv() => frame,
            };
            let Some(frame) = frame else {
                break;
            };

            let written = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    sink_usable = false;
                    break;
                }
                written = tokio::time::timeout(self.write_timeout, self.sink.send(frame)) => written,
            };

            match written {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.signal.report(e.into());
                    break;
                }
                Err(_) => {
                    sink_usable = false;
                    self.signal
                        .report(DisconnectReason::WriteStalled(self.write_timeout));
                    break;
                }
            }
        }

        if sink_usable {
            close_sink(self.sink.as_mut()).await;
        } else {
            tracing::debug!("Write abandoned, skipping close frame");
        }
        tracing::debug!("Write loop stopped");
    }
}

// =============================================================================
// Read Loop
// =============================================================================

struct ReadLoop {
    codec: KiwoomCodec,
    stream: Box<dyn FrameStream>,
    outbound_tx: mpsc::Sender<Frame>,
    dispatch_tx: mpsc::Sender<RealtimeEvent>,
    heartbeat: Arc<HeartbeatState>,
    signal: Arc<DisconnectSignal>,
}

impl ReadLoop {
    async fn run(mut self) {
        let cancel = self.signal.cancel.clone();

        loop {
            let frame = tokio::select! {
                biased;

                () = cancel.cancelled() => break,
                frame = self.stream.next() => frame,
            };

            match frame {
                Some(Ok(frame)) => {
                    self.heartbeat.record_activity();
                    if let Err(reason) = self.handle_frame(frame) {
                        self.signal.report(reason);
                        break;
                    }
                }
                Some(Err(e)) => {
                    self.signal.report(e.into());
                    break;
                }
                None => {
                    self.signal.report(DisconnectReason::StreamEnded);
                    break;
                }
            }
        }

        tracing::debug!("Read loop stopped");
    }

    fn handle_frame(&self, frame: Frame) -> Result<(), DisconnectReason> {
        match frame {
            Frame::Text(text) => {
                self.handle_text(&text);
                Ok(())
            }
            Frame::Ping(payload) => {
                self.reply(Frame::Pong(payload));
                Ok(())
            }
            Frame::Pong(_) => Ok(()),
            Frame::Binary(bytes) => {
                tracing::debug!(len = bytes.len(), "Ignoring binary frame");
                Ok(())
            }
            Frame::Close => {
                tracing::info!("Server sent close frame");
                Err(DisconnectReason::ClosedByServer)
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let decoded = match self.codec.decode(text) {
            Ok(decoded) => decoded,
            Err(e) => {
                metrics::record_decode_error();
                tracing::warn!(error = %e, len = text.len(), "Dropping undecodable frame");
                return;
            }
        };

        match decoded {
            Decoded::Events(events) => {
                for event in events {
                    self.forward(event);
                }
            }
            Decoded::Control(control) => self.handle_control(control),
        }
    }

    fn handle_control(&self, control: ControlMessage) {
        match control {
            ControlMessage::Ping => match self.codec.encode_pong() {
                Ok(pong) => self.reply(Frame::Text(pong)),
                Err(e) => tracing::error!(error = %e, "Failed to encode pong"),
            },
            ControlMessage::Pong => tracing::trace!("Heartbeat pong received"),
            ControlMessage::LoginAck(ack) => {
                tracing::debug!(code = ?ack.code, "Late login ack");
            }
            ControlMessage::RegisterAck(ack) | ControlMessage::RemoveAck(ack)
                if !ack.is_success() =>
            {
                tracing::warn!(code = ?ack.code, msg = %ack.message, "Subscription request rejected");
            }
            ControlMessage::RegisterAck(ack) | ControlMessage::RemoveAck(ack) => {
                tracing::debug!(msg = %ack.message, "Subscription request acknowledged");
            }
            ControlMessage::ConditionRejected(ack) => {
                tracing::warn!(code = ?ack.code, msg = %ack.message, "Condition search rejected");
            }
        }
    }

    fn forward(&self, event: RealtimeEvent) {
        let data_type = event.data_type();
        metrics::record_event_received(data_type);

        match self.dispatch_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                metrics::record_event_dropped(data_type, DropReason::QueueFull);
                tracing::warn!(
                    data_type = %data_type,
                    symbol = event.symbol(),
                    "Dispatch queue full, dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Dispatch queue closed, dropping event");
            }
        }
    }

    fn reply(&self, frame: Frame) {
        if let Err(e) = self.outbound_tx.try_send(frame) {
            tracing::warn!(error = %e, "Failed to queue heartbeat reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::streaming::DataType;
    use crate::infrastructure::kiwoom::test_support::{
        FakeConnector, LOGIN_OK, LOGIN_REJECTED, ServerEnd, StallingConnector, next_server,
    };

    fn settings(login_timeout: Duration) -> ConnectionSettings {
        ConnectionSettings {
            url: "ws://test".to_string(),
            token: AccessToken::new("tok").unwrap(),
            login_timeout,
            heartbeat: HeartbeatConfig::new(Duration::from_secs(60), Duration::from_secs(10)),
            outbound_capacity: 16,
            write_timeout: Duration::from_secs(5),
        }
    }

    async fn connected(
        dispatch_capacity: usize,
    ) -> (
        LiveConnection,
        oneshot::Receiver<DisconnectReason>,
        ServerEnd,
        mpsc::Receiver<RealtimeEvent>,
    ) {
        let (connector, mut servers) = FakeConnector::new(&[LOGIN_OK]);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(dispatch_capacity);
        let (conn, disconnected) = establish(
            &connector,
            &settings(Duration::from_secs(1)),
            dispatch_tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let mut server = next_server(&mut servers).await;
        assert!(server.recv_text().await.contains("\"LOGIN\""));
        (conn, disconnected, server, dispatch_rx)
    }

    #[tokio::test]
    async fn login_then_events_flow_to_dispatch_queue() {
        let (conn, _disconnected, server, mut dispatch_rx) = connected(8).await;

        server.push(
            r#"{"trnm":"REAL","data":[{"type":"0B","item":"005930","values":{"10":"75000"}}]}"#,
        );

        let event = tokio::time::timeout(Duration::from_secs(1), dispatch_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.data_type(), DataType::StockTrade);
        assert_eq!(event.symbol(), "005930");
        assert_eq!(event.field("10"), Some("75000"));

        conn.shutdown().await;
    }

    #[tokio::test]
    async fn rejected_login_is_auth_error() {
        let (connector, _servers) = FakeConnector::new(&[LOGIN_REJECTED]);
        let (dispatch_tx, _dispatch_rx) = mpsc::channel(8);

        let err = establish(
            &connector,
            &settings(Duration::from_secs(1)),
            dispatch_tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            ConnectError::Auth(AuthError::Rejected {
                code: Some(8005),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn silent_server_times_out_login() {
        let (connector, _servers) = FakeConnector::new(&[]);
        let (dispatch_tx, _dispatch_rx) = mpsc::channel(8);

        let err = establish(
            &connector,
            &settings(Duration::from_millis(50)),
            dispatch_tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ConnectError::Timeout(_)));
    }

    #[tokio::test]
    async fn refused_transport_is_connection_error() {
        let (connector, _servers) = FakeConnector::new(&[LOGIN_OK]);
        connector.refuse(true);
        let (dispatch_tx, _dispatch_rx) = mpsc::channel(8);

        let err = establish(
            &connector,
            &settings(Duration::from_secs(1)),
            dispatch_tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ConnectError::Connection(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn ping_before_login_ack_is_answered() {
        let (connector, mut servers) = FakeConnector::new(&[r#"{"trnm":"PING"}"#, LOGIN_OK]);
        let (dispatch_tx, _dispatch_rx) = mpsc::channel(8);

        let (conn, _disconnected) = establish(
            &connector,
            &settings(Duration::from_secs(1)),
            dispatch_tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let mut server = next_server(&mut servers).await;
        assert!(server.recv_text().await.contains("\"LOGIN\""));
        assert_eq!(server.recv_text().await, r#"{"trnm":"PONG"}"#);

        conn.shutdown().await;
    }

    #[tokio::test]
    async fn server_ping_is_answered_with_pong() {
        let (conn, _disconnected, mut server, _dispatch_rx) = connected(8).await;

        server.push(r#"{"trnm":"PING"}"#);
        assert_eq!(server.recv_text().await, r#"{"trnm":"PONG"}"#);

        server.push_frame(Frame::Ping(vec![1, 2]));
        assert_eq!(server.recv().await, Frame::Pong(vec![1, 2]));

        conn.shutdown().await;
    }

    #[tokio::test]
    async fn stream_end_is_reported_once() {
        let (conn, disconnected, server, _dispatch_rx) = connected(8).await;

        drop(server);

        let reason = tokio::time::timeout(Duration::from_secs(1), disconnected)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, DisconnectReason::StreamEnded);
        assert!(conn.is_closed());
        assert_eq!(
            conn.send_text("x".to_string()).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn close_frame_is_reported() {
        let (_conn, disconnected, server, _dispatch_rx) = connected(8).await;

        server.push_frame(Frame::Close);

        let reason = tokio::time::timeout(Duration::from_secs(1), disconnected)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, DisconnectReason::ClosedByServer);
    }

    #[tokio::test]
    async fn shutdown_reports_nothing_and_closes_link() {
        let (conn, disconnected, mut server, _dispatch_rx) = connected(8).await;

        conn.send_text(r#"{"trnm":"REG"}"#.to_string()).await.unwrap();
        assert_eq!(server.recv_text().await, r#"{"trnm":"REG"}"#);

        conn.shutdown().await;

        assert_eq!(server.recv().await, Frame::Close);
        assert!(disconnected.await.is_err());
    }

    #[tokio::test]
    async fn undecodable_frames_do_not_stop_the_loop() {
        let (conn, _disconnected, server, mut dispatch_rx) = connected(8).await;

        server.push("not json");
        server.push(r#"{"trnm":"WHAT"}"#);
        server.push(r#"{"trnm":"REAL","data":[{"type":"0B","item":"005930"}]}"#);
        server.push(
            r#"{"trnm":"REAL","data":[{"type":"0B","item":"000660","values":{"10":"1"}}]}"#,
        );

        let event = tokio::time::timeout(Duration::from_secs(1), dispatch_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.symbol(), "000660");
        assert!(!conn.is_closed());

        conn.shutdown().await;
    }

    #[tokio::test]
    async fn full_dispatch_queue_drops_without_blocking() {
        let (conn, _disconnected, mut server, mut dispatch_rx) = connected(1).await;

        server.push(
            r#"{"trnm":"REAL","data":[
                {"type":"0B","item":"A","values":{"10":"1"}},
                {"type":"0B","item":"B","values":{"10":"2"}},
                {"type":"0B","item":"C","values":{"10":"3"}}
            ]}"#,
        );

        // Still answering pings after dropping.
        server.push(r#"{"trnm":"PING"}"#);
        assert_eq!(server.recv_text().await, r#"{"trnm":"PONG"}"#);

        let first = dispatch_rx.recv().await.unwrap();
        assert_eq!(first.symbol(), "A");
        assert!(dispatch_rx.try_recv().is_err());

        conn.shutdown().await;
    }

    #[tokio::test]
    async fn silent_link_reports_heartbeat_timeout() {
        let (connector, mut servers) = FakeConnector::new(&[LOGIN_OK]);
        let (dispatch_tx, _dispatch_rx) = mpsc::channel(8);
        let settings = ConnectionSettings {
            heartbeat: HeartbeatConfig::new(Duration::from_millis(20), Duration::from_millis(30)),
            ..settings(Duration::from_secs(1))
        };

        let (_conn, disconnected) =
            establish(&connector, &settings, dispatch_tx, &CancellationToken::new())
                .await
                .unwrap();
        let mut server = next_server(&mut servers).await;
        let _login = server.recv_text().await;

        let reason = tokio::time::timeout(Duration::from_secs(1), disconnected)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(reason, DisconnectReason::HeartbeatTimeout { .. }));
        assert_eq!(server.recv_text().await, r#"{"trnm":"PING"}"#);
    }

    #[tokio::test]
    async fn stalled_write_still_detects_silence_and_shuts_down() {
        let settings = ConnectionSettings {
            heartbeat: HeartbeatConfig::new(Duration::from_millis(20), Duration::from_millis(30)),
            write_timeout: Duration::from_secs(60),
            ..settings(Duration::from_secs(1))
        };
        let (dispatch_tx, _dispatch_rx) = mpsc::channel(8);

        let (conn, disconnected) = establish(
            &StallingConnector,
            &settings,
            dispatch_tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(1), disconnected)
            .await
            .expect("silence reported while the ping write hangs")
            .unwrap();
        assert!(matches!(reason, DisconnectReason::HeartbeatTimeout { .. }));

        tokio::time::timeout(Duration::from_secs(1), conn.shutdown())
            .await
            .expect("shutdown does not wait on the hung write");
    }

    #[tokio::test]
    async fn write_past_timeout_is_a_stall() {
        let settings = ConnectionSettings {
            write_timeout: Duration::from_millis(30),
            ..settings(Duration::from_secs(1))
        };
        let (dispatch_tx, _dispatch_rx) = mpsc::channel(8);

        let (conn, disconnected) = establish(
            &StallingConnector,
            &settings,
            dispatch_tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        conn.send_text(r#"{"trnm":"REG"}"#.to_string()).await.unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(1), disconnected)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, DisconnectReason::WriteStalled(Duration::from_millis(30)));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn queued_send_gives_up_when_cancelled() {
        let settings = ConnectionSettings {
            outbound_capacity: 1,
            write_timeout: Duration::from_secs(60),
            ..settings(Duration::from_secs(1))
        };
        let (dispatch_tx, _dispatch_rx) = mpsc::channel(8);
        let parent = CancellationToken::new();

        let (conn, _disconnected) = establish(&StallingConnector, &settings, dispatch_tx, &parent)
            .await
            .unwrap();
        let conn = Arc::new(conn);

        // One frame hangs in the sink, one fills the queue, the third waits.
        let sender = Arc::clone(&conn);
        let blocked = tokio::spawn(async move {
            for _ in 0..3 {
                sender.send_text("{}".to_string()).await?;
            }
            Ok::<(), TransportError>(())
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        parent.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("blocked send released")
            .unwrap();
        assert_eq!(result, Err(TransportError::Closed));
    }
}
