//! WebSocket Transport
//!
//! [`Connector`] implementation over `tokio-tungstenite`. The bearer token
//! rides on the upgrade request as `Authorization: Bearer <token>`.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::application::ports::{Connector, Frame, FrameSink, FrameStream, Link, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens links with `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    /// Create a new connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str, token: &str) -> Result<Link, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| TransportError::Connect("token is not a valid header value".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::debug!(status = %response.status(), "WebSocket upgrade complete");

        let (write, read) = ws_stream.split();
        let sink: Box<dyn FrameSink> = Box::new(WsSink(write));
        let stream: Box<dyn FrameStream> = Box::new(WsReader(read));
        Ok((sink, stream))
    }
}

struct WsSink(SplitSink<WsStream, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.0
            .send(to_message(frame))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.0.close().await {
            tracing::debug!(error = %e, "WebSocket close failed");
        }
    }
}

struct WsReader(SplitStream<WsStream>);

#[async_trait]
impl FrameStream for WsReader {
    async fn next(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            match self.0.next().await? {
                Ok(message) => {
                    if let Some(frame) = from_message(message) {
                        return Some(Ok(frame));
                    }
                }
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            }
        }
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(bytes) => Message::Binary(bytes.into()),
        Frame::Ping(payload) => Message::Ping(payload.into()),
        Frame::Pong(payload) => Message::Pong(payload.into()),
        Frame::Close => Message::Close(None),
    }
}

/// Raw frames carry no message of their own.
fn from_message(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text.to_string())),
        Message::Binary(bytes) => Some(Frame::Binary(bytes.to_vec())),
        Message::Ping(payload) => Some(Frame::Ping(payload.to_vec())),
        Message::Pong(payload) => Some(Frame::Pong(payload.to_vec())),
        Message::Close(_) => Some(Frame::Close),
        Message::Frame(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_map_to_messages() {
        assert_eq!(to_message(Frame::text("hi")), Message::Text("hi".into()));
        assert_eq!(
            to_message(Frame::Ping(vec![1])),
            Message::Ping(vec![1].into())
        );
        assert_eq!(to_message(Frame::Close), Message::Close(None));
    }

    #[test]
    fn messages_map_to_frames() {
        assert_eq!(
            from_message(Message::Text("{}".into())),
            Some(Frame::text("{}"))
        );
        assert_eq!(
            from_message(Message::Pong(vec![9].into())),
            Some(Frame::Pong(vec![9]))
        );
        assert_eq!(from_message(Message::Close(None)), Some(Frame::Close));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_connect_error() {
        let result = TungsteniteConnector::new()
            .connect("ws://127.0.0.1:1", "tok")
            .await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn invalid_url_is_connect_error() {
        let result = TungsteniteConnector::new().connect("not a url", "tok").await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }
}
