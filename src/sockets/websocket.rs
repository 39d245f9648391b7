//! WebSocket signal socket using `tokio-tungstenite`, with the validate
//! probe carried over HTTP via `reqwest`.
//!
//! Both `ws://` and `wss://` URLs are supported — TLS is handled
//! transparently via [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream).
//!
//! # Feature gate
//!
//! This module is only available when the `socket-websocket` feature is
//! enabled (it is enabled by default).

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::error::RoomWireError;
use crate::socket::{SignalSocket, SocketConnector, SocketMessage};

/// Default deadline for one websocket dial.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Type alias for the underlying WebSocket stream.
///
/// Made public so that callers can construct a [`WsSocket`] from an existing
/// stream via [`WsSocket::from_stream`].
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`SignalSocket`] backed by a WebSocket connection.
///
/// Binary WebSocket frames map to [`SocketMessage::Binary`], text frames to
/// [`SocketMessage::Text`]. Control frames (ping/pong) are handled inside
/// [`recv`](SignalSocket::recv) and never surface.
///
/// # Cancel Safety
///
/// The [`recv`](SignalSocket::recv) method is cancel-safe. Dropping the
/// future returned by `recv` before it completes will not consume or lose
/// any messages, making it safe to use inside `tokio::select!`.
#[derive(Debug)]
pub struct WsSocket {
    stream: WsStream,
    closed: bool,
}

impl WsSocket {
    /// Establish a new WebSocket connection to the given URL.
    ///
    /// # Errors
    ///
    /// Returns [`RoomWireError::Io`] if the URL is invalid or the connection
    /// cannot be established. When the underlying error is an I/O error its
    /// [`ErrorKind`](std::io::ErrorKind) is preserved; all other errors are
    /// mapped to [`ErrorKind::Other`](std::io::ErrorKind::Other).
    pub async fn connect(url: &str) -> Result<Self, RoomWireError> {
        tracing::debug!(url = %url, "dialing signal websocket");

        let (stream, _response) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            let kind = match &e {
                tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
                _ => std::io::ErrorKind::Other,
            };
            RoomWireError::Io(std::io::Error::new(kind, e))
        })?;

        tracing::debug!(url = %url, "signal websocket established");

        Ok(Self {
            stream,
            closed: false,
        })
    }

    /// Create a [`WsSocket`] from an already-established WebSocket stream.
    ///
    /// Useful when custom TLS configuration, proxies or extra headers are
    /// needed beyond what [`connect`](Self::connect) exposes.
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

#[async_trait]
impl SignalSocket for WsSocket {
    async fn send(&mut self, message: SocketMessage) -> Result<(), RoomWireError> {
        if self.closed {
            return Err(RoomWireError::SocketClosed);
        }
        let frame = match message {
            SocketMessage::Binary(bytes) => Message::Binary(bytes.into()),
            SocketMessage::Text(text) => Message::Text(text.into()),
        };
        self.stream
            .send(frame)
            .await
            .map_err(|e| RoomWireError::SocketSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<SocketMessage, RoomWireError>> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    return Some(Err(RoomWireError::SocketReceive(e.to_string())));
                }
                None => return None,
            };

            match msg {
                Message::Binary(bytes) => return Some(Ok(SocketMessage::Binary(bytes.to_vec()))),
                Message::Text(text) => return Some(Ok(SocketMessage::Text(text.to_string()))),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "received WebSocket close frame");
                    return None;
                }
                Message::Ping(_) => {
                    // tungstenite auto-queues a Pong reply; no manual response needed.
                }
                Message::Pong(_) => {
                    // Transport-level pong, distinct from the protocol keepalive.
                }
                Message::Frame(_) => {
                    // Never produced by the read half; kept for exhaustiveness.
                    tracing::debug!("received raw WebSocket frame, skipping");
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), RoomWireError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| RoomWireError::SocketSend(e.to_string()))
    }
}

/// The default [`SocketConnector`]: WebSocket dialing plus an HTTP validate
/// probe against the companion `validate` endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
    http: reqwest::Client,
}

impl WebSocketConnector {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    /// Use a custom dial deadline instead of [`DEFAULT_CONNECT_TIMEOUT`].
    pub fn with_timeout(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            http: reqwest::Client::new(),
        }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SocketConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn SignalSocket>, RoomWireError> {
        let socket = tokio::time::timeout(self.connect_timeout, WsSocket::connect(url))
            .await
            .map_err(|_| RoomWireError::Timeout("socket connect"))??;
        Ok(Box::new(socket))
    }

    async fn validate(&self, url: &str) -> Result<Option<String>, RoomWireError> {
        let response = self
            .http
            .get(url)
            .timeout(self.connect_timeout)
            .send()
            .await
            .map_err(|e| RoomWireError::Connect(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(None);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| status.to_string());
        tracing::debug!(status = %status, "validate endpoint rejected the request");
        Ok(Some(body))
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn ws_socket_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WsSocket>();
    }

    #[tokio::test]
    async fn connect_fails_with_invalid_url() {
        let result = WsSocket::connect("not-a-valid-url").await;
        let err = result.unwrap_err();
        assert!(matches!(err, RoomWireError::Io(_)));
    }

    // ── Mock-stream helpers ──────────────────────────────────────────────

    use tokio::net::TcpListener;

    /// Start a local WebSocket server that runs `handler` on the accepted
    /// connection and returns the address to connect to.
    async fn start_mock_server<F, Fut>(handler: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });

        format!("ws://{addr}")
    }

    // ── Mock-stream tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn recv_carries_both_frame_types() {
        let url = start_mock_server(|mut ws| async move {
            ws.send(Message::Binary(vec![0x01, 0x02].into()))
                .await
                .unwrap();
            ws.send(Message::Text("fallback".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut socket = WsSocket::connect(&url).await.unwrap();

        let first = socket.recv().await.unwrap().unwrap();
        assert_eq!(first, SocketMessage::Binary(vec![0x01, 0x02]));

        let second = socket.recv().await.unwrap().unwrap();
        assert_eq!(second, SocketMessage::Text("fallback".to_string()));
    }

    #[tokio::test]
    async fn recv_returns_none_on_close_frame() {
        let url = start_mock_server(|mut ws| async move {
            ws.close(None).await.unwrap();
        })
        .await;

        let mut socket = WsSocket::connect(&url).await.unwrap();
        assert!(socket.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_after_close_returns_socket_closed() {
        let url =
            start_mock_server(|mut ws| async move { while let Some(Ok(_)) = ws.next().await {} })
                .await;

        let mut socket = WsSocket::connect(&url).await.unwrap();
        socket.close().await.unwrap();

        let err = socket
            .send(SocketMessage::Text("oops".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, RoomWireError::SocketClosed));
    }

    #[tokio::test]
    async fn double_close_is_idempotent() {
        let url =
            start_mock_server(|mut ws| async move { while let Some(Ok(_)) = ws.next().await {} })
                .await;

        let mut socket = WsSocket::connect(&url).await.unwrap();
        socket.close().await.unwrap();
        socket.close().await.unwrap();
    }

    #[tokio::test]
    async fn binary_round_trip() {
        let url = start_mock_server(|mut ws| async move {
            // Echo one frame back.
            if let Some(Ok(frame)) = ws.next().await {
                ws.send(frame).await.unwrap();
            }
            ws.close(None).await.unwrap();
        })
        .await;

        let mut socket = WsSocket::connect(&url).await.unwrap();
        socket
            .send(SocketMessage::Binary(vec![9, 8, 7]))
            .await
            .unwrap();

        let echoed = socket.recv().await.unwrap().unwrap();
        assert_eq!(echoed, SocketMessage::Binary(vec![9, 8, 7]));
    }

    #[tokio::test]
    async fn connector_dial_times_out() {
        // Non-routable address guarantees the deadline fires.
        let connector = WebSocketConnector::with_timeout(Duration::from_millis(50));
        let err = connector.connect("ws://192.0.2.1:1").await.unwrap_err();
        assert!(matches!(
            err,
            RoomWireError::Timeout(_) | RoomWireError::Io(_)
        ));
    }

    #[tokio::test]
    async fn validate_against_unreachable_host_errors() {
        let connector = WebSocketConnector::with_timeout(Duration::from_millis(100));
        let err = connector
            .validate("http://127.0.0.1:1/validate")
            .await
            .unwrap_err();
        assert!(matches!(err, RoomWireError::Connect(_)));
    }
}
