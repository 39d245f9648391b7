//! Socket abstraction for the RoomWire signaling protocol.
//!
//! The [`SignalSocket`] trait defines a bidirectional framed message channel
//! between the client and server. Signaling messages travel as binary frames
//! (bincode) with a JSON text fallback, so every socket implementation must
//! carry both frame types and handle framing internally.
//!
//! The [`SocketConnector`] trait owns connection setup. The signal client
//! re-dials through the same connector on every reconnect, which is also the
//! seam tests use to script whole connection sequences.

use async_trait::async_trait;

use crate::error::RoomWireError;

/// One framed message in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketMessage {
    /// A bincode-encoded protocol message.
    Binary(Vec<u8>),
    /// A JSON-encoded protocol message (fallback path).
    Text(String),
}

/// A connected, bidirectional framed socket.
///
/// # Object Safety
///
/// This trait is object-safe; the signal client drives a `Box<dyn SignalSocket>`
/// from its socket task.
///
/// # Cancel Safety
///
/// The [`recv`](SignalSocket::recv) method **MUST** be cancel-safe because it
/// is used inside `tokio::select!`. If `recv` is cancelled before completion,
/// calling it again must not lose data. Channel-based implementations are
/// naturally cancel-safe.
#[async_trait]
pub trait SignalSocket: Send + 'static {
    /// Send one framed message to the server.
    ///
    /// # Errors
    ///
    /// Returns [`RoomWireError::SocketSend`] if the frame could not be sent.
    async fn send(&mut self, message: SocketMessage) -> Result<(), RoomWireError>;

    /// Receive the next framed message from the server.
    ///
    /// Returns:
    /// - `Some(Ok(message))` — a complete frame was received
    /// - `Some(Err(e))` — a socket error occurred
    /// - `None` — the connection was closed cleanly by the server
    ///
    /// # Cancel Safety
    ///
    /// This method **MUST** be cancel-safe (see [trait documentation](SignalSocket)).
    async fn recv(&mut self) -> Option<Result<SocketMessage, RoomWireError>>;

    /// Close the socket gracefully. Implementations release resources even
    /// when the close handshake fails.
    async fn close(&mut self) -> Result<(), RoomWireError>;
}

impl std::fmt::Debug for dyn SignalSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SignalSocket")
    }
}

/// Dials signal sockets and probes the companion validate endpoint.
///
/// A connector is handed to the signal client once and used for the initial
/// dial and every reconnect, so implementations must be reusable.
#[async_trait]
pub trait SocketConnector: Send + Sync + 'static {
    /// Open a socket to a fully built signal URL (scheme, path and query
    /// already in place, see `signal::url`).
    async fn connect(&self, url: &str) -> Result<Box<dyn SignalSocket>, RoomWireError>;

    /// Ask the HTTP validate endpoint why a dial might have been refused.
    ///
    /// Returns `Ok(Some(reason))` when the server answered with a rejection
    /// reason, `Ok(None)` when the server found nothing wrong with the
    /// request, and `Err` when the endpoint could not be reached at all.
    async fn validate(&self, url: &str) -> Result<Option<String>, RoomWireError>;
}
