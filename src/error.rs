//! Error types for the RoomWire client.

use thiserror::Error;

/// Errors that can occur when using the RoomWire client.
#[derive(Debug, Error)]
pub enum RoomWireError {
    /// An operation was attempted in a connection state that does not allow it.
    #[error("invalid state: {0}")]
    State(String),

    /// Establishing the signal connection failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Failed to send a frame through the signal socket.
    #[error("socket send error: {0}")]
    SocketSend(String),

    /// Failed to receive a frame from the signal socket.
    #[error("socket receive error: {0}")]
    SocketReceive(String),

    /// The signal socket was closed unexpectedly.
    #[error("socket closed")]
    SocketClosed,

    /// A bounded wait elapsed. Carries the name of the operation that timed out.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// A request correlated by client id collided with one still in flight.
    #[error("duplicate request: {0}")]
    Duplicate(String),

    /// Failed to encode an outbound protocol message.
    #[error("serialize error: {0}")]
    Serialize(String),

    /// Failed to decode an inbound protocol message or data packet.
    #[error("parse error: {0}")]
    Parse(String),

    /// A media collaborator (track or peer connection) reported a failure.
    #[error("media error: {0}")]
    Media(String),

    /// A data packet was rejected before transmission.
    #[error("data error: {0}")]
    Data(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for RoomWire client operations.
pub type Result<T> = std::result::Result<T, RoomWireError>;
