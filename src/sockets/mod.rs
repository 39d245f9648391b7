//! Socket backends for the RoomWire signaling protocol.
//!
//! This module provides concrete [`SignalSocket`](crate::SignalSocket) and
//! [`SocketConnector`](crate::SocketConnector) implementations behind feature
//! gates. Enable the corresponding Cargo feature to pull in a backend:
//!
//! | Feature            | Backend                |
//! |--------------------|------------------------|
//! | `socket-websocket` | [`WebSocketConnector`] |

#[cfg(feature = "socket-websocket")]
pub mod websocket;

#[cfg(feature = "socket-websocket")]
pub use websocket::WebSocketConnector;
