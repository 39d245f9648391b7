//! # RoomWire Client
//!
//! Async Rust client SDK for the RoomWire real-time conferencing protocol.
//!
//! This crate connects to a RoomWire deployment over a signaling socket and a
//! pair of peer connections, and exposes the conference as a [`Room`]: a
//! participant roster, track publications, and an event stream describing how
//! they change.
//!
//! ## Features
//!
//! - **Socket-agnostic**: implement [`SocketConnector`] for any backend; the
//!   default `socket-websocket` feature provides a WebSocket one
//! - **Media-agnostic**: peer connections and tracks sit behind the traits in
//!   [`rtc::peer`] and [`media`], so any WebRTC stack can be plugged in
//! - **Wire-compatible**: protocol types in [`protocol`] match the server's
//!   v3 format exactly, binary frames with a JSON text fallback
//! - **Self-healing**: dropped connections are resumed in place when possible
//!   and rebuilt from scratch when not, with queued signaling replayed in order
//! - **Event-driven**: receive typed [`RoomEvent`]s via a channel
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use roomwire_client::rtc::peer::PeerFactory;
//! use roomwire_client::{Room, RoomEvent, RoomOptions, RoomWireError};
//!
//! async fn run(peers: Arc<dyn PeerFactory>) -> Result<(), RoomWireError> {
//!     let options = RoomOptions::new(peers);
//!     let (room, mut events) =
//!         Room::connect("wss://conference.example.com", "<token>", options).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             RoomEvent::DataReceived { payload, .. } => {
//!                 println!("received {} bytes", payload.len());
//!             }
//!             RoomEvent::Disconnected { reason } => {
//!                 println!("disconnected: {reason:?}");
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//!     room.close().await;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod media;
pub mod options;
pub mod protocol;
pub mod room;
pub mod rtc;
pub mod signal;
pub mod socket;
pub mod sockets;
pub mod state;

mod utils;

// Re-export primary types for ergonomic imports.
pub use error::{Result, RoomWireError};
pub use media::{LocalMediaTrack, RemoteMediaTrack};
pub use options::{RoomOptions, SignalOptions};
pub use protocol::{DataPacketKind, DisconnectReason};
pub use room::{Room, RoomEvent, RoomEvents};
pub use signal::SignalClient;
pub use socket::{SignalSocket, SocketConnector, SocketMessage};
pub use state::ConnectionState;
pub use utils::retry::RetryPolicy;
