//! Connection orchestration: peer transports, session epochs and the engine
//! state machine.
//!
//! The layering runs bottom-up: [`peer`] abstracts a WebRTC implementation,
//! [`transport`] adds negotiation discipline on top of one peer,
//! [`session`] owns everything belonging to a single connection epoch, and
//! [`engine`] drives sessions through connect, reconnect and close.

pub mod engine;
pub mod peer;
pub mod session;
pub mod transport;
