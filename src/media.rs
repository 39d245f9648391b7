//! Media track abstraction.
//!
//! The crate never touches raw media. Local tracks are supplied by the
//! application behind [`LocalMediaTrack`]; remote tracks surface from the
//! peer layer behind [`RemoteMediaTrack`]. The engine only needs names,
//! kinds and dimensions to negotiate publications.

use uuid::Uuid;

use crate::protocol::{TrackCid, TrackKind, TrackSid};

/// Pixel size of a video track. Audio tracks have none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackDimensions {
    pub width: u32,
    pub height: u32,
}

/// A track captured by the application and offered for publication.
///
/// Implementations wrap whatever native media object the peer layer
/// understands; [`PeerConnection::add_track`](crate::rtc::peer::PeerConnection::add_track)
/// receives the same object and may downcast it.
pub trait LocalMediaTrack: std::fmt::Debug + Send + Sync {
    /// Display name sent to the server; not required to be unique.
    fn name(&self) -> String;

    fn kind(&self) -> TrackKind;

    /// Capture size for video tracks, `None` for audio.
    fn dimensions(&self) -> Option<TrackDimensions>;
}

/// A track received from another participant.
///
/// The server tags media streams with the publication sid, so
/// implementations can recover it from transport metadata.
pub trait RemoteMediaTrack: std::fmt::Debug + Send + Sync {
    /// The server-assigned sid of the publication this track belongs to.
    fn sid(&self) -> TrackSid;

    fn kind(&self) -> TrackKind;
}

/// Mint a client-generated track id, unique per publication attempt.
pub fn new_track_cid() -> TrackCid {
    Uuid::new_v4().to_string()
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
    fn track_cids_are_unique() {
        let a = new_track_cid();
        let b = new_track_cid();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }
}
