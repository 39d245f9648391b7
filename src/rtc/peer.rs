//! Peer connection abstraction.
//!
//! The crate does not ship a WebRTC stack. Applications provide one behind
//! [`PeerFactory`], and the engine drives it exclusively through these
//! traits: descriptions and candidates flow in, [`PeerEvent`]s flow out
//! through the channel handed to [`PeerFactory::create_peer`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::media::{LocalMediaTrack, RemoteMediaTrack};
use crate::protocol::{
    DataPacketKind, IceCandidateInit, IceServerInfo, SessionDescription, SignalTarget, TrackCid,
    VideoLayer,
};

/// SDP negotiation state of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Aggregate connectivity state of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Lifecycle state of a data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Configuration applied when a peer connection is created.
#[derive(Debug, Clone, Default)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServerInfo>,
}

/// Creation parameters for a data channel.
#[derive(Debug, Clone)]
pub struct DataChannelInit {
    pub ordered: bool,
    /// `Some(0)` means best-effort delivery; `None` means fully reliable.
    pub max_retransmits: Option<u16>,
}

impl Default for DataChannelInit {
    fn default() -> Self {
        Self {
            ordered: true,
            max_retransmits: None,
        }
    }
}

/// Options for [`PeerConnection::create_offer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OfferOptions {
    pub ice_restart: bool,
}

/// Events emitted by a peer connection. Candidate and state events carry the
/// emitting peer's target so both peers can share one channel.
#[derive(Debug)]
pub enum PeerEvent {
    IceCandidate {
        target: SignalTarget,
        candidate: IceCandidateInit,
    },
    StateChanged {
        target: SignalTarget,
        state: PeerState,
    },
    /// A message arrived on one of the server-created data channels. The
    /// implementation maps the channel label
    /// ([`RELIABLE_DC_LABEL`](crate::protocol::RELIABLE_DC_LABEL) /
    /// [`LOSSY_DC_LABEL`](crate::protocol::LOSSY_DC_LABEL)) to the kind.
    Data {
        payload: Vec<u8>,
        kind: DataPacketKind,
    },
    /// A remote media track was added by the server.
    Track { track: Arc<dyn RemoteMediaTrack> },
}

/// One WebRTC peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    fn state(&self) -> PeerState;

    fn local_description(&self) -> Option<SessionDescription>;

    fn remote_description(&self) -> Option<SessionDescription>;

    async fn create_data_channel(
        &self,
        label: &str,
        init: DataChannelInit,
    ) -> Result<Arc<dyn DataChannel>>;

    /// Attach a local track under the given client-generated id.
    async fn add_track(
        &self,
        cid: TrackCid,
        track: Arc<dyn LocalMediaTrack>,
        layers: Vec<VideoLayer>,
    ) -> Result<()>;

    /// Detach a previously added track.
    async fn remove_track(&self, cid: &str) -> Result<()>;

    async fn close(&self);
}

/// One negotiated data channel.
#[async_trait]
pub trait DataChannel: Send + Sync + 'static {
    fn label(&self) -> String;

    /// Negotiated SCTP stream id, reported to the server on resume.
    fn id(&self) -> u16;

    fn state(&self) -> DataChannelState;

    async fn send(&self, payload: &[u8]) -> Result<()>;
}

/// Creates peer connections for the engine. Implemented once per WebRTC
/// backend; tests substitute a scripted factory.
pub trait PeerFactory: Send + Sync + 'static {
    fn create_peer(
        &self,
        target: SignalTarget,
        config: RtcConfiguration,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>>;
}
