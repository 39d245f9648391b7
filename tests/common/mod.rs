#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Shared test utilities for RoomWire client integration tests.
//!
//! Provides a scripted [`MockConnector`] / [`MockSocket`] pair for the signal
//! side, a [`MockPeerFactory`] for the media side and builders for common
//! server frames. Each scripted socket serves its `incoming` list first and
//! then whatever the test pushes through the [`SocketHandle::feed`] sender,
//! so handshakes can be pre-scripted while later frames react to what the
//! client actually sent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use roomwire_client::media::{LocalMediaTrack, RemoteMediaTrack, TrackDimensions};
use roomwire_client::protocol::{
    decode_request, encode_response, IceCandidateInit, JoinPayload, ParticipantInfo,
    ParticipantState, RoomInfo, SessionDescription, SdpKind, SignalRequest, SignalResponse,
    SignalTarget, TrackCid, TrackInfo, TrackKind, TrackSid, VideoLayer,
};
use roomwire_client::rtc::peer::{
    DataChannel, DataChannelInit, DataChannelState, OfferOptions, PeerConnection, PeerEvent,
    PeerFactory, PeerState, RtcConfiguration, SignalingState,
};
use roomwire_client::{RoomWireError, SocketMessage};

/// One scripted `recv` outcome: a frame, a socket error, or a clean close.
pub type ScriptedRecv = Option<Result<SocketMessage, RoomWireError>>;

// ── MockSocket ──────────────────────────────────────────────────────

/// A scripted signal socket.
///
/// `recv` serves the scripted list first, then the live feed, then hangs
/// so the socket task stays alive until the client closes it. `send`
/// decodes every outgoing frame back into a [`SignalRequest`] and records
/// it, so tests assert on protocol messages instead of raw bytes.
pub struct MockSocket {
    incoming: VecDeque<ScriptedRecv>,
    feed: mpsc::UnboundedReceiver<ScriptedRecv>,
    sent: Arc<StdMutex<Vec<SignalRequest>>>,
    closed: Arc<AtomicBool>,
}

/// Inspection handles for one scripted socket.
pub struct SocketHandle {
    /// Requests the client sent through this socket, in order.
    pub sent: Arc<StdMutex<Vec<SignalRequest>>>,
    /// Whether the client closed this socket.
    pub closed: Arc<AtomicBool>,
    /// Push additional frames after the scripted list is exhausted.
    pub feed: mpsc::UnboundedSender<ScriptedRecv>,
}

impl SocketHandle {
    /// Feed one server frame to the client.
    pub fn push(&self, response: &SignalResponse) {
        self.feed
            .send(text_frame(response))
            .expect("socket feed closed");
    }

    /// Snapshot of the requests sent so far.
    pub fn sent_requests(&self) -> Vec<SignalRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl roomwire_client::SignalSocket for MockSocket {
    async fn send(&mut self, message: SocketMessage) -> Result<(), RoomWireError> {
        let request = match message {
            SocketMessage::Binary(bytes) => decode_request(&bytes)?,
            SocketMessage::Text(text) => serde_json::from_str(&text)
                .map_err(|e| RoomWireError::Parse(e.to_string()))?,
        };
        self.sent.lock().unwrap().push(request);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<SocketMessage, RoomWireError>> {
        if let Some(item) = self.incoming.pop_front() {
            return item;
        }
        if let Some(item) = self.feed.recv().await {
            return item;
        }
        // Script and feed exhausted — hang so the socket stays alive until
        // the client tears it down.
        std::future::pending().await
    }

    async fn close(&mut self) -> Result<(), RoomWireError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

// ── MockConnector ───────────────────────────────────────────────────

/// A connector serving pre-scripted sockets in dial order.
///
/// Every dial URL is recorded, giving tests visibility into the reconnect
/// query parameters the client used.
#[derive(Default)]
pub struct MockConnector {
    sockets: StdMutex<VecDeque<Result<MockSocket, RoomWireError>>>,
    urls: Arc<StdMutex<Vec<String>>>,
    validate_reason: StdMutex<Option<String>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script the next socket this connector will hand out.
    pub fn script_socket(&self, incoming: Vec<ScriptedRecv>) -> SocketHandle {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        self.sockets.lock().unwrap().push_back(Ok(MockSocket {
            incoming: VecDeque::from(incoming),
            feed: feed_rx,
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
        }));
        SocketHandle {
            sent,
            closed,
            feed: feed_tx,
        }
    }

    /// Script the next dial to fail outright.
    pub fn script_failure(&self, error: RoomWireError) {
        self.sockets.lock().unwrap().push_back(Err(error));
    }

    /// What the validate probe should answer with.
    pub fn set_validate_reason(&self, reason: &str) {
        *self.validate_reason.lock().unwrap() = Some(reason.to_owned());
    }

    pub fn dial_count(&self) -> usize {
        self.urls.lock().unwrap().len()
    }

    pub fn dial_url(&self, index: usize) -> String {
        self.urls.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl roomwire_client::SocketConnector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn roomwire_client::SignalSocket>, RoomWireError> {
        self.urls.lock().unwrap().push(url.to_owned());
        match self.sockets.lock().unwrap().pop_front() {
            Some(Ok(socket)) => Ok(Box::new(socket)),
            Some(Err(e)) => Err(e),
            None => Err(RoomWireError::Connect("no scripted socket for dial".into())),
        }
    }

    async fn validate(&self, _url: &str) -> Result<Option<String>, RoomWireError> {
        Ok(self.validate_reason.lock().unwrap().clone())
    }
}

// ── Frame builders ──────────────────────────────────────────────────

/// A server frame on the JSON text path.
pub fn text_frame(response: &SignalResponse) -> ScriptedRecv {
    Some(Ok(SocketMessage::Text(
        serde_json::to_string(response).expect("response serialization"),
    )))
}

/// A server frame on the binary path.
pub fn binary_frame(response: &SignalResponse) -> ScriptedRecv {
    Some(Ok(SocketMessage::Binary(
        encode_response(response).expect("response encoding"),
    )))
}

/// A socket-level receive error.
pub fn socket_error() -> ScriptedRecv {
    Some(Err(RoomWireError::SocketReceive("mock socket dropped".into())))
}

/// A clean server-side close.
pub fn server_close() -> ScriptedRecv {
    None
}

// ── Payload builders ────────────────────────────────────────────────

/// A join payload for a subscriber-primary deployment with no keepalive
/// and no other participants.
pub fn join_payload() -> JoinPayload {
    join_payload_with(true, Vec::new())
}

pub fn join_payload_with(
    subscriber_primary: bool,
    other_participants: Vec<ParticipantInfo>,
) -> JoinPayload {
    JoinPayload {
        room: RoomInfo {
            sid: "RM_mock".into(),
            name: "mock-room".into(),
            metadata: String::new(),
        },
        participant: participant_info("PA_local", "local-identity"),
        other_participants,
        ice_servers: Vec::new(),
        subscriber_primary,
        server_version: "1.9.0".into(),
        // Keepalive off by default; tests enable it explicitly.
        ping_interval: 0,
        ping_timeout: 0,
    }
}

/// The join frame most tests start their first socket with.
pub fn join_frame() -> ScriptedRecv {
    text_frame(&SignalResponse::Join(Box::new(join_payload())))
}

pub fn participant_info(sid: &str, identity: &str) -> ParticipantInfo {
    ParticipantInfo {
        sid: sid.into(),
        identity: identity.into(),
        name: identity.into(),
        state: ParticipantState::Active,
        metadata: String::new(),
        tracks: Vec::new(),
    }
}

pub fn track_info(sid: &str, kind: TrackKind) -> TrackInfo {
    TrackInfo {
        sid: sid.into(),
        name: format!("mock-{sid}"),
        kind,
        muted: false,
        width: 0,
        height: 0,
        simulcast: false,
        layers: Vec::new(),
    }
}

/// Server answer to a publisher offer.
pub fn answer_frame() -> ScriptedRecv {
    text_frame(&SignalResponse::Answer(SessionDescription {
        kind: SdpKind::Answer,
        sdp: "v=0 mock-server-answer".into(),
    }))
}

// ── MockPeerFactory ─────────────────────────────────────────────────

/// Creates [`MockPeer`]s and keeps them reachable for inspection.
///
/// Peers are recorded in creation order: the publisher of a session first,
/// then its subscriber. A session rebuilt by a full reconnect appends two
/// more.
pub struct MockPeerFactory {
    peers: StdMutex<Vec<Arc<MockPeer>>>,
    auto_connect: bool,
}

impl MockPeerFactory {
    /// Factory whose peers report `Connected` from the start, letting
    /// connection waits pass immediately.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: StdMutex::new(Vec::new()),
            auto_connect: true,
        })
    }

    /// Factory whose peers start in `New` and only change state when the
    /// test drives them.
    pub fn manual() -> Arc<Self> {
        Arc::new(Self {
            peers: StdMutex::new(Vec::new()),
            auto_connect: false,
        })
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn peer(&self, index: usize) -> Arc<MockPeer> {
        Arc::clone(&self.peers.lock().unwrap()[index])
    }

    /// The most recently created peer for `target`.
    pub fn last_peer_for(&self, target: SignalTarget) -> Arc<MockPeer> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|peer| peer.target == target)
            .map(Arc::clone)
            .expect("no peer created for target")
    }
}

impl PeerFactory for MockPeerFactory {
    fn create_peer(
        &self,
        target: SignalTarget,
        _config: RtcConfiguration,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, RoomWireError> {
        let peer = Arc::new(MockPeer {
            target,
            state: StdMutex::new(if self.auto_connect {
                PeerState::Connected
            } else {
                PeerState::New
            }),
            signaling: StdMutex::new(SignalingState::Stable),
            local: StdMutex::new(None),
            remote: StdMutex::new(None),
            remote_candidates: StdMutex::new(Vec::new()),
            added_tracks: StdMutex::new(Vec::new()),
            removed_tracks: StdMutex::new(Vec::new()),
            offer_count: AtomicU32::new(0),
            channels: StdMutex::new(Vec::new()),
            events,
        });
        self.peers.lock().unwrap().push(Arc::clone(&peer));
        Ok(peer)
    }
}

// ── MockPeer ────────────────────────────────────────────────────────

/// A scripted peer connection that records everything done to it.
pub struct MockPeer {
    pub target: SignalTarget,
    state: StdMutex<PeerState>,
    signaling: StdMutex<SignalingState>,
    local: StdMutex<Option<SessionDescription>>,
    remote: StdMutex<Option<SessionDescription>>,
    pub remote_candidates: StdMutex<Vec<IceCandidateInit>>,
    pub added_tracks: StdMutex<Vec<TrackCid>>,
    pub removed_tracks: StdMutex<Vec<String>>,
    offer_count: AtomicU32,
    pub channels: StdMutex<Vec<Arc<MockDataChannel>>>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl MockPeer {
    /// Set the reported state and emit the matching peer event, the way a
    /// real connection would.
    pub fn set_state(&self, state: PeerState) {
        *self.state.lock().unwrap() = state;
        let _ = self.events.send(PeerEvent::StateChanged {
            target: self.target,
            state,
        });
    }

    /// Sender for injecting arbitrary peer events (data, tracks).
    pub fn events(&self) -> mpsc::UnboundedSender<PeerEvent> {
        self.events.clone()
    }

    pub fn offer_count(&self) -> u32 {
        self.offer_count.load(Ordering::SeqCst)
    }

    pub fn channel(&self, label: &str) -> Arc<MockDataChannel> {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .find(|dc| dc.label == label)
            .map(Arc::clone)
            .expect("data channel not created")
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, RoomWireError> {
        let n = self.offer_count.fetch_add(1, Ordering::SeqCst) + 1;
        let restart = if options.ice_restart { " ice-restart" } else { "" };
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: format!("v=0 mock-offer-{n}{restart}"),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, RoomWireError> {
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0 mock-answer".into(),
        })
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RoomWireError> {
        *self.signaling.lock().unwrap() = match description.kind {
            SdpKind::Offer => SignalingState::HaveLocalOffer,
            SdpKind::Answer => SignalingState::Stable,
        };
        *self.local.lock().unwrap() = Some(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RoomWireError> {
        *self.signaling.lock().unwrap() = match description.kind {
            SdpKind::Offer => SignalingState::HaveRemoteOffer,
            SdpKind::Answer => SignalingState::Stable,
        };
        *self.remote.lock().unwrap() = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), RoomWireError> {
        self.remote_candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        *self.signaling.lock().unwrap()
    }

    fn state(&self) -> PeerState {
        *self.state.lock().unwrap()
    }

    fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().unwrap().clone()
    }

    fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().unwrap().clone()
    }

    async fn create_data_channel(
        &self,
        label: &str,
        _init: DataChannelInit,
    ) -> Result<Arc<dyn DataChannel>, RoomWireError> {
        let mut channels = self.channels.lock().unwrap();
        let dc = Arc::new(MockDataChannel {
            label: label.to_owned(),
            id: channels.len() as u16,
            state: StdMutex::new(DataChannelState::Open),
            sent: StdMutex::new(Vec::new()),
        });
        channels.push(Arc::clone(&dc));
        Ok(dc)
    }

    async fn add_track(
        &self,
        cid: TrackCid,
        _track: Arc<dyn LocalMediaTrack>,
        _layers: Vec<VideoLayer>,
    ) -> Result<(), RoomWireError> {
        self.added_tracks.lock().unwrap().push(cid);
        Ok(())
    }

    async fn remove_track(&self, cid: &str) -> Result<(), RoomWireError> {
        self.removed_tracks.lock().unwrap().push(cid.to_owned());
        Ok(())
    }

    async fn close(&self) {
        *self.state.lock().unwrap() = PeerState::Closed;
        *self.signaling.lock().unwrap() = SignalingState::Closed;
    }
}

/// A data channel that records sent payloads.
pub struct MockDataChannel {
    pub label: String,
    pub id: u16,
    state: StdMutex<DataChannelState>,
    pub sent: StdMutex<Vec<Vec<u8>>>,
}

impl MockDataChannel {
    pub fn set_state(&self, state: DataChannelState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn sent_payloads(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn id(&self) -> u16 {
        self.id
    }

    fn state(&self) -> DataChannelState {
        *self.state.lock().unwrap()
    }

    async fn send(&self, payload: &[u8]) -> Result<(), RoomWireError> {
        self.sent.lock().unwrap().push(payload.to_vec());
        Ok(())
    }
}

// ── MockLocalTrack ──────────────────────────────────────────────────

/// A stand-in local media track.
#[derive(Debug)]
pub struct MockLocalTrack {
    name: String,
    kind: TrackKind,
    dimensions: Option<TrackDimensions>,
}

impl MockLocalTrack {
    pub fn video(name: &str, width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            kind: TrackKind::Video,
            dimensions: Some(TrackDimensions { width, height }),
        })
    }

    pub fn audio(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            kind: TrackKind::Audio,
            dimensions: None,
        })
    }
}

impl LocalMediaTrack for MockLocalTrack {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn dimensions(&self) -> Option<TrackDimensions> {
        self.dimensions
    }
}

/// A stand-in remote media track, tagged with its publication sid.
#[derive(Debug)]
pub struct MockRemoteTrack {
    sid: TrackSid,
    kind: TrackKind,
}

impl MockRemoteTrack {
    pub fn new(sid: &str, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            sid: sid.to_owned(),
            kind,
        })
    }
}

impl RemoteMediaTrack for MockRemoteTrack {
    fn sid(&self) -> TrackSid {
        self.sid.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }
}

// ── Wait helpers ────────────────────────────────────────────────────

/// Poll the sent log until a request matching `predicate` shows up.
pub async fn wait_for_request<F>(
    sent: &Arc<StdMutex<Vec<SignalRequest>>>,
    timeout: Duration,
    predicate: F,
) -> SignalRequest
where
    F: Fn(&SignalRequest) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(found) = sent.lock().unwrap().iter().find(|r| predicate(r)).cloned() {
            return found;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "request did not arrive within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Receive the next event or fail the test.
pub async fn next_event<T>(events: &mut mpsc::UnboundedReceiver<T>, timeout: Duration) -> T {
    tokio::time::timeout(timeout, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Count the sent requests matching `predicate`.
pub fn count_requests<F>(sent: &Arc<StdMutex<Vec<SignalRequest>>>, predicate: F) -> usize
where
    F: Fn(&SignalRequest) -> bool,
{
    sent.lock().unwrap().iter().filter(|r| predicate(r)).count()
}
