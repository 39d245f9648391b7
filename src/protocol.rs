//! Wire types for the RoomWire signaling protocol.
//!
//! Messages travel binary-first (`bincode`) with a JSON text fallback over
//! the same serde schema: binary socket frames decode through [`decode_response`],
//! text frames through [`decode_response_json`]. Both envelopes are adjacently
//! tagged (`type` + `data`) so the JSON form stays self-describing.
//!
//! The binary codec is positional, so optional fields always serialize; no
//! `skip_serializing_if` anywhere in this module.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RoomWireError};

/// Protocol revision advertised in the signal URL query string.
pub const PROTOCOL_VERSION: u32 = 3;

/// SDK identifier advertised in the signal URL query string.
pub const SDK_IDENTIFIER: &str = "rust";

/// Maximum user payload size for a data packet, enforced before serialization.
pub const MAX_DATA_PAYLOAD_SIZE: usize = 15_000;

/// Label of the ordered, retransmitting publisher data channel.
pub const RELIABLE_DC_LABEL: &str = "_reliable";

/// Label of the ordered, zero-retransmit publisher data channel.
pub const LOSSY_DC_LABEL: &str = "_lossy";

// ── Type aliases ────────────────────────────────────────────────────

/// Server-issued participant identifier.
pub type ParticipantSid = String;

/// Server-issued track identifier.
pub type TrackSid = String;

/// Client-generated track identifier, used to correlate add-track requests.
pub type TrackCid = String;

// ── Enums ───────────────────────────────────────────────────────────

/// Which peer connection a signaling message applies to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SignalTarget {
    Publisher,
    Subscriber,
}

/// Media kind of a track.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Simulcast quality rung, low to high.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum VideoQuality {
    Low,
    Medium,
    High,
}

/// Lifecycle state of a participant as reported by the server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantState {
    Joining,
    Joined,
    Active,
    Disconnected,
}

/// Server-evaluated connection quality for a participant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Poor,
    Good,
    Excellent,
}

/// Delivery state of a subscribed media stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Active,
    Paused,
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The local side called disconnect.
    User,
    /// Transport loss or exhausted reconnect attempts.
    Network,
    /// The server asked this client to leave.
    Server,
}

/// What the recipient of a `leave` message is expected to do next.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LeaveAction {
    /// Tear down; do not reconnect.
    Disconnect,
    /// Reconnect, resuming the existing session if possible.
    Resume,
    /// Reconnect with a full rejoin.
    Reconnect,
}

/// SDP type of a session description.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Delivery guarantee of a data packet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DataPacketKind {
    Reliable,
    Lossy,
}

// ── Structs ─────────────────────────────────────────────────────────

/// An SDP offer or answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// A trickled ICE candidate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidateInit {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u32>,
}

/// STUN/TURN server handed out in the join response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServerInfo {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Room-level metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomInfo {
    pub sid: String,
    pub name: String,
    #[serde(default)]
    pub metadata: String,
}

/// One simulcast layer of a published video track.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VideoLayer {
    pub quality: VideoQuality,
    pub width: u32,
    pub height: u32,
    pub bitrate: u64,
}

/// Server view of a published track.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackInfo {
    pub sid: TrackSid,
    pub name: String,
    pub kind: TrackKind,
    pub muted: bool,
    pub width: u32,
    pub height: u32,
    pub simulcast: bool,
    #[serde(default)]
    pub layers: Vec<VideoLayer>,
}

/// Server view of a participant, including their published tracks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParticipantInfo {
    pub sid: ParticipantSid,
    pub identity: String,
    pub name: String,
    pub state: ParticipantState,
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub tracks: Vec<TrackInfo>,
}

/// Momentary speaker activity for one participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeakerInfo {
    pub sid: ParticipantSid,
    pub level: f32,
    pub active: bool,
}

/// Connection quality for one participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionQualityInfo {
    pub participant_sid: ParticipantSid,
    pub quality: ConnectionQuality,
}

/// Delivery state of one subscribed track.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamStateInfo {
    pub participant_sid: ParticipantSid,
    pub track_sid: TrackSid,
    pub state: StreamState,
}

/// One quality rung the server wants enabled or disabled on a published track.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscribedQuality {
    pub quality: VideoQuality,
    pub enabled: bool,
}

/// Track selection scoped to a single participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantTracks {
    pub participant_sid: ParticipantSid,
    pub track_sids: Vec<TrackSid>,
}

/// Per-participant permission grant for track subscription.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackPermission {
    pub participant_sid: ParticipantSid,
    pub all_tracks: bool,
    pub track_sids: Vec<TrackSid>,
}

/// Description of one publisher data channel, replayed in sync-state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataChannelInfo {
    pub label: String,
    pub id: u16,
}

// ── Payload structs ─────────────────────────────────────────────────

/// Payload for the `join` response.
/// Boxed in [`SignalResponse`] to reduce enum size.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinPayload {
    pub room: RoomInfo,
    pub participant: ParticipantInfo,
    pub other_participants: Vec<ParticipantInfo>,
    pub ice_servers: Vec<IceServerInfo>,
    /// When true the subscriber peer connection is the primary transport.
    pub subscriber_primary: bool,
    pub server_version: String,
    /// Keepalive ping interval, in seconds. Zero disables the keepalive.
    #[serde(default)]
    pub ping_interval: u32,
    /// Missing-pong tolerance, in seconds.
    #[serde(default)]
    pub ping_timeout: u32,
}

/// Payload for the `add_track` request.
/// Boxed in [`SignalRequest`] to reduce enum size.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddTrackRequest {
    pub cid: TrackCid,
    pub name: String,
    pub kind: TrackKind,
    pub muted: bool,
    pub width: u32,
    pub height: u32,
    pub simulcast: bool,
    #[serde(default)]
    pub layers: Vec<VideoLayer>,
}

/// Payload for the `track_published` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackPublishedPayload {
    pub cid: TrackCid,
    pub track: TrackInfo,
}

/// Renderer-driven settings for a subscribed track.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateTrackSettings {
    pub track_sids: Vec<TrackSid>,
    pub disabled: bool,
    pub quality: VideoQuality,
    pub width: u32,
    pub height: u32,
}

/// Subscribe or unsubscribe from a set of tracks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateSubscription {
    pub track_sids: Vec<TrackSid>,
    pub subscribe: bool,
    #[serde(default)]
    pub participant_tracks: Vec<ParticipantTracks>,
}

/// Which participants may subscribe to this client's tracks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionPermission {
    pub all_participants: bool,
    pub track_permissions: Vec<TrackPermission>,
}

/// Client session snapshot sent after a quick resume.
/// Boxed in [`SignalRequest`] to reduce enum size.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncStatePayload {
    /// The subscriber's most recent local answer, if one was applied.
    pub answer: Option<SessionDescription>,
    pub subscription: UpdateSubscription,
    pub publish_tracks: Vec<TrackPublishedPayload>,
    pub data_channels: Vec<DataChannelInfo>,
}

/// Payload for `leave`, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeavePayload {
    pub reason: DisconnectReason,
    pub action: LeaveAction,
}

/// Payload for `mute`, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutePayload {
    pub sid: TrackSid,
    pub muted: bool,
}

/// Payload for the `subscribed_quality_update` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscribedQualityUpdate {
    pub track_sid: TrackSid,
    pub subscribed_qualities: Vec<SubscribedQuality>,
}

/// Payload for the `subscription_permission_update` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionPermissionUpdate {
    pub participant_sid: ParticipantSid,
    pub track_sid: TrackSid,
    pub allowed: bool,
}

/// Server-side condition the client can ask the deployment to fake.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum SimulatePayload {
    /// Mark this participant as an active speaker for `seconds`.
    SpeakerUpdate { seconds: u32 },
    NodeFailure,
    ServerLeave,
    Migration,
    /// Drop non-TCP ICE candidates on the server side.
    ForceTcp,
    /// Drop non-TLS ICE candidates on the server side.
    ForceTls,
}

// ── Messages ────────────────────────────────────────────────────────

/// Message types sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum SignalRequest {
    /// Publisher SDP offer.
    Offer(SessionDescription),
    /// Subscriber SDP answer.
    Answer(SessionDescription),
    /// Locally gathered ICE candidate.
    Trickle {
        candidate: IceCandidateInit,
        target: SignalTarget,
    },
    /// Announce a local track before attaching it to the publisher.
    AddTrack(Box<AddTrackRequest>),
    /// Change the mute state of a published track.
    Mute(MutePayload),
    /// Renderer-driven settings for subscribed tracks.
    UpdateTrackSettings(UpdateTrackSettings),
    /// Explicit subscription change.
    UpdateSubscription(UpdateSubscription),
    /// Subscription permission grant for this client's tracks.
    SubscriptionPermission(SubscriptionPermission),
    /// Session snapshot after a quick resume (boxed to reduce enum size).
    SyncState(Box<SyncStatePayload>),
    /// Graceful departure.
    Leave(LeavePayload),
    /// Ask the server to fake a failure condition.
    Simulate(SimulatePayload),
    /// Keepalive. Carries the sender's timestamp in unix milliseconds.
    Ping { timestamp: i64 },
}

/// Message types sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum SignalResponse {
    /// Session granted (boxed to reduce enum size).
    Join(Box<JoinPayload>),
    /// Publisher SDP answer.
    Answer(SessionDescription),
    /// Subscriber SDP offer.
    Offer(SessionDescription),
    /// Remotely gathered ICE candidate.
    Trickle {
        candidate: IceCandidateInit,
        target: SignalTarget,
    },
    /// Participant delta: joins, updates and departures.
    Update { participants: Vec<ParticipantInfo> },
    /// Correlates an `add_track` request by client track id.
    TrackPublished(TrackPublishedPayload),
    /// Momentary speaker activity.
    SpeakersChanged { speakers: Vec<SpeakerInfo> },
    /// Per-participant connection quality.
    ConnectionQuality { updates: Vec<ConnectionQualityInfo> },
    /// Server-forced mute state change for a local track.
    Mute(MutePayload),
    /// Server-initiated departure.
    Leave(LeavePayload),
    /// Room metadata changed.
    RoomUpdate { room: RoomInfo },
    /// Delivery state changes for subscribed tracks.
    StreamStateUpdate { stream_states: Vec<StreamStateInfo> },
    /// Which simulcast rungs the server currently wants published.
    SubscribedQualityUpdate(SubscribedQualityUpdate),
    /// A subscription was allowed or revoked.
    SubscriptionPermissionUpdate(SubscriptionPermissionUpdate),
    /// Replacement access token for subsequent reconnects.
    RefreshToken { token: String },
    /// Keepalive reply. Echoes the ping timestamp.
    Pong { timestamp: i64 },
}

impl SignalRequest {
    /// Whether this request may sit in the reconnect queue and be replayed
    /// after the socket reopens. Point-in-time negotiation messages would be
    /// stale by then and are never queued.
    pub fn is_queueable(&self) -> bool {
        !matches!(
            self,
            Self::Offer(_)
                | Self::Answer(_)
                | Self::Trickle { .. }
                | Self::SyncState(_)
                | Self::Simulate(_)
        )
    }

    /// Stable lowercase name of this message kind, for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::Trickle { .. } => "trickle",
            Self::AddTrack(_) => "add_track",
            Self::Mute(_) => "mute",
            Self::UpdateTrackSettings(_) => "update_track_settings",
            Self::UpdateSubscription(_) => "update_subscription",
            Self::SubscriptionPermission(_) => "subscription_permission",
            Self::SyncState(_) => "sync_state",
            Self::Leave(_) => "leave",
            Self::Simulate(_) => "simulate",
            Self::Ping { .. } => "ping",
        }
    }
}

impl SignalResponse {
    /// Stable lowercase name of this message kind, for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join(_) => "join",
            Self::Answer(_) => "answer",
            Self::Offer(_) => "offer",
            Self::Trickle { .. } => "trickle",
            Self::Update { .. } => "update",
            Self::TrackPublished(_) => "track_published",
            Self::SpeakersChanged { .. } => "speakers_changed",
            Self::ConnectionQuality { .. } => "connection_quality",
            Self::Mute(_) => "mute",
            Self::Leave(_) => "leave",
            Self::RoomUpdate { .. } => "room_update",
            Self::StreamStateUpdate { .. } => "stream_state_update",
            Self::SubscribedQualityUpdate(_) => "subscribed_quality_update",
            Self::SubscriptionPermissionUpdate(_) => "subscription_permission_update",
            Self::RefreshToken { .. } => "refresh_token",
            Self::Pong { .. } => "pong",
        }
    }
}

// ── Data packets ────────────────────────────────────────────────────

/// Envelope carried over the publisher data channels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataPacket {
    pub kind: DataPacketKind,
    pub value: DataPacketValue,
}

/// Contents of a data packet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum DataPacketValue {
    /// Speaker activity fanned out by the server.
    Speaker { speakers: Vec<SpeakerInfo> },
    /// Opaque user payload.
    User(UserPacket),
}

/// User payload relayed between participants.
/// Uses `Vec<u8>` with `serde_bytes` for efficient serialization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserPacket {
    /// Sender sid; filled in by the server on delivery.
    #[serde(default)]
    pub participant_sid: ParticipantSid,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// Recipient sids. Empty broadcasts to the room.
    #[serde(default)]
    pub dest_sids: Vec<ParticipantSid>,
    pub topic: Option<String>,
}

// ── Codecs ──────────────────────────────────────────────────────────

/// Encode a request for a binary socket frame.
pub fn encode_request(request: &SignalRequest) -> Result<Vec<u8>> {
    bincode::serialize(request).map_err(|e| RoomWireError::Serialize(e.to_string()))
}

/// Decode a request from a binary socket frame.
pub fn decode_request(bytes: &[u8]) -> Result<SignalRequest> {
    bincode::deserialize(bytes).map_err(|e| RoomWireError::Parse(e.to_string()))
}

/// Encode a response for a binary socket frame.
pub fn encode_response(response: &SignalResponse) -> Result<Vec<u8>> {
    bincode::serialize(response).map_err(|e| RoomWireError::Serialize(e.to_string()))
}

/// Decode a response from a binary socket frame.
pub fn decode_response(bytes: &[u8]) -> Result<SignalResponse> {
    bincode::deserialize(bytes).map_err(|e| RoomWireError::Parse(e.to_string()))
}

/// Decode a response from a JSON text frame (fallback path).
pub fn decode_response_json(text: &str) -> Result<SignalResponse> {
    serde_json::from_str(text).map_err(|e| RoomWireError::Parse(e.to_string()))
}

/// Encode a data packet for the publisher data channel.
pub fn encode_data_packet(packet: &DataPacket) -> Result<Vec<u8>> {
    bincode::serialize(packet).map_err(|e| RoomWireError::Serialize(e.to_string()))
}

/// Decode a data packet received from a subscriber data channel.
pub fn decode_data_packet(bytes: &[u8]) -> Result<DataPacket> {
    bincode::deserialize(bytes).map_err(|e| RoomWireError::Parse(e.to_string()))
}
