//! One connection epoch.
//!
//! [`RtcSession`] ties together everything that lives and dies with a single
//! signal connection: the [`SignalClient`], the publisher and subscriber
//! [`RtcTransport`]s, the two publisher data channels and the tasks pumping
//! signal and peer events. A quick resume restarts pieces of a session in
//! place; a full reconnect throws the session away and builds a new one.
//!
//! Sessions are deliberately dumb about policy. They report losses through
//! [`SessionEvent::Close`] and leave the decision to reconnect, resume or
//! give up to the engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::{Result, RoomWireError};
use crate::media::{new_track_cid, LocalMediaTrack, RemoteMediaTrack};
use crate::options::{compute_video_layers, EngineOptions};
use crate::protocol::{
    self, AddTrackRequest, ConnectionQualityInfo, DataChannelInfo, DataPacket, DataPacketKind,
    DataPacketValue, JoinPayload, LeavePayload, MutePayload, ParticipantInfo, RoomInfo, SdpKind,
    SessionDescription, SignalRequest, SignalResponse, SignalTarget, SpeakerInfo, StreamStateInfo,
    SubscribedQualityUpdate, SubscriptionPermissionUpdate, SyncStatePayload, TrackCid, TrackInfo,
    TrackPublishedPayload, TrackSid, UpdateSubscription, LOSSY_DC_LABEL, MAX_DATA_PAYLOAD_SIZE,
    RELIABLE_DC_LABEL,
};
use crate::rtc::peer::{
    DataChannel, DataChannelInit, DataChannelState, OfferOptions, PeerEvent, PeerState,
    RtcConfiguration,
};
use crate::rtc::transport::RtcTransport;
use crate::signal::{SignalClient, SignalEvent, SignalEvents};
use crate::state::ConnectionState;
use crate::utils::pending::PendingMap;

/// How long to wait for a peer connection to reach `Connected`.
pub const ICE_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// How long to wait for the server to acknowledge an `add_track` request.
pub const TRACK_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting on peer connection or data channel state.
const PEER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Events a session reports to the engine.
#[derive(Debug)]
pub enum SessionEvent {
    ParticipantUpdate { participants: Vec<ParticipantInfo> },
    RoomUpdate { room: RoomInfo },
    SpeakersChanged { speakers: Vec<SpeakerInfo> },
    ConnectionQuality { updates: Vec<ConnectionQualityInfo> },
    StreamStateUpdate { stream_states: Vec<StreamStateInfo> },
    SubscribedQualityUpdate { update: SubscribedQualityUpdate },
    SubscriptionPermissionUpdate { update: SubscriptionPermissionUpdate },
    /// The server changed the mute state of one of this client's tracks.
    RemoteMute { sid: TrackSid, muted: bool },
    /// The server asked this client to leave, resume or reconnect.
    Leave { payload: LeavePayload },
    /// A remote media track arrived on the subscriber.
    MediaTrack { track: Arc<dyn RemoteMediaTrack> },
    /// A data packet arrived on one of the data channels.
    Data {
        kind: DataPacketKind,
        value: DataPacketValue,
    },
    /// The session lost its connection. The engine decides what happens next.
    Close { source: String },
}

/// Sender half handed to [`RtcSession::connect`].
pub type SessionEmitter = mpsc::UnboundedSender<SessionEvent>;

struct SessionInner {
    signal: SignalClient,
    publisher: Arc<RtcTransport>,
    subscriber: Arc<RtcTransport>,
    reliable_dc: Arc<dyn DataChannel>,
    lossy_dc: Arc<dyn DataChannel>,
    subscriber_primary: bool,
    auto_subscribe: bool,
    has_published: AtomicBool,
    closed: AtomicBool,
    /// One loss report per outage: set when `Close` is emitted, cleared by a
    /// successful resume.
    close_reported: AtomicBool,
    /// In-flight `add_track` requests, keyed by client track id.
    pending_tracks: PendingMap<TrackCid, TrackInfo>,
    /// Server-acknowledged publications, keyed by client track id.
    published: Mutex<HashMap<TrackCid, TrackInfo>>,
    emitter: SessionEmitter,
}

pub struct RtcSession {
    inner: Arc<SessionInner>,
    signal_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    rtc_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RtcSession {
    /// Dial the signal endpoint, build both peer transports and start the
    /// event pumps. Returns once the join handshake completes; ICE proceeds
    /// in the background.
    pub async fn connect(
        url: &str,
        token: &str,
        options: &EngineOptions,
        emitter: SessionEmitter,
    ) -> Result<(Self, JoinPayload)> {
        let (signal, join, signal_events) = SignalClient::connect(
            Arc::clone(&options.connector),
            url,
            token,
            options.signal.clone(),
        )
        .await?;

        let config = RtcConfiguration {
            ice_servers: join.ice_servers.clone(),
        };
        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();
        let publisher_peer = options.peers.create_peer(
            SignalTarget::Publisher,
            config.clone(),
            peer_events_tx.clone(),
        )?;
        let subscriber_peer =
            options
                .peers
                .create_peer(SignalTarget::Subscriber, config, peer_events_tx)?;
        let publisher = Arc::new(RtcTransport::new(SignalTarget::Publisher, publisher_peer));
        let subscriber = Arc::new(RtcTransport::new(SignalTarget::Subscriber, subscriber_peer));

        // The data channels ride the publisher and must exist before its
        // first offer so they appear in the SDP.
        let reliable_dc = publisher
            .peer()
            .create_data_channel(RELIABLE_DC_LABEL, DataChannelInit::default())
            .await?;
        let lossy_dc = publisher
            .peer()
            .create_data_channel(
                LOSSY_DC_LABEL,
                DataChannelInit {
                    ordered: true,
                    max_retransmits: Some(0),
                },
            )
            .await?;

        let inner = Arc::new(SessionInner {
            signal,
            publisher,
            subscriber,
            reliable_dc,
            lossy_dc,
            subscriber_primary: join.subscriber_primary,
            auto_subscribe: options.signal.auto_subscribe,
            has_published: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_reported: AtomicBool::new(false),
            pending_tracks: PendingMap::new(),
            published: Mutex::new(HashMap::new()),
            emitter,
        });

        // Publisher offers flow straight into the signal client. Weak so the
        // transport's handler does not keep the session alive.
        {
            let weak = Arc::downgrade(&inner);
            inner.publisher.on_offer(move |offer| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        if let Err(e) = inner.signal.send(SignalRequest::Offer(offer)).await {
                            warn!("failed to send publisher offer: {e}");
                        }
                    }
                }
            });
        }

        let session = Self {
            signal_task: Mutex::new(Some(tokio::spawn(signal_task(
                Arc::clone(&inner),
                signal_events,
            )))),
            rtc_task: Mutex::new(Some(tokio::spawn(rtc_task(
                Arc::clone(&inner),
                peer_events_rx,
            )))),
            inner,
        };

        // Transports exist now; release the responses held since join.
        session.inner.signal.resume_responses();

        if !join.subscriber_primary {
            // Publisher-primary deployments expect the client to start
            // negotiation immediately.
            session.inner.publisher.negotiate();
        }

        Ok((session, join))
    }

    /// Publish a local track: announce it, wait for the server's ack, attach
    /// the media to the publisher and renegotiate. Returns the client track
    /// id alongside the server's track info.
    pub async fn publish_track(
        &self,
        track: Arc<dyn LocalMediaTrack>,
    ) -> Result<(TrackCid, TrackInfo)> {
        self.ensure_open()?;
        let cid = new_track_cid();
        let dimensions = track.dimensions();
        let layers = dimensions
            .map(|d| compute_video_layers(d.width, d.height))
            .unwrap_or_default();
        let request = AddTrackRequest {
            cid: cid.clone(),
            name: track.name(),
            kind: track.kind(),
            muted: false,
            width: dimensions.map_or(0, |d| d.width),
            height: dimensions.map_or(0, |d| d.height),
            simulcast: layers.len() > 1,
            layers: layers.clone(),
        };

        let ack = self
            .inner
            .pending_tracks
            .register(cid.clone())
            .ok_or_else(|| {
                RoomWireError::Duplicate(format!("track {cid} is already being published"))
            })?;
        if let Err(e) = self
            .inner
            .signal
            .send(SignalRequest::AddTrack(Box::new(request)))
            .await
        {
            self.inner.pending_tracks.remove(&cid);
            return Err(e);
        }

        let info = match tokio::time::timeout(TRACK_PUBLISH_TIMEOUT, ack).await {
            Ok(Ok(info)) => info,
            Ok(Err(_)) => {
                self.inner.pending_tracks.remove(&cid);
                return Err(RoomWireError::State(
                    "session closed while publishing".into(),
                ));
            }
            Err(_) => {
                self.inner.pending_tracks.remove(&cid);
                return Err(RoomWireError::Timeout("track publication"));
            }
        };
        debug!(cid = %cid, sid = %info.sid, "track published");

        self.inner
            .published
            .lock()
            .insert(cid.clone(), info.clone());
        self.inner
            .publisher
            .peer()
            .add_track(cid.clone(), track, layers)
            .await?;
        self.inner.has_published.store(true, Ordering::SeqCst);
        self.inner.publisher.negotiate();
        Ok((cid, info))
    }

    /// Detach a published track and renegotiate. The server learns about the
    /// removal from the SDP.
    pub async fn unpublish_track(&self, cid: &str) -> Result<()> {
        self.ensure_open()?;
        if self.inner.published.lock().remove(cid).is_none() {
            return Err(RoomWireError::State(format!(
                "track {cid} is not published"
            )));
        }
        self.inner.publisher.peer().remove_track(cid).await?;
        self.inner.publisher.negotiate();
        Ok(())
    }

    /// Report a local mute change to the server.
    pub async fn set_track_muted(&self, sid: &str, muted: bool) -> Result<()> {
        self.ensure_open()?;
        {
            let mut published = self.inner.published.lock();
            if let Some(track) = published.values_mut().find(|track| track.sid == sid) {
                track.muted = muted;
            }
        }
        self.inner
            .signal
            .send(SignalRequest::Mute(MutePayload {
                sid: sid.to_owned(),
                muted,
            }))
            .await
    }

    /// Send a data packet over the matching publisher data channel,
    /// connecting the publisher first if it never negotiated.
    pub async fn publish_data(&self, packet: DataPacket) -> Result<()> {
        self.ensure_open()?;
        if let DataPacketValue::User(user) = &packet.value {
            if user.payload.len() > MAX_DATA_PAYLOAD_SIZE {
                return Err(RoomWireError::Data(format!(
                    "payload of {} bytes exceeds the {MAX_DATA_PAYLOAD_SIZE} byte limit",
                    user.payload.len()
                )));
            }
        }
        self.ensure_publisher_connected().await?;
        let dc = match packet.kind {
            DataPacketKind::Reliable => &self.inner.reliable_dc,
            DataPacketKind::Lossy => &self.inner.lossy_dc,
        };
        self.wait_dc_open(dc, ICE_CONNECT_TIMEOUT).await?;
        let bytes = protocol::encode_data_packet(&packet)?;
        dc.send(&bytes).await
    }

    /// Quick resume: restart the signal socket in place, restart ICE where
    /// needed and replay session state, all without a new join handshake.
    pub async fn resume(&self) -> Result<()> {
        self.ensure_open()?;
        if self.inner.subscriber_primary {
            // The server offers the subscriber a fresh ICE session on resume;
            // buffer its candidates until that offer lands.
            self.inner.subscriber.prepare_ice_restart();
        }
        self.inner.signal.restart().await?;

        if self.inner.has_published.load(Ordering::SeqCst) || !self.inner.subscriber_primary {
            self.inner
                .publisher
                .create_and_send_offer(OfferOptions { ice_restart: true })
                .await?;
        }

        self.wait_primary_connected(ICE_CONNECT_TIMEOUT).await?;
        self.send_sync_state().await?;
        // The session is healthy again; future losses should be reported.
        self.inner.close_reported.store(false, Ordering::SeqCst);
        debug!("session resumed");
        Ok(())
    }

    /// Wait until the primary transport reports `Connected`.
    pub async fn wait_primary_connected(&self, timeout: Duration) -> Result<()> {
        let primary = if self.inner.subscriber_primary {
            &self.inner.subscriber
        } else {
            &self.inner.publisher
        };
        self.inner.wait_transport_connected(primary, timeout).await
    }

    /// Pass a request through to the signal client, subject to its queueing
    /// rules.
    pub async fn send_request(&self, request: SignalRequest) -> Result<()> {
        self.inner.signal.send(request).await
    }

    /// Acked publications as (client id, server info) pairs, for republishing
    /// after a full reconnect.
    pub fn published_tracks(&self) -> Vec<(TrackCid, TrackInfo)> {
        self.inner
            .published
            .lock()
            .iter()
            .map(|(cid, info)| (cid.clone(), info.clone()))
            .collect()
    }

    pub fn subscriber_primary(&self) -> bool {
        self.inner.subscriber_primary
    }

    pub fn signal_state(&self) -> ConnectionState {
        self.inner.signal.state()
    }

    /// The token to use for the next connection attempt, including any
    /// refresh the server pushed.
    pub fn token(&self) -> String {
        self.inner.signal.token()
    }

    /// Tear the session down. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing rtc session");
        self.inner.pending_tracks.clear();
        self.inner.signal.close().await;
        self.inner.publisher.close().await;
        self.inner.subscriber.close().await;
        if let Some(task) = self.signal_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.rtc_task.lock().take() {
            task.abort();
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RoomWireError::State("session is closed".into()));
        }
        Ok(())
    }

    async fn ensure_publisher_connected(&self) -> Result<()> {
        if self.inner.publisher.is_connected() {
            return Ok(());
        }
        self.inner.publisher.negotiate();
        self.inner
            .wait_transport_connected(&self.inner.publisher, ICE_CONNECT_TIMEOUT)
            .await
    }

    async fn wait_dc_open(&self, dc: &Arc<dyn DataChannel>, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if dc.state() == DataChannelState::Open {
                return Ok(());
            }
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(RoomWireError::State("session is closed".into()));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RoomWireError::Timeout("data channel open"));
            }
            tokio::time::sleep(PEER_POLL_INTERVAL).await;
        }
    }

    async fn send_sync_state(&self) -> Result<()> {
        let payload = self.inner.sync_state();
        self.inner
            .signal
            .send(SignalRequest::SyncState(Box::new(payload)))
            .await
    }
}

impl std::fmt::Debug for RtcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcSession")
            .field("signal", &self.inner.signal.state())
            .field("subscriber_primary", &self.inner.subscriber_primary)
            .finish()
    }
}

impl Drop for RtcSession {
    fn drop(&mut self) {
        if let Some(task) = self.signal_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.rtc_task.lock().take() {
            task.abort();
        }
    }
}

impl SessionInner {
    fn emit(&self, event: SessionEvent) {
        let _ = self.emitter.send(event);
    }

    /// Emit at most one `Close` per outage, across both event pumps.
    fn report_close(&self, source: String) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if !self.close_reported.swap(true, Ordering::SeqCst) {
            self.emit(SessionEvent::Close { source });
        }
    }

    async fn wait_transport_connected(
        &self,
        transport: &Arc<RtcTransport>,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if transport.is_connected() {
                return Ok(());
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(RoomWireError::State("session is closed".into()));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RoomWireError::Timeout("ice connection"));
            }
            tokio::time::sleep(PEER_POLL_INTERVAL).await;
        }
    }

    /// Snapshot sent to the server after a quick resume so it can verify the
    /// client's view survived the socket loss.
    fn sync_state(&self) -> SyncStatePayload {
        let answer = self.subscriber_answer();
        let publish_tracks = self
            .published
            .lock()
            .iter()
            .map(|(cid, track)| TrackPublishedPayload {
                cid: cid.clone(),
                track: track.clone(),
            })
            .collect();
        SyncStatePayload {
            answer,
            subscription: UpdateSubscription {
                track_sids: Vec::new(),
                // With auto-subscribe the empty subscribe-all form tells the
                // server to keep fanning out everything.
                subscribe: self.auto_subscribe,
                participant_tracks: Vec::new(),
            },
            publish_tracks,
            data_channels: vec![
                DataChannelInfo {
                    label: self.reliable_dc.label(),
                    id: self.reliable_dc.id(),
                },
                DataChannelInfo {
                    label: self.lossy_dc.label(),
                    id: self.lossy_dc.id(),
                },
            ],
        }
    }

    /// The subscriber's current local answer, if one was ever applied.
    fn subscriber_answer(&self) -> Option<SessionDescription> {
        self.subscriber
            .peer()
            .local_description()
            .filter(|sd| sd.kind == SdpKind::Answer)
    }

    async fn on_signal_message(&self, message: SignalResponse) {
        match message {
            SignalResponse::Answer(sd) => {
                debug!("received publisher answer");
                if let Err(e) = self.publisher.set_remote_description(sd).await {
                    error!("failed to apply publisher answer: {e}");
                }
            }
            SignalResponse::Offer(sd) => {
                debug!("received subscriber offer");
                if let Err(e) = self.handle_subscriber_offer(sd).await {
                    error!("failed to answer subscriber offer: {e}");
                }
            }
            SignalResponse::Trickle { candidate, target } => {
                let transport = match target {
                    SignalTarget::Publisher => &self.publisher,
                    SignalTarget::Subscriber => &self.subscriber,
                };
                if let Err(e) = transport.add_ice_candidate(candidate).await {
                    warn!(?target, "failed to add remote ice candidate: {e}");
                }
            }
            SignalResponse::TrackPublished(payload) => {
                if !self.pending_tracks.complete(&payload.cid, payload.track) {
                    debug!(cid = %payload.cid, "unsolicited track_published ack");
                }
            }
            SignalResponse::Update { participants } => {
                self.emit(SessionEvent::ParticipantUpdate { participants });
            }
            SignalResponse::RoomUpdate { room } => {
                self.emit(SessionEvent::RoomUpdate { room });
            }
            SignalResponse::SpeakersChanged { speakers } => {
                self.emit(SessionEvent::SpeakersChanged { speakers });
            }
            SignalResponse::ConnectionQuality { updates } => {
                self.emit(SessionEvent::ConnectionQuality { updates });
            }
            SignalResponse::StreamStateUpdate { stream_states } => {
                self.emit(SessionEvent::StreamStateUpdate { stream_states });
            }
            SignalResponse::SubscribedQualityUpdate(update) => {
                self.emit(SessionEvent::SubscribedQualityUpdate { update });
            }
            SignalResponse::SubscriptionPermissionUpdate(update) => {
                self.emit(SessionEvent::SubscriptionPermissionUpdate { update });
            }
            SignalResponse::Mute(payload) => {
                self.emit(SessionEvent::RemoteMute {
                    sid: payload.sid,
                    muted: payload.muted,
                });
            }
            SignalResponse::Leave(payload) => {
                debug!(action = ?payload.action, "server asked us to leave");
                self.emit(SessionEvent::Leave { payload });
            }
            // Join, pong and token refreshes never leave the signal client.
            other => debug!(kind = other.kind(), "ignoring signal message"),
        }
    }

    async fn handle_subscriber_offer(&self, offer: SessionDescription) -> Result<()> {
        self.subscriber.set_remote_description(offer).await?;
        let answer = self.subscriber.peer().create_answer().await?;
        self.subscriber
            .peer()
            .set_local_description(answer.clone())
            .await?;
        self.signal.send(SignalRequest::Answer(answer)).await
    }

    fn on_peer_state(&self, target: SignalTarget, state: PeerState) {
        debug!(?target, ?state, "peer connection state changed");
        let primary = if self.subscriber_primary {
            SignalTarget::Subscriber
        } else {
            SignalTarget::Publisher
        };
        // Secondary transports recover through negotiation; only a failed
        // primary means the session is gone.
        if target == primary && state == PeerState::Failed {
            warn!(?target, "primary peer connection failed");
            self.report_close("primary peer connection failed".into());
        }
    }

    fn on_data(&self, payload: &[u8]) {
        match protocol::decode_data_packet(payload) {
            Ok(packet) => self.emit(SessionEvent::Data {
                kind: packet.kind,
                value: packet.value,
            }),
            Err(e) => warn!("failed to decode data packet: {e}"),
        }
    }
}

/// Pumps decoded signal messages into session handling.
async fn signal_task(inner: Arc<SessionInner>, mut events: SignalEvents) {
    while let Some(event) = events.recv().await {
        match event {
            SignalEvent::Message(message) => inner.on_signal_message(*message).await,
            SignalEvent::Close(source) => {
                debug!("signal connection closed: {source}");
                inner.report_close(source);
            }
        }
    }
}

/// Pumps peer events from both transports into session handling.
async fn rtc_task(inner: Arc<SessionInner>, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::IceCandidate { target, candidate } => {
                if let Err(e) = inner
                    .signal
                    .send(SignalRequest::Trickle { candidate, target })
                    .await
                {
                    debug!(?target, "dropped local ice candidate: {e}");
                }
            }
            PeerEvent::StateChanged { target, state } => inner.on_peer_state(target, state),
            PeerEvent::Data { payload, .. } => inner.on_data(&payload),
            PeerEvent::Track { track } => inner.emit(SessionEvent::MediaTrack { track }),
        }
    }
}
