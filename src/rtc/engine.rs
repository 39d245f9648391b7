//! Connection state machine.
//!
//! [`RtcEngine`] owns the current [`RtcSession`] and the policy around it:
//! when a session reports a loss the engine first attempts a quick resume,
//! then escalates to full reconnects (new session, new join handshake) until
//! the retry policy is exhausted, at which point it emits exactly one
//! [`EngineEvent::Disconnected`]. Publications and subscription settings are
//! remembered across session swaps so a full reconnect can rebuild the
//! server-side state the old session carried.
//!
//! All reconnect work runs inside the engine task, serialized with event
//! processing; the per-session event channel is replaced together with the
//! session so stale events from a dead session cannot leak into a fresh one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use crate::error::{Result, RoomWireError};
use crate::media::{LocalMediaTrack, RemoteMediaTrack};
use crate::options::EngineOptions;
use crate::protocol::{
    ConnectionQualityInfo, DataPacket, DataPacketKind, DataPacketValue, DisconnectReason,
    JoinPayload, LeaveAction, LeavePayload, ParticipantInfo, RoomInfo, SignalRequest,
    SimulatePayload, SpeakerInfo, StreamStateInfo, SubscribedQualityUpdate, SubscriptionPermission,
    SubscriptionPermissionUpdate, TrackCid, TrackInfo, TrackSid, UpdateSubscription,
    UpdateTrackSettings,
};
use crate::rtc::session::{RtcSession, SessionEvent, ICE_CONNECT_TIMEOUT};
use crate::state::{ConnectMode, ConnectionState, ReconnectMode};
use crate::utils::retry::{retry, RetryError};
use crate::utils::watchable::Watchable;

/// Events the engine reports to the room layer.
#[derive(Debug)]
pub enum EngineEvent {
    /// The engine's connection state changed.
    StateChanged {
        previous: ConnectionState,
        current: ConnectionState,
    },
    ParticipantUpdate { participants: Vec<ParticipantInfo> },
    RoomUpdate { room: RoomInfo },
    SpeakersChanged { speakers: Vec<SpeakerInfo> },
    ConnectionQuality { updates: Vec<ConnectionQualityInfo> },
    StreamStateUpdate { stream_states: Vec<StreamStateInfo> },
    SubscribedQualityUpdate { update: SubscribedQualityUpdate },
    SubscriptionPermissionUpdate { update: SubscriptionPermissionUpdate },
    /// The server changed the mute state of one of this client's tracks.
    RemoteMute { sid: TrackSid, muted: bool },
    MediaTrack { track: Arc<dyn RemoteMediaTrack> },
    Data {
        kind: DataPacketKind,
        value: DataPacketValue,
    },
    /// A quick resume started.
    Resuming,
    /// A quick resume finished; server state survived intact.
    Resumed,
    /// A full reconnect started; local room state is about to be replaced.
    Restarting,
    /// A full reconnect finished. Carries the new join payload so the room
    /// can rebuild.
    Restarted { join: Box<JoinPayload> },
    /// Terminal for this engine. Emitted exactly once.
    Disconnected { reason: DisconnectReason },
}

/// Receiving end of the engine event stream.
pub type EngineEvents = mpsc::UnboundedReceiver<EngineEvent>;

/// A publication remembered for republishing after a full reconnect.
#[derive(Clone)]
struct PublishedTrack {
    track: Arc<dyn LocalMediaTrack>,
    sid: TrackSid,
    muted: bool,
}

/// Subscription-side settings replayed after every successful reconnect.
#[derive(Default)]
struct SavedSettings {
    track_settings: HashMap<TrackSid, UpdateTrackSettings>,
    subscriptions: HashMap<TrackSid, bool>,
    permission: Option<SubscriptionPermission>,
}

struct EngineInner {
    options: EngineOptions,
    url: String,
    token: Mutex<String>,
    state: Watchable<ConnectionState>,
    session: RwLock<Option<Arc<RtcSession>>>,
    emitter: mpsc::UnboundedSender<EngineEvent>,
    /// Held for the duration of a reconnect sequence.
    reconnect_lock: AsyncMutex<()>,
    publications: Mutex<HashMap<TrackCid, PublishedTrack>>,
    settings: Mutex<SavedSettings>,
    closed: AtomicBool,
    /// Guards the one-and-only `Disconnected` emission.
    terminated: AtomicBool,
    engine_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Handle to the connection state machine. One engine serves one room for
/// its whole lifetime, across any number of sessions.
pub struct RtcEngine {
    inner: Arc<EngineInner>,
}

impl RtcEngine {
    /// Connect and return the engine, the join payload and the event stream.
    pub async fn connect(
        url: &str,
        token: &str,
        options: EngineOptions,
    ) -> Result<(Self, JoinPayload, EngineEvents)> {
        let (emitter, events) = mpsc::unbounded_channel();
        let inner = Arc::new(EngineInner {
            options,
            url: url.to_owned(),
            token: Mutex::new(token.to_owned()),
            state: Watchable::new(ConnectionState::Connecting {
                mode: ConnectMode::Normal,
            }),
            session: RwLock::new(None),
            emitter: emitter.clone(),
            reconnect_lock: AsyncMutex::new(()),
            publications: Mutex::new(HashMap::new()),
            settings: Mutex::new(SavedSettings::default()),
            closed: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            engine_task: Mutex::new(None),
        });
        inner.state.on_change(move |old, new| {
            if old != new {
                let _ = emitter.send(EngineEvent::StateChanged {
                    previous: *old,
                    current: *new,
                });
            }
        });

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (session, join) =
            match RtcSession::connect(url, token, &inner.options, session_tx).await {
                Ok(connected) => connected,
                Err(e) => {
                    inner.state.set(ConnectionState::Disconnected {
                        reason: DisconnectReason::Network,
                    });
                    return Err(e);
                }
            };
        // Connected means the primary transport carries media, not just
        // that signaling is up.
        let session = Arc::new(session);
        if let Err(e) = session.wait_primary_connected(ICE_CONNECT_TIMEOUT).await {
            session.close().await;
            inner.state.set(ConnectionState::Disconnected {
                reason: DisconnectReason::Network,
            });
            return Err(e);
        }
        *inner.session.write() = Some(session);
        inner.state.set(ConnectionState::Connected {
            mode: ConnectMode::Normal,
        });

        let task = tokio::spawn(engine_task(Arc::clone(&inner), session_rx));
        *inner.engine_task.lock() = Some(task);
        Ok((Self { inner }, join, events))
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.read()
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Publish a local track and remember it for republishing after a full
    /// reconnect.
    pub async fn publish_track(&self, track: Arc<dyn LocalMediaTrack>) -> Result<TrackInfo> {
        self.inner.ensure_running()?;
        let session = self.inner.current_session()?;
        let (cid, info) = session.publish_track(Arc::clone(&track)).await?;
        self.inner.publications.lock().insert(
            cid,
            PublishedTrack {
                track,
                sid: info.sid.clone(),
                muted: false,
            },
        );
        Ok(info)
    }

    /// Unpublish by server-assigned sid.
    pub async fn unpublish_track(&self, sid: &str) -> Result<()> {
        self.inner.ensure_running()?;
        let session = self.inner.current_session()?;
        let cid = self
            .inner
            .publications
            .lock()
            .iter()
            .find(|(_, publication)| publication.sid == sid)
            .map(|(cid, _)| cid.clone())
            .ok_or_else(|| RoomWireError::State(format!("track {sid} is not published")))?;
        session.unpublish_track(&cid).await?;
        self.inner.publications.lock().remove(&cid);
        Ok(())
    }

    /// Change the mute state of a published track. Muted tracks are not
    /// republished by a full reconnect.
    pub async fn set_track_muted(&self, sid: &str, muted: bool) -> Result<()> {
        self.inner.ensure_running()?;
        let session = self.inner.current_session()?;
        self.inner.note_mute(sid, muted);
        session.set_track_muted(sid, muted).await
    }

    /// Send a data packet to the room over the publisher data channels.
    pub async fn publish_data(&self, packet: DataPacket) -> Result<()> {
        self.inner.ensure_running()?;
        let session = self.inner.current_session()?;
        session.publish_data(packet).await
    }

    /// Apply renderer-driven settings for subscribed tracks. Remembered and
    /// replayed after reconnects.
    pub async fn update_track_settings(&self, settings: UpdateTrackSettings) -> Result<()> {
        self.inner.ensure_running()?;
        {
            let mut saved = self.inner.settings.lock();
            for sid in &settings.track_sids {
                saved.track_settings.insert(sid.clone(), settings.clone());
            }
        }
        let session = self.inner.current_session()?;
        session
            .send_request(SignalRequest::UpdateTrackSettings(settings))
            .await
    }

    /// Subscribe to or unsubscribe from tracks. Remembered and replayed
    /// after reconnects.
    pub async fn update_subscription(&self, update: UpdateSubscription) -> Result<()> {
        self.inner.ensure_running()?;
        {
            let mut saved = self.inner.settings.lock();
            for sid in &update.track_sids {
                saved.subscriptions.insert(sid.clone(), update.subscribe);
            }
        }
        let session = self.inner.current_session()?;
        session
            .send_request(SignalRequest::UpdateSubscription(update))
            .await
    }

    /// Grant or revoke permission for others to subscribe to local tracks.
    pub async fn set_subscription_permission(
        &self,
        permission: SubscriptionPermission,
    ) -> Result<()> {
        self.inner.ensure_running()?;
        self.inner.settings.lock().permission = Some(permission.clone());
        let session = self.inner.current_session()?;
        session
            .send_request(SignalRequest::SubscriptionPermission(permission))
            .await
    }

    /// Ask the server to fake a failure condition, for integration testing
    /// against a live deployment.
    pub async fn simulate(&self, scenario: SimulatePayload) -> Result<()> {
        self.inner.ensure_running()?;
        let session = self.inner.current_session()?;
        session.send_request(SignalRequest::Simulate(scenario)).await
    }

    /// Leave the room and shut the engine down. Idempotent; the server gets
    /// a best-effort goodbye so it can release the participant immediately.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("engine close requested");
        let session = self.inner.session.read().clone();
        if let Some(session) = session {
            let _ = session
                .send_request(SignalRequest::Leave(LeavePayload {
                    reason: DisconnectReason::User,
                    action: LeaveAction::Disconnect,
                }))
                .await;
        }
        self.inner.terminate(DisconnectReason::User).await;
        if let Some(task) = self.inner.engine_task.lock().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for RtcEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcEngine")
            .field("url", &self.inner.url)
            .field("state", &self.inner.state.read())
            .finish()
    }
}

impl Drop for RtcEngine {
    fn drop(&mut self) {
        if let Some(task) = self.inner.engine_task.lock().take() {
            task.abort();
        }
    }
}

impl EngineInner {
    fn emit(&self, event: EngineEvent) {
        let _ = self.emitter.send(event);
    }

    fn ensure_running(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RoomWireError::State("engine is closed".into()));
        }
        Ok(())
    }

    fn current_session(&self) -> Result<Arc<RtcSession>> {
        self.session
            .read()
            .clone()
            .ok_or_else(|| RoomWireError::State("engine is not connected".into()))
    }

    /// Set the state if it differs; returns whether a transition happened.
    fn flip_state(&self, next: ConnectionState) -> bool {
        self.state.mutate(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        })
    }

    fn note_mute(&self, sid: &str, muted: bool) {
        let mut publications = self.publications.lock();
        if let Some(publication) = publications
            .values_mut()
            .find(|publication| publication.sid == sid)
        {
            publication.muted = muted;
        }
    }

    /// Run the reconnect sequence: a quick resume first (when the loss
    /// allows it), then full reconnects until the policy is exhausted.
    /// Returns the new session's event receiver when the session was
    /// replaced.
    async fn reconnect(
        &self,
        initial: ReconnectMode,
    ) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        let Ok(_guard) = self.reconnect_lock.try_lock() else {
            debug!("reconnect already in progress");
            return None;
        };
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }

        let policy = self.options.reconnect;
        let try_quick_first = initial == ReconnectMode::Quick;
        let replaced_events: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>> =
            Mutex::new(None);

        let result = retry(policy, |attempt| {
            let replaced_events = &replaced_events;
            async move {
                if self.closed.load(Ordering::SeqCst) {
                    return Err(RetryError::Fatal(RoomWireError::State(
                        "engine is closed".into(),
                    )));
                }
                if attempt == 0 && try_quick_first {
                    if self.flip_state(ConnectionState::Connecting {
                        mode: ConnectMode::Reconnect(ReconnectMode::Quick),
                    }) {
                        info!("attempting quick resume");
                        self.emit(EngineEvent::Resuming);
                    }
                    self.try_resume().await.map_err(RetryError::Transient)
                } else {
                    if self.flip_state(ConnectionState::Connecting {
                        mode: ConnectMode::Reconnect(ReconnectMode::Full),
                    }) {
                        info!(attempt, "attempting full reconnect");
                        self.emit(EngineEvent::Restarting);
                    }
                    let events = self
                        .try_full_reconnect()
                        .await
                        .map_err(RetryError::Transient)?;
                    *replaced_events.lock() = Some(events);
                    Ok(())
                }
            }
        })
        .await;

        match result {
            Ok(()) => replaced_events.lock().take(),
            Err(e) => {
                error!("reconnect attempts exhausted: {e}");
                self.terminate(DisconnectReason::Network).await;
                None
            }
        }
    }

    /// Quick resume: same session, restarted socket and ICE.
    async fn try_resume(&self) -> Result<()> {
        let session = self.current_session()?;
        session.resume().await?;
        self.resend_settings(&session).await?;
        self.state.set(ConnectionState::Connected {
            mode: ConnectMode::Reconnect(ReconnectMode::Quick),
        });
        info!("session resumed");
        self.emit(EngineEvent::Resumed);
        Ok(())
    }

    /// Full reconnect: replace the session wholesale and rebuild the
    /// server-side state the old one carried.
    async fn try_full_reconnect(&self) -> Result<mpsc::UnboundedReceiver<SessionEvent>> {
        // Reap the previous session, keeping its freshest token.
        let old = self.session.write().take();
        if let Some(old) = old {
            *self.token.lock() = old.token();
            old.close().await;
        }

        let token = self.token.lock().clone();
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (session, join) =
            RtcSession::connect(&self.url, &token, &self.options, session_tx).await?;
        let session = Arc::new(session);
        session.wait_primary_connected(ICE_CONNECT_TIMEOUT).await?;
        *self.session.write() = Some(Arc::clone(&session));

        // Republish non-muted tracks. Muted publications do not survive a
        // full reconnect; their owners republish when they unmute.
        let snapshot: Vec<PublishedTrack> =
            self.publications.lock().values().cloned().collect();
        let mut republished = HashMap::new();
        for publication in snapshot {
            if publication.muted {
                debug!(sid = %publication.sid, "dropping muted track on full reconnect");
                continue;
            }
            let (cid, info) = session.publish_track(Arc::clone(&publication.track)).await?;
            republished.insert(
                cid,
                PublishedTrack {
                    track: publication.track,
                    sid: info.sid.clone(),
                    muted: false,
                },
            );
        }
        *self.publications.lock() = republished;

        self.resend_settings(&session).await?;
        self.state.set(ConnectionState::Connected {
            mode: ConnectMode::Reconnect(ReconnectMode::Full),
        });
        info!("session restarted");
        self.emit(EngineEvent::Restarted {
            join: Box::new(join),
        });
        Ok(session_rx)
    }

    /// Replay remembered subscription-side settings onto a fresh connection.
    async fn resend_settings(&self, session: &RtcSession) -> Result<()> {
        let (track_settings, subscribed, unsubscribed, permission) = {
            let saved = self.settings.lock();
            let track_settings: Vec<_> = saved.track_settings.values().cloned().collect();
            let subscribed: Vec<TrackSid> = saved
                .subscriptions
                .iter()
                .filter(|(_, subscribe)| **subscribe)
                .map(|(sid, _)| sid.clone())
                .collect();
            let unsubscribed: Vec<TrackSid> = saved
                .subscriptions
                .iter()
                .filter(|(_, subscribe)| !**subscribe)
                .map(|(sid, _)| sid.clone())
                .collect();
            (track_settings, subscribed, unsubscribed, saved.permission.clone())
        };

        for settings in track_settings {
            session
                .send_request(SignalRequest::UpdateTrackSettings(settings))
                .await?;
        }
        if !subscribed.is_empty() {
            session
                .send_request(SignalRequest::UpdateSubscription(UpdateSubscription {
                    track_sids: subscribed,
                    subscribe: true,
                    participant_tracks: Vec::new(),
                }))
                .await?;
        }
        if !unsubscribed.is_empty() {
            session
                .send_request(SignalRequest::UpdateSubscription(UpdateSubscription {
                    track_sids: unsubscribed,
                    subscribe: false,
                    participant_tracks: Vec::new(),
                }))
                .await?;
        }
        if let Some(permission) = permission {
            session
                .send_request(SignalRequest::SubscriptionPermission(permission))
                .await?;
        }
        Ok(())
    }

    /// Close the current session and emit the one-and-only `Disconnected`.
    async fn terminate(&self, reason: DisconnectReason) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.session.write().take();
        if let Some(session) = session {
            session.close().await;
        }
        self.state.set(ConnectionState::Disconnected { reason });
        self.emit(EngineEvent::Disconnected { reason });
    }

    /// Map a routine session event onto the engine surface.
    fn forward(&self, event: SessionEvent) {
        let mapped = match event {
            SessionEvent::ParticipantUpdate { participants } => {
                EngineEvent::ParticipantUpdate { participants }
            }
            SessionEvent::RoomUpdate { room } => EngineEvent::RoomUpdate { room },
            SessionEvent::SpeakersChanged { speakers } => {
                EngineEvent::SpeakersChanged { speakers }
            }
            SessionEvent::ConnectionQuality { updates } => {
                EngineEvent::ConnectionQuality { updates }
            }
            SessionEvent::StreamStateUpdate { stream_states } => {
                EngineEvent::StreamStateUpdate { stream_states }
            }
            SessionEvent::SubscribedQualityUpdate { update } => {
                EngineEvent::SubscribedQualityUpdate { update }
            }
            SessionEvent::SubscriptionPermissionUpdate { update } => {
                EngineEvent::SubscriptionPermissionUpdate { update }
            }
            SessionEvent::RemoteMute { sid, muted } => {
                self.note_mute(&sid, muted);
                EngineEvent::RemoteMute { sid, muted }
            }
            SessionEvent::MediaTrack { track } => EngineEvent::MediaTrack { track },
            SessionEvent::Data { kind, value } => EngineEvent::Data { kind, value },
            // Handled by the engine task before forwarding.
            SessionEvent::Close { .. } | SessionEvent::Leave { .. } => return,
        };
        self.emit(mapped);
    }
}

/// Consumes session events, reconnecting (and swapping the event channel)
/// when the session is lost.
async fn engine_task(
    inner: Arc<EngineInner>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) {
    loop {
        let Some(event) = events.recv().await else {
            break;
        };
        match event {
            SessionEvent::Close { source } => {
                if inner.closed.load(Ordering::SeqCst) {
                    continue;
                }
                warn!("session lost: {source}");
                if let Some(new_events) = inner.reconnect(ReconnectMode::Quick).await {
                    events = new_events;
                }
            }
            SessionEvent::Leave { payload } => {
                if inner.closed.load(Ordering::SeqCst) {
                    continue;
                }
                match payload.action {
                    LeaveAction::Disconnect => {
                        info!(reason = ?payload.reason, "server closed the session");
                        inner.terminate(payload.reason).await;
                    }
                    LeaveAction::Resume => {
                        if let Some(new_events) = inner.reconnect(ReconnectMode::Quick).await {
                            events = new_events;
                        }
                    }
                    LeaveAction::Reconnect => {
                        if let Some(new_events) = inner.reconnect(ReconnectMode::Full).await {
                            events = new_events;
                        }
                    }
                }
            }
            other => inner.forward(other),
        }
    }
    debug!("engine task exited");
}
