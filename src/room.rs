//! Room layer: the user-facing view of a conference.
//!
//! [`Room`] wraps an [`RtcEngine`] and keeps the local bookkeeping the wire
//! protocol implies but never spells out: which participants are present,
//! what they publish, who is speaking. Engine events are folded into that
//! state and surfaced as deltas — a participant update containing a new
//! track becomes [`RoomEvent::TrackPublished`], a missing one becomes
//! [`RoomEvent::TrackUnpublished`], and so on.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::Result;
use crate::media::{LocalMediaTrack, RemoteMediaTrack};
use crate::options::RoomOptions;
use crate::protocol::{
    ConnectionQualityInfo, DataPacket, DataPacketKind, DataPacketValue, DisconnectReason,
    ParticipantInfo, ParticipantSid, ParticipantState, RoomInfo, SimulatePayload, SpeakerInfo,
    StreamStateInfo, SubscriptionPermission, TrackInfo, TrackSid, UpdateSubscription,
    UpdateTrackSettings, UserPacket,
};
use crate::rtc::engine::{EngineEvent, EngineEvents, RtcEngine};
use crate::state::ConnectionState;

/// Grace period for the room task to drain its terminal event on close.
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Events delivered to the application.
#[derive(Debug)]
pub enum RoomEvent {
    ParticipantConnected { participant: ParticipantInfo },
    ParticipantDisconnected { participant: ParticipantInfo },
    /// Metadata or display name changed, local participant included.
    ParticipantMetadataChanged { participant: ParticipantInfo },
    TrackPublished {
        participant_sid: ParticipantSid,
        track: TrackInfo,
    },
    TrackUnpublished {
        participant_sid: ParticipantSid,
        track_sid: TrackSid,
    },
    /// Media for a subscribed track arrived.
    TrackSubscribed {
        participant_sid: ParticipantSid,
        track: Arc<dyn RemoteMediaTrack>,
    },
    TrackMuted {
        participant_sid: ParticipantSid,
        track_sid: TrackSid,
    },
    TrackUnmuted {
        participant_sid: ParticipantSid,
        track_sid: TrackSid,
    },
    LocalTrackPublished { track: TrackInfo },
    LocalTrackUnpublished { track_sid: TrackSid },
    /// The server changed the mute state of a local track.
    LocalTrackMuteChanged { track_sid: TrackSid, muted: bool },
    ActiveSpeakersChanged { speakers: Vec<SpeakerInfo> },
    ConnectionQualityChanged { updates: Vec<ConnectionQualityInfo> },
    StreamStateChanged { updates: Vec<StreamStateInfo> },
    RoomMetadataChanged { metadata: String },
    DataReceived {
        participant_sid: ParticipantSid,
        payload: Vec<u8>,
        topic: Option<String>,
        kind: DataPacketKind,
    },
    TrackSubscriptionPermissionChanged {
        participant_sid: ParticipantSid,
        track_sid: TrackSid,
        allowed: bool,
    },
    ConnectionStateChanged { state: ConnectionState },
    /// A quick resume started; expect a short gap in media.
    Reconnecting,
    /// The quick resume succeeded; room state survived.
    Reconnected,
    /// A full reconnect started; room state is about to be rebuilt.
    Restarting,
    /// The full reconnect finished and room state was rebuilt.
    Restarted,
    /// Terminal. No further events follow.
    Disconnected { reason: DisconnectReason },
}

/// Receiving end of the room event stream.
pub type RoomEvents = mpsc::UnboundedReceiver<RoomEvent>;

/// Bookkeeping shared between the room handle and its event task.
struct RoomState {
    info: Mutex<RoomInfo>,
    local: Mutex<ParticipantInfo>,
    remotes: Mutex<HashMap<ParticipantSid, ParticipantInfo>>,
    active_speakers: Mutex<Vec<SpeakerInfo>>,
    /// Remote media that arrived before its owner's participant info.
    orphan_tracks: Mutex<Vec<Arc<dyn RemoteMediaTrack>>>,
}

/// A connected conference. Dropping the room severs the connection without
/// a goodbye; call [`close`](Self::close) for a clean leave.
pub struct Room {
    engine: RtcEngine,
    state: Arc<RoomState>,
    emitter: mpsc::UnboundedSender<RoomEvent>,
    room_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Room {
    /// Connect to a room and return the handle plus the event stream.
    pub async fn connect(url: &str, token: &str, options: RoomOptions) -> Result<(Self, RoomEvents)> {
        let engine_options = options.into_engine_options()?;
        let (engine, join, engine_events) = RtcEngine::connect(url, token, engine_options).await?;

        let (emitter, events) = mpsc::unbounded_channel();
        let state = Arc::new(RoomState {
            info: Mutex::new(join.room.clone()),
            local: Mutex::new(join.participant.clone()),
            remotes: Mutex::new(
                join.other_participants
                    .iter()
                    .cloned()
                    .map(|participant| (participant.sid.clone(), participant))
                    .collect(),
            ),
            active_speakers: Mutex::new(Vec::new()),
            orphan_tracks: Mutex::new(Vec::new()),
        });
        let task = tokio::spawn(room_task(
            Arc::clone(&state),
            emitter.clone(),
            engine_events,
        ));
        info!(
            room = %join.room.name,
            identity = %join.participant.identity,
            "connected to room"
        );
        Ok((
            Self {
                engine,
                state,
                emitter,
                room_task: Mutex::new(Some(task)),
            },
            events,
        ))
    }

    // ── Snapshots ───────────────────────────────────────────────────

    pub fn info(&self) -> RoomInfo {
        self.state.info.lock().clone()
    }

    pub fn local_participant(&self) -> ParticipantInfo {
        self.state.local.lock().clone()
    }

    pub fn remote_participants(&self) -> Vec<ParticipantInfo> {
        self.state.remotes.lock().values().cloned().collect()
    }

    pub fn active_speakers(&self) -> Vec<SpeakerInfo> {
        self.state.active_speakers.lock().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.engine.state()
    }

    // ── Publishing ──────────────────────────────────────────────────

    /// Publish a local track to the room.
    pub async fn publish_track(&self, track: Arc<dyn LocalMediaTrack>) -> Result<TrackInfo> {
        let info = self.engine.publish_track(track).await?;
        {
            let mut local = self.state.local.lock();
            local.tracks.retain(|track| track.sid != info.sid);
            local.tracks.push(info.clone());
        }
        let _ = self.emitter.send(RoomEvent::LocalTrackPublished {
            track: info.clone(),
        });
        Ok(info)
    }

    /// Withdraw a local publication.
    pub async fn unpublish_track(&self, sid: &str) -> Result<()> {
        self.engine.unpublish_track(sid).await?;
        self.state
            .local
            .lock()
            .tracks
            .retain(|track| track.sid != sid);
        let _ = self.emitter.send(RoomEvent::LocalTrackUnpublished {
            track_sid: sid.to_owned(),
        });
        Ok(())
    }

    /// Mute or unmute a local publication.
    pub async fn set_track_muted(&self, sid: &str, muted: bool) -> Result<()> {
        self.engine.set_track_muted(sid, muted).await?;
        self.state.set_local_track_muted(sid, muted);
        let participant_sid = self.state.local.lock().sid.clone();
        let event = if muted {
            RoomEvent::TrackMuted {
                participant_sid,
                track_sid: sid.to_owned(),
            }
        } else {
            RoomEvent::TrackUnmuted {
                participant_sid,
                track_sid: sid.to_owned(),
            }
        };
        let _ = self.emitter.send(event);
        Ok(())
    }

    /// Send an opaque payload to the room, or to `dest_sids` when non-empty.
    pub async fn publish_data(
        &self,
        payload: Vec<u8>,
        kind: DataPacketKind,
        topic: Option<String>,
        dest_sids: Vec<ParticipantSid>,
    ) -> Result<()> {
        let participant_sid = self.state.local.lock().sid.clone();
        self.engine
            .publish_data(DataPacket {
                kind,
                value: DataPacketValue::User(UserPacket {
                    participant_sid,
                    payload,
                    dest_sids,
                    topic,
                }),
            })
            .await
    }

    // ── Subscriptions ───────────────────────────────────────────────

    pub async fn update_track_settings(&self, settings: UpdateTrackSettings) -> Result<()> {
        self.engine.update_track_settings(settings).await
    }

    pub async fn update_subscription(&self, update: UpdateSubscription) -> Result<()> {
        self.engine.update_subscription(update).await
    }

    pub async fn set_subscription_permission(
        &self,
        permission: SubscriptionPermission,
    ) -> Result<()> {
        self.engine.set_subscription_permission(permission).await
    }

    /// Ask the server to fake a failure condition.
    pub async fn simulate(&self, scenario: SimulatePayload) -> Result<()> {
        self.engine.simulate(scenario).await
    }

    /// Leave the room. Idempotent; the event stream ends with
    /// [`RoomEvent::Disconnected`].
    pub async fn close(&self) {
        self.engine.close().await;
        let task = self.room_task.lock().take();
        if let Some(mut task) = task {
            // Let the task drain the terminal event before reaping it.
            if tokio::time::timeout(TASK_DRAIN_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.state.info.lock().name)
            .field("state", &self.engine.state())
            .finish()
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        if let Some(task) = self.room_task.lock().take() {
            task.abort();
        }
    }
}

impl RoomState {
    fn set_local_track_muted(&self, sid: &str, muted: bool) {
        let mut local = self.local.lock();
        if let Some(track) = local.tracks.iter_mut().find(|track| track.sid == sid) {
            track.muted = muted;
        }
    }

    /// Fold a participant delta into the roster and describe what changed.
    fn apply_participant_update(&self, participants: Vec<ParticipantInfo>) -> Vec<RoomEvent> {
        let mut events = Vec::new();
        let local_sid = self.local.lock().sid.clone();
        let mut remotes = self.remotes.lock();
        for info in participants {
            if info.sid == local_sid {
                let mut local = self.local.lock();
                if local.metadata != info.metadata || local.name != info.name {
                    events.push(RoomEvent::ParticipantMetadataChanged {
                        participant: info.clone(),
                    });
                }
                *local = info;
                continue;
            }
            if info.state == ParticipantState::Disconnected {
                if let Some(gone) = remotes.remove(&info.sid) {
                    events.push(RoomEvent::ParticipantDisconnected { participant: gone });
                }
                continue;
            }
            match remotes.entry(info.sid.clone()) {
                Entry::Vacant(slot) => {
                    events.push(RoomEvent::ParticipantConnected {
                        participant: info.clone(),
                    });
                    for track in &info.tracks {
                        events.push(RoomEvent::TrackPublished {
                            participant_sid: info.sid.clone(),
                            track: track.clone(),
                        });
                    }
                    slot.insert(info);
                }
                Entry::Occupied(mut slot) => {
                    events.extend(diff_participant(slot.get(), &info));
                    slot.insert(info);
                }
            }
        }
        events
    }

    /// Replace the roster with an authoritative list, reporting departures
    /// the list no longer contains. Used after a full reconnect.
    fn sync_participants(&self, participants: Vec<ParticipantInfo>) -> Vec<RoomEvent> {
        let mut events = Vec::new();
        {
            let fresh: HashSet<&ParticipantSid> =
                participants.iter().map(|participant| &participant.sid).collect();
            let mut remotes = self.remotes.lock();
            let gone: Vec<ParticipantSid> = remotes
                .keys()
                .filter(|sid| !fresh.contains(sid))
                .cloned()
                .collect();
            for sid in gone {
                if let Some(participant) = remotes.remove(&sid) {
                    events.push(RoomEvent::ParticipantDisconnected { participant });
                }
            }
        }
        events.extend(self.apply_participant_update(participants));
        events
    }

    /// Attach arriving media to its owning participant, or park it until
    /// the owner's info shows up.
    fn attach_media_track(&self, track: Arc<dyn RemoteMediaTrack>) -> Vec<RoomEvent> {
        let sid = track.sid();
        if let Some(participant_sid) = self.find_track_owner(&sid) {
            return vec![RoomEvent::TrackSubscribed {
                participant_sid,
                track,
            }];
        }
        debug!(track = %sid, "media arrived before participant info; parking");
        self.orphan_tracks.lock().push(track);
        Vec::new()
    }

    /// Retry parked media against the current roster.
    fn match_orphan_tracks(&self) -> Vec<RoomEvent> {
        let mut events = Vec::new();
        let mut orphans = self.orphan_tracks.lock();
        if orphans.is_empty() {
            return events;
        }
        orphans.retain(|track| match self.find_track_owner(&track.sid()) {
            Some(participant_sid) => {
                events.push(RoomEvent::TrackSubscribed {
                    participant_sid,
                    track: Arc::clone(track),
                });
                false
            }
            None => true,
        });
        events
    }

    fn find_track_owner(&self, track_sid: &str) -> Option<ParticipantSid> {
        self.remotes
            .lock()
            .values()
            .find(|participant| {
                participant
                    .tracks
                    .iter()
                    .any(|track| track.sid == track_sid)
            })
            .map(|participant| participant.sid.clone())
    }
}

/// Track-level differences between two views of the same participant.
fn diff_participant(old: &ParticipantInfo, new: &ParticipantInfo) -> Vec<RoomEvent> {
    let mut events = Vec::new();
    if old.metadata != new.metadata || old.name != new.name {
        events.push(RoomEvent::ParticipantMetadataChanged {
            participant: new.clone(),
        });
    }
    for track in &new.tracks {
        match old.tracks.iter().find(|previous| previous.sid == track.sid) {
            None => events.push(RoomEvent::TrackPublished {
                participant_sid: new.sid.clone(),
                track: track.clone(),
            }),
            Some(previous) if previous.muted != track.muted => {
                events.push(if track.muted {
                    RoomEvent::TrackMuted {
                        participant_sid: new.sid.clone(),
                        track_sid: track.sid.clone(),
                    }
                } else {
                    RoomEvent::TrackUnmuted {
                        participant_sid: new.sid.clone(),
                        track_sid: track.sid.clone(),
                    }
                });
            }
            Some(_) => {}
        }
    }
    for track in &old.tracks {
        if !new.tracks.iter().any(|current| current.sid == track.sid) {
            events.push(RoomEvent::TrackUnpublished {
                participant_sid: new.sid.clone(),
                track_sid: track.sid.clone(),
            });
        }
    }
    events
}

/// Folds engine events into room state and emits the resulting deltas.
async fn room_task(
    state: Arc<RoomState>,
    emitter: mpsc::UnboundedSender<RoomEvent>,
    mut engine_events: EngineEvents,
) {
    while let Some(event) = engine_events.recv().await {
        let mut out = Vec::new();
        match event {
            EngineEvent::StateChanged { current, .. } => {
                out.push(RoomEvent::ConnectionStateChanged { state: current });
            }
            EngineEvent::ParticipantUpdate { participants } => {
                out.extend(state.apply_participant_update(participants));
                out.extend(state.match_orphan_tracks());
            }
            EngineEvent::RoomUpdate { room } => {
                let metadata_changed = {
                    let mut info = state.info.lock();
                    let changed = info.metadata != room.metadata;
                    *info = room;
                    changed
                };
                if metadata_changed {
                    let metadata = state.info.lock().metadata.clone();
                    out.push(RoomEvent::RoomMetadataChanged { metadata });
                }
            }
            EngineEvent::SpeakersChanged { speakers } => {
                *state.active_speakers.lock() = speakers.clone();
                out.push(RoomEvent::ActiveSpeakersChanged { speakers });
            }
            EngineEvent::ConnectionQuality { updates } => {
                out.push(RoomEvent::ConnectionQualityChanged { updates });
            }
            EngineEvent::StreamStateUpdate { stream_states } => {
                out.push(RoomEvent::StreamStateChanged {
                    updates: stream_states,
                });
            }
            EngineEvent::SubscribedQualityUpdate { update } => {
                // Encoder management is the publisher implementation's job.
                debug!(track = %update.track_sid, "subscribed quality update");
            }
            EngineEvent::SubscriptionPermissionUpdate { update } => {
                out.push(RoomEvent::TrackSubscriptionPermissionChanged {
                    participant_sid: update.participant_sid,
                    track_sid: update.track_sid,
                    allowed: update.allowed,
                });
            }
            EngineEvent::RemoteMute { sid, muted } => {
                state.set_local_track_muted(&sid, muted);
                out.push(RoomEvent::LocalTrackMuteChanged {
                    track_sid: sid,
                    muted,
                });
            }
            EngineEvent::MediaTrack { track } => {
                out.extend(state.attach_media_track(track));
            }
            EngineEvent::Data { kind, value } => match value {
                DataPacketValue::User(packet) => out.push(RoomEvent::DataReceived {
                    participant_sid: packet.participant_sid,
                    payload: packet.payload,
                    topic: packet.topic,
                    kind,
                }),
                DataPacketValue::Speaker { speakers } => {
                    *state.active_speakers.lock() = speakers.clone();
                    out.push(RoomEvent::ActiveSpeakersChanged { speakers });
                }
            },
            EngineEvent::Resuming => out.push(RoomEvent::Reconnecting),
            EngineEvent::Resumed => out.push(RoomEvent::Reconnected),
            EngineEvent::Restarting => out.push(RoomEvent::Restarting),
            EngineEvent::Restarted { join } => {
                *state.info.lock() = join.room.clone();
                *state.local.lock() = join.participant.clone();
                out.extend(state.sync_participants(join.other_participants));
                out.extend(state.match_orphan_tracks());
                out.push(RoomEvent::Restarted);
            }
            EngineEvent::Disconnected { reason } => {
                let _ = emitter.send(RoomEvent::Disconnected { reason });
                break;
            }
        }
        for event in out {
            if emitter.send(event).is_err() {
                return;
            }
        }
    }
    debug!("room task exited");
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
    use crate::protocol::TrackKind;

    fn participant(sid: &str, tracks: Vec<TrackInfo>) -> ParticipantInfo {
        ParticipantInfo {
            sid: sid.into(),
            identity: format!("id-{sid}"),
            name: format!("name-{sid}"),
            state: ParticipantState::Active,
            metadata: String::new(),
            tracks,
        }
    }

    fn track(sid: &str, muted: bool) -> TrackInfo {
        TrackInfo {
            sid: sid.into(),
            name: "cam".into(),
            kind: TrackKind::Video,
            muted,
            width: 1280,
            height: 720,
            simulcast: true,
            layers: Vec::new(),
        }
    }

    fn empty_state() -> RoomState {
        RoomState {
            info: Mutex::new(RoomInfo {
                sid: "RM_1".into(),
                name: "demo".into(),
                metadata: String::new(),
            }),
            local: Mutex::new(participant("PA_local", Vec::new())),
            remotes: Mutex::new(HashMap::new()),
            active_speakers: Mutex::new(Vec::new()),
            orphan_tracks: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn new_participant_yields_connect_and_publish_events() {
        let state = empty_state();
        let events = state.apply_participant_update(vec![participant(
            "PA_1",
            vec![track("TR_1", false)],
        )]);

        assert!(matches!(
            events[0],
            RoomEvent::ParticipantConnected { .. }
        ));
        assert!(matches!(
            &events[1],
            RoomEvent::TrackPublished { participant_sid, track }
                if participant_sid == "PA_1" && track.sid == "TR_1"
        ));
    }

    #[test]
    fn mute_transitions_are_detected() {
        let state = empty_state();
        state.apply_participant_update(vec![participant("PA_1", vec![track("TR_1", false)])]);

        let events =
            state.apply_participant_update(vec![participant("PA_1", vec![track("TR_1", true)])]);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            RoomEvent::TrackMuted { track_sid, .. } if track_sid == "TR_1"
        ));

        let events =
            state.apply_participant_update(vec![participant("PA_1", vec![track("TR_1", false)])]);
        assert!(matches!(&events[0], RoomEvent::TrackUnmuted { .. }));
    }

    #[test]
    fn departure_via_disconnected_state() {
        let state = empty_state();
        state.apply_participant_update(vec![participant("PA_1", Vec::new())]);

        let mut gone = participant("PA_1", Vec::new());
        gone.state = ParticipantState::Disconnected;
        let events = state.apply_participant_update(vec![gone]);
        assert!(matches!(
            &events[0],
            RoomEvent::ParticipantDisconnected { participant } if participant.sid == "PA_1"
        ));
        assert!(state.remotes.lock().is_empty());
    }

    #[test]
    fn unpublished_track_is_reported() {
        let state = empty_state();
        state.apply_participant_update(vec![participant("PA_1", vec![track("TR_1", false)])]);

        let events = state.apply_participant_update(vec![participant("PA_1", Vec::new())]);
        assert!(matches!(
            &events[0],
            RoomEvent::TrackUnpublished { track_sid, .. } if track_sid == "TR_1"
        ));
    }

    #[test]
    fn sync_drops_participants_missing_from_the_authoritative_list() {
        let state = empty_state();
        state.apply_participant_update(vec![
            participant("PA_1", Vec::new()),
            participant("PA_2", Vec::new()),
        ]);

        let events = state.sync_participants(vec![participant("PA_2", Vec::new())]);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            RoomEvent::ParticipantDisconnected { participant } if participant.sid == "PA_1"
        ));
        assert_eq!(state.remotes.lock().len(), 1);
    }

    #[test]
    fn local_participant_updates_do_not_touch_the_roster() {
        let state = empty_state();
        let mut me = participant("PA_local", Vec::new());
        me.metadata = "hello".into();
        let events = state.apply_participant_update(vec![me]);

        assert!(matches!(
            &events[0],
            RoomEvent::ParticipantMetadataChanged { .. }
        ));
        assert!(state.remotes.lock().is_empty());
        assert_eq!(state.local.lock().metadata, "hello");
    }

    #[derive(Debug)]
    struct FakeRemoteTrack(TrackSid);

    impl RemoteMediaTrack for FakeRemoteTrack {
        fn sid(&self) -> TrackSid {
            self.0.clone()
        }

        fn kind(&self) -> TrackKind {
            TrackKind::Video
        }
    }

    #[test]
    fn media_arriving_before_participant_info_is_parked_then_matched() {
        let state = empty_state();
        let events = state.attach_media_track(Arc::new(FakeRemoteTrack("TR_1".into())));
        assert!(events.is_empty());
        assert_eq!(state.orphan_tracks.lock().len(), 1);

        state.apply_participant_update(vec![participant("PA_1", vec![track("TR_1", false)])]);
        let events = state.match_orphan_tracks();
        assert!(matches!(
            &events[0],
            RoomEvent::TrackSubscribed { participant_sid, .. } if participant_sid == "PA_1"
        ));
        assert!(state.orphan_tracks.lock().is_empty());
    }
}
