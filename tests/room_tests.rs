#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Integration tests for the room layer.
//!
//! Exercises [`Room`] end to end over the scripted signal socket and peer
//! factory: roster bookkeeping, speaker and data fan-out, publication
//! events, reconnect surfaces and shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use roomwire_client::protocol::{
    encode_data_packet, DataPacket, DataPacketKind, DataPacketValue, DisconnectReason,
    LeaveAction, LeavePayload, MutePayload, ParticipantState, SignalRequest, SignalResponse,
    SpeakerInfo, TrackKind, UserPacket,
};
use roomwire_client::rtc::peer::{PeerEvent, PeerFactory};
use roomwire_client::{
    Room, RoomEvent, RoomEvents, RoomOptions, RetryPolicy, SocketConnector,
};

use common::{
    count_requests, join_payload_with, participant_info, socket_error, text_frame, track_info,
    wait_for_request, MockConnector, MockLocalTrack, MockPeerFactory, MockRemoteTrack,
    SocketHandle,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn options(connector: &Arc<MockConnector>, peers: &Arc<MockPeerFactory>) -> RoomOptions {
    RoomOptions::new(Arc::clone(peers) as Arc<dyn PeerFactory>)
        .with_connector(Arc::clone(connector) as Arc<dyn SocketConnector>)
        .with_reconnect(RetryPolicy {
            attempts: 2,
            delay: Duration::from_millis(1),
        })
}

/// Ack the next `add_track` announcement on `socket` with the given sid.
fn spawn_track_ack(socket: &SocketHandle, sid: &str) -> tokio::task::JoinHandle<()> {
    let sent = Arc::clone(&socket.sent);
    let feed = socket.feed.clone();
    let sid = sid.to_owned();
    tokio::spawn(async move {
        let request = wait_for_request(&sent, EVENT_TIMEOUT, |r| {
            matches!(r, SignalRequest::AddTrack(_))
        })
        .await;
        let SignalRequest::AddTrack(add) = request else {
            panic!("expected an add_track request");
        };
        feed.send(text_frame(&SignalResponse::TrackPublished(
            roomwire_client::protocol::TrackPublishedPayload {
                cid: add.cid.clone(),
                track: roomwire_client::protocol::TrackInfo {
                    sid,
                    name: add.name.clone(),
                    kind: add.kind,
                    muted: add.muted,
                    width: add.width,
                    height: add.height,
                    simulcast: add.simulcast,
                    layers: add.layers.clone(),
                },
            },
        )))
        .expect("socket feed closed");
    })
}

/// Skip events until `predicate` matches, failing on timeout.
async fn wait_for_room_event<F>(events: &mut RoomEvents, predicate: F) -> RoomEvent
where
    F: Fn(&RoomEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let event = tokio::time::timeout(remaining, events.recv())
            .await
            .expect("timed out waiting for room event")
            .expect("room event channel closed");
        if predicate(&event) {
            return event;
        }
    }
}

/// The next event that is not a connection state change.
async fn next_delta(events: &mut RoomEvents) -> RoomEvent {
    wait_for_room_event(events, |event| {
        !matches!(event, RoomEvent::ConnectionStateChanged { .. })
    })
    .await
}

fn speaker(sid: &str, level: f32) -> SpeakerInfo {
    SpeakerInfo {
        sid: sid.into(),
        level,
        active: true,
    }
}

// ════════════════════════════════════════════════════════════════════
// Connecting
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn connect_exposes_the_join_snapshot() {
    let connector = MockConnector::new();
    let peers = MockPeerFactory::new();
    connector.script_socket(vec![text_frame(&SignalResponse::Join(Box::new(
        join_payload_with(true, vec![participant_info("PA_1", "alice")]),
    )))]);

    let (room, _events) = Room::connect("wss://rw.example.com", "tok", options(&connector, &peers))
        .await
        .unwrap();

    assert_eq!(room.info().name, "mock-room");
    assert_eq!(room.local_participant().sid, "PA_local");
    let remotes = room.remote_participants();
    assert_eq!(remotes.len(), 1);
    assert_eq!(remotes[0].identity, "alice");
    assert!(room.connection_state().is_connected());
    assert!(room.active_speakers().is_empty());
}

// ════════════════════════════════════════════════════════════════════
// Roster
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn participant_updates_flow_as_roster_deltas() {
    let connector = MockConnector::new();
    let peers = MockPeerFactory::new();
    let socket = connector.script_socket(vec![text_frame(&SignalResponse::Join(Box::new(
        join_payload_with(true, Vec::new()),
    )))]);

    let (room, mut events) =
        Room::connect("wss://rw.example.com", "tok", options(&connector, &peers))
            .await
            .unwrap();

    let mut bob = participant_info("PA_2", "bob");
    bob.tracks.push(track_info("TR_9", TrackKind::Video));
    socket.push(&SignalResponse::Update {
        participants: vec![bob],
    });

    let event = next_delta(&mut events).await;
    let RoomEvent::ParticipantConnected { participant } = event else {
        panic!("expected the participant connect first");
    };
    assert_eq!(participant.identity, "bob");
    let event = next_delta(&mut events).await;
    let RoomEvent::TrackPublished {
        participant_sid,
        track,
    } = event
    else {
        panic!("expected the publication that came with it");
    };
    assert_eq!(participant_sid, "PA_2");
    assert_eq!(track.sid, "TR_9");
    assert_eq!(room.remote_participants().len(), 1);

    let mut gone = participant_info("PA_2", "bob");
    gone.state = ParticipantState::Disconnected;
    socket.push(&SignalResponse::Update {
        participants: vec![gone],
    });

    let event = next_delta(&mut events).await;
    let RoomEvent::ParticipantDisconnected { participant } = event else {
        panic!("expected the departure");
    };
    assert_eq!(participant.sid, "PA_2");
    assert!(room.remote_participants().is_empty());
}

// ════════════════════════════════════════════════════════════════════
// Speakers and data
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn speaker_updates_arrive_from_signal_and_data_channel() {
    let connector = MockConnector::new();
    let peers = MockPeerFactory::new();
    let socket = connector.script_socket(vec![text_frame(&SignalResponse::Join(Box::new(
        join_payload_with(true, Vec::new()),
    )))]);

    let (room, mut events) =
        Room::connect("wss://rw.example.com", "tok", options(&connector, &peers))
            .await
            .unwrap();

    // The slow path: a signal frame.
    socket.push(&SignalResponse::SpeakersChanged {
        speakers: vec![speaker("PA_1", 0.8)],
    });
    let event = next_delta(&mut events).await;
    let RoomEvent::ActiveSpeakersChanged { speakers } = event else {
        panic!("expected the speaker update");
    };
    assert_eq!(speakers[0].sid, "PA_1");
    assert_eq!(room.active_speakers()[0].sid, "PA_1");

    // The fast path: a packet on the subscriber data channel.
    let payload = encode_data_packet(&DataPacket {
        kind: DataPacketKind::Lossy,
        value: DataPacketValue::Speaker {
            speakers: vec![speaker("PA_2", 0.5)],
        },
    })
    .unwrap();
    peers
        .peer(1)
        .events()
        .send(PeerEvent::Data {
            payload,
            kind: DataPacketKind::Lossy,
        })
        .unwrap();
    let event = next_delta(&mut events).await;
    let RoomEvent::ActiveSpeakersChanged { speakers } = event else {
        panic!("expected the speaker update from the data channel");
    };
    assert_eq!(speakers[0].sid, "PA_2");
    assert_eq!(room.active_speakers()[0].sid, "PA_2");
}

#[tokio::test]
async fn data_packets_surface_with_sender_and_topic() {
    let connector = MockConnector::new();
    let peers = MockPeerFactory::new();
    connector.script_socket(vec![text_frame(&SignalResponse::Join(Box::new(
        join_payload_with(true, Vec::new()),
    )))]);

    let (_room, mut events) =
        Room::connect("wss://rw.example.com", "tok", options(&connector, &peers))
            .await
            .unwrap();

    let payload = encode_data_packet(&DataPacket {
        kind: DataPacketKind::Reliable,
        value: DataPacketValue::User(UserPacket {
            participant_sid: "PA_9".into(),
            payload: b"ping".to_vec(),
            dest_sids: Vec::new(),
            topic: Some("chat".into()),
        }),
    })
    .unwrap();
    peers
        .peer(1)
        .events()
        .send(PeerEvent::Data {
            payload,
            kind: DataPacketKind::Reliable,
        })
        .unwrap();

    let event = next_delta(&mut events).await;
    let RoomEvent::DataReceived {
        participant_sid,
        payload,
        topic,
        kind,
    } = event
    else {
        panic!("expected the data event");
    };
    assert_eq!(participant_sid, "PA_9");
    assert_eq!(payload, b"ping");
    assert_eq!(topic.as_deref(), Some("chat"));
    assert_eq!(kind, DataPacketKind::Reliable);
}

// ════════════════════════════════════════════════════════════════════
// Local publications
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn publish_and_mute_roundtrip() {
    let connector = MockConnector::new();
    let peers = MockPeerFactory::new();
    let socket = connector.script_socket(vec![text_frame(&SignalResponse::Join(Box::new(
        join_payload_with(true, Vec::new()),
    )))]);

    let (room, mut events) =
        Room::connect("wss://rw.example.com", "tok", options(&connector, &peers))
            .await
            .unwrap();

    let ack = spawn_track_ack(&socket, "TR_cam");
    let info = room
        .publish_track(MockLocalTrack::video("camera", 1280, 720))
        .await
        .unwrap();
    ack.await.unwrap();
    assert_eq!(info.sid, "TR_cam");
    let event = wait_for_room_event(&mut events, |event| {
        matches!(event, RoomEvent::LocalTrackPublished { .. })
    })
    .await;
    let RoomEvent::LocalTrackPublished { track } = event else {
        panic!("expected the local publication event");
    };
    assert_eq!(track.name, "camera");
    assert_eq!(room.local_participant().tracks.len(), 1);

    room.set_track_muted("TR_cam", true).await.unwrap();
    wait_for_request(&socket.sent, EVENT_TIMEOUT, |r| {
        matches!(r, SignalRequest::Mute(MutePayload { muted: true, .. }))
    })
    .await;
    let event = next_delta(&mut events).await;
    let RoomEvent::TrackMuted {
        participant_sid,
        track_sid,
    } = event
    else {
        panic!("expected the mute event");
    };
    assert_eq!(participant_sid, "PA_local");
    assert_eq!(track_sid, "TR_cam");
    assert!(room.local_participant().tracks[0].muted);

    room.set_track_muted("TR_cam", false).await.unwrap();
    let event = next_delta(&mut events).await;
    assert!(matches!(event, RoomEvent::TrackUnmuted { .. }));
    assert!(!room.local_participant().tracks[0].muted);
}

#[tokio::test]
async fn server_forced_mute_is_reported() {
    let connector = MockConnector::new();
    let peers = MockPeerFactory::new();
    let socket = connector.script_socket(vec![text_frame(&SignalResponse::Join(Box::new(
        join_payload_with(true, Vec::new()),
    )))]);

    let (room, mut events) =
        Room::connect("wss://rw.example.com", "tok", options(&connector, &peers))
            .await
            .unwrap();

    let ack = spawn_track_ack(&socket, "TR_mic");
    room.publish_track(MockLocalTrack::audio("microphone"))
        .await
        .unwrap();
    ack.await.unwrap();

    socket.push(&SignalResponse::Mute(MutePayload {
        sid: "TR_mic".into(),
        muted: true,
    }));

    let event = wait_for_room_event(&mut events, |event| {
        matches!(event, RoomEvent::LocalTrackMuteChanged { .. })
    })
    .await;
    let RoomEvent::LocalTrackMuteChanged { track_sid, muted } = event else {
        panic!("expected the forced mute event");
    };
    assert_eq!(track_sid, "TR_mic");
    assert!(muted);
    assert!(room.local_participant().tracks[0].muted);
}

// ════════════════════════════════════════════════════════════════════
// Room metadata
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn room_metadata_changes_are_deduplicated() {
    let connector = MockConnector::new();
    let peers = MockPeerFactory::new();
    let socket = connector.script_socket(vec![text_frame(&SignalResponse::Join(Box::new(
        join_payload_with(true, Vec::new()),
    )))]);

    let (room, mut events) =
        Room::connect("wss://rw.example.com", "tok", options(&connector, &peers))
            .await
            .unwrap();

    let mut info = room.info();
    info.metadata = "season 2".into();
    socket.push(&SignalResponse::RoomUpdate { room: info.clone() });

    let event = next_delta(&mut events).await;
    let RoomEvent::RoomMetadataChanged { metadata } = event else {
        panic!("expected the metadata change");
    };
    assert_eq!(metadata, "season 2");
    assert_eq!(room.info().metadata, "season 2");

    // The same metadata again is swallowed; the sentinel frame behind it is
    // the next thing to surface.
    socket.push(&SignalResponse::RoomUpdate { room: info });
    socket.push(&SignalResponse::SpeakersChanged {
        speakers: vec![speaker("PA_1", 0.6)],
    });
    let event = next_delta(&mut events).await;
    assert!(matches!(event, RoomEvent::ActiveSpeakersChanged { .. }));
}

// ════════════════════════════════════════════════════════════════════
// Remote media
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn media_tracks_attach_to_their_publisher() {
    let connector = MockConnector::new();
    let peers = MockPeerFactory::new();
    let mut alice = participant_info("PA_1", "alice");
    alice.tracks.push(track_info("TR_9", TrackKind::Video));
    let socket = connector.script_socket(vec![text_frame(&SignalResponse::Join(Box::new(
        join_payload_with(true, vec![alice]),
    )))]);

    let (_room, mut events) =
        Room::connect("wss://rw.example.com", "tok", options(&connector, &peers))
            .await
            .unwrap();

    // Known publication: media matches immediately.
    peers
        .peer(1)
        .events()
        .send(PeerEvent::Track {
            track: MockRemoteTrack::new("TR_9", TrackKind::Video),
        })
        .unwrap();
    let event = next_delta(&mut events).await;
    let RoomEvent::TrackSubscribed {
        participant_sid,
        track,
    } = event
    else {
        panic!("expected the subscription");
    };
    assert_eq!(participant_sid, "PA_1");
    assert_eq!(track.sid(), "TR_9");

    // Unknown publication: media is parked until its owner shows up.
    peers
        .peer(1)
        .events()
        .send(PeerEvent::Track {
            track: MockRemoteTrack::new("TR_77", TrackKind::Audio),
        })
        .unwrap();
    let mut bob = participant_info("PA_2", "bob");
    bob.tracks.push(track_info("TR_77", TrackKind::Audio));
    socket.push(&SignalResponse::Update {
        participants: vec![bob],
    });

    let event = wait_for_room_event(&mut events, |event| {
        matches!(event, RoomEvent::TrackSubscribed { .. })
    })
    .await;
    let RoomEvent::TrackSubscribed {
        participant_sid,
        track,
    } = event
    else {
        panic!("expected the parked track to attach");
    };
    assert_eq!(participant_sid, "PA_2");
    assert_eq!(track.sid(), "TR_77");
}

// ════════════════════════════════════════════════════════════════════
// Reconnects
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn socket_loss_surfaces_reconnecting_then_reconnected() {
    let connector = MockConnector::new();
    let peers = MockPeerFactory::new();
    let first = connector.script_socket(vec![text_frame(&SignalResponse::Join(Box::new(
        join_payload_with(true, Vec::new()),
    )))]);
    connector.script_socket(vec![]);

    let (room, mut events) =
        Room::connect("wss://rw.example.com", "tok", options(&connector, &peers))
            .await
            .unwrap();

    first.feed.send(socket_error()).unwrap();

    assert!(matches!(
        next_delta(&mut events).await,
        RoomEvent::Reconnecting
    ));
    assert!(matches!(
        next_delta(&mut events).await,
        RoomEvent::Reconnected
    ));
    assert!(room.connection_state().is_connected());
}

#[tokio::test]
async fn full_reconnect_rebuilds_the_roster() {
    let connector = MockConnector::new();
    let peers = MockPeerFactory::new();
    let first = connector.script_socket(vec![text_frame(&SignalResponse::Join(Box::new(
        join_payload_with(true, vec![participant_info("PA_1", "alice")]),
    )))]);
    connector.script_socket(vec![text_frame(&SignalResponse::Join(Box::new(
        join_payload_with(true, vec![participant_info("PA_2", "bob")]),
    )))]);

    let (room, mut events) =
        Room::connect("wss://rw.example.com", "tok", options(&connector, &peers))
            .await
            .unwrap();
    assert_eq!(room.remote_participants()[0].sid, "PA_1");

    first.push(&SignalResponse::Leave(LeavePayload {
        reason: DisconnectReason::Server,
        action: LeaveAction::Reconnect,
    }));

    assert!(matches!(
        next_delta(&mut events).await,
        RoomEvent::Restarting
    ));
    let event = next_delta(&mut events).await;
    let RoomEvent::ParticipantDisconnected { participant } = event else {
        panic!("expected the stale participant to depart");
    };
    assert_eq!(participant.sid, "PA_1");
    let event = next_delta(&mut events).await;
    let RoomEvent::ParticipantConnected { participant } = event else {
        panic!("expected the fresh roster to connect");
    };
    assert_eq!(participant.sid, "PA_2");
    assert!(matches!(
        next_delta(&mut events).await,
        RoomEvent::Restarted
    ));

    assert!(first.was_closed());
    let remotes = room.remote_participants();
    assert_eq!(remotes.len(), 1);
    assert_eq!(remotes[0].sid, "PA_2");
}

// ════════════════════════════════════════════════════════════════════
// Closing
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn close_ends_the_stream_with_disconnected() {
    let connector = MockConnector::new();
    let peers = MockPeerFactory::new();
    let socket = connector.script_socket(vec![text_frame(&SignalResponse::Join(Box::new(
        join_payload_with(true, Vec::new()),
    )))]);

    let (room, mut events) =
        Room::connect("wss://rw.example.com", "tok", options(&connector, &peers))
            .await
            .unwrap();

    room.close().await;
    room.close().await;

    assert_eq!(
        count_requests(&socket.sent, |r| matches!(r, SignalRequest::Leave(_))),
        1
    );
    assert!(socket.was_closed());

    let event = wait_for_room_event(&mut events, |event| {
        matches!(event, RoomEvent::Disconnected { .. })
    })
    .await;
    let RoomEvent::Disconnected { reason } = event else {
        panic!("expected the terminal event");
    };
    assert_eq!(reason, DisconnectReason::User);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err(), "no events after disconnected");
}
