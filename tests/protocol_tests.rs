#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Wire-format tests for the RoomWire signaling protocol.
//!
//! Focuses on the envelope rules both codecs share — adjacent `type`/`data`
//! tagging, snake_case names, defaults for omitted fields — plus JSON
//! fixtures shaped like real server output and parity between the binary
//! and text paths. Exhaustive per-variant round-trips live with the codecs
//! themselves.

use roomwire_client::protocol::{
    decode_data_packet, decode_request, decode_response, decode_response_json, encode_data_packet,
    encode_request, encode_response, AddTrackRequest, DataPacket, DataPacketKind, DataPacketValue,
    DisconnectReason, IceCandidateInit, LeaveAction, MutePayload, SdpKind, SessionDescription,
    SignalRequest, SignalResponse, SignalTarget, SimulatePayload, SpeakerInfo, SyncStatePayload,
    TrackKind, UpdateSubscription, UserPacket, VideoLayer, VideoQuality, MAX_DATA_PAYLOAD_SIZE,
};

// ════════════════════════════════════════════════════════════════════
// Envelope shape
// ════════════════════════════════════════════════════════════════════

#[test]
fn requests_use_adjacent_type_and_data_tags() {
    let request = SignalRequest::Mute(MutePayload {
        sid: "TR_1".into(),
        muted: true,
    });
    let value: serde_json::Value = serde_json::to_value(&request).unwrap();
    assert_eq!(value["type"], "mute");
    assert_eq!(value["data"]["sid"], "TR_1");
    assert_eq!(value["data"]["muted"], true);
}

#[test]
fn variant_names_are_snake_case() {
    let request = SignalRequest::UpdateTrackSettings(
        roomwire_client::protocol::UpdateTrackSettings {
            track_sids: vec!["TR_1".into()],
            disabled: false,
            quality: VideoQuality::High,
            width: 1280,
            height: 720,
        },
    );
    let value: serde_json::Value = serde_json::to_value(&request).unwrap();
    assert_eq!(value["type"], "update_track_settings");
}

#[test]
fn session_description_kind_serializes_as_type() {
    let sdp = SessionDescription {
        kind: SdpKind::Offer,
        sdp: "v=0".into(),
    };
    let value: serde_json::Value = serde_json::to_value(&sdp).unwrap();
    assert_eq!(value["type"], "offer");
    assert_eq!(value["sdp"], "v=0");
}

#[test]
fn simulate_nests_its_own_envelope() {
    let request = SignalRequest::Simulate(SimulatePayload::SpeakerUpdate { seconds: 3 });
    let value: serde_json::Value = serde_json::to_value(&request).unwrap();
    assert_eq!(value["type"], "simulate");
    assert_eq!(value["data"]["type"], "speaker_update");
    assert_eq!(value["data"]["data"]["seconds"], 3);
}

// ════════════════════════════════════════════════════════════════════
// Server fixtures (text path)
// ════════════════════════════════════════════════════════════════════

#[test]
fn join_fixture_decodes() {
    let fixture = r#"{
        "type": "join",
        "data": {
            "room": { "sid": "RM_77", "name": "standup", "metadata": "" },
            "participant": {
                "sid": "PA_1",
                "identity": "alice",
                "name": "Alice",
                "state": "active",
                "metadata": "",
                "tracks": []
            },
            "other_participants": [],
            "ice_servers": [
                { "urls": ["stun:stun.example.com:3478"], "username": null, "credential": null }
            ],
            "subscriber_primary": true,
            "server_version": "1.9.3",
            "ping_interval": 30,
            "ping_timeout": 15
        }
    }"#;
    let response = decode_response_json(fixture).unwrap();
    let SignalResponse::Join(join) = response else {
        panic!("expected join");
    };
    assert_eq!(join.room.sid, "RM_77");
    assert_eq!(join.participant.identity, "alice");
    assert!(join.subscriber_primary);
    assert_eq!(join.ping_interval, 30);
    assert_eq!(join.ice_servers[0].urls[0], "stun:stun.example.com:3478");
}

#[test]
fn join_fixture_defaults_omitted_keepalive_fields() {
    let fixture = r#"{
        "type": "join",
        "data": {
            "room": { "sid": "RM_1", "name": "r" },
            "participant": { "sid": "PA_1", "identity": "a", "name": "a", "state": "joined" },
            "other_participants": [],
            "ice_servers": [],
            "subscriber_primary": false,
            "server_version": "1.9.0"
        }
    }"#;
    let SignalResponse::Join(join) = decode_response_json(fixture).unwrap() else {
        panic!("expected join");
    };
    assert_eq!(join.ping_interval, 0);
    assert_eq!(join.ping_timeout, 0);
    assert_eq!(join.room.metadata, "");
    assert!(join.participant.tracks.is_empty());
}

#[test]
fn trickle_fixture_decodes_with_target() {
    let fixture = r#"{
        "type": "trickle",
        "data": {
            "candidate": {
                "candidate": "candidate:1 1 udp 2130706431 10.0.0.1 54321 typ host",
                "sdp_mid": "0",
                "sdp_m_line_index": 0
            },
            "target": "subscriber"
        }
    }"#;
    let SignalResponse::Trickle { candidate, target } = decode_response_json(fixture).unwrap()
    else {
        panic!("expected trickle");
    };
    assert_eq!(target, SignalTarget::Subscriber);
    assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
    assert_eq!(candidate.sdp_m_line_index, Some(0));
}

#[test]
fn leave_fixture_decodes() {
    let fixture = r#"{ "type": "leave", "data": { "reason": "server", "action": "reconnect" } }"#;
    let SignalResponse::Leave(payload) = decode_response_json(fixture).unwrap() else {
        panic!("expected leave");
    };
    assert_eq!(payload.reason, DisconnectReason::Server);
    assert_eq!(payload.action, LeaveAction::Reconnect);
}

#[test]
fn unknown_fields_from_newer_servers_are_ignored() {
    let fixture = r#"{
        "type": "pong",
        "data": { "timestamp": 1724582400000, "server_load": 0.3 }
    }"#;
    let SignalResponse::Pong { timestamp } = decode_response_json(fixture).unwrap() else {
        panic!("expected pong");
    };
    assert_eq!(timestamp, 1_724_582_400_000);
}

#[test]
fn malformed_text_is_a_parse_error() {
    let err = decode_response_json("{\"type\": \"join\", \"data\": 42}").unwrap_err();
    assert!(matches!(err, roomwire_client::RoomWireError::Parse(_)));
}

// ════════════════════════════════════════════════════════════════════
// Binary / text parity
// ════════════════════════════════════════════════════════════════════

#[test]
fn both_codec_paths_agree() {
    let original = SignalResponse::SpeakersChanged {
        speakers: vec![SpeakerInfo {
            sid: "PA_1".into(),
            level: 0.62,
            active: true,
        }],
    };

    let binary = encode_response(&original).unwrap();
    let from_binary = decode_response(&binary).unwrap();

    let text = serde_json::to_string(&original).unwrap();
    let from_text = decode_response_json(&text).unwrap();

    assert_eq!(from_binary, original);
    assert_eq!(from_text, original);
}

#[test]
fn add_track_request_survives_the_binary_path() {
    let request = SignalRequest::AddTrack(Box::new(AddTrackRequest {
        cid: "cid-1234".into(),
        name: "camera".into(),
        kind: TrackKind::Video,
        muted: false,
        width: 1280,
        height: 720,
        simulcast: true,
        layers: vec![VideoLayer {
            quality: VideoQuality::High,
            width: 1280,
            height: 720,
            bitrate: 1_700_000,
        }],
    }));
    let bytes = encode_request(&request).unwrap();
    assert_eq!(decode_request(&bytes).unwrap(), request);
}

#[test]
fn sync_state_with_no_answer_survives_the_binary_path() {
    let request = SignalRequest::SyncState(Box::new(SyncStatePayload {
        answer: None,
        subscription: UpdateSubscription {
            track_sids: Vec::new(),
            subscribe: true,
            participant_tracks: Vec::new(),
        },
        publish_tracks: Vec::new(),
        data_channels: Vec::new(),
    }));
    let bytes = encode_request(&request).unwrap();
    assert_eq!(decode_request(&bytes).unwrap(), request);
}

#[test]
fn truncated_binary_is_a_parse_error() {
    let bytes = encode_response(&SignalResponse::Pong { timestamp: 7 }).unwrap();
    let err = decode_response(&bytes[..bytes.len() - 1]).unwrap_err();
    assert!(matches!(err, roomwire_client::RoomWireError::Parse(_)));
}

// ════════════════════════════════════════════════════════════════════
// Data packets
// ════════════════════════════════════════════════════════════════════

#[test]
fn user_packet_round_trips_arbitrary_bytes() {
    let packet = DataPacket {
        kind: DataPacketKind::Lossy,
        value: DataPacketValue::User(UserPacket {
            participant_sid: "PA_1".into(),
            payload: vec![0x00, 0xFF, 0x7F, 0x00, 0x01],
            dest_sids: vec!["PA_2".into()],
            topic: Some("state".into()),
        }),
    };
    let bytes = encode_data_packet(&packet).unwrap();
    assert_eq!(decode_data_packet(&bytes).unwrap(), packet);
}

#[test]
fn speaker_packet_round_trips() {
    let packet = DataPacket {
        kind: DataPacketKind::Reliable,
        value: DataPacketValue::Speaker {
            speakers: vec![SpeakerInfo {
                sid: "PA_3".into(),
                level: 0.9,
                active: true,
            }],
        },
    };
    let bytes = encode_data_packet(&packet).unwrap();
    assert_eq!(decode_data_packet(&bytes).unwrap(), packet);
}

#[test]
fn payload_limit_leaves_headroom_under_typical_sctp_mtu() {
    assert_eq!(MAX_DATA_PAYLOAD_SIZE, 15_000);
}

// ════════════════════════════════════════════════════════════════════
// Queueing classification
// ════════════════════════════════════════════════════════════════════

#[test]
fn negotiation_messages_are_never_queueable() {
    let sdp = SessionDescription {
        kind: SdpKind::Offer,
        sdp: "v=0".into(),
    };
    let not_queueable = [
        SignalRequest::Offer(sdp.clone()),
        SignalRequest::Answer(sdp),
        SignalRequest::Trickle {
            candidate: IceCandidateInit {
                candidate: "candidate:1".into(),
                sdp_mid: None,
                sdp_m_line_index: None,
            },
            target: SignalTarget::Publisher,
        },
        SignalRequest::SyncState(Box::new(SyncStatePayload {
            answer: None,
            subscription: UpdateSubscription {
                track_sids: Vec::new(),
                subscribe: true,
                participant_tracks: Vec::new(),
            },
            publish_tracks: Vec::new(),
            data_channels: Vec::new(),
        })),
        SignalRequest::Simulate(SimulatePayload::NodeFailure),
    ];
    for request in not_queueable {
        assert!(!request.is_queueable(), "{} must not queue", request.kind());
    }
}

#[test]
fn state_changing_messages_are_queueable() {
    let queueable = [
        SignalRequest::Mute(MutePayload {
            sid: "TR_1".into(),
            muted: true,
        }),
        SignalRequest::UpdateSubscription(UpdateSubscription {
            track_sids: vec!["TR_1".into()],
            subscribe: true,
            participant_tracks: Vec::new(),
        }),
        SignalRequest::Leave(roomwire_client::protocol::LeavePayload {
            reason: DisconnectReason::User,
            action: LeaveAction::Disconnect,
        }),
        SignalRequest::Ping {
            timestamp: 1_724_582_400_000,
        },
    ];
    for request in queueable {
        assert!(request.is_queueable(), "{} must queue", request.kind());
    }
}
