//! Cross-encoding codec tests: both payload encodings must round-trip
//! every message shape, and `check_complete` must agree with `encode`.

use clasp_core::codec::{self, Encoding};
use clasp_core::frame::Frame;
use clasp_core::*;
use std::collections::BTreeMap;

fn sample_messages() -> Vec<Message> {
    let mut meta = BTreeMap::new();
    meta.insert("version".to_string(), Value::Int(2));
    meta.insert("name".to_string(), Value::String("studio".into()));

    vec![
        Message::Hello(Hello {
            version: 2,
            name: "console".into(),
            features: vec!["param".into(), "gesture".into()],
            token: Some("cap:read:/**".into()),
        }),
        Message::Welcome(Welcome {
            version: 2,
            session: "s-91f2".into(),
            name: "studio router".into(),
            features: vec!["param".into()],
            time: 1_719_000_000_000_000,
        }),
        Message::Announce(Announce {
            namespace: "/studio".into(),
            signals: vec![SignalInfo {
                address: "/studio/bpm".into(),
                kind: SignalKind::Param,
                datatype: Some("float".into()),
            }],
            meta: Some(meta),
        }),
        Message::Subscribe(Subscribe {
            id: 4,
            pattern: "/lights/**".into(),
            types: vec![SignalKind::Param, SignalKind::Event],
            options: Some(SubscribeOptions {
                max_rate: Some(60),
                epsilon: Some(0.001),
                history: Some(1),
                window: None,
            }),
        }),
        Message::Unsubscribe(Unsubscribe { id: 4 }),
        Message::Publish(Publish {
            address: "/sensor/imu".into(),
            signal: Some(SignalKind::Stream),
            value: None,
            payload: None,
            samples: Some(vec![0.1, 0.2, 0.3]),
            rate: Some(200),
            id: None,
            phase: None,
            timestamp: Some(77),
        }),
        Message::Set(Set {
            address: "/lights/kitchen/brightness".into(),
            value: Value::Float(0.5),
            revision: Some(12),
            lock: true,
            unlock: false,
        }),
        Message::Get(Get {
            address: "/lights/kitchen/brightness".into(),
        }),
        Message::Snapshot(Snapshot {
            params: vec![ParamSnapshot {
                address: "/x".into(),
                value: Value::Float(0.75),
                revision: 1,
                writer: Some("s-1".into()),
                timestamp: Some(99),
            }],
        }),
        Message::Bundle(Bundle {
            timestamp: Some(123_456),
            messages: vec![Message::Set(Set {
                address: "/l/1".into(),
                value: Value::Float(1.0),
                revision: None,
                lock: false,
                unlock: false,
            })],
        }),
        Message::Sync(Sync {
            t1: 10,
            t2: Some(20),
            t3: Some(21),
        }),
        Message::Ping,
        Message::Pong,
        Message::Ack(Ack {
            address: Some("/x".into()),
            revision: Some(1),
            locked: None,
            holder: None,
            correlation_id: Some(3),
        }),
        Message::ErrorMsg(ErrorInfo {
            code: 301,
            message: "scope".into(),
            address: Some("/system/boot".into()),
            correlation_id: None,
        }),
        Message::Query(Query {
            pattern: "/lights/**".into(),
        }),
        Message::QueryResult(QueryResult {
            signals: vec![SignalInfo {
                address: "/lights/kitchen/brightness".into(),
                kind: SignalKind::Param,
                datatype: None,
            }],
        }),
    ]
}

fn assert_equivalent(a: &Message, b: &Message) {
    // Message doesn't implement PartialEq (Bundle nests arbitrarily);
    // comparing re-encoded bytes is an exact structural check.
    let ea = codec::encode_payload(a, Encoding::Binary).unwrap();
    let eb = codec::encode_payload(b, Encoding::Binary).unwrap();
    assert_eq!(ea, eb, "mismatch between {a:?} and {b:?}");
}

#[test]
fn binary_roundtrip_all_messages() {
    for msg in sample_messages() {
        let wire = codec::encode(&msg).unwrap();
        let (decoded, _) = codec::decode(&wire).unwrap();
        assert_equivalent(&msg, &decoded);
    }
}

#[test]
fn map_style_roundtrip_all_messages() {
    for msg in sample_messages() {
        let wire = codec::encode_with(&msg, Encoding::Map, None, None).unwrap();
        let (decoded, _) = codec::decode(&wire).unwrap();
        assert_equivalent(&msg, &decoded);
    }
}

#[test]
fn check_complete_equals_encoded_length() {
    for msg in sample_messages() {
        let wire = codec::encode(&msg).unwrap();
        assert_eq!(
            Frame::check_complete(&wire).unwrap(),
            Some(wire.len()),
            "length mismatch for {msg:?}"
        );
        // Appending garbage must not change the reported frame length.
        let mut padded = wire.to_vec();
        padded.extend_from_slice(&[0xAA; 7]);
        assert_eq!(Frame::check_complete(&padded).unwrap(), Some(wire.len()));
    }
}

#[test]
fn encodings_are_auto_discriminated() {
    for msg in sample_messages() {
        let map = codec::encode_payload(&msg, Encoding::Map).unwrap();
        let bin = codec::encode_payload(&msg, Encoding::Binary).unwrap();
        assert_eq!(codec::detect(&map), Some(Encoding::Map));
        assert_eq!(codec::detect(&bin), Some(Encoding::Binary));
        // Decoding either must yield the same message.
        assert_equivalent(
            &codec::decode_payload(&map).unwrap(),
            &codec::decode_payload(&bin).unwrap(),
        );
    }
}

#[test]
fn map_style_ignores_unknown_top_level_keys() {
    // Forward compatibility: a newer peer may add fields.
    let raw = rmp_serde::to_vec_named(&serde_json::json!({
        "type": "GET",
        "address": "/x",
        "someFutureField": 17,
    }))
    .unwrap();
    let msg = codec::decode_payload(&raw).unwrap();
    assert!(matches!(msg, Message::Get(_)));
}

#[test]
fn truncated_frames_never_panic() {
    for msg in sample_messages() {
        let wire = codec::encode(&msg).unwrap();
        for cut in 0..wire.len() {
            // Either an error or (for header prefixes) "incomplete".
            let _ = codec::decode(&wire[..cut]);
        }
    }
}
