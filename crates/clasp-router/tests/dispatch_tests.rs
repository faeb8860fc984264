//! End-to-end dispatcher scenarios, driven through loopback sessions.

use bytes::Bytes;
use clasp_core::codec::{self, Encoding};
use clasp_core::grant::Grant;
use clasp_core::time::now_micros;
use clasp_core::{
    Bundle, Frame, GesturePhase, Message, Publish, QoS, Set, SignalKind, Subscribe,
    SubscribeOptions, Value,
};
use clasp_router::{Dispatcher, Session};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn frame(qos: QoS) -> Frame {
    Frame::new(Bytes::new()).with_qos(qos)
}

fn connect(dispatcher: &Arc<Dispatcher>, grant: Grant) -> (Arc<Session>, mpsc::Receiver<Bytes>) {
    let (sender, frames) = clasp_transport::LoopbackSender::channel(256);
    let session = Arc::new(Session::new(
        Arc::new(sender),
        "test-client".into(),
        vec![],
        grant,
        Encoding::Binary,
    ));
    dispatcher.sessions.insert(session.clone());
    (session, frames)
}

async fn next_message(frames: &mut mpsc::Receiver<Bytes>) -> Message {
    let bytes = timeout(Duration::from_secs(2), frames.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("channel closed");
    codec::decode(&bytes).expect("bad frame").0
}

async fn assert_silent(frames: &mut mpsc::Receiver<Bytes>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        frames.try_recv().is_err(),
        "expected no delivery, but one arrived"
    );
}

fn set(address: &str, value: f64) -> Message {
    Message::Set(Set {
        address: address.into(),
        value: Value::Float(value),
        revision: None,
        lock: false,
        unlock: false,
    })
}

fn subscribe(id: u32, pattern: &str) -> Message {
    Message::Subscribe(Subscribe {
        id,
        pattern: pattern.into(),
        types: vec![],
        options: None,
    })
}

#[tokio::test]
async fn late_joiner_gets_state() {
    let d = Dispatcher::new();
    let (a, mut a_rx) = connect(&d, Grant::open());
    let (b, mut b_rx) = connect(&d, Grant::open());

    d.dispatch(&a, set("/x", 0.75), &frame(QoS::Confirm)).await;
    match next_message(&mut a_rx).await {
        Message::Ack(ack) => {
            assert_eq!(ack.address.as_deref(), Some("/x"));
            assert_eq!(ack.revision, Some(1));
        }
        other => panic!("expected ACK, got {other:?}"),
    }

    d.dispatch(&b, subscribe(1, "/x"), &frame(QoS::Confirm)).await;
    match next_message(&mut b_rx).await {
        Message::Snapshot(snap) => {
            assert_eq!(snap.params.len(), 1);
            assert_eq!(snap.params[0].address, "/x");
            assert_eq!(snap.params[0].value, Value::Float(0.75));
            assert_eq!(snap.params[0].revision, 1);
        }
        other => panic!("expected SNAPSHOT first, got {other:?}"),
    }
}

#[tokio::test]
async fn wildcard_fanout_reaches_only_matches() {
    let d = Dispatcher::new();
    let (a, mut a_rx) = connect(&d, Grant::open());
    let (b, _b_rx) = connect(&d, Grant::open());

    d.dispatch(&a, subscribe(1, "/lights/**"), &frame(QoS::Fire))
        .await;
    // Drain the (empty) initial snapshot.
    assert!(matches!(next_message(&mut a_rx).await, Message::Snapshot(_)));

    d.dispatch(&b, set("/lights/kitchen/brightness", 0.5), &frame(QoS::Fire))
        .await;
    match next_message(&mut a_rx).await {
        Message::Set(update) => {
            assert_eq!(update.address, "/lights/kitchen/brightness");
            assert_eq!(update.value, Value::Float(0.5));
            assert_eq!(update.revision, Some(1));
        }
        other => panic!("expected SET delivery, got {other:?}"),
    }

    d.dispatch(&b, set("/other", 0.1), &frame(QoS::Fire)).await;
    assert_silent(&mut a_rx).await;
}

#[tokio::test]
async fn immediate_bundle_is_atomic_and_coalesced() {
    let d = Dispatcher::new();
    let (a, mut a_rx) = connect(&d, Grant::open());
    let (b, mut b_rx) = connect(&d, Grant::open());

    d.dispatch(&a, subscribe(1, "/l/**"), &frame(QoS::Fire)).await;
    assert!(matches!(next_message(&mut a_rx).await, Message::Snapshot(_)));

    let bundle = Message::Bundle(Bundle {
        timestamp: None,
        messages: vec![
            set("/l/1", 0.2),
            set("/l/2", 0.5),
            set("/l/1", 1.0), // last write per address wins the fan-out
        ],
    });
    d.dispatch(&b, bundle, &frame(QoS::Commit)).await;

    let mut got = std::collections::HashMap::new();
    for _ in 0..2 {
        match next_message(&mut a_rx).await {
            Message::Set(update) => {
                got.insert(update.address.clone(), update.value.clone());
            }
            other => panic!("expected SET delivery, got {other:?}"),
        }
    }
    assert_eq!(got["/l/1"], Value::Float(1.0));
    assert_eq!(got["/l/2"], Value::Float(0.5));
    assert_silent(&mut a_rx).await;

    // Submitter gets exactly one ACK for the bundle.
    match next_message(&mut b_rx).await {
        Message::Ack(ack) => assert!(ack.correlation_id.is_some()),
        other => panic!("expected bundle ACK, got {other:?}"),
    }
}

#[tokio::test]
async fn scheduled_bundle_fires_later() {
    let d = Dispatcher::new();
    let (tx, rx) = tokio::sync::watch::channel(false);
    tokio::spawn(d.clone().run_timers(rx));

    let (a, mut a_rx) = connect(&d, Grant::open());
    let (b, _b_rx) = connect(&d, Grant::open());

    d.dispatch(&a, subscribe(1, "/l/**"), &frame(QoS::Fire)).await;
    assert!(matches!(next_message(&mut a_rx).await, Message::Snapshot(_)));

    let bundle = Message::Bundle(Bundle {
        timestamp: Some(now_micros() + 100_000),
        messages: vec![set("/l/1", 1.0), set("/l/2", 0.5)],
    });
    d.dispatch(&b, bundle, &frame(QoS::Commit)).await;

    // Nothing observable before the fire time.
    assert!(a_rx.try_recv().is_err());
    assert!(d.store.get("/l/1").is_none());

    let mut got = std::collections::HashMap::new();
    for _ in 0..2 {
        match next_message(&mut a_rx).await {
            Message::Set(update) => {
                got.insert(update.address.clone(), update.value.clone());
            }
            other => panic!("expected SET delivery, got {other:?}"),
        }
    }
    assert_eq!(got["/l/1"], Value::Float(1.0));
    assert_eq!(got["/l/2"], Value::Float(0.5));
    let _ = tx.send(true);
}

#[tokio::test]
async fn stale_scheduled_bundle_rejected() {
    let d = Dispatcher::new();
    let (a, mut a_rx) = connect(&d, Grant::open());

    let bundle = Message::Bundle(Bundle {
        timestamp: Some(now_micros().saturating_sub(2_000_000)),
        messages: vec![set("/l/1", 1.0)],
    });
    d.dispatch(&a, bundle, &frame(QoS::Commit)).await;
    match next_message(&mut a_rx).await {
        Message::ErrorMsg(err) => assert_eq!(err.code, 404),
        other => panic!("expected ERROR 404, got {other:?}"),
    }
    assert!(d.store.get("/l/1").is_none());
}

#[tokio::test]
async fn failing_bundle_leaves_no_trace() {
    let d = Dispatcher::new();
    let (locker, _l_rx) = connect(&d, Grant::open());
    let (b, mut b_rx) = connect(&d, Grant::open());

    // Another session holds /held.
    d.dispatch(
        &locker,
        Message::Set(Set {
            address: "/held".into(),
            value: Value::Int(1),
            revision: None,
            lock: true,
            unlock: false,
        }),
        &frame(QoS::Fire),
    )
    .await;

    let bundle = Message::Bundle(Bundle {
        timestamp: None,
        messages: vec![set("/fresh", 0.5), set("/held", 2.0)],
    });
    d.dispatch(&b, bundle, &frame(QoS::Commit)).await;

    match next_message(&mut b_rx).await {
        Message::ErrorMsg(err) => assert_eq!(err.code, 401),
        other => panic!("expected ERROR 401, got {other:?}"),
    }
    // The earlier message in the bundle must not have applied.
    assert!(d.store.get("/fresh").is_none());
    assert_eq!(d.store.get("/held").unwrap().value, Value::Int(1));
}

#[tokio::test]
async fn stream_rate_limit_bounds_deliveries() {
    let d = Dispatcher::new();
    let (a, mut a_rx) = connect(&d, Grant::open());
    let (b, _b_rx) = connect(&d, Grant::open());

    d.dispatch(
        &a,
        Message::Subscribe(Subscribe {
            id: 1,
            pattern: "/sensor".into(),
            types: vec![SignalKind::Stream],
            options: Some(SubscribeOptions {
                max_rate: Some(10),
                ..Default::default()
            }),
        }),
        &frame(QoS::Fire),
    )
    .await;
    assert!(matches!(next_message(&mut a_rx).await, Message::Snapshot(_)));

    // 100 publishes spread over roughly one second.
    let started = std::time::Instant::now();
    for i in 0..100u32 {
        let publish = Message::Publish(Publish {
            address: "/sensor".into(),
            signal: Some(SignalKind::Stream),
            value: Some(Value::Float(i as f64)),
            payload: None,
            samples: None,
            rate: None,
            id: None,
            phase: None,
            timestamp: None,
        });
        d.dispatch(&b, publish, &frame(QoS::Fire)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let elapsed = started.elapsed().as_secs_f64();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut delivered = 0u32;
    while a_rx.try_recv().is_ok() {
        delivered += 1;
    }
    // No more than ceil(rate * T) deliveries over any window T, and the
    // limiter must not starve the stream either.
    let ceiling = (10.0 * elapsed).ceil() as u32 + 1;
    assert!(
        delivered <= ceiling,
        "delivered {delivered}, ceiling {ceiling} over {elapsed:.2}s"
    );
    assert!(delivered >= 9, "delivered only {delivered} of 100");
}

#[tokio::test]
async fn capability_violation_is_refused() {
    let d = Dispatcher::new();
    let grant = Grant::parse("write:/user/**;read:/user/**").unwrap();
    let (a, mut a_rx) = connect(&d, grant);

    d.dispatch(
        &a,
        Message::Set(Set {
            address: "/system/boot".into(),
            value: Value::Bool(true),
            revision: None,
            lock: false,
            unlock: false,
        }),
        &frame(QoS::Confirm),
    )
    .await;

    match next_message(&mut a_rx).await {
        Message::ErrorMsg(err) => {
            assert_eq!(err.code, 301);
            assert_eq!(err.message, "scope");
            assert_eq!(err.address.as_deref(), Some("/system/boot"));
        }
        other => panic!("expected ERROR 301, got {other:?}"),
    }
    assert!(d.store.get("/system/boot").is_none());
}

#[tokio::test]
async fn subscribe_outside_read_scope_rejected() {
    let d = Dispatcher::new();
    let grant = Grant::parse("read:/user/**").unwrap();
    let (a, mut a_rx) = connect(&d, grant);

    d.dispatch(&a, subscribe(1, "/system/**"), &frame(QoS::Fire))
        .await;
    match next_message(&mut a_rx).await {
        Message::ErrorMsg(err) => assert_eq!(err.code, 301),
        other => panic!("expected ERROR 301, got {other:?}"),
    }
    assert_eq!(d.subscriptions.len(), 0);
}

#[tokio::test]
async fn get_unknown_address_is_2xx() {
    let d = Dispatcher::new();
    let (a, mut a_rx) = connect(&d, Grant::open());
    d.dispatch(
        &a,
        Message::Get(clasp_core::Get {
            address: "/nope".into(),
        }),
        &frame(QoS::Fire),
    )
    .await;
    match next_message(&mut a_rx).await {
        Message::ErrorMsg(err) => assert_eq!(err.code, 201),
        other => panic!("expected ERROR 201, got {other:?}"),
    }
}

#[tokio::test]
async fn gesture_move_without_start_is_dropped_with_error() {
    let d = Dispatcher::new();
    let (b, mut b_rx) = connect(&d, Grant::open());
    let (watcher, mut w_rx) = connect(&d, Grant::open());

    d.dispatch(&watcher, subscribe(1, "/touch/**"), &frame(QoS::Fire))
        .await;
    assert!(matches!(next_message(&mut w_rx).await, Message::Snapshot(_)));

    let gesture = |phase: GesturePhase, id: u32| {
        Message::Publish(Publish {
            address: "/touch/pad".into(),
            signal: Some(SignalKind::Gesture),
            value: None,
            payload: None,
            samples: None,
            rate: None,
            id: Some(id),
            phase: Some(phase),
            timestamp: None,
        })
    };

    // Move before start: 4xx, no fan-out.
    d.dispatch(&b, gesture(GesturePhase::Move, 5), &frame(QoS::Fire))
        .await;
    match next_message(&mut b_rx).await {
        Message::ErrorMsg(err) => assert_eq!(err.code, 403),
        other => panic!("expected ERROR 403, got {other:?}"),
    }
    assert_silent(&mut w_rx).await;

    // Proper lifecycle flows through.
    d.dispatch(&b, gesture(GesturePhase::Start, 5), &frame(QoS::Fire))
        .await;
    d.dispatch(&b, gesture(GesturePhase::Move, 5), &frame(QoS::Fire))
        .await;
    d.dispatch(&b, gesture(GesturePhase::End, 5), &frame(QoS::Fire))
        .await;
    for want in [GesturePhase::Start, GesturePhase::Move, GesturePhase::End] {
        match next_message(&mut w_rx).await {
            Message::Publish(p) => assert_eq!(p.phase, Some(want)),
            other => panic!("expected gesture publish, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn session_close_cascades() {
    let d = Dispatcher::new();
    let (a, _a_rx) = connect(&d, Grant::open());
    let (watcher, mut w_rx) = connect(&d, Grant::open());

    d.dispatch(&watcher, subscribe(1, "/**"), &frame(QoS::Fire)).await;
    assert!(matches!(next_message(&mut w_rx).await, Message::Snapshot(_)));

    // A locks a param and starts a gesture, then goes away.
    d.dispatch(
        &a,
        Message::Set(Set {
            address: "/deck/fader".into(),
            value: Value::Float(0.3),
            revision: None,
            lock: true,
            unlock: false,
        }),
        &frame(QoS::Fire),
    )
    .await;
    assert!(matches!(next_message(&mut w_rx).await, Message::Set(_)));
    d.dispatch(
        &a,
        Message::Publish(Publish {
            address: "/touch/pad".into(),
            signal: Some(SignalKind::Gesture),
            value: None,
            payload: None,
            samples: None,
            rate: None,
            id: Some(1),
            phase: Some(GesturePhase::Start),
            timestamp: None,
        }),
        &frame(QoS::Fire),
    )
    .await;
    assert!(matches!(next_message(&mut w_rx).await, Message::Publish(_)));

    d.close_session(&a).await;

    // Watcher sees the synthesized gesture cancel.
    match next_message(&mut w_rx).await {
        Message::Publish(p) => {
            assert_eq!(p.phase, Some(GesturePhase::Cancel));
            assert_eq!(p.id, Some(1));
        }
        other => panic!("expected cancel publish, got {other:?}"),
    }

    // Param state survives, but the lock is gone.
    let (b, _b_rx) = connect(&d, Grant::open());
    assert_eq!(d.store.get("/deck/fader").unwrap().value, Value::Float(0.3));
    d.dispatch(&b, set("/deck/fader", 0.9), &frame(QoS::Fire)).await;
    assert_eq!(d.store.get("/deck/fader").unwrap().value, Value::Float(0.9));
}

#[tokio::test]
async fn query_lists_matching_addresses() {
    let d = Dispatcher::new();
    let (a, mut a_rx) = connect(&d, Grant::open());
    d.dispatch(&a, set("/l/1", 0.1), &frame(QoS::Fire)).await;
    d.dispatch(&a, set("/l/2", 0.2), &frame(QoS::Fire)).await;
    d.dispatch(&a, set("/m/1", 0.3), &frame(QoS::Fire)).await;

    d.dispatch(
        &a,
        Message::Query(clasp_core::Query {
            pattern: "/l/**".into(),
        }),
        &frame(QoS::Fire),
    )
    .await;
    match next_message(&mut a_rx).await {
        Message::QueryResult(result) => {
            let addrs: Vec<&str> = result.signals.iter().map(|s| s.address.as_str()).collect();
            assert_eq!(addrs, vec!["/l/1", "/l/2"]);
        }
        other => panic!("expected RESULT, got {other:?}"),
    }
}

#[tokio::test]
async fn revision_mismatch_and_lock_conflict_codes() {
    let d = Dispatcher::new();
    let (a, _a_rx) = connect(&d, Grant::open());
    let (b, mut b_rx) = connect(&d, Grant::open());

    d.dispatch(&a, set("/x", 1.0), &frame(QoS::Fire)).await;
    d.dispatch(
        &b,
        Message::Set(Set {
            address: "/x".into(),
            value: Value::Float(2.0),
            revision: Some(9),
            lock: false,
            unlock: false,
        }),
        &frame(QoS::Fire),
    )
    .await;
    match next_message(&mut b_rx).await {
        Message::ErrorMsg(err) => assert_eq!(err.code, 400),
        other => panic!("expected ERROR 400, got {other:?}"),
    }

    d.dispatch(
        &a,
        Message::Set(Set {
            address: "/x".into(),
            value: Value::Float(3.0),
            revision: None,
            lock: true,
            unlock: false,
        }),
        &frame(QoS::Fire),
    )
    .await;
    d.dispatch(&b, set("/x", 4.0), &frame(QoS::Fire)).await;
    match next_message(&mut b_rx).await {
        Message::ErrorMsg(err) => assert_eq!(err.code, 401),
        other => panic!("expected ERROR 401, got {other:?}"),
    }
}
