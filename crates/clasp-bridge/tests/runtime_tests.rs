//! Supervisor behavior with scripted drivers: routing through the
//! pseudo-session, restart with backoff, isolation of failures.

use async_trait::async_trait;
use clasp_bridge::{BridgeDriver, BridgeRuntime, BridgeSpec, BridgeState, DriverEvent, Result};
use clasp_core::codec::Encoding;
use clasp_core::grant::Grant;
use clasp_core::{Message, Set, Subscribe, Value};
use clasp_router::{Dispatcher, Session};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Driver scripted from the outside: the test feeds inbound messages
/// and observes outbound ones.
struct ScriptedDriver {
    namespace: String,
    inbound_rx: Option<mpsc::Receiver<DriverEvent>>,
    outbound_tx: mpsc::Sender<Message>,
    starts: Arc<AtomicU32>,
    fail_first_starts: u32,
}

#[async_trait]
impl BridgeDriver for ScriptedDriver {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn start(&mut self) -> Result<mpsc::Receiver<DriverEvent>> {
        let attempt = self.starts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first_starts {
            return Err(clasp_bridge::BridgeError::Transient("flaky device".into()));
        }
        self.inbound_rx
            .take()
            .ok_or_else(|| clasp_bridge::BridgeError::Transient("already started".into()))
    }

    async fn outbound(&mut self, message: &Message) -> Result<()> {
        let _ = self.outbound_tx.send(message.clone()).await;
        Ok(())
    }

    async fn stop(&mut self) {}
}

struct Rig {
    dispatcher: Arc<Dispatcher>,
    runtime: Arc<BridgeRuntime>,
    inbound_tx: mpsc::Sender<DriverEvent>,
    outbound_rx: mpsc::Receiver<Message>,
}

async fn rig(id: &str, namespace: &str, fail_first_starts: u32) -> Rig {
    let dispatcher = Dispatcher::new();
    let runtime = BridgeRuntime::new(dispatcher.clone());
    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let driver = Box::new(ScriptedDriver {
        namespace: namespace.to_string(),
        inbound_rx: Some(inbound_rx),
        outbound_tx,
        starts: Arc::new(AtomicU32::new(0)),
        fail_first_starts,
    });
    runtime
        .create_with(
            BridgeSpec {
                id: id.to_string(),
                kind: "scripted".to_string(),
                source_addr: String::new(),
                target_addr: namespace.to_string(),
                config: serde_json::Value::Null,
            },
            driver,
        )
        .await
        .unwrap();
    Rig {
        dispatcher,
        runtime,
        inbound_tx,
        outbound_rx,
    }
}

async fn wait_for_state(runtime: &BridgeRuntime, id: &str, want: BridgeState) {
    for _ in 0..200 {
        if runtime.state_of(id) == Some(want) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("bridge {id} never reached {want:?}");
}

fn attach_observer(dispatcher: &Arc<Dispatcher>) -> (Arc<Session>, mpsc::Receiver<bytes::Bytes>) {
    let (sender, frames) = clasp_transport::LoopbackSender::channel(64);
    let session = Arc::new(Session::new(
        Arc::new(sender),
        "observer".into(),
        vec![],
        Grant::open(),
        Encoding::Binary,
    ));
    dispatcher.sessions.insert(session.clone());
    (session, frames)
}

#[tokio::test]
async fn inbound_traffic_routes_to_subscribers() {
    let rig = rig("b1", "/osc", 0).await;
    wait_for_state(&rig.runtime, "b1", BridgeState::Running).await;

    let (observer, mut frames) = attach_observer(&rig.dispatcher);
    rig.dispatcher
        .inject(
            &observer,
            Message::Subscribe(Subscribe {
                id: 1,
                pattern: "/osc/**".into(),
                types: vec![],
                options: None,
            }),
        )
        .await;
    // Initial snapshot.
    let first = frames.recv().await.unwrap();
    assert!(matches!(
        clasp_core::codec::decode(&first).unwrap().0,
        Message::Snapshot(_)
    ));

    rig.inbound_tx
        .send(DriverEvent::Inbound(Message::Set(Set {
            address: "/osc/fader/1".into(),
            value: Value::Float(0.5),
            revision: None,
            lock: false,
            unlock: false,
        })))
        .await
        .unwrap();

    let delivered = timeout(Duration::from_secs(2), frames.recv())
        .await
        .unwrap()
        .unwrap();
    match clasp_core::codec::decode(&delivered).unwrap().0 {
        Message::Set(set) => {
            assert_eq!(set.address, "/osc/fader/1");
            assert_eq!(set.revision, Some(1));
        }
        other => panic!("expected SET, got {other:?}"),
    }
    // State landed in the store too.
    assert!(rig.dispatcher.store.get("/osc/fader/1").is_some());
}

#[tokio::test]
async fn router_writes_reach_the_driver() {
    let mut rig = rig("b2", "/osc", 0).await;
    wait_for_state(&rig.runtime, "b2", BridgeState::Running).await;

    let (writer, _frames) = attach_observer(&rig.dispatcher);
    rig.dispatcher
        .inject(
            &writer,
            Message::Set(Set {
                address: "/osc/fader/2".into(),
                value: Value::Float(0.9),
                revision: None,
                lock: false,
                unlock: false,
            }),
        )
        .await;

    let outbound = timeout(Duration::from_secs(2), rig.outbound_rx.recv())
        .await
        .unwrap()
        .unwrap();
    match outbound {
        Message::Set(set) => assert_eq!(set.address, "/osc/fader/2"),
        other => panic!("expected SET, got {other:?}"),
    }
}

#[tokio::test]
async fn bridge_does_not_echo_its_own_writes() {
    let mut rig = rig("b3", "/osc", 0).await;
    wait_for_state(&rig.runtime, "b3", BridgeState::Running).await;

    rig.inbound_tx
        .send(DriverEvent::Inbound(Message::Set(Set {
            address: "/osc/loop".into(),
            value: Value::Int(1),
            revision: None,
            lock: false,
            unlock: false,
        })))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        rig.outbound_rx.try_recv().is_err(),
        "bridge saw its own write come back"
    );
}

#[tokio::test]
async fn flaky_starts_recover_with_backoff() {
    let rig = rig("b4", "/flaky", 2).await;
    // Two failed starts, then Running.
    wait_for_state(&rig.runtime, "b4", BridgeState::Running).await;
}

#[tokio::test]
async fn fatal_fault_parks_the_bridge() {
    let rig = rig("b5", "/dead", 0).await;
    wait_for_state(&rig.runtime, "b5", BridgeState::Running).await;

    rig.inbound_tx
        .send(DriverEvent::Fault {
            fatal: true,
            detail: "device gone".into(),
        })
        .await
        .unwrap();
    wait_for_state(&rig.runtime, "b5", BridgeState::Error).await;

    // The router is untouched: sessions still dispatch normally.
    let (writer, _frames) = attach_observer(&rig.dispatcher);
    rig.dispatcher
        .inject(
            &writer,
            Message::Set(Set {
                address: "/elsewhere".into(),
                value: Value::Int(1),
                revision: None,
                lock: false,
                unlock: false,
            }),
        )
        .await;
    assert!(rig.dispatcher.store.get("/elsewhere").is_some());
}

#[tokio::test]
async fn create_is_idempotent_on_identical_spec() {
    let dispatcher = Dispatcher::new();
    let runtime = BridgeRuntime::new(dispatcher);
    let spec = BridgeSpec {
        id: "dup".into(),
        kind: "scripted".into(),
        source_addr: String::new(),
        target_addr: "/dup".into(),
        config: serde_json::Value::Null,
    };
    let (_tx, inbound_rx) = mpsc::channel(4);
    let (outbound_tx, _outbound_rx) = mpsc::channel(4);
    runtime
        .create_with(
            spec.clone(),
            Box::new(ScriptedDriver {
                namespace: "/dup".into(),
                inbound_rx: Some(inbound_rx),
                outbound_tx,
                starts: Arc::new(AtomicU32::new(0)),
                fail_first_starts: 0,
            }),
        )
        .await
        .unwrap();

    // Same spec again: no-op.
    assert!(runtime.create(spec.clone()).await.is_ok());
    // Same id, different namespace: refused.
    let conflicting = BridgeSpec {
        target_addr: "/other".into(),
        ..spec
    };
    assert!(runtime.create(conflicting).await.is_err());
    assert_eq!(runtime.list().len(), 1);
}

#[tokio::test]
async fn delete_stops_and_unregisters() {
    let rig = rig("b6", "/gone", 0).await;
    wait_for_state(&rig.runtime, "b6", BridgeState::Running).await;
    assert!(rig.runtime.delete("b6").await);
    assert!(rig.runtime.state_of("b6").is_none());
    assert!(!rig.runtime.delete("b6").await);
    // Pseudo-session is gone from the router.
    assert_eq!(rig.dispatcher.sessions.len(), 0);
}
