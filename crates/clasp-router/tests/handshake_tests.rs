//! Handshake lifecycle through Router::attach with loopback transports.

use bytes::Bytes;
use clasp_core::codec;
use clasp_core::grant::{Grant, TokenBook};
use clasp_core::{Hello, Message, PROTOCOL_VERSION};
use clasp_router::{Router, RouterConfig};
use clasp_transport::{LoopbackReceiver, LoopbackSender, TransportEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

struct Peer {
    events: mpsc::Sender<TransportEvent>,
    frames: mpsc::Receiver<Bytes>,
}

impl Peer {
    async fn push(&self, message: &Message) {
        let wire = codec::encode(message).unwrap();
        self.events
            .send(TransportEvent::Data(wire))
            .await
            .unwrap();
    }

    async fn next(&mut self) -> Message {
        let bytes = timeout(Duration::from_secs(2), self.frames.recv())
            .await
            .expect("timed out")
            .expect("closed");
        codec::decode(&bytes).unwrap().0
    }
}

fn attach(router: &Router) -> Peer {
    let (sender, frames) = LoopbackSender::channel(64);
    let (events, receiver) = LoopbackReceiver::channel(64);
    router.attach(Arc::new(sender), receiver);
    Peer { events, frames }
}

fn hello(version: u8, token: Option<&str>) -> Message {
    Message::Hello(Hello {
        version,
        name: "client".into(),
        features: vec!["binary".into()],
        token: token.map(str::to_string),
    })
}

#[tokio::test]
async fn hello_yields_welcome_with_session_and_time() {
    let router = Router::new(RouterConfig::default(), TokenBook::new());
    let mut peer = attach(&router);
    peer.push(&hello(PROTOCOL_VERSION, None)).await;
    match peer.next().await {
        Message::Welcome(welcome) => {
            assert_eq!(welcome.version, PROTOCOL_VERSION);
            assert!(!welcome.session.is_empty());
            assert!(welcome.time > 0);
        }
        other => panic!("expected WELCOME, got {other:?}"),
    }
    assert_eq!(router.dispatcher.sessions.len(), 1);
}

#[tokio::test]
async fn wrong_version_refused_with_1xx() {
    let router = Router::new(RouterConfig::default(), TokenBook::new());
    let mut peer = attach(&router);
    peer.push(&hello(1, None)).await;
    match peer.next().await {
        Message::ErrorMsg(err) => assert_eq!(err.code, 102),
        other => panic!("expected ERROR 102, got {other:?}"),
    }
    assert_eq!(router.dispatcher.sessions.len(), 0);
}

#[tokio::test]
async fn first_message_must_be_hello() {
    let router = Router::new(RouterConfig::default(), TokenBook::new());
    let mut peer = attach(&router);
    peer.push(&Message::Ping).await;
    match peer.next().await {
        Message::ErrorMsg(err) => assert_eq!(err.code / 100, 1),
        other => panic!("expected 1xx ERROR, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_token_refused_with_300() {
    let config = RouterConfig {
        require_token: true,
        ..Default::default()
    };
    let router = Router::new(config, TokenBook::new());
    let mut peer = attach(&router);
    peer.push(&hello(PROTOCOL_VERSION, Some("bogus"))).await;
    match peer.next().await {
        Message::ErrorMsg(err) => assert_eq!(err.code, 300),
        other => panic!("expected ERROR 300, got {other:?}"),
    }
}

#[tokio::test]
async fn registry_token_scopes_the_session() {
    let mut tokens = TokenBook::new();
    tokens.insert("deck-token", Grant::parse("admin:/deck/**").unwrap());
    let config = RouterConfig {
        require_token: true,
        ..Default::default()
    };
    let router = Router::new(config, tokens);

    let mut peer = attach(&router);
    peer.push(&hello(PROTOCOL_VERSION, Some("deck-token"))).await;
    assert!(matches!(peer.next().await, Message::Welcome(_)));

    // In scope: accepted and ACKed.
    peer.push(&Message::Set(clasp_core::Set {
        address: "/deck/fader".into(),
        value: clasp_core::Value::Float(0.5),
        revision: None,
        lock: false,
        unlock: false,
    }))
    .await;
    // SET rides at its default Confirm QoS through codec::encode.
    match peer.next().await {
        Message::Ack(ack) => assert_eq!(ack.address.as_deref(), Some("/deck/fader")),
        other => panic!("expected ACK, got {other:?}"),
    }

    // Out of scope: 301.
    peer.push(&Message::Set(clasp_core::Set {
        address: "/house/lights".into(),
        value: clasp_core::Value::Float(0.5),
        revision: None,
        lock: false,
        unlock: false,
    }))
    .await;
    match peer.next().await {
        Message::ErrorMsg(err) => assert_eq!(err.code, 301),
        other => panic!("expected ERROR 301, got {other:?}"),
    }
}

#[tokio::test]
async fn decode_fault_closes_session() {
    let router = Router::new(RouterConfig::default(), TokenBook::new());
    let mut peer = attach(&router);
    peer.push(&hello(PROTOCOL_VERSION, None)).await;
    assert!(matches!(peer.next().await, Message::Welcome(_)));

    // Garbage after the handshake: ERROR 1xx, then teardown.
    peer.events
        .send(TransportEvent::Data(Bytes::from_static(&[0xFF, 0x00])))
        .await
        .unwrap();
    match peer.next().await {
        Message::ErrorMsg(err) => assert_eq!(err.code / 100, 1),
        other => panic!("expected 1xx ERROR, got {other:?}"),
    }
    // Session is removed shortly after.
    for _ in 0..50 {
        if router.dispatcher.sessions.len() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(router.dispatcher.sessions.len(), 0);
}
