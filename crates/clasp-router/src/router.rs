//! Router front door: accept loops, handshake, per-session read loops
//!
//! Each transport accept and each session read loop is its own task.
//! The read loop serializes dispatch for its session, drives the idle
//! PING probe, and observes the shutdown signal at every suspension
//! point.

use crate::dispatch::{Dispatcher, RouterEvent};
use crate::error::Result;
use crate::session::Session;
use clasp_core::codec::{self, Encoding};
use clasp_core::grant::{Grant, TokenBook};
use clasp_core::time::now_micros;
use clasp_core::{
    Error as CoreError, ErrorCode, ErrorInfo, Frame, Hello, Message, Welcome, PROTOCOL_VERSION,
};
use clasp_transport::{TransportEvent, TransportReceiver, TransportSender, TransportServer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Name announced in WELCOME and over discovery.
    pub name: String,
    pub features: Vec<String>,
    /// Refuse HELLOs that carry no token.
    pub require_token: bool,
    pub max_sessions: usize,
    pub handshake_timeout: Duration,
    /// Idle time before the router probes with PING.
    pub idle_ping: Duration,
    /// Grace after the probe before the session is closed.
    pub pong_grace: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            name: "CLASP Router".to_string(),
            features: vec![
                "param".into(),
                "event".into(),
                "stream".into(),
                "gesture".into(),
                "timeline".into(),
            ],
            require_token: false,
            max_sessions: 512,
            handshake_timeout: Duration::from_secs(5),
            idle_ping: Duration::from_secs(30),
            pong_grace: Duration::from_secs(10),
        }
    }
}

pub struct Router {
    pub config: RouterConfig,
    pub dispatcher: Arc<Dispatcher>,
    tokens: Arc<TokenBook>,
    shutdown: watch::Sender<bool>,
}

impl Router {
    pub fn new(config: RouterConfig, tokens: TokenBook) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            dispatcher: Dispatcher::new(),
            tokens: Arc::new(tokens),
            shutdown,
        }
    }

    /// Spawn the background timer task. Call once before serving.
    pub fn start(&self) {
        let dispatcher = self.dispatcher.clone();
        let rx = self.shutdown.subscribe();
        tokio::spawn(dispatcher.run_timers(rx));
    }

    /// Broadcast shutdown; every task exits at its next suspension point.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<RouterEvent> {
        self.dispatcher.subscribe_events()
    }

    /// Accept connections from one transport listener until shutdown.
    pub async fn serve<S>(&self, mut server: S) -> Result<()>
    where
        S: TransportServer,
        S::Sender: 'static,
        S::Receiver: 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = server.accept() => {
                    match accepted {
                        Ok((sender, receiver, peer)) => {
                            debug!(%peer, "transport accepted");
                            self.attach(Arc::new(sender), receiver);
                        }
                        Err(e) => {
                            warn!("accept failed: {e}");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = server.close().await;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Run the session lifecycle for one accepted connection.
    pub fn attach<R>(&self, sender: Arc<dyn TransportSender>, receiver: R)
    where
        R: TransportReceiver + 'static,
    {
        let dispatcher = self.dispatcher.clone();
        let tokens = self.tokens.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(session_task(
            dispatcher, tokens, config, sender, receiver, shutdown,
        ));
    }
}

async fn session_task<R>(
    dispatcher: Arc<Dispatcher>,
    tokens: Arc<TokenBook>,
    config: RouterConfig,
    sender: Arc<dyn TransportSender>,
    mut receiver: R,
    mut shutdown: watch::Receiver<bool>,
) where
    R: TransportReceiver,
{
    let hello = match timeout(config.handshake_timeout, wait_for_hello(&mut receiver)).await {
        Ok(Ok(got)) => got,
        Ok(Err(fault)) => {
            refuse(&sender, fault.0, &fault.1).await;
            return;
        }
        Err(_elapsed) => {
            refuse(&sender, ErrorCode::BadMessage, "handshake timed out").await;
            return;
        }
    };
    let (hello, encoding) = hello;

    if hello.version != PROTOCOL_VERSION {
        refuse(
            &sender,
            ErrorCode::BadVersion,
            &format!("unsupported version {}", hello.version),
        )
        .await;
        return;
    }
    if dispatcher.sessions.len() >= config.max_sessions {
        refuse(&sender, ErrorCode::BackpressureExhausted, "session limit").await;
        return;
    }

    let grant = match &hello.token {
        Some(token) => match tokens.resolve(token) {
            Ok(grant) => grant,
            Err(e) => {
                refuse(&sender, ErrorCode::TokenRejected, &e.to_string()).await;
                return;
            }
        },
        None if config.require_token => {
            refuse(&sender, ErrorCode::TokenRejected, "token required").await;
            return;
        }
        None => Grant::open(),
    };

    // Mirror the peer's encoding unless it advertises binary support.
    let outbound = if hello.features.iter().any(|f| f == "binary") {
        Encoding::Binary
    } else {
        encoding
    };
    let session = Arc::new(Session::new(
        sender,
        hello.name.clone(),
        hello.features.clone(),
        grant,
        outbound,
    ));
    dispatcher.sessions.insert(session.clone());
    info!(session = %session.id, name = %session.name, "session established");

    let welcome = Message::Welcome(Welcome {
        version: PROTOCOL_VERSION,
        session: session.id.clone(),
        name: config.name.clone(),
        features: config.features.clone(),
        time: now_micros(),
    });
    if session.send(&welcome).await.is_err() {
        dispatcher.close_session(&session).await;
        return;
    }

    let mut probe = tokio::time::interval(Duration::from_secs(1));
    let mut pinged = false;
    loop {
        tokio::select! {
            event = receiver.recv() => {
                match event {
                    Some(TransportEvent::Data(data)) => {
                        pinged = false;
                        match codec::decode(&data) {
                            Ok((message, frame)) => {
                                dispatcher.dispatch(&session, message, &frame).await;
                            }
                            Err(e) => {
                                // Codec faults terminate the session.
                                let code = decode_fault_code(&e);
                                dispatcher
                                    .send_error(&session, code, &e.to_string(), None, None)
                                    .await;
                                break;
                            }
                        }
                    }
                    Some(TransportEvent::Disconnected { reason }) => {
                        debug!(session = %session.id, ?reason, "peer disconnected");
                        break;
                    }
                    Some(TransportEvent::Error(e)) => {
                        warn!(session = %session.id, "transport error: {e}");
                        break;
                    }
                    Some(TransportEvent::Connected) => {}
                    None => break,
                }
            }
            _ = probe.tick() => {
                let idle = session.idle_for();
                if pinged {
                    if idle >= config.idle_ping + config.pong_grace {
                        warn!(session = %session.id, "no PONG, closing");
                        break;
                    }
                } else if idle >= config.idle_ping {
                    let _ = session.send(&Message::Ping).await;
                    pinged = true;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    session.close().await;
    dispatcher.close_session(&session).await;
}

/// First frame must decode to HELLO; anything else is a protocol fault.
async fn wait_for_hello<R>(receiver: &mut R) -> std::result::Result<(Hello, Encoding), (ErrorCode, String)>
where
    R: TransportReceiver,
{
    loop {
        match receiver.recv().await {
            Some(TransportEvent::Data(data)) => {
                return match codec::decode(&data) {
                    Ok((Message::Hello(hello), frame)) => {
                        Ok((hello, Encoding::from_version_bits(frame.flags.version)))
                    }
                    Ok((other, _)) => Err((
                        ErrorCode::BadMessage,
                        format!("expected HELLO, got {:?}", other.message_type()),
                    )),
                    Err(e) => Err((decode_fault_code(&e), e.to_string())),
                };
            }
            Some(TransportEvent::Connected) => continue,
            Some(TransportEvent::Disconnected { .. }) | None => {
                return Err((ErrorCode::BadMessage, "closed before HELLO".into()))
            }
            Some(TransportEvent::Error(e)) => return Err((ErrorCode::BadFrame, e)),
        }
    }
}

fn decode_fault_code(err: &CoreError) -> ErrorCode {
    match err {
        CoreError::BadMagic(_) | CoreError::Truncated { .. } | CoreError::LengthOverflow(_) => {
            ErrorCode::BadFrame
        }
        _ => ErrorCode::BadMessage,
    }
}

/// Report a handshake failure and drop the transport.
async fn refuse(sender: &Arc<dyn TransportSender>, code: ErrorCode, text: &str) {
    let err = Message::ErrorMsg(ErrorInfo {
        code: code.as_u16(),
        message: text.to_string(),
        address: None,
        correlation_id: None,
    });
    if let Ok(bytes) = codec::encode(&err) {
        let _ = sender.send(bytes).await;
    }
    let _ = sender.close().await;
}

// Re-exported for pseudo-session construction by the bridge runtime.
impl Dispatcher {
    /// Register an in-process peer (a bridge) as a session. It routes
    /// exactly like a network client.
    pub fn attach_pseudo_session(
        self: &Arc<Self>,
        name: &str,
        sender: Arc<dyn TransportSender>,
    ) -> Arc<Session> {
        let session = Arc::new(Session::bridge(sender, name.to_string()));
        self.sessions.insert(session.clone());
        session
    }

    /// Feed one message from an in-process peer through the normal
    /// dispatch path.
    pub async fn inject(&self, session: &Arc<Session>, message: Message) {
        let frame = Frame::new(bytes::Bytes::new()).with_qos(message.default_qos());
        self.dispatch(session, message, &frame).await;
    }
}
