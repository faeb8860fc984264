//! Supervised bridge runtime
//!
//! Each bridge runs its driver in its own task under a supervisor that
//! restarts on transient faults with exponential backoff (250 ms
//! doubling, capped at 30 s) and parks the bridge in `Error` on fatal
//! ones. A bridge attaches to the router as a pseudo-session: it
//! subscribes to its namespace and injects inbound traffic through the
//! ordinary dispatch path, so one bridge's death never touches the
//! router or its peers.

use crate::driver::{BridgeDriver, BridgeState, DriverEvent};
use crate::error::{BridgeError, Result};
use clasp_core::{codec, Message, ParamSnapshot, Set, Subscribe};
use clasp_router::{Dispatcher, Session};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

const BACKOFF_FLOOR: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Consecutive failed starts before a "transient" fault is declared
/// fatal (a bind that never succeeds, an unplugged device that never
/// returns).
const MAX_CONSECUTIVE_FAILURES: u32 = 8;

/// Control-surface contract for creating a bridge. `target_addr` is the
/// namespace prefix inside the router's address space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeSpec {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub source_addr: String,
    pub target_addr: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// State transitions surfaced to the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeEvent {
    pub bridge_id: String,
    pub state: BridgeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeInfo {
    pub id: String,
    pub kind: String,
    pub namespace: String,
    pub state: BridgeState,
}

struct BridgeHandle {
    spec: BridgeSpec,
    state: Arc<RwLock<BridgeState>>,
    session: Arc<Session>,
    stop: watch::Sender<bool>,
}

pub struct BridgeRuntime {
    dispatcher: Arc<Dispatcher>,
    bridges: DashMap<String, BridgeHandle>,
    events: broadcast::Sender<BridgeEvent>,
}

impl BridgeRuntime {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        let (events, _) = broadcast::channel(128);
        Arc::new(Self {
            dispatcher,
            bridges: DashMap::new(),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Create and supervise a bridge using the built-in driver set.
    /// Idempotent on id: an identical spec is a no-op, a conflicting
    /// one is refused.
    pub async fn create(self: &Arc<Self>, spec: BridgeSpec) -> Result<()> {
        if let Some(existing) = self.bridges.get(&spec.id) {
            if existing.spec == spec {
                return Ok(());
            }
            return Err(BridgeError::Config(format!(
                "bridge id {} exists with a different config",
                spec.id
            )));
        }
        let driver = crate::build_driver(&spec)?;
        self.create_with(spec, driver).await
    }

    /// Supervise a caller-supplied driver (custom protocols, tests).
    pub async fn create_with(
        self: &Arc<Self>,
        spec: BridgeSpec,
        driver: Box<dyn BridgeDriver>,
    ) -> Result<()> {
        if let Some(existing) = self.bridges.get(&spec.id) {
            if existing.spec == spec {
                return Ok(());
            }
            return Err(BridgeError::Config(format!(
                "bridge id {} exists with a different config",
                spec.id
            )));
        }
        let state = Arc::new(RwLock::new(BridgeState::Starting));
        let (stop, stop_rx) = watch::channel(false);

        let (sender, deliveries) = clasp_transport::LoopbackSender::channel(256);
        let session = self
            .dispatcher
            .attach_pseudo_session(&format!("bridge:{}", spec.id), Arc::new(sender));
        // The bridge listens on its own namespace.
        self.dispatcher
            .inject(
                &session,
                Message::Subscribe(Subscribe {
                    id: 1,
                    pattern: format!("{}/**", spec.target_addr.trim_end_matches('/')),
                    types: vec![],
                    options: None,
                }),
            )
            .await;

        info!(bridge = %spec.id, kind = %spec.kind, "bridge created");
        self.bridges.insert(
            spec.id.clone(),
            BridgeHandle {
                spec: spec.clone(),
                state: state.clone(),
                session: session.clone(),
                stop,
            },
        );

        let runtime = self.clone();
        tokio::spawn(supervise(
            runtime, spec, driver, state, session, deliveries, stop_rx,
        ));
        Ok(())
    }

    /// Stop and remove a bridge. Returns false if the id is unknown.
    pub async fn delete(&self, id: &str) -> bool {
        match self.bridges.remove(id) {
            Some((_, handle)) => {
                let _ = handle.stop.send(true);
                self.dispatcher.close_session(&handle.session).await;
                info!(bridge = %id, "bridge deleted");
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<BridgeInfo> {
        self.bridges
            .iter()
            .map(|e| BridgeInfo {
                id: e.spec.id.clone(),
                kind: e.spec.kind.clone(),
                namespace: e.spec.target_addr.clone(),
                state: *e.state.read(),
            })
            .collect()
    }

    pub fn state_of(&self, id: &str) -> Option<BridgeState> {
        self.bridges.get(id).map(|e| *e.state.read())
    }

    /// Which bridge, if any, owns this pseudo-session. The control
    /// surface uses it to label the signal monitor feed.
    pub fn bridge_for_session(&self, session_id: &str) -> Option<String> {
        self.bridges
            .iter()
            .find(|e| e.session.id == session_id)
            .map(|e| e.spec.id.clone())
    }

    /// Push a signal into the router as if the named bridge produced it.
    pub async fn send_signal(&self, id: &str, address: &str, value: clasp_core::Value) -> bool {
        let Some(handle) = self.bridges.get(id).map(|e| e.session.clone()) else {
            return false;
        };
        self.dispatcher
            .inject(
                &handle,
                Message::Set(Set {
                    address: address.to_string(),
                    value,
                    revision: None,
                    lock: false,
                    unlock: false,
                }),
            )
            .await;
        true
    }

    fn transition(&self, id: &str, state_slot: &RwLock<BridgeState>, to: BridgeState, detail: Option<String>) {
        *state_slot.write() = to;
        let _ = self.events.send(BridgeEvent {
            bridge_id: id.to_string(),
            state: to,
            detail,
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    runtime: Arc<BridgeRuntime>,
    spec: BridgeSpec,
    mut driver: Box<dyn BridgeDriver>,
    state: Arc<RwLock<BridgeState>>,
    session: Arc<Session>,
    mut deliveries: tokio::sync::mpsc::Receiver<bytes::Bytes>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let id = spec.id.clone();
    let mut backoff = BACKOFF_FLOOR;
    let mut failures: u32 = 0;

    'supervisor: loop {
        runtime.transition(&id, &state, BridgeState::Starting, None);
        match driver.start().await {
            Ok(mut inbound) => {
                runtime.transition(&id, &state, BridgeState::Running, None);
                backoff = BACKOFF_FLOOR;
                failures = 0;

                loop {
                    tokio::select! {
                        event = inbound.recv() => match event {
                            Some(DriverEvent::Inbound(message)) => {
                                runtime.dispatcher.inject(&session, message).await;
                            }
                            Some(DriverEvent::Fault { fatal: true, detail }) => {
                                warn!(bridge = %id, "fatal driver fault: {detail}");
                                driver.stop().await;
                                runtime.transition(&id, &state, BridgeState::Error, Some(detail));
                                break 'supervisor;
                            }
                            Some(DriverEvent::Fault { fatal: false, detail }) => {
                                debug!(bridge = %id, "transient driver fault: {detail}");
                                runtime.transition(&id, &state, BridgeState::Degraded, Some(detail));
                                break;
                            }
                            None => {
                                runtime.transition(
                                    &id,
                                    &state,
                                    BridgeState::Degraded,
                                    Some("driver event stream ended".into()),
                                );
                                break;
                            }
                        },
                        frame = deliveries.recv() => match frame {
                            Some(bytes) => {
                                forward_delivery(&mut driver, &bytes).await;
                            }
                            None => {
                                driver.stop().await;
                                runtime.transition(&id, &state, BridgeState::Stopped, None);
                                break 'supervisor;
                            }
                        },
                        changed = stop_rx.changed() => {
                            if changed.is_err() || *stop_rx.borrow() {
                                driver.stop().await;
                                runtime.transition(&id, &state, BridgeState::Stopped, None);
                                break 'supervisor;
                            }
                        }
                    }
                }
                driver.stop().await;
            }
            Err(e) if e.is_fatal() => {
                runtime.transition(&id, &state, BridgeState::Error, Some(e.to_string()));
                break 'supervisor;
            }
            Err(e) => {
                failures += 1;
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    runtime.transition(
                        &id,
                        &state,
                        BridgeState::Error,
                        Some(format!("retries exhausted: {e}")),
                    );
                    break 'supervisor;
                }
                runtime.transition(&id, &state, BridgeState::Degraded, Some(e.to_string()));
            }
        }

        // Back off before the next start attempt, still listening for
        // a delete.
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    runtime.transition(&id, &state, BridgeState::Stopped, None);
                    break 'supervisor;
                }
            }
        }
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

/// Router → bridge: unwrap a delivered frame and hand it to the driver.
/// Snapshots (initial subscription state) replay as individual SETs so
/// the foreign side starts from current state.
async fn forward_delivery(driver: &mut Box<dyn BridgeDriver>, bytes: &[u8]) {
    let message = match codec::decode(bytes) {
        Ok((message, _)) => message,
        Err(e) => {
            debug!("undecodable delivery for bridge: {e}");
            return;
        }
    };
    match message {
        Message::Snapshot(snapshot) => {
            for ParamSnapshot { address, value, revision, .. } in snapshot.params {
                let set = Message::Set(Set {
                    address,
                    value,
                    revision: Some(revision),
                    lock: false,
                    unlock: false,
                });
                if let Err(e) = driver.outbound(&set).await {
                    debug!("bridge outbound failed: {e}");
                }
            }
        }
        message @ (Message::Set(_) | Message::Publish(_) | Message::Bundle(_)) => {
            if let Err(e) = driver.outbound(&message).await {
                debug!("bridge outbound failed: {e}");
            }
        }
        _ => {}
    }
}
