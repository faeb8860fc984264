//! The dispatcher: inbound message handling and fan-out
//!
//! Owns the process-wide singletons (store, subscription table, session
//! table, gesture registry, stats) and routes every decoded message.
//! Ordering contract: messages from one session arrive here serialized
//! by that session's read loop; store writes serialize per address; the
//! `fanout_gate` lets a bundle exclude every other fan-out while it
//! commits, which is what makes bundles atomic to observers.

use crate::bundle::{PendingBundle, TimerWheel, SCHEDULE_TOLERANCE_US};
use crate::gesture::{GestureError, GestureRegistry};
use crate::session::{Session, SessionId, SessionTable};
use crate::stats::RouterStats;
use crate::store::{ParamStore, WriteError};
use crate::subscription::{Subscription, SubscriptionTable};
use clasp_core::address::{Address, Pattern};
use clasp_core::grant::Refusal;
use clasp_core::time::now_micros;
use clasp_core::{
    Ack, ErrorCode, ErrorInfo, Frame, GesturePhase, Message, Publish, QoS, Set, SignalKind,
    Snapshot, Value,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, trace, warn};

/// Idle gestures are cancelled after this long without a phase.
const GESTURE_TIMEOUT_US: u64 = 60_000_000;

/// Internal event feed consumed by bridges and the control surface.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    SessionOpened {
        session: SessionId,
        name: String,
    },
    SessionClosed {
        session: SessionId,
        name: String,
    },
    Signal {
        session: SessionId,
        address: String,
        kind: SignalKind,
        value: Option<Value>,
    },
}

pub struct Dispatcher {
    pub store: ParamStore,
    pub subscriptions: SubscriptionTable,
    pub sessions: SessionTable,
    pub gestures: GestureRegistry,
    pub stats: RouterStats,
    wheel: TimerWheel<PendingBundle>,
    /// Bundles take this exclusively; single-message fan-outs share it.
    fanout_gate: RwLock<()>,
    events: broadcast::Sender<RouterEvent>,
}

impl Dispatcher {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            store: ParamStore::new(),
            subscriptions: SubscriptionTable::new(),
            sessions: SessionTable::new(),
            gestures: GestureRegistry::new(),
            stats: RouterStats::new(),
            wheel: TimerWheel::for_bundles(now_micros()),
            fanout_gate: RwLock::new(()),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RouterEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RouterEvent) {
        let _ = self.events.send(event);
    }

    /// Entry point for one decoded inbound frame.
    pub async fn dispatch(&self, session: &Arc<Session>, message: Message, frame: &Frame) {
        session.touch_rx();
        self.stats.frame_in();
        let confirmed = matches!(frame.flags.qos, QoS::Confirm | QoS::Commit);
        let correlation = confirmed.then(|| session.next_inbound_correlation());

        match message {
            Message::Set(set) => self.on_set(session, set, confirmed).await,
            Message::Get(get) => self.on_get(session, &get.address).await,
            Message::Publish(publish) => self.on_publish(session, publish, correlation).await,
            Message::Subscribe(sub) => self.on_subscribe(session, sub).await,
            Message::Unsubscribe(unsub) => {
                self.subscriptions.unsubscribe(&session.id, unsub.id);
                session.remove_subscription(unsub.id);
            }
            Message::Bundle(bundle) => {
                self.on_bundle(session, bundle.timestamp, bundle.messages, correlation)
                    .await
            }
            Message::Sync(sync) => {
                let t2 = now_micros();
                session.observe_sync(sync.t1, t2);
                let reply = Message::Sync(clasp_core::Sync {
                    t1: sync.t1,
                    t2: Some(t2),
                    t3: Some(now_micros()),
                });
                self.reply(session, &reply).await;
            }
            Message::Ping => self.reply(session, &Message::Pong).await,
            Message::Pong => {}
            Message::Ack(ack) => session.on_ack(ack.correlation_id),
            Message::Query(query) => self.on_query(session, &query.pattern).await,
            Message::ErrorMsg(err) => {
                warn!(session = %session.id, code = err.code, "client error: {}", err.message);
            }
            Message::Hello(_) => {
                self.send_error(
                    session,
                    ErrorCode::BadMessage,
                    "session already established",
                    None,
                    None,
                )
                .await;
            }
            Message::Announce(announce) => {
                debug!(session = %session.id, namespace = %announce.namespace, "announce");
            }
            // Router-originated shapes arriving inbound carry no meaning.
            Message::Welcome(_) | Message::Snapshot(_) | Message::QueryResult(_) => {
                trace!(session = %session.id, "ignoring router-only message from peer");
            }
        }
    }

    // -- SET ---------------------------------------------------------------

    async fn on_set(&self, session: &Arc<Session>, set: Set, confirmed: bool) {
        if Address::parse(&set.address).is_err() {
            self.send_error(
                session,
                ErrorCode::BadAddress,
                "address must be concrete",
                Some(set.address),
                None,
            )
            .await;
            return;
        }
        if let Err(refusal) = session.grant.check_write(&set.address, &set.value) {
            self.refuse_write(session, &set.address, refusal).await;
            return;
        }
        if let Some(rate) = session.grant.write_rate_limit(&set.address) {
            if !session.admit_write(&set.address, rate, now_micros()) {
                self.send_error(
                    session,
                    ErrorCode::ValueRejected,
                    &format!("write rate above {rate} Hz"),
                    Some(set.address),
                    None,
                )
                .await;
                return;
            }
        }

        let applied = {
            let _shared = self.fanout_gate.read().await;
            match self.store.set(
                &set.address,
                set.value.clone(),
                &session.id,
                set.revision,
                set.lock,
                set.unlock,
            ) {
                Ok(applied) => applied,
                Err(err) => {
                    self.send_write_error(session, &set.address, err).await;
                    return;
                }
            }
        };
        self.stats.set_applied();

        // ACK reaches the writer before the fan-out is complete.
        if confirmed {
            let ack = Message::Ack(Ack {
                address: Some(set.address.clone()),
                revision: Some(applied.revision),
                locked: set.lock.then_some(applied.locked),
                holder: None,
                correlation_id: None,
            });
            self.reply(session, &ack).await;
        }

        {
            let _shared = self.fanout_gate.read().await;
            self.fanout_param(&session.id, &set.address, &set.value, applied.revision)
                .await;
        }

        self.emit(RouterEvent::Signal {
            session: session.id.clone(),
            address: set.address,
            kind: SignalKind::Param,
            value: Some(set.value),
        });
    }

    /// Deliver one Param update to every admitted subscriber. Caller
    /// holds the fan-out gate. Subscribed writers see their own updates,
    /// except bridge pseudo-sessions, which would loop them straight
    /// back out the foreign side.
    async fn fanout_param(&self, origin: &SessionId, address: &str, value: &Value, revision: u64) {
        let now = now_micros();
        let update = Message::Set(Set {
            address: address.to_string(),
            value: value.clone(),
            revision: Some(revision),
            lock: false,
            unlock: false,
        });
        for sub in self.subscriptions.fanout(address, SignalKind::Param) {
            if !sub.admit(address, SignalKind::Param, Some(value), now) {
                self.stats.delivery_dropped();
                continue;
            }
            if let Some(target) = self.sessions.get(&sub.session) {
                if target.is_bridge && &sub.session == origin {
                    continue;
                }
                if target.try_send(&update) {
                    self.stats.frame_out();
                } else {
                    self.stats.delivery_dropped();
                }
            }
        }
    }

    // -- GET ---------------------------------------------------------------

    async fn on_get(&self, session: &Arc<Session>, address: &str) {
        match self.store.get(address) {
            Some(entry) => {
                let snapshot = Message::Snapshot(Snapshot {
                    params: vec![clasp_core::ParamSnapshot {
                        address: address.to_string(),
                        value: entry.value,
                        revision: entry.revision,
                        writer: Some(entry.writer),
                        timestamp: Some(entry.timestamp),
                    }],
                });
                self.reply(session, &snapshot).await;
            }
            None => {
                self.send_error(
                    session,
                    ErrorCode::AddressNotFound,
                    "no retained value",
                    Some(address.to_string()),
                    None,
                )
                .await;
            }
        }
    }

    // -- PUBLISH -----------------------------------------------------------

    async fn on_publish(&self, session: &Arc<Session>, publish: Publish, correlation: Option<u32>) {
        if Address::parse(&publish.address).is_err() {
            self.send_error(
                session,
                ErrorCode::BadAddress,
                "address must be concrete",
                Some(publish.address),
                None,
            )
            .await;
            return;
        }
        let effective = publish.value.as_ref().or(publish.payload.as_ref());
        if let Err(refusal) = session
            .grant
            .check_write(&publish.address, effective.unwrap_or(&Value::Null))
        {
            self.refuse_write(session, &publish.address, refusal).await;
            return;
        }

        let kind = publish.kind();
        if kind == SignalKind::Gesture {
            match publish.phase {
                None => {
                    self.send_error(
                        session,
                        ErrorCode::BadMessage,
                        "gesture publish without phase",
                        Some(publish.address),
                        None,
                    )
                    .await;
                    return;
                }
                Some(GesturePhase::Start) => {
                    self.gestures
                        .start(&session.id, publish.id.unwrap_or(0), &publish.address);
                }
                Some(GesturePhase::Move) => {
                    if let Err(GestureError::Unknown { id }) =
                        self.gestures.touch(&session.id, publish.id.unwrap_or(0))
                    {
                        self.unknown_gesture(session, &publish.address, id).await;
                        return;
                    }
                }
                Some(GesturePhase::End) | Some(GesturePhase::Cancel) => {
                    if let Err(GestureError::Unknown { id }) =
                        self.gestures.finish(&session.id, publish.id.unwrap_or(0))
                    {
                        self.unknown_gesture(session, &publish.address, id).await;
                        return;
                    }
                }
            }
        }

        {
            let _shared = self.fanout_gate.read().await;
            self.fanout_publish(&session.id, &publish, false).await;
        }
        self.stats.publish_routed();

        if let Some(correlation) = correlation {
            let ack = Message::Ack(Ack {
                correlation_id: Some(correlation),
                ..Default::default()
            });
            self.reply(session, &ack).await;
        }

        self.emit(RouterEvent::Signal {
            session: session.id.clone(),
            address: publish.address.clone(),
            kind,
            value: publish.value.clone().or(publish.payload.clone()),
        });
    }

    /// Deliver a non-retained signal to every admitted subscriber except
    /// its origin. Caller holds the fan-out gate. `lossy` forces
    /// droppable delivery for every kind; bundle execution uses it so no
    /// send can park while the exclusive gate is held.
    async fn fanout_publish(&self, origin: &SessionId, publish: &Publish, lossy: bool) {
        let kind = publish.kind();
        let now = now_micros();
        let effective = publish.value.as_ref().or(publish.payload.as_ref());
        let message = Message::Publish(publish.clone());
        for sub in self.subscriptions.fanout(&publish.address, kind) {
            if &sub.session == origin {
                continue;
            }
            if !sub.admit(&publish.address, kind, effective, now) {
                self.stats.delivery_dropped();
                continue;
            }
            let Some(target) = self.sessions.get(&sub.session) else {
                continue;
            };
            let tracked = matches!(kind, SignalKind::Event | SignalKind::Timeline) && !lossy;
            if tracked {
                // Events and timeline frames ride the tracked path.
                if target.send(&message).await.is_ok() {
                    self.stats.frame_out();
                } else {
                    self.stats.delivery_dropped();
                }
            } else if target.try_send(&message) {
                self.stats.frame_out();
            } else {
                self.stats.delivery_dropped();
            }
        }
    }

    async fn unknown_gesture(&self, session: &Arc<Session>, address: &str, id: u32) {
        self.send_error(
            session,
            ErrorCode::UnknownGesture,
            &format!("gesture {id} is not active"),
            Some(address.to_string()),
            None,
        )
        .await;
    }

    // -- SUBSCRIBE ---------------------------------------------------------

    async fn on_subscribe(&self, session: &Arc<Session>, sub: clasp_core::Subscribe) {
        let pattern = match Pattern::compile(&sub.pattern) {
            Ok(p) => p,
            Err(e) => {
                self.send_error(
                    session,
                    ErrorCode::BadPattern,
                    &e.to_string(),
                    Some(sub.pattern),
                    None,
                )
                .await;
                return;
            }
        };
        if !session.grant.read_set_intersects(&pattern) {
            self.send_error(
                session,
                ErrorCode::ScopeViolation,
                "pattern outside read scope",
                Some(sub.pattern),
                None,
            )
            .await;
            return;
        }

        // Register before snapshotting so a write racing this subscribe
        // lands in the snapshot, the fan-out, or both, never neither.
        self.subscriptions.subscribe(Subscription::new(
            session.id.clone(),
            sub.id,
            pattern.clone(),
            &sub.types,
            sub.options.unwrap_or_default(),
        ));
        session.add_subscription(sub.id);
        let snapshot = self.store.snapshot(&pattern);

        // Late joiners always get current state first, even when empty.
        if session
            .send_with_qos(&Message::Snapshot(snapshot), QoS::Confirm)
            .await
            .is_ok()
        {
            self.stats.frame_out();
        }
    }

    // -- BUNDLE ------------------------------------------------------------

    async fn on_bundle(
        &self,
        session: &Arc<Session>,
        timestamp: Option<u64>,
        messages: Vec<Message>,
        correlation: Option<u32>,
    ) {
        match timestamp {
            None => {
                self.execute_bundle(session, messages, correlation).await;
            }
            Some(ts) => {
                let now = now_micros();
                if ts + SCHEDULE_TOLERANCE_US < now {
                    self.send_error(
                        session,
                        ErrorCode::ScheduleOutOfTolerance,
                        "scheduled time too far in the past",
                        None,
                        correlation,
                    )
                    .await;
                    return;
                }
                if ts <= now {
                    self.execute_bundle(session, messages, correlation).await;
                } else {
                    self.wheel.insert(
                        ts,
                        PendingBundle {
                            session: session.id.clone(),
                            correlation,
                            messages,
                            fire_at: ts,
                        },
                    );
                }
            }
        }
    }

    /// Execute a bundle atomically: validate everything, apply
    /// everything, then one coalesced fan-out per touched address, all
    /// under the exclusive gate so no other fan-out interleaves.
    pub(crate) async fn execute_bundle(
        &self,
        session: &Arc<Session>,
        messages: Vec<Message>,
        correlation: Option<u32>,
    ) {
        let _exclusive = self.fanout_gate.write().await;

        // Validation pass: any failure aborts with no visible effect.
        for message in &messages {
            let verdict = match message {
                Message::Set(set) => self.preflight_set(session, set),
                Message::Publish(publish) => self.preflight_publish(session, publish),
                _ => Err((
                    ErrorCode::BadMessage,
                    "only SET and PUBLISH may appear in a bundle".to_string(),
                    None,
                )),
            };
            if let Err((code, text, address)) = verdict {
                self.send_error(session, code, &text, address, correlation)
                    .await;
                return;
            }
        }

        // Apply pass: collect the final value per touched address.
        let mut touched: Vec<String> = Vec::new();
        let mut final_state: std::collections::HashMap<String, (Value, u64)> =
            std::collections::HashMap::new();
        let mut publishes: Vec<Publish> = Vec::new();
        for message in messages {
            match message {
                Message::Set(set) => {
                    match self.store.set(
                        &set.address,
                        set.value.clone(),
                        &session.id,
                        set.revision,
                        set.lock,
                        set.unlock,
                    ) {
                        Ok(applied) => {
                            if !final_state.contains_key(&set.address) {
                                touched.push(set.address.clone());
                            }
                            final_state.insert(set.address, (set.value, applied.revision));
                            self.stats.set_applied();
                        }
                        Err(err) => {
                            // Preflight ran under the exclusive gate, so
                            // this cannot happen; treat it as internal.
                            warn!("bundle apply failed after preflight: {err:?}");
                            self.send_error(
                                session,
                                ErrorCode::Internal,
                                "bundle apply failed",
                                Some(set.address),
                                correlation,
                            )
                            .await;
                            return;
                        }
                    }
                }
                Message::Publish(publish) => publishes.push(publish),
                _ => unreachable!("rejected during validation"),
            }
        }

        // One fan-out per address, carrying the last value.
        for address in &touched {
            let (value, revision) = &final_state[address];
            self.fanout_param(&session.id, address, value, *revision).await;
        }
        for publish in &publishes {
            self.fanout_publish(&session.id, publish, true).await;
        }

        self.stats.bundle_fired();
        let ack = Message::Ack(Ack {
            correlation_id: correlation,
            ..Default::default()
        });
        self.reply(session, &ack).await;
    }

    fn preflight_set(
        &self,
        session: &Arc<Session>,
        set: &Set,
    ) -> std::result::Result<(), (ErrorCode, String, Option<String>)> {
        if Address::parse(&set.address).is_err() {
            return Err((
                ErrorCode::BadAddress,
                "address must be concrete".into(),
                Some(set.address.clone()),
            ));
        }
        match session.grant.check_write(&set.address, &set.value) {
            Err(Refusal::Scope) => {
                return Err((
                    ErrorCode::ScopeViolation,
                    "scope".into(),
                    Some(set.address.clone()),
                ))
            }
            Err(Refusal::Range { min, max }) => {
                return Err((
                    ErrorCode::ValueRejected,
                    format!("value outside [{min}, {max}]"),
                    Some(set.address.clone()),
                ))
            }
            Ok(()) => {}
        }
        match self.store.check_writable(&set.address, &session.id, set.revision) {
            Ok(()) => Ok(()),
            Err(WriteError::RevisionConflict { expected, actual }) => Err((
                ErrorCode::RevisionMismatch,
                format!("expected revision {expected}, at {actual}"),
                Some(set.address.clone()),
            )),
            Err(WriteError::LockHeld { holder }) => Err((
                ErrorCode::LockConflict,
                format!("lock held by {holder}"),
                Some(set.address.clone()),
            )),
        }
    }

    fn preflight_publish(
        &self,
        session: &Arc<Session>,
        publish: &Publish,
    ) -> std::result::Result<(), (ErrorCode, String, Option<String>)> {
        if Address::parse(&publish.address).is_err() {
            return Err((
                ErrorCode::BadAddress,
                "address must be concrete".into(),
                Some(publish.address.clone()),
            ));
        }
        if !session.grant.allows_write(&publish.address) {
            return Err((
                ErrorCode::ScopeViolation,
                "scope".into(),
                Some(publish.address.clone()),
            ));
        }
        Ok(())
    }

    // -- QUERY -------------------------------------------------------------

    async fn on_query(&self, session: &Arc<Session>, pattern: &str) {
        match Pattern::compile(pattern) {
            Ok(p) => {
                let result = Message::QueryResult(clasp_core::QueryResult {
                    signals: self.store.query(&p),
                });
                self.reply(session, &result).await;
            }
            Err(e) => {
                self.send_error(
                    session,
                    ErrorCode::BadPattern,
                    &e.to_string(),
                    Some(pattern.to_string()),
                    None,
                )
                .await;
            }
        }
    }

    // -- teardown ----------------------------------------------------------

    /// Cascade a session's removal: subscriptions, locks and gestures go
    /// with it; retained Param state stays.
    pub async fn close_session(&self, session: &Arc<Session>) {
        self.sessions.remove(&session.id);
        self.subscriptions.remove_session(&session.id);
        self.store.release_locks(&session.id);

        let cancelled = self.gestures.cancel_session(&session.id);
        for (id, address) in cancelled {
            let cancel = Publish {
                address,
                signal: Some(SignalKind::Gesture),
                value: None,
                payload: None,
                samples: None,
                rate: None,
                id: Some(id),
                phase: Some(GesturePhase::Cancel),
                timestamp: Some(now_micros()),
            };
            let _shared = self.fanout_gate.read().await;
            self.fanout_publish(&session.id, &cancel, false).await;
        }

        self.emit(RouterEvent::SessionClosed {
            session: session.id.clone(),
            name: session.name.clone(),
        });
        debug!(session = %session.id, "session closed");
    }

    // -- timers ------------------------------------------------------------

    /// Drive the timer wheel and per-second housekeeping until shutdown.
    pub async fn run_timers(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut wheel_tick = tokio::time::interval(Duration::from_millis(1));
        let mut housekeeping = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = wheel_tick.tick() => {
                    for pending in self.wheel.drain_due(now_micros()) {
                        // Origin may be gone; its scheduled work dies with it.
                        if let Some(session) = self.sessions.get(&pending.session) {
                            self.execute_bundle(&session, pending.messages, pending.correlation)
                                .await;
                        }
                    }
                }
                _ = housekeeping.tick() => {
                    let expired = self.sessions.expire_pending_acks();
                    if expired > 0 {
                        warn!(expired, "acknowledgements timed out");
                    }
                    for (session_id, id, address) in self.gestures.sweep(GESTURE_TIMEOUT_US) {
                        let cancel = Publish {
                            address,
                            signal: Some(SignalKind::Gesture),
                            value: None,
                            payload: None,
                            samples: None,
                            rate: None,
                            id: Some(id),
                            phase: Some(GesturePhase::Cancel),
                            timestamp: Some(now_micros()),
                        };
                        let _shared = self.fanout_gate.read().await;
                        self.fanout_publish(&session_id, &cancel, false).await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    // -- helpers -----------------------------------------------------------

    async fn reply(&self, session: &Arc<Session>, message: &Message) {
        if session.send(message).await.is_ok() {
            self.stats.frame_out();
        }
    }

    async fn refuse_write(&self, session: &Arc<Session>, address: &str, refusal: Refusal) {
        match refusal {
            Refusal::Scope => {
                self.send_error(
                    session,
                    ErrorCode::ScopeViolation,
                    "scope",
                    Some(address.to_string()),
                    None,
                )
                .await
            }
            Refusal::Range { min, max } => {
                self.send_error(
                    session,
                    ErrorCode::ValueRejected,
                    &format!("value outside [{min}, {max}]"),
                    Some(address.to_string()),
                    None,
                )
                .await
            }
        }
    }

    async fn send_write_error(&self, session: &Arc<Session>, address: &str, err: WriteError) {
        match err {
            WriteError::RevisionConflict { expected, actual } => {
                self.send_error(
                    session,
                    ErrorCode::RevisionMismatch,
                    &format!("expected revision {expected}, at {actual}"),
                    Some(address.to_string()),
                    None,
                )
                .await
            }
            WriteError::LockHeld { holder } => {
                self.send_error(
                    session,
                    ErrorCode::LockConflict,
                    &format!("lock held by {holder}"),
                    Some(address.to_string()),
                    None,
                )
                .await
            }
        }
    }

    pub async fn send_error(
        &self,
        session: &Arc<Session>,
        code: ErrorCode,
        text: &str,
        address: Option<String>,
        correlation: Option<u32>,
    ) {
        self.stats.error_emitted(code.as_u16());
        let err = Message::ErrorMsg(ErrorInfo {
            code: code.as_u16(),
            message: text.to_string(),
            address,
            correlation_id: correlation,
        });
        let _ = session.send(&err).await;
        self.stats.frame_out();
    }
}
