//! Session manager
//!
//! One `Session` per connected client (bridges attach through the same
//! type as pseudo-sessions). The session owns its transport sender, the
//! decoded capability grant, the peer clock estimate fed by SYNC, and
//! the outstanding-ACK table that implements cooperative backpressure:
//! Confirm/Commit deliveries hold one of a bounded set of permits until
//! the peer acknowledges, so a stalled peer blocks only its own feed.

use clasp_core::codec::{self, Encoding};
use clasp_core::grant::Grant;
use clasp_core::time::{Micros, OffsetEstimate};
use clasp_core::{Message, QoS};
use clasp_transport::TransportSender;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

pub type SessionId = String;

/// Outstanding Confirm/Commit deliveries allowed per session.
pub const ACK_WINDOW: usize = 64;

/// How long a delivery may stay unacknowledged.
pub const ACK_DEADLINE: Duration = Duration::from_secs(5);

struct PendingDelivery {
    deadline: Instant,
    _permit: OwnedSemaphorePermit,
}

pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub features: Vec<String>,
    /// Payload encoding mirrored back to this peer.
    pub encoding: Encoding,
    pub grant: Grant,
    /// Bridge pseudo-sessions skip self-echo suppression rules.
    pub is_bridge: bool,

    sender: Arc<dyn TransportSender>,
    subscriptions: RwLock<HashSet<u32>>,
    clock: RwLock<OffsetEstimate>,

    /// Implicit correlation counter for inbound Confirm/Commit messages;
    /// ACKs we emit echo it.
    inbound_seq: AtomicU32,
    /// Implicit correlation counter for outbound Confirm/Commit
    /// deliveries; peer ACKs clear entries from `pending`.
    outbound_seq: AtomicU32,
    pending: DashMap<u32, PendingDelivery>,
    ack_permits: Arc<Semaphore>,
    degraded: AtomicBool,

    last_rx: RwLock<Instant>,
    pub created_at: Instant,
    /// Last accepted write per address, for grant max-rate constraints.
    write_stamps: DashMap<String, Micros>,
}

impl Session {
    pub fn new(
        sender: Arc<dyn TransportSender>,
        name: String,
        features: Vec<String>,
        grant: Grant,
        encoding: Encoding,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            features,
            encoding,
            grant,
            is_bridge: false,
            sender,
            subscriptions: RwLock::new(HashSet::new()),
            clock: RwLock::new(OffsetEstimate::new()),
            inbound_seq: AtomicU32::new(0),
            outbound_seq: AtomicU32::new(0),
            pending: DashMap::new(),
            ack_permits: Arc::new(Semaphore::new(ACK_WINDOW)),
            degraded: AtomicBool::new(false),
            last_rx: RwLock::new(now),
            created_at: now,
            write_stamps: DashMap::new(),
        }
    }

    pub fn bridge(sender: Arc<dyn TransportSender>, name: String) -> Self {
        let mut session = Self::new(
            sender,
            name,
            vec!["bridge".into()],
            Grant::open(),
            Encoding::Binary,
        );
        session.is_bridge = true;
        session
    }

    // -- outbound ----------------------------------------------------------

    /// Fire-and-forget delivery; dropped when the peer's buffer is full.
    pub fn try_send(&self, message: &Message) -> bool {
        match codec::encode_with(message, self.encoding, Some(QoS::Fire), None) {
            Ok(bytes) => self.sender.try_send(bytes).is_ok(),
            Err(_) => false,
        }
    }

    /// Deliver with the message's default QoS. Confirm/Commit deliveries
    /// take an ACK permit; when the window is full this awaits, which is
    /// the per-session backpressure point.
    pub async fn send(&self, message: &Message) -> crate::error::Result<()> {
        self.send_with_qos(message, message.default_qos()).await
    }

    pub async fn send_with_qos(&self, message: &Message, qos: QoS) -> crate::error::Result<()> {
        if matches!(qos, QoS::Confirm | QoS::Commit) {
            let permit = self
                .ack_permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| crate::error::RouterError::ShuttingDown)?;
            let correlation = self.outbound_seq.fetch_add(1, Ordering::Relaxed) + 1;
            self.pending.insert(
                correlation,
                PendingDelivery {
                    deadline: Instant::now() + ACK_DEADLINE,
                    _permit: permit,
                },
            );
        }
        let bytes = codec::encode_with(message, self.encoding, Some(qos), None)?;
        self.sender.send(bytes).await?;
        Ok(())
    }

    /// Peer acknowledged a delivery. Without an explicit id the oldest
    /// outstanding entry clears.
    pub fn on_ack(&self, correlation: Option<u32>) {
        match correlation {
            Some(c) => {
                self.pending.remove(&c);
            }
            None => {
                if let Some(oldest) = self.pending.iter().map(|e| *e.key()).min() {
                    self.pending.remove(&oldest);
                }
            }
        }
    }

    /// Expire overdue deliveries; an expiry marks the session degraded.
    /// Returns how many were dropped.
    pub fn expire_pending(&self, now: Instant) -> usize {
        let overdue: Vec<u32> = self
            .pending
            .iter()
            .filter(|e| e.deadline <= now)
            .map(|e| *e.key())
            .collect();
        for key in &overdue {
            self.pending.remove(key);
        }
        if !overdue.is_empty() {
            self.degraded.store(true, Ordering::Relaxed);
        }
        overdue.len()
    }

    pub fn outstanding_acks(&self) -> usize {
        self.pending.len()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.sender.is_connected()
    }

    pub async fn close(&self) {
        let _ = self.sender.close().await;
    }

    // -- inbound accounting ------------------------------------------------

    /// Correlation id for the ACK answering an inbound Confirm/Commit.
    pub fn next_inbound_correlation(&self) -> u32 {
        self.inbound_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn touch_rx(&self) {
        *self.last_rx.write() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_rx.read().elapsed()
    }

    /// Enforce a grant's per-address write ceiling. Accepting a write
    /// records its time; a refusal leaves the window untouched.
    pub fn admit_write(&self, address: &str, rate_hz: u32, now: Micros) -> bool {
        let min_gap = 1_000_000 / rate_hz.max(1) as u64;
        let mut stamp = self.write_stamps.entry(address.to_string()).or_insert(0);
        if *stamp != 0 && now.saturating_sub(*stamp) < min_gap {
            return false;
        }
        *stamp = now.max(1);
        true
    }

    // -- clock -------------------------------------------------------------

    /// Fold a SYNC exchange into the peer clock estimate. `t1` is the
    /// peer's send stamp, `t2` ours at receipt.
    pub fn observe_sync(&self, t1: Micros, t2: Micros) {
        self.clock.write().observe(t1 as i64 - t2 as i64);
    }

    pub fn clock_offset_us(&self) -> i64 {
        self.clock.read().offset_us()
    }

    /// Translate a peer-stamped time into router time.
    pub fn peer_time_to_router(&self, ts: Micros) -> Micros {
        self.clock.read().to_router_time(ts)
    }

    // -- subscriptions -----------------------------------------------------

    pub fn add_subscription(&self, id: u32) {
        self.subscriptions.write().insert(id);
    }

    pub fn remove_subscription(&self, id: u32) -> bool {
        self.subscriptions.write().remove(&id)
    }

    pub fn subscription_ids(&self) -> Vec<u32> {
        self.subscriptions.read().iter().copied().collect()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("bridge", &self.is_bridge)
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clasp_transport::LoopbackSender;

    fn session() -> (Session, tokio::sync::mpsc::Receiver<bytes::Bytes>) {
        let (sender, frames) = LoopbackSender::channel(128);
        (
            Session::new(
                Arc::new(sender),
                "test".into(),
                vec![],
                Grant::open(),
                Encoding::Binary,
            ),
            frames,
        )
    }

    #[tokio::test]
    async fn confirm_sends_hold_permits_until_acked() {
        let (session, _frames) = session();
        let msg = Message::Ping; // shape irrelevant here
        session.send_with_qos(&msg, QoS::Confirm).await.unwrap();
        session.send_with_qos(&msg, QoS::Commit).await.unwrap();
        assert_eq!(session.outstanding_acks(), 2);

        session.on_ack(Some(1));
        assert_eq!(session.outstanding_acks(), 1);
        // ACK without an id clears the oldest outstanding entry.
        session.on_ack(None);
        assert_eq!(session.outstanding_acks(), 0);
    }

    #[tokio::test]
    async fn expired_acks_mark_degraded() {
        let (session, _frames) = session();
        session
            .send_with_qos(&Message::Ping, QoS::Confirm)
            .await
            .unwrap();
        assert!(!session.is_degraded());
        let expired = session.expire_pending(Instant::now() + ACK_DEADLINE + Duration::from_secs(1));
        assert_eq!(expired, 1);
        assert!(session.is_degraded());
        assert_eq!(session.outstanding_acks(), 0);
    }

    #[tokio::test]
    async fn write_rate_ceiling_applies_per_address() {
        let (session, _frames) = session();
        let base = clasp_core::time::now_micros();
        assert!(session.admit_write("/a", 10, base));
        assert!(!session.admit_write("/a", 10, base + 50_000));
        assert!(session.admit_write("/b", 10, base + 50_000));
        assert!(session.admit_write("/a", 10, base + 150_000));
    }

    #[tokio::test]
    async fn sync_observations_move_the_offset() {
        let (session, _frames) = session();
        session.observe_sync(1_000_500, 1_000_000);
        assert_eq!(session.clock_offset_us(), 500);
        assert_eq!(session.peer_time_to_router(2_000_500), 2_000_000);
    }
}

/// Process-wide session table.
#[derive(Default)]
pub struct SessionTable {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| e.clone()).collect()
    }

    /// Sweep helper for the housekeeping tick.
    pub fn expire_pending_acks(&self) -> usize {
        let now = Instant::now();
        self.sessions
            .iter()
            .map(|e| e.expire_pending(now))
            .sum()
    }
}
