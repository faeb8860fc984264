//! Bundle scheduling
//!
//! Scheduled bundles wait on a hashed timer wheel: slots of `tick_us`
//! granularity, entries hashed by fire time. Draining advances a cursor
//! over elapsed ticks, so each entry is handed out exactly once no
//! matter how late the driver runs. Entries further out than one
//! revolution simply stay in their slot until their time comes around.

use crate::session::SessionId;
use clasp_core::time::Micros;
use clasp_core::Message;
use parking_lot::Mutex;

/// Scheduled-time slack allowed against the submitter's clock estimate.
pub const SCHEDULE_TOLERANCE_US: u64 = 500_000;

/// A bundle parked until its fire time.
#[derive(Debug)]
pub struct PendingBundle {
    pub session: SessionId,
    pub correlation: Option<u32>,
    pub messages: Vec<Message>,
    pub fire_at: Micros,
}

struct Entry<T> {
    fire_at: Micros,
    item: T,
}

pub struct TimerWheel<T> {
    slots: Vec<Mutex<Vec<Entry<T>>>>,
    tick_us: u64,
    cursor: Mutex<u64>,
}

impl<T> TimerWheel<T> {
    /// `slot_count` buckets of `tick_us` each; one revolution spans
    /// `slot_count * tick_us` microseconds.
    pub fn new(slot_count: usize, tick_us: u64, now: Micros) -> Self {
        Self {
            slots: (0..slot_count).map(|_| Mutex::new(Vec::new())).collect(),
            tick_us: tick_us.max(1),
            cursor: Mutex::new(now / tick_us.max(1)),
        }
    }

    /// Timer wheel sized for bundle scheduling: 1 ms ticks, 1 s
    /// revolution.
    pub fn for_bundles(now: Micros) -> Self {
        Self::new(1024, 1_000, now)
    }

    pub fn insert(&self, fire_at: Micros, item: T) {
        let slot = (fire_at / self.tick_us) as usize % self.slots.len();
        self.slots[slot].lock().push(Entry { fire_at, item });
    }

    /// Everything due at or before `now`, in fire-time order.
    pub fn drain_due(&self, now: Micros) -> Vec<T> {
        let now_tick = now / self.tick_us;
        let mut cursor = self.cursor.lock();
        if now_tick < *cursor {
            return Vec::new();
        }
        let span = (now_tick - *cursor + 1).min(self.slots.len() as u64);
        let mut due: Vec<Entry<T>> = Vec::new();
        for tick in (now_tick + 1 - span)..=now_tick {
            let slot = tick as usize % self.slots.len();
            let mut bucket = self.slots[slot].lock();
            let mut keep = Vec::with_capacity(bucket.len());
            for entry in bucket.drain(..) {
                if entry.fire_at <= now {
                    due.push(entry);
                } else {
                    keep.push(entry);
                }
            }
            *bucket = keep;
        }
        *cursor = now_tick;
        due.sort_by_key(|e| e.fire_at);
        due.into_iter().map(|e| e.item).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
