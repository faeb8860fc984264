//! Microsecond clock helpers and per-session clock offset tracking

use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds since the Unix epoch.
pub type Micros = u64;

/// Current wall-clock time in microseconds.
pub fn now_micros() -> Micros {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as Micros
}

/// Exponentially-weighted estimate of a peer's clock offset relative to
/// this process, in microseconds. Positive means the peer's clock runs
/// ahead of ours.
///
/// The router feeds this from SYNC exchanges: a client stamps `t1` when
/// it sends, the router stamps `t2` on receipt, and `t2 - t1` bounds the
/// offset from above by one uplink delay. Smoothing keeps a single noisy
/// sample from skewing bundle-tolerance checks.
#[derive(Debug, Clone, Default)]
pub struct OffsetEstimate {
    offset_us: i64,
    samples: u32,
}

impl OffsetEstimate {
    const ALPHA: f64 = 0.3;

    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one observed offset (peer time minus router time).
    pub fn observe(&mut self, observed_us: i64) {
        if self.samples == 0 {
            self.offset_us = observed_us;
        } else {
            self.offset_us = ((1.0 - Self::ALPHA) * self.offset_us as f64
                + Self::ALPHA * observed_us as f64) as i64;
        }
        self.samples = self.samples.saturating_add(1);
    }

    /// Current offset estimate in microseconds.
    pub fn offset_us(&self) -> i64 {
        self.offset_us
    }

    /// Number of SYNC samples folded in so far.
    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// Translate a timestamp from the peer's clock into router time.
    pub fn to_router_time(&self, peer_us: Micros) -> Micros {
        (peer_us as i64 - self.offset_us).max(0) as Micros
    }
}
