//! Router statistics
//!
//! Lock-free counters surfaced through the control surface.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RouterStats {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    sets: AtomicU64,
    publishes: AtomicU64,
    bundles: AtomicU64,
    drops: AtomicU64,
    /// Errors emitted, indexed by code family (1xx..5xx).
    errors: [AtomicU64; 5],
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub frames_in: u64,
    pub frames_out: u64,
    pub sets: u64,
    pub publishes: u64,
    pub bundles: u64,
    pub drops: u64,
    pub errors_by_family: [u64; 5],
    pub sessions: usize,
    pub params: usize,
    pub subscriptions: usize,
}

impl RouterStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_in(&self) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_out(&self) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_applied(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_routed(&self) {
        self.publishes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bundle_fired(&self) {
        self.bundles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_dropped(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_emitted(&self, code: u16) {
        let family = (code / 100).clamp(1, 5) as usize - 1;
        self.errors[family].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, sessions: usize, params: usize, subscriptions: usize) -> StatsSnapshot {
        StatsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            publishes: self.publishes.load(Ordering::Relaxed),
            bundles: self.bundles.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
            errors_by_family: std::array::from_fn(|i| self.errors[i].load(Ordering::Relaxed)),
            sessions,
            params,
            subscriptions,
        }
    }
}
