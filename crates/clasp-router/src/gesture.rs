//! Gesture registry
//!
//! Tracks live gesture ids per session. `start` establishes an id,
//! `move`/`end`/`cancel` must name a live one; violations surface as 4xx
//! errors at the dispatcher. Phases are forwarded unmodified: any move
//! coalescing happens in bridges, not here. Session teardown cancels
//! everything the session had open, and abandoned gestures age out.

use crate::session::SessionId;
use clasp_core::time::{now_micros, Micros};
use dashmap::DashMap;

#[derive(Debug, Clone, PartialEq)]
pub enum GestureError {
    /// move/end/cancel for an id this session never started (or already
    /// finished).
    Unknown { id: u32 },
}

#[derive(Debug, Clone)]
struct ActiveGesture {
    address: String,
    started_at: Micros,
    last_seen: Micros,
}

#[derive(Debug, Default)]
pub struct GestureRegistry {
    active: DashMap<(SessionId, u32), ActiveGesture>,
}

impl GestureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Establish a gesture id. A start for an id that is already live
    /// replaces it; devices re-emit start after hiccups.
    pub fn start(&self, session: &SessionId, id: u32, address: &str) {
        let now = now_micros();
        self.active.insert(
            (session.clone(), id),
            ActiveGesture {
                address: address.to_string(),
                started_at: now,
                last_seen: now,
            },
        );
    }

    /// Record a move phase.
    pub fn touch(&self, session: &SessionId, id: u32) -> Result<(), GestureError> {
        match self.active.get_mut(&(session.clone(), id)) {
            Some(mut entry) => {
                entry.last_seen = now_micros();
                Ok(())
            }
            None => Err(GestureError::Unknown { id }),
        }
    }

    /// Close out an end or cancel phase.
    pub fn finish(&self, session: &SessionId, id: u32) -> Result<(), GestureError> {
        self.active
            .remove(&(session.clone(), id))
            .map(|_| ())
            .ok_or(GestureError::Unknown { id })
    }

    /// Cancel everything a closing session had open; returns the
    /// (id, address) pairs so the dispatcher can fan out cancel phases.
    pub fn cancel_session(&self, session: &SessionId) -> Vec<(u32, String)> {
        let keys: Vec<(SessionId, u32)> = self
            .active
            .iter()
            .filter(|e| &e.key().0 == session)
            .map(|e| e.key().clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| {
                let id = key.1;
                self.active.remove(&key).map(|(_, g)| (id, g.address))
            })
            .collect()
    }

    /// Drop gestures idle longer than `timeout_us`; returns what was
    /// dropped so cancels can be synthesized.
    pub fn sweep(&self, timeout_us: u64) -> Vec<(SessionId, u32, String)> {
        let now = now_micros();
        let stale: Vec<(SessionId, u32)> = self
            .active
            .iter()
            .filter(|e| now.saturating_sub(e.last_seen) > timeout_us)
            .map(|e| e.key().clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|key| {
                self.active
                    .remove(&key)
                    .map(|((session, id), g)| (session, id, g.address))
            })
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn started_at(&self, session: &SessionId, id: u32) -> Option<Micros> {
        self.active
            .get(&(session.clone(), id))
            .map(|g| g.started_at)
    }
}
