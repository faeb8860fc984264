//! Subscription engine
//!
//! Owns every standing subscription and answers "who receives this
//! signal". Lookups go through a trie keyed on the literal segments
//! before the first wildcard, so fan-out cost scales with the address
//! depth rather than the subscription count. Per-(subscription, address)
//! delivery state backs the rate and epsilon filters and is created
//! lazily on first match.

use crate::session::SessionId;
use clasp_core::address::Pattern;
use clasp_core::time::Micros;
use clasp_core::types::{kind_mask, SignalKind, SubscribeOptions, Value};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

type SubKey = (SessionId, u32);

/// One standing subscription.
#[derive(Debug)]
pub struct Subscription {
    pub session: SessionId,
    pub id: u32,
    pub pattern: Pattern,
    pub kinds: u8,
    pub options: SubscribeOptions,
    /// Last delivery per matched address: (timestamp, numeric value).
    delivered: DashMap<String, DeliveryState>,
}

#[derive(Debug, Clone, Copy, Default)]
struct DeliveryState {
    at: Micros,
    numeric: Option<f64>,
}

impl Subscription {
    pub fn new(
        session: SessionId,
        id: u32,
        pattern: Pattern,
        types: &[SignalKind],
        options: SubscribeOptions,
    ) -> Self {
        Self {
            session,
            id,
            pattern,
            kinds: kind_mask(types),
            options,
            delivered: DashMap::new(),
        }
    }

    pub fn wants_kind(&self, kind: SignalKind) -> bool {
        self.kinds & kind.mask_bit() != 0
    }

    /// Apply rate and epsilon filters for a delivery at `now`, recording
    /// the delivery if it passes. Filters only throttle the high-rate
    /// kinds; Event, Gesture and Timeline always pass.
    pub fn admit(&self, address: &str, kind: SignalKind, value: Option<&Value>, now: Micros) -> bool {
        if !matches!(kind, SignalKind::Param | SignalKind::Stream) {
            return true;
        }

        let min_interval = self.options.max_rate.map(|hz| 1_000_000 / hz.max(1) as u64);
        // Stream subscribers with a coalescing window accept one update
        // per window; intermediate samples are dropped, not queued.
        let window = (kind == SignalKind::Stream)
            .then_some(self.options.window)
            .flatten()
            .map(u64::from);
        let gap = match (min_interval, window) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        let numeric = value.and_then(Value::as_f64);
        let mut state = self.delivered.entry(address.to_string()).or_default();

        if state.at != 0 {
            if let Some(gap) = gap {
                if now.saturating_sub(state.at) < gap {
                    return false;
                }
            }
            if let (Some(eps), Some(new), Some(old)) =
                (self.options.epsilon, numeric, state.numeric)
            {
                if (new - old).abs() < eps {
                    return false;
                }
            }
        }

        state.at = now.max(1);
        if numeric.is_some() {
            state.numeric = numeric;
        }
        true
    }
}

#[derive(Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    here: Vec<SubKey>,
}

impl TrieNode {
    fn remove_key(&mut self, key: &SubKey) {
        self.here.retain(|k| k != key);
        for child in self.children.values_mut() {
            child.remove_key(key);
        }
        self.children.retain(|_, c| !c.here.is_empty() || !c.children.is_empty());
    }
}

/// Process-wide set of subscriptions.
#[derive(Default)]
pub struct SubscriptionTable {
    subs: DashMap<SubKey, Arc<Subscription>>,
    index: RwLock<TrieNode>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (idempotent per (session, id): a re-subscribe replaces
    /// the previous registration).
    pub fn subscribe(&self, sub: Subscription) {
        let key = (sub.session.clone(), sub.id);
        let sub = Arc::new(sub);
        if self.subs.insert(key.clone(), sub.clone()).is_some() {
            self.index.write().remove_key(&key);
        }
        let mut index = self.index.write();
        let mut node = &mut *index;
        for seg in sub.pattern.literal_prefix() {
            node = node.children.entry(seg.to_string()).or_default();
        }
        node.here.push(key);
    }

    pub fn unsubscribe(&self, session: &SessionId, id: u32) -> bool {
        let key = (session.clone(), id);
        let removed = self.subs.remove(&key).is_some();
        if removed {
            self.index.write().remove_key(&key);
        }
        removed
    }

    /// Drop everything a closing session owned.
    pub fn remove_session(&self, session: &SessionId) {
        let keys: Vec<SubKey> = self
            .subs
            .iter()
            .filter(|e| &e.key().0 == session)
            .map(|e| e.key().clone())
            .collect();
        let mut index = self.index.write();
        for key in keys {
            self.subs.remove(&key);
            index.remove_key(&key);
        }
    }

    /// Subscriptions whose pattern matches `address` and whose kind set
    /// admits `kind`.
    pub fn fanout(&self, address: &str, kind: SignalKind) -> Vec<Arc<Subscription>> {
        let mut candidates: Vec<SubKey> = Vec::new();
        {
            let index = self.index.read();
            let mut node = Some(&*index);
            candidates.extend_from_slice(&index.here);
            if let Some(path) = address.strip_prefix('/') {
                for seg in path.split('/') {
                    node = node.and_then(|n| n.children.get(seg));
                    match node {
                        Some(n) => candidates.extend_from_slice(&n.here),
                        None => break,
                    }
                }
            }
        }

        candidates
            .into_iter()
            .filter_map(|key| self.subs.get(&key).map(|e| e.clone()))
            .filter(|sub| sub.wants_kind(kind) && sub.pattern.matches(address))
            .collect()
    }

    pub fn get(&self, session: &SessionId, id: u32) -> Option<Arc<Subscription>> {
        self.subs.get(&(session.clone(), id)).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }
}
