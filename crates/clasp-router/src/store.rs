//! Param state store
//!
//! Exclusive owner of retained Param state. Reads are concurrent; each
//! write runs under its address's map entry, which serializes writers per
//! address and makes revision allocation race-free. Insertion order is
//! kept separately so `get_matching` enumerates deterministically.

use clasp_core::address::Pattern;
use clasp_core::time::{now_micros, Micros};
use clasp_core::{ParamSnapshot, SignalInfo, SignalKind, Snapshot, Value};
use dashmap::DashMap;
use parking_lot::Mutex;

fn datatype_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Int(_) => "int",
        Value::Float(_) => "float",
        Value::String(_) => "string",
        Value::Bytes(_) => "bytes",
        Value::Array(_) => "array",
        Value::Map(_) => "map",
    }
}

/// Why a write was refused. The dispatcher maps these onto 4xx errors.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteError {
    RevisionConflict { expected: u64, actual: u64 },
    LockHeld { holder: String },
}

/// Retained state for one address.
#[derive(Debug, Clone)]
pub struct ParamEntry {
    pub value: Value,
    pub revision: u64,
    pub writer: String,
    pub timestamp: Micros,
    pub lock_holder: Option<String>,
}

impl ParamEntry {
    fn snapshot(&self, address: &str) -> ParamSnapshot {
        ParamSnapshot {
            address: address.to_string(),
            value: self.value.clone(),
            revision: self.revision,
            writer: Some(self.writer.clone()),
            timestamp: Some(self.timestamp),
        }
    }
}

/// Result of an applied write.
#[derive(Debug, Clone)]
pub struct Applied {
    pub revision: u64,
    pub locked: bool,
}

#[derive(Debug, Default)]
pub struct ParamStore {
    entries: DashMap<String, ParamEntry>,
    order: Mutex<Vec<String>>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot read of one address.
    pub fn get(&self, address: &str) -> Option<ParamEntry> {
        self.entries.get(address).map(|e| e.clone())
    }

    /// Apply a write, creating the entry on first use.
    ///
    /// `revision_hint` rejects the write unless it names the current
    /// revision. `lock` claims the entry for `writer`; `unlock` releases
    /// a lock this writer holds.
    pub fn set(
        &self,
        address: &str,
        value: Value,
        writer: &str,
        revision_hint: Option<u64>,
        lock: bool,
        unlock: bool,
    ) -> Result<Applied, WriteError> {
        match self.entries.entry(address.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occ) => {
                let entry = occ.get_mut();
                if let Some(expected) = revision_hint {
                    if expected != entry.revision {
                        return Err(WriteError::RevisionConflict {
                            expected,
                            actual: entry.revision,
                        });
                    }
                }
                if let Some(holder) = &entry.lock_holder {
                    if holder != writer {
                        return Err(WriteError::LockHeld {
                            holder: holder.clone(),
                        });
                    }
                }
                if unlock && entry.lock_holder.as_deref() == Some(writer) {
                    entry.lock_holder = None;
                }
                if lock {
                    entry.lock_holder = Some(writer.to_string());
                }
                entry.value = value;
                entry.revision += 1;
                entry.writer = writer.to_string();
                entry.timestamp = now_micros();
                Ok(Applied {
                    revision: entry.revision,
                    locked: entry.lock_holder.is_some(),
                })
            }
            dashmap::mapref::entry::Entry::Vacant(vac) => {
                let entry = ParamEntry {
                    value,
                    revision: 1,
                    writer: writer.to_string(),
                    timestamp: now_micros(),
                    lock_holder: lock.then(|| writer.to_string()),
                };
                let locked = entry.lock_holder.is_some();
                vac.insert(entry);
                self.order.lock().push(address.to_string());
                Ok(Applied {
                    revision: 1,
                    locked,
                })
            }
        }
    }

    /// Would a write by `writer` with this hint be accepted right now?
    /// Bundles preflight every contained SET with this before applying
    /// any of them.
    pub fn check_writable(
        &self,
        address: &str,
        writer: &str,
        revision_hint: Option<u64>,
    ) -> Result<(), WriteError> {
        if let Some(entry) = self.entries.get(address) {
            if let Some(expected) = revision_hint {
                if expected != entry.revision {
                    return Err(WriteError::RevisionConflict {
                        expected,
                        actual: entry.revision,
                    });
                }
            }
            if let Some(holder) = &entry.lock_holder {
                if holder != writer {
                    return Err(WriteError::LockHeld {
                        holder: holder.clone(),
                    });
                }
            }
        } else if revision_hint.is_some() {
            // A hint against an address that doesn't exist yet.
            return Err(WriteError::RevisionConflict {
                expected: revision_hint.unwrap_or(0),
                actual: 0,
            });
        }
        Ok(())
    }

    /// All entries matching `pattern`, in insertion order.
    pub fn get_matching(&self, pattern: &Pattern) -> Vec<ParamSnapshot> {
        let order = self.order.lock();
        order
            .iter()
            .filter(|addr| pattern.matches(addr))
            .filter_map(|addr| self.entries.get(addr).map(|e| e.snapshot(addr)))
            .collect()
    }

    /// Same data packaged as a SNAPSHOT message.
    pub fn snapshot(&self, pattern: &Pattern) -> Snapshot {
        Snapshot {
            params: self.get_matching(pattern),
        }
    }

    /// Addresses matching `pattern`, as QUERY result entries with the
    /// datatype of the current value.
    pub fn query(&self, pattern: &Pattern) -> Vec<SignalInfo> {
        let order = self.order.lock();
        order
            .iter()
            .filter(|addr| pattern.matches(addr))
            .map(|addr| SignalInfo {
                address: addr.clone(),
                kind: SignalKind::Param,
                datatype: self
                    .entries
                    .get(addr.as_str())
                    .map(|e| datatype_of(&e.value).to_string()),
            })
            .collect()
    }

    /// Drop every lock held by a closing session.
    pub fn release_locks(&self, session: &str) {
        for mut entry in self.entries.iter_mut() {
            if entry.lock_holder.as_deref() == Some(session) {
                entry.lock_holder = None;
            }
        }
    }

    /// Not exposed over the wire; used by tests and admin tooling.
    pub fn delete(&self, address: &str) -> Option<ParamEntry> {
        let removed = self.entries.remove(address).map(|(_, e)| e);
        if removed.is_some() {
            self.order.lock().retain(|a| a != address);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revisions_start_at_one_and_increment() {
        let store = ParamStore::new();
        let a = store.set("/x", Value::Float(0.1), "s1", None, false, false).unwrap();
        assert_eq!(a.revision, 1);
        let b = store.set("/x", Value::Float(0.2), "s2", None, false, false).unwrap();
        assert_eq!(b.revision, 2);
        assert_eq!(store.get("/x").unwrap().writer, "s2");
    }

    #[test]
    fn revision_hint_mismatch_rejected() {
        let store = ParamStore::new();
        store.set("/x", Value::Int(1), "s1", None, false, false).unwrap();
        let err = store
            .set("/x", Value::Int(2), "s1", Some(7), false, false)
            .unwrap_err();
        assert_eq!(
            err,
            WriteError::RevisionConflict {
                expected: 7,
                actual: 1
            }
        );
        // State unchanged.
        assert_eq!(store.get("/x").unwrap().revision, 1);
    }

    #[test]
    fn locks_block_other_writers_until_released() {
        let store = ParamStore::new();
        store.set("/fader", Value::Float(0.0), "a", None, true, false).unwrap();
        let err = store
            .set("/fader", Value::Float(0.5), "b", None, false, false)
            .unwrap_err();
        assert_eq!(err, WriteError::LockHeld { holder: "a".into() });

        // Holder can keep writing, then release.
        store.set("/fader", Value::Float(0.7), "a", None, false, true).unwrap();
        store.set("/fader", Value::Float(0.9), "b", None, false, false).unwrap();
    }

    #[test]
    fn session_close_releases_locks() {
        let store = ParamStore::new();
        store.set("/a", Value::Int(1), "s1", None, true, false).unwrap();
        store.release_locks("s1");
        assert!(store.set("/a", Value::Int(2), "s2", None, false, false).is_ok());
    }

    #[test]
    fn matching_enumerates_in_insertion_order() {
        let store = ParamStore::new();
        store.set("/t/b", Value::Int(1), "s", None, false, false).unwrap();
        store.set("/t/a", Value::Int(2), "s", None, false, false).unwrap();
        store.set("/u/c", Value::Int(3), "s", None, false, false).unwrap();
        let pattern = Pattern::compile("/t/**").unwrap();
        let got: Vec<String> = store
            .get_matching(&pattern)
            .into_iter()
            .map(|p| p.address)
            .collect();
        assert_eq!(got, vec!["/t/b".to_string(), "/t/a".to_string()]);
    }

    #[test]
    fn preflight_matches_apply_behavior() {
        let store = ParamStore::new();
        store.set("/x", Value::Int(1), "a", None, true, false).unwrap();
        assert!(store.check_writable("/x", "a", Some(1)).is_ok());
        assert!(store.check_writable("/x", "b", None).is_err());
        assert!(store.check_writable("/x", "a", Some(2)).is_err());
        assert!(store.check_writable("/fresh", "b", None).is_ok());
        assert!(store.check_writable("/fresh", "b", Some(1)).is_err());
    }
}
