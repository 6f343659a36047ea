//! Presence registry: which identities hold which live connections.
//!
//! Keyed by connection handle, so a handle can never appear twice. Every
//! operation is a single short critical section and never suspends; callers
//! get owned copies and can iterate without holding the lock.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::protocol::{ConnectionHandle, Identity, OnlineUser};

/// One registered (joined) connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub handle: ConnectionHandle,
    pub identity: Identity,
    pub joined_at: DateTime<Utc>,
}

impl From<&PresenceEntry> for OnlineUser {
    fn from(entry: &PresenceEntry) -> Self {
        OnlineUser {
            identity: entry.identity.clone(),
            handle: entry.handle,
        }
    }
}

#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: Mutex<BTreeMap<ConnectionHandle, PresenceEntry>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry for `handle`.
    pub fn register(&self, handle: ConnectionHandle, identity: Identity) {
        let entry = PresenceEntry {
            handle,
            identity,
            joined_at: Utc::now(),
        };
        self.entries.lock().insert(handle, entry);
    }

    /// Remove the entry for `handle`. Returns false if there was none.
    pub fn deregister(&self, handle: ConnectionHandle) -> bool {
        self.entries.lock().remove(&handle).is_some()
    }

    /// All live handles held by `identity_id`, in handle order.
    pub fn lookup_by_identity(&self, identity_id: &str) -> Vec<ConnectionHandle> {
        self.entries
            .lock()
            .values()
            .filter(|e| e.identity.id == identity_id)
            .map(|e| e.handle)
            .collect()
    }

    /// Point-in-time copy of every entry, in handle order.
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        self.entries.lock().values().cloned().collect()
    }

    /// Distinct ids of identities with at least one live connection.
    pub fn online_identities(&self) -> BTreeSet<String> {
        self.entries
            .lock()
            .values()
            .map(|e| e.identity.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    fn h(n: u64) -> ConnectionHandle {
        ConnectionHandle::from_raw(n)
    }

    #[test]
    fn register_is_idempotent_per_handle() {
        let reg = PresenceRegistry::new();
        reg.register(h(1), Identity::new("u1", "Ada"));
        reg.register(h(1), Identity::new("u1", "Ada"));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.lookup_by_identity("u1"), vec![h(1)]);
    }

    #[test]
    fn deregister_twice_is_a_noop() {
        let reg = PresenceRegistry::new();
        reg.register(h(1), Identity::new("u1", "Ada"));
        assert!(reg.deregister(h(1)));
        assert!(!reg.deregister(h(1)));
        assert!(reg.is_empty());
    }

    #[test]
    fn lookup_returns_every_handle_of_an_identity() {
        let reg = PresenceRegistry::new();
        reg.register(h(3), Identity::new("u1", "Ada"));
        reg.register(h(1), Identity::new("u1", "Ada"));
        reg.register(h(2), Identity::new("u2", "Grace"));
        assert_eq!(reg.lookup_by_identity("u1"), vec![h(1), h(3)]);
        assert_eq!(reg.lookup_by_identity("u2"), vec![h(2)]);
        assert!(reg.lookup_by_identity("u3").is_empty());
        assert_eq!(reg.online_identities().len(), 2);
    }

    #[test]
    fn snapshot_does_not_alias_registry() {
        let reg = PresenceRegistry::new();
        reg.register(h(1), Identity::new("u1", "Ada"));
        let snap = reg.snapshot();
        reg.deregister(h(1));
        assert_eq!(snap.len(), 1);
        assert!(reg.snapshot().is_empty());
    }

    #[test]
    fn concurrent_mutation_never_duplicates_handles() {
        let reg = Arc::new(PresenceRegistry::new());
        let writers: Vec<_> = (0..8u64)
            .map(|t| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    for i in 0..200u64 {
                        // Writers overlap on handles to force overwrites.
                        let handle = h((t * 200 + i) % 300);
                        reg.register(handle, Identity::new(format!("u{t}"), "x"));
                        if i % 3 == 0 {
                            reg.deregister(handle);
                        }
                    }
                })
            })
            .collect();
        let reader = {
            let reg = reg.clone();
            std::thread::spawn(move || {
                for _ in 0..500 {
                    let snap = reg.snapshot();
                    let unique: HashSet<_> = snap.iter().map(|e| e.handle).collect();
                    assert_eq!(unique.len(), snap.len());
                }
            })
        };
        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();

        let snap = reg.snapshot();
        let unique: HashSet<_> = snap.iter().map(|e| e.handle).collect();
        assert_eq!(unique.len(), snap.len());
    }

    #[test]
    fn deregistered_handle_absent_from_snapshot() {
        let reg = PresenceRegistry::new();
        reg.register(h(1), Identity::new("u1", "Ada"));
        reg.register(h(2), Identity::new("u2", "Grace"));
        reg.deregister(h(1));
        let handles: Vec<_> = reg.snapshot().into_iter().map(|e| e.handle).collect();
        assert_eq!(handles, vec![h(2)]);
    }
}
