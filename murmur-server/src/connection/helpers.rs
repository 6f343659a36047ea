//! Delivery target sets and online-set broadcasts.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::presence::PresenceRegistry;
use crate::protocol::{ConnectionHandle, OnlineUser, ServerEvent};
use crate::server::SharedState;

/// Every live handle of either identity, each once.
///
/// Covers self-messages and identities with several devices: the same
/// handle can only appear once in the set.
pub fn delivery_targets(
    presence: &PresenceRegistry,
    sender_id: &str,
    recipient_id: &str,
) -> BTreeSet<ConnectionHandle> {
    let mut targets: BTreeSet<_> = presence.lookup_by_identity(sender_id).into_iter().collect();
    targets.extend(presence.lookup_by_identity(recipient_id));
    targets
}

/// Push the current online set to every registered connection.
///
/// Each recipient's list leaves out its own identity's entries. The
/// announce lock is held from snapshot to the last push so two
/// concurrent announces cannot deliver an older snapshot after a newer one.
pub fn announce_presence(state: &Arc<SharedState>) {
    let _order = state.announce_lock.lock();
    let snapshot = state.presence.snapshot();
    let targets: Vec<_> = {
        let conns = state.connections.lock();
        snapshot
            .iter()
            .filter_map(|entry| conns.get(&entry.handle).map(|o| (entry, o.clone())))
            .collect()
    };

    for (entry, outbox) in targets {
        let users: Vec<OnlineUser> = snapshot
            .iter()
            .filter(|other| other.identity.id != entry.identity.id)
            .map(OnlineUser::from)
            .collect();
        outbox.push(ServerEvent::OnlineUsers { users });
    }
    tracing::debug!(online = snapshot.len(), "Announced presence");
}
