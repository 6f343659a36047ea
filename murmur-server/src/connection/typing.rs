//! Typing indicators. Ephemeral: relayed once, never stored, never timed out
//! server-side.

use crate::protocol::{Identity, ServerEvent};
use crate::server::SharedState;

pub fn notify_typing(state: &SharedState, identity: &Identity) {
    relay(
        state,
        identity,
        ServerEvent::UserTyping {
            identity: identity.clone(),
        },
    );
}

pub fn notify_stopped_typing(state: &SharedState, identity: &Identity) {
    relay(
        state,
        identity,
        ServerEvent::UserStoppedTyping {
            identity: identity.clone(),
        },
    );
}

/// Send to every joined connection except the originator's own handles.
fn relay(state: &SharedState, origin: &Identity, event: ServerEvent) {
    for entry in state.presence.snapshot() {
        if entry.identity.id != origin.id {
            state.deliver(entry.handle, event.clone());
        }
    }
}
