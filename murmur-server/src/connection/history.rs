//! Backlog replay for a joining connection.

use crate::protocol::{Identity, Message};
use crate::server::SharedState;

/// The most recent `history_limit` messages `identity` sent or received,
/// oldest-first. A store failure yields an empty backlog; the join goes on.
pub fn load(state: &SharedState, identity: &Identity) -> Vec<Message> {
    match state
        .store
        .recent_for(&identity.id, state.config.history_limit)
    {
        Ok(messages) => messages,
        Err(e) => {
            tracing::warn!(user = %identity.id, "History unavailable, sending empty backlog: {e}");
            Vec::new()
        }
    }
}
