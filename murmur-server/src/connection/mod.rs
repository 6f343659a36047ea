//! Per-client connection handler.
//!
//! Each WebSocket gets one task running [`run`], which consumes decoded
//! frames from an ordered inbound channel and drives a [`ConnState`]
//! machine:
//!
//! `Connecting -> Authenticated -> Joined -> Closed`
//!
//! The transition itself is the pure [`ConnState::on_event`]; side effects
//! live in the submodules:
//! - [`history`]: backlog replay on join
//! - [`messaging`]: validate, persist and route `sendMessage`
//! - [`typing`]: typing start/stop relay
//! - [`helpers`]: delivery target sets and online-set broadcasts

pub mod helpers;
pub mod history;
pub mod messaging;
pub mod typing;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{AuthError, ProtocolError};
use crate::protocol::{ClientEvent, ConnectionHandle, Identity, ServerEvent};
use crate::server::{Outbox, SharedState};

/// How often an idle connection re-checks its outbox health.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// One item from the transport, in receive order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Event(ClientEvent),
    /// A frame that could not be decoded. Carries the reason for logs.
    Malformed(String),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Authenticated,
    Joined,
    Closed,
}

/// Effect requested by a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Join,
    Route { recipient_id: String, text: String },
    /// `true` for typing start, `false` for stop.
    Typing(bool),
    Reject(ProtocolError),
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: ConnState,
    pub action: Action,
}

impl Transition {
    fn stay(state: ConnState, action: Action) -> Self {
        Self {
            next: state,
            action,
        }
    }

    /// Report `error`; fatal ones also close the connection.
    fn reject(state: ConnState, error: ProtocolError) -> Self {
        let next = if error.is_fatal() { ConnState::Closed } else { state };
        Self {
            next,
            action: Action::Reject(error),
        }
    }
}

impl ConnState {
    /// Decide what an event means in this state. No side effects.
    pub fn on_event(self, event: &ClientEvent, identity: &Identity) -> Transition {
        use ConnState::*;
        match (self, event) {
            (Authenticated, ClientEvent::Join { id, .. }) if *id == identity.id => Transition {
                next: Joined,
                action: Action::Join,
            },
            (Authenticated, ClientEvent::Join { .. }) => {
                Transition::reject(self, ProtocolError::IdentityMismatch)
            }
            (Authenticated, _) => Transition::reject(self, ProtocolError::NotJoined),
            (Joined, ClientEvent::Join { .. }) => Transition::reject(self, ProtocolError::AlreadyJoined),
            (Joined, ClientEvent::SendMessage { text, recipient_id }) => Transition::stay(
                self,
                Action::Route {
                    recipient_id: recipient_id.clone(),
                    text: text.clone(),
                },
            ),
            (Joined, ClientEvent::Typing {}) => Transition::stay(self, Action::Typing(true)),
            (Joined, ClientEvent::StopTyping {}) => Transition::stay(self, Action::Typing(false)),
            (Connecting | Closed, _) => Transition::stay(self, Action::Ignore),
        }
    }
}

/// Outcome of offering one event to the [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admit {
    Allow,
    /// Drop the event. `warn` is set on the first drop of a burst.
    Throttle { warn: bool },
}

/// Token bucket: `rate` events per second, bursting up to `rate`.
/// A rate of zero disables limiting.
#[derive(Debug)]
pub struct RateLimiter {
    tokens: f64,
    capacity: f64,
    last: Instant,
    throttled: bool,
}

impl RateLimiter {
    pub fn new(rate: u32) -> Self {
        Self::starting_at(rate, Instant::now())
    }

    fn starting_at(rate: u32, now: Instant) -> Self {
        let capacity = f64::from(rate);
        Self {
            tokens: capacity,
            capacity,
            last: now,
            throttled: false,
        }
    }

    pub fn admit(&mut self) -> Admit {
        self.admit_at(Instant::now())
    }

    fn admit_at(&mut self, now: Instant) -> Admit {
        if self.capacity <= 0.0 {
            return Admit::Allow;
        }
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.capacity).min(self.capacity);
        self.last = now;
        if self.tokens < 1.0 {
            let warn = !self.throttled;
            self.throttled = true;
            return Admit::Throttle { warn };
        }
        self.tokens -= 1.0;
        self.throttled = false;
        Admit::Allow
    }
}

/// Drive one connection from authentication to close.
///
/// Returns `Err` only when authentication fails; in that case nothing was
/// registered or written and no event was queued.
pub async fn run(
    state: Arc<SharedState>,
    token: Option<String>,
    mut inbound: mpsc::Receiver<Inbound>,
    outbound: mpsc::Sender<ServerEvent>,
) -> Result<(), AuthError> {
    let identity = match token.as_deref() {
        Some(token) => state.verifier.verify(token),
        None => Err(AuthError::InvalidToken),
    }
    .inspect_err(|e| tracing::info!(kind = e.kind(), "Authentication failed"))?;

    let handle = state.next_handle();
    let outbox = Outbox::new(outbound);
    state.attach(handle, outbox.clone());
    tracing::info!(%handle, user = %identity.id, "Connection authenticated");

    let mut conn = ConnState::Authenticated;
    let mut joined = false;
    let mut limiter = RateLimiter::new(state.config.rate_limit);
    let mut health = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    health.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        // A full outbox means the client stopped reading
        if !outbox.is_healthy() {
            tracing::info!(%handle, "Outbox unhealthy, disconnecting");
            break;
        }

        let item = tokio::select! {
            item = inbound.recv() => item,
            _ = health.tick() => continue,
        };
        let item = match item {
            None | Some(Inbound::Closed) => break,
            Some(item) => item,
        };

        if conn == ConnState::Joined
            && let Admit::Throttle { warn } = limiter.admit()
        {
            tracing::debug!(%handle, "Rate limited");
            if warn {
                outbox.push(ServerEvent::error(ProtocolError::RateLimited.kind()));
            }
            continue;
        }

        let event = match item {
            Inbound::Event(event) => event,
            Inbound::Malformed(reason) => {
                tracing::debug!(%handle, %reason, "Malformed frame");
                outbox.push(ServerEvent::error(ProtocolError::MalformedEvent.kind()));
                continue;
            }
            Inbound::Closed => break,
        };

        let Transition { next, action } = conn.on_event(&event, &identity);
        conn = next;
        match action {
            Action::Join => {
                join(&state, handle, &identity);
                joined = true;
            }
            Action::Route { recipient_id, text } => {
                if let Err(e) = messaging::submit(&state, &identity, &recipient_id, &text) {
                    tracing::debug!(%handle, kind = e.kind(), "Send rejected");
                    outbox.push(ServerEvent::error(e.kind()));
                }
            }
            Action::Typing(true) => typing::notify_typing(&state, &identity),
            Action::Typing(false) => typing::notify_stopped_typing(&state, &identity),
            Action::Reject(e) => {
                tracing::debug!(%handle, kind = e.kind(), "Protocol error");
                outbox.push(ServerEvent::error(e.kind()));
            }
            Action::Ignore => {}
        }

        if conn == ConnState::Closed {
            break;
        }
    }

    leave(&state, handle, &identity, joined);
    Ok(())
}

/// `Authenticated -> Joined`: read the backlog, register, mark online,
/// queue the backlog, announce.
///
/// The first four steps run under the identity lock, which the router also
/// takes to deliver. A message stored during the join is therefore either
/// in the backlog or sent live after it, never both.
fn join(state: &Arc<SharedState>, handle: ConnectionHandle, identity: &Identity) {
    let lock = state.identity_lock(&identity.id);
    {
        let _identity = lock.lock();
        let messages = history::load(state, identity);
        state.presence.register(handle, identity.clone());
        if let Err(e) = state.store.set_online(&identity.id) {
            tracing::warn!(user = %identity.id, "Failed to mark online: {e}");
        }
        tracing::info!(%handle, user = %identity.id, history = messages.len(), "Joined");
        state.deliver_history(handle, messages);
    }
    helpers::announce_presence(state);
}

/// Tear down. Only a joined connection touches the registry or the store.
fn leave(state: &Arc<SharedState>, handle: ConnectionHandle, identity: &Identity, joined: bool) {
    state.detach(handle);
    if !joined {
        tracing::info!(%handle, user = %identity.id, "Connection closed before join");
        return;
    }

    // Deregister, last-session check and offline write as one step against
    // a concurrent join of the same identity
    let lock = state.identity_lock(&identity.id);
    let last_session = {
        let _identity = lock.lock();
        state.presence.deregister(handle);
        let last_session = state.presence.lookup_by_identity(&identity.id).is_empty();
        if last_session
            && let Err(e) = state.store.set_offline(&identity.id, chrono::Utc::now())
        {
            tracing::warn!(user = %identity.id, "Failed to mark offline: {e}");
        }
        last_session
    };
    helpers::announce_presence(state);
    tracing::info!(%handle, user = %identity.id, last_session, "Connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ada() -> Identity {
        Identity::new("u1", "Ada")
    }

    fn join(id: &str) -> ClientEvent {
        ClientEvent::Join {
            id: id.to_string(),
            display_name: None,
        }
    }

    fn send(text: &str) -> ClientEvent {
        ClientEvent::SendMessage {
            text: text.to_string(),
            recipient_id: "u2".to_string(),
        }
    }

    #[test]
    fn matching_join_enters_joined() {
        let t = ConnState::Authenticated.on_event(&join("u1"), &ada());
        assert_eq!(t.next, ConnState::Joined);
        assert_eq!(t.action, Action::Join);
    }

    #[test]
    fn mismatched_join_closes() {
        let t = ConnState::Authenticated.on_event(&join("u2"), &ada());
        assert_eq!(t.next, ConnState::Closed);
        assert_eq!(t.action, Action::Reject(ProtocolError::IdentityMismatch));
    }

    #[test]
    fn events_before_join_are_rejected_but_keep_connection() {
        for event in [send("hi"), ClientEvent::Typing {}, ClientEvent::StopTyping {}] {
            let t = ConnState::Authenticated.on_event(&event, &ada());
            assert_eq!(t.next, ConnState::Authenticated);
            assert_eq!(t.action, Action::Reject(ProtocolError::NotJoined));
        }
    }

    #[test]
    fn joined_dispatches_events() {
        let t = ConnState::Joined.on_event(&send("hi"), &ada());
        assert_eq!(t.next, ConnState::Joined);
        assert_eq!(
            t.action,
            Action::Route {
                recipient_id: "u2".to_string(),
                text: "hi".to_string(),
            }
        );
        assert_eq!(
            ConnState::Joined.on_event(&ClientEvent::Typing {}, &ada()).action,
            Action::Typing(true)
        );
        assert_eq!(
            ConnState::Joined.on_event(&ClientEvent::StopTyping {}, &ada()).action,
            Action::Typing(false)
        );
        let again = ConnState::Joined.on_event(&join("u1"), &ada());
        assert_eq!(again.next, ConnState::Joined);
        assert_eq!(again.action, Action::Reject(ProtocolError::AlreadyJoined));
    }

    #[test]
    fn closed_ignores_everything() {
        let t = ConnState::Closed.on_event(&send("hi"), &ada());
        assert_eq!(t.next, ConnState::Closed);
        assert_eq!(t.action, Action::Ignore);
    }

    #[test]
    fn bucket_throttles_and_refills() {
        let start = Instant::now();
        let mut limiter = RateLimiter::starting_at(2, start);
        assert_eq!(limiter.admit_at(start), Admit::Allow);
        assert_eq!(limiter.admit_at(start), Admit::Allow);
        assert_eq!(limiter.admit_at(start), Admit::Throttle { warn: true });
        assert_eq!(limiter.admit_at(start), Admit::Throttle { warn: false });
        let later = start + Duration::from_secs(1);
        assert_eq!(limiter.admit_at(later), Admit::Allow);
    }

    #[test]
    fn zero_rate_disables_limiting() {
        let start = Instant::now();
        let mut limiter = RateLimiter::starting_at(0, start);
        for _ in 0..1000 {
            assert_eq!(limiter.admit_at(start), Admit::Allow);
        }
    }
}
