//! Server state and HTTP listener.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::auth::{IdentityVerifier, TokenVerifier};
use crate::config::ServerConfig;
use crate::presence::PresenceRegistry;
use crate::protocol::{ConnectionHandle, Message, ServerEvent};
use crate::store::{MessageStore, SqliteStore};

/// Bounded outbound queue for one connection.
///
/// Pushing never blocks. A full queue marks the connection unhealthy and
/// its own task closes it.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<ServerEvent>,
    healthy: Arc<AtomicBool>,
    /// Ids carried by this connection's join backlog.
    replayed: Arc<Mutex<HashSet<String>>>,
}

impl Outbox {
    pub fn new(tx: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            tx,
            healthy: Arc::new(AtomicBool::new(true)),
            replayed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Queue the join backlog and remember which messages it carried.
    pub fn push_history(&self, messages: Vec<Message>) -> bool {
        self.replayed
            .lock()
            .extend(messages.iter().map(|m| m.id.clone()));
        self.push(ServerEvent::MessageHistory { messages })
    }

    /// Queue a live message unless the backlog already carried it.
    pub fn push_message(&self, message: &Message) -> bool {
        if self.replayed.lock().contains(&message.id) {
            return false;
        }
        self.push(ServerEvent::Message {
            message: message.clone(),
        })
    }

    /// Queue an event. Returns false if it was dropped.
    pub fn push(&self, event: ServerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                tracing::warn!(event = event.name(), "Send buffer full, marking connection unhealthy");
                self.healthy.store(false, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed) && !self.tx.is_closed()
    }
}

/// Shared state accessible by all connection handlers.
pub struct SharedState {
    pub config: ServerConfig,
    /// Joined connections and their identities.
    pub presence: PresenceRegistry,
    /// handle -> outbound queue, for every authenticated connection
    pub connections: Mutex<HashMap<ConnectionHandle, Outbox>>,
    pub store: Arc<dyn MessageStore>,
    pub verifier: Arc<dyn IdentityVerifier>,
    /// Serializes online-set broadcasts so queues see snapshots in order.
    pub(crate) announce_lock: Mutex<()>,
    /// identity id -> lock held across that identity's join, leave and
    /// live message delivery. Never held across an `.await`.
    identity_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    next_handle: AtomicU64,
    started_at: Instant,
}

impl SharedState {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn MessageStore>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            presence: PresenceRegistry::new(),
            connections: Mutex::new(HashMap::new()),
            store,
            verifier,
            announce_lock: Mutex::new(()),
            identity_locks: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            started_at: Instant::now(),
        })
    }

    pub fn next_handle(&self) -> ConnectionHandle {
        ConnectionHandle::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    pub fn attach(&self, handle: ConnectionHandle, outbox: Outbox) {
        self.connections.lock().insert(handle, outbox);
    }

    pub fn detach(&self, handle: ConnectionHandle) {
        self.connections.lock().remove(&handle);
    }

    fn outbox(&self, handle: ConnectionHandle) -> Option<Outbox> {
        self.connections.lock().get(&handle).cloned()
    }

    /// Queue an event for one connection. Unknown handles are skipped.
    pub fn deliver(&self, handle: ConnectionHandle, event: ServerEvent) -> bool {
        self.outbox(handle).is_some_and(|outbox| outbox.push(event))
    }

    pub fn deliver_history(&self, handle: ConnectionHandle, messages: Vec<Message>) -> bool {
        self.outbox(handle)
            .is_some_and(|outbox| outbox.push_history(messages))
    }

    pub fn deliver_message(&self, handle: ConnectionHandle, message: &Message) -> bool {
        self.outbox(handle)
            .is_some_and(|outbox| outbox.push_message(message))
    }

    pub fn identity_lock(&self, identity_id: &str) -> Arc<Mutex<()>> {
        self.identity_locks
            .lock()
            .entry(identity_id.to_string())
            .or_default()
            .clone()
    }

    /// Locks for both parties of a message, once each, in id order.
    pub fn pair_locks(&self, a: &str, b: &str) -> Vec<Arc<Mutex<()>>> {
        BTreeSet::from([a, b])
            .into_iter()
            .map(|id| self.identity_lock(id))
            .collect()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Flip every identity still marked online to offline.
    pub fn shutdown_cleanup(&self) {
        match self.store.mark_all_offline(chrono::Utc::now()) {
            Ok(n) => tracing::info!("Marked {n} identities offline"),
            Err(e) => tracing::error!("Failed to mark identities offline on shutdown: {e}"),
        }
    }
}

pub struct Server {
    config: ServerConfig,
    store: Option<Arc<dyn MessageStore>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            store: None,
        }
    }

    /// Create a server over an existing store (for testing).
    pub fn with_store(config: ServerConfig, store: Arc<dyn MessageStore>) -> Self {
        Self {
            config,
            store: Some(store),
        }
    }

    /// Build SharedState, opening the database if none was supplied.
    fn build_state(&self) -> Result<Arc<SharedState>> {
        let store: Arc<dyn MessageStore> = match (&self.store, &self.config.db_path) {
            (Some(store), _) => Arc::clone(store),
            (None, Some(path)) => {
                tracing::info!("Opening database: {path}");
                Arc::new(SqliteStore::open(path).context("Failed to open database")?)
            }
            (None, None) => {
                tracing::warn!("No --db-path given, messages will not survive a restart");
                Arc::new(SqliteStore::open_memory().context("Failed to open in-memory database")?)
            }
        };
        if self.config.uses_dev_secret() {
            tracing::warn!("Using the built-in development token secret; set MURMUR_TOKEN_SECRET");
        }
        let verifier = TokenVerifier::new(self.config.token_secret.as_bytes(), Arc::clone(&store))?;
        Ok(SharedState::new(self.config.clone(), store, Arc::new(verifier)))
    }

    /// Run the server until Ctrl-C, then mark everyone offline.
    pub async fn run(self) -> Result<()> {
        let state = self.build_state()?;
        let listener = TcpListener::bind(self.config.listen_addr.as_str()).await?;
        tracing::info!("HTTP/WebSocket listener on {}", self.config.listen_addr);

        let router = crate::web::router(Arc::clone(&state));
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for Ctrl-C: {e}");
                    std::future::pending::<()>().await;
                }
                tracing::info!("Received shutdown signal, cleaning up...");
            })
            .await
            .context("Server error");

        state.shutdown_cleanup();
        tracing::info!("Shutdown complete");
        result
    }

    /// Start the server and return the bound address, state and task handle (for testing).
    pub async fn start(self) -> Result<(SocketAddr, Arc<SharedState>, JoinHandle<Result<()>>)> {
        let state = self.build_state()?;
        let listener = TcpListener::bind(self.config.listen_addr.as_str()).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");

        let router = crate::web::router(Arc::clone(&state));
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await?;
            Ok(())
        });
        Ok((addr, state, handle))
    }
}
