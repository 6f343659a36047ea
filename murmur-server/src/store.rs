//! The persistence boundary consumed by the relay.
//!
//! [`MessageStore`] is the only way the connection engine touches durable
//! state. Every call either fully succeeds or fully fails. [`SqliteStore`]
//! is the shipped implementation over [`Db`].

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::db::{Db, UserRow};
use crate::error::StoreError;
use crate::protocol::{Identity, Message};

pub trait MessageStore: Send + Sync {
    /// Persist a new message; the store assigns its id and creation time.
    fn append(&self, sender: &Identity, recipient: &Identity, text: &str)
    -> Result<Message, StoreError>;

    /// The most recent `limit` messages sent or received by `user_id`,
    /// oldest-first.
    fn recent_for(&self, user_id: &str, limit: usize) -> Result<Vec<Message>, StoreError>;

    /// Messages between two identities, oldest-first.
    fn conversation(
        &self,
        a: &str,
        b: &str,
        limit: usize,
        before: Option<&str>,
    ) -> Result<Vec<Message>, StoreError>;

    fn find_identity(&self, user_id: &str) -> Result<Option<Identity>, StoreError>;

    fn upsert_identity(&self, identity: &Identity) -> Result<(), StoreError>;

    /// The user directory, ordered by display name.
    fn list_users(&self) -> Result<Vec<UserRow>, StoreError>;

    fn set_online(&self, user_id: &str) -> Result<(), StoreError>;

    fn set_offline(&self, user_id: &str, last_seen: DateTime<Utc>) -> Result<(), StoreError>;

    /// Flip every identity still marked online to offline.
    fn mark_all_offline(&self, at: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// SQLite-backed store. One connection, serialized behind a mutex.
pub struct SqliteStore {
    db: Mutex<Db>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Ok(Self::from_db(Db::open(path)?))
    }

    pub fn open_memory() -> Result<Self, StoreError> {
        Ok(Self::from_db(Db::open_memory()?))
    }

    pub fn from_db(db: Db) -> Self {
        Self { db: Mutex::new(db) }
    }

    /// Run a closure with the database.
    pub fn with_db<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Db) -> rusqlite::Result<R>,
    {
        let db = self.db.lock();
        Ok(f(&db)?)
    }
}

impl MessageStore for SqliteStore {
    fn append(
        &self,
        sender: &Identity,
        recipient: &Identity,
        text: &str,
    ) -> Result<Message, StoreError> {
        self.with_db(|db| db.insert_message(sender, recipient, text))
    }

    fn recent_for(&self, user_id: &str, limit: usize) -> Result<Vec<Message>, StoreError> {
        self.with_db(|db| db.messages_for_user(user_id, limit))
    }

    fn conversation(
        &self,
        a: &str,
        b: &str,
        limit: usize,
        before: Option<&str>,
    ) -> Result<Vec<Message>, StoreError> {
        self.with_db(|db| db.conversation(a, b, limit, before))
    }

    fn find_identity(&self, user_id: &str) -> Result<Option<Identity>, StoreError> {
        self.with_db(|db| db.get_user(user_id))
            .map(|row| row.map(|r| r.identity))
    }

    fn upsert_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        self.with_db(|db| db.upsert_user(identity))
    }

    fn list_users(&self) -> Result<Vec<UserRow>, StoreError> {
        self.with_db(|db| db.list_users())
    }

    fn set_online(&self, user_id: &str) -> Result<(), StoreError> {
        self.with_db(|db| db.set_online(user_id))
    }

    fn set_offline(&self, user_id: &str, last_seen: DateTime<Utc>) -> Result<(), StoreError> {
        self.with_db(|db| db.set_offline(user_id, last_seen))
    }

    fn mark_all_offline(&self, at: DateTime<Utc>) -> Result<usize, StoreError> {
        self.with_db(|db| db.mark_all_offline(at))
    }
}
