//! SQLite persistence layer.
//!
//! Stores the user directory (display name, online flag, last-seen) and
//! the append-only message log. Uses WAL mode for concurrent reads during
//! writes.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Result as SqlResult, params};

use crate::msgid;
use crate::protocol::{Identity, Message};

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

/// A row of the user directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRow {
    pub identity: Identity,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

const MESSAGE_COLUMNS: &str =
    "msgid, text, sender_id, sender_name, recipient_id, recipient_name, created_at";

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing and ephemeral runs).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id           TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                online       INTEGER NOT NULL DEFAULT 0,
                last_seen    INTEGER
            );

            CREATE TABLE IF NOT EXISTS messages (
                seq            INTEGER PRIMARY KEY AUTOINCREMENT,
                msgid          TEXT NOT NULL UNIQUE,
                text           TEXT NOT NULL,
                sender_id      TEXT NOT NULL,
                sender_name    TEXT NOT NULL,
                recipient_id   TEXT NOT NULL,
                recipient_name TEXT,
                created_at     INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender_id, seq);
            CREATE INDEX IF NOT EXISTS idx_messages_recipient ON messages(recipient_id, seq);
            ",
        )?;
        Ok(())
    }

    // ── Users ──────────────────────────────────────────────────────────

    /// Insert a user or update their display name.
    pub fn upsert_user(&self, identity: &Identity) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO users (id, display_name) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET display_name=excluded.display_name",
            params![identity.id, identity.display_name],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: &str) -> SqlResult<Option<UserRow>> {
        self.conn
            .query_row(
                "SELECT id, display_name, online, last_seen FROM users WHERE id = ?1",
                params![id],
                map_user_row,
            )
            .optional()
    }

    /// All users, ordered by display name.
    pub fn list_users(&self) -> SqlResult<Vec<UserRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, display_name, online, last_seen FROM users
             ORDER BY display_name COLLATE NOCASE, id",
        )?;
        let rows = stmt.query_map([], map_user_row)?;
        rows.collect()
    }

    pub fn set_online(&self, id: &str) -> SqlResult<()> {
        self.conn
            .execute("UPDATE users SET online = 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn set_offline(&self, id: &str, last_seen: DateTime<Utc>) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE users SET online = 0, last_seen = ?2 WHERE id = ?1",
            params![id, last_seen.timestamp_millis()],
        )?;
        Ok(())
    }

    /// Flip every online user offline. Returns how many rows changed.
    pub fn mark_all_offline(&self, at: DateTime<Utc>) -> SqlResult<usize> {
        self.conn.execute(
            "UPDATE users SET online = 0, last_seen = ?1 WHERE online = 1",
            params![at.timestamp_millis()],
        )
    }

    // ── Messages ───────────────────────────────────────────────────────

    /// Append a message. The id and creation time are assigned here.
    pub fn insert_message(
        &self,
        sender: &Identity,
        recipient: &Identity,
        text: &str,
    ) -> SqlResult<Message> {
        let created_at = Utc::now();
        let id = msgid::generate();
        self.conn.execute(
            "INSERT INTO messages (msgid, text, sender_id, sender_name, recipient_id, recipient_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                text,
                sender.id,
                sender.display_name,
                recipient.id,
                recipient.display_name,
                created_at.timestamp_millis(),
            ],
        )?;
        Ok(Message {
            id,
            text: text.to_string(),
            sender_id: sender.id.clone(),
            sender_display_name: sender.display_name.clone(),
            recipient_id: recipient.id.clone(),
            recipient_display_name: Some(recipient.display_name.clone()),
            created_at: truncate_to_millis(created_at),
        })
    }

    /// Most recent messages sent or received by `user_id`, oldest-first.
    pub fn messages_for_user(&self, user_id: &str, limit: usize) -> SqlResult<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE sender_id = ?1 OR recipient_id = ?1
             ORDER BY seq DESC LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, sql_limit(limit)], map_message_row)?;
        oldest_first(rows.collect())
    }

    /// Messages exchanged between `a` and `b`, oldest-first.
    /// `before`: a message id; if Some, only messages stored before it
    /// (for pagination). An unknown id pages from the newest message.
    pub fn conversation(
        &self,
        a: &str,
        b: &str,
        limit: usize,
        before: Option<&str>,
    ) -> SqlResult<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE ((sender_id = ?1 AND recipient_id = ?2) OR (sender_id = ?2 AND recipient_id = ?1))
               AND seq < COALESCE((SELECT seq FROM messages WHERE msgid = ?3), {max})
             ORDER BY seq DESC LIMIT ?4",
            max = i64::MAX
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![a, b, before, sql_limit(limit)], map_message_row)?;
        oldest_first(rows.collect())
    }

    pub fn message_count(&self) -> SqlResult<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

fn oldest_first(rows: SqlResult<Vec<Message>>) -> SqlResult<Vec<Message>> {
    let mut rows = rows?;
    rows.reverse();
    Ok(rows)
}

/// SQLite reads a negative LIMIT as unbounded, so saturate instead of wrapping.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn truncate_to_millis(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(t.timestamp_millis()).unwrap_or(t)
}

fn millis_to_datetime(idx: usize, ms: i64) -> SqlResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn map_user_row(row: &rusqlite::Row) -> SqlResult<UserRow> {
    let last_seen = match row.get::<_, Option<i64>>(3)? {
        Some(ms) => Some(millis_to_datetime(3, ms)?),
        None => None,
    };
    Ok(UserRow {
        identity: Identity {
            id: row.get(0)?,
            display_name: row.get(1)?,
        },
        online: row.get::<_, i64>(2)? != 0,
        last_seen,
    })
}

fn map_message_row(row: &rusqlite::Row) -> SqlResult<Message> {
    Ok(Message {
        id: row.get(0)?,
        text: row.get(1)?,
        sender_id: row.get(2)?,
        sender_display_name: row.get(3)?,
        recipient_id: row.get(4)?,
        recipient_display_name: row.get(5)?,
        created_at: millis_to_datetime(6, row.get(6)?)?,
    })
}
