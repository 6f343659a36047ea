//! Error taxonomy.
//!
//! Every variant that can reach a client carries a stable kebab-case
//! `kind()` string; that string is what goes out in `error { kind }`.

use thiserror::Error;

/// Failure to turn a presented token into an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("token is malformed or its signature does not verify")]
    InvalidToken,
    #[error("token has expired")]
    ExpiredToken,
    #[error("token subject is not a known identity")]
    IdentityNotFound,
}

impl AuthError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidToken => "invalid-token",
            Self::ExpiredToken => "expired-token",
            Self::IdentityNotFound => "identity-not-found",
        }
    }
}

/// Rejection of a single `sendMessage`. Reported to the sender only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("message text is empty")]
    EmptyText,
    #[error("message text exceeds the configured limit")]
    TextTooLong,
    #[error("recipient is not a known identity")]
    UnknownRecipient,
    #[error("message could not be persisted")]
    PersistenceFailed,
}

impl SendError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyText => "empty-text",
            Self::TextTooLong => "text-too-long",
            Self::UnknownRecipient => "unknown-recipient",
            Self::PersistenceFailed => "persistence-failed",
        }
    }
}

/// Session-level protocol violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("event could not be decoded")]
    MalformedEvent,
    #[error("join before sending other events")]
    NotJoined,
    #[error("connection has already joined")]
    AlreadyJoined,
    #[error("join identity does not match the authenticated identity")]
    IdentityMismatch,
    #[error("too many events")]
    RateLimited,
}

impl ProtocolError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedEvent => "malformed-event",
            Self::NotJoined => "not-joined",
            Self::AlreadyJoined => "already-joined",
            Self::IdentityMismatch => "identity-mismatch",
            Self::RateLimited => "rate-limited",
        }
    }

    /// Fatal errors close the connection after being reported.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::IdentityMismatch)
    }
}

/// Failure inside the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
