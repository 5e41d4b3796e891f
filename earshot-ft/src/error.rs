//! Error types for the friend tracker

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the ingestion pipeline and event store.
#[derive(Error, Debug)]
pub enum Error {
    /// The snapshot source could not be reached (network failure, non-auth
    /// HTTP error). Retryable.
    #[error("Snapshot source unavailable: {0}")]
    SourceUnavailable(String),

    /// The source rejected our credentials. Not retryable; ingestion halts
    /// until the operator supplies fresh credentials.
    #[error("Snapshot source authentication expired")]
    AuthExpired,

    /// The source answered with a payload we could not interpret.
    #[error("Malformed snapshot feed: {0}")]
    MalformedFeed(String),

    /// A snapshot is older than the state we already hold for that friend.
    /// The snapshot is dropped; the rest of the batch proceeds.
    #[error("Stale snapshot for friend {friend_id}: observed {observed_at}, last seen {last_seen_at}")]
    StaleSnapshot {
        friend_id: String,
        observed_at: DateTime<Utc>,
        last_seen_at: DateTime<Utc>,
    },

    /// Attempted to close an event that already has an end timestamp.
    /// The first close wins; later closes are rejected.
    #[error("Event {0} is already closed")]
    AlreadyClosed(Uuid),

    /// The event store rejected a batch after exhausting write retries.
    #[error("Event store write failed: {0}")]
    StorageWrite(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Common(#[from] earshot_common::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
