//! Snapshot sources
//!
//! A snapshot source produces point-in-time observations of what each
//! friend is listening to. The production source is the Spotify buddylist
//! endpoint ([`spotify::SpotifyPresenceClient`]); tests substitute scripted
//! sources through the [`SnapshotSource`] trait.

pub mod spotify;

use chrono::{DateTime, Utc};
use std::future::Future;
use thiserror::Error;

pub use spotify::SpotifyPresenceClient;

/// One observation of one friend's current listening state.
///
/// Carries both the identity fields the synthesizer compares and the
/// display metadata the store's catalog tables cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub friend_id: String,
    /// Feed-reported time of the friend's last listening transition
    pub observed_at: DateTime<Utc>,
    pub track_id: String,
    pub artist_id: String,
    /// Playback context (playlist, album, artist radio), if reported
    pub context_id: Option<String>,

    // Catalog metadata
    pub friend_name: String,
    pub friend_image_url: Option<String>,
    pub track_name: String,
    pub artist_name: String,
    pub album_id: Option<String>,
    pub album_name: Option<String>,
    pub track_image_url: Option<String>,
}

/// Errors from a snapshot source poll.
#[derive(Error, Debug)]
pub enum SourceError {
    /// Transient failure: network error or non-auth HTTP failure. Retried
    /// with backoff.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// Credentials rejected. Fatal for the ingestion loop.
    #[error("authentication expired")]
    AuthExpired,

    /// Response body did not parse. Not retried within the cycle; the
    /// payload will not improve on immediate retry.
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// A pollable source of friend-activity snapshots.
pub trait SnapshotSource: Send + Sync {
    /// Fetch the current snapshot batch. Returns only entries considered
    /// active; ordering within the batch is not significant.
    fn poll(&self) -> impl Future<Output = Result<Vec<Snapshot>, SourceError>> + Send;
}
