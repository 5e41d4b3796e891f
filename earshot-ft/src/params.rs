//! Tracker tuning parameters loaded from the settings table
//!
//! Every knob has a compiled-in default so the tracker runs on a fresh
//! database before `init_default_settings` has seeded anything. Values that
//! fail to parse fall back to the default with a warning rather than
//! aborting startup.

use sqlx::SqlitePool;
use std::time::Duration as StdDuration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct TrackerParams {
    /// Seconds between buddylist polls
    pub poll_interval_secs: u64,
    /// Gap beyond which a listening session is considered ended
    pub idle_threshold_secs: u64,
    /// Feed entries older than this are dropped as inactive
    pub active_threshold_secs: u64,
    /// Number of entries kept in each top-N ranking
    pub top_n_size: u64,
    /// Whether idle-truncated plays count toward aggregates
    pub count_truncated_plays: bool,
    /// Poll attempts per cycle before the cycle is marked failed
    pub source_retry_attempts: u64,
    /// Base delay for exponential poll backoff
    pub source_backoff_base_secs: u64,
    /// Upper bound on the poll backoff delay
    pub source_backoff_cap_secs: u64,
    /// Write attempts per batch before the batch is abandoned
    pub storage_retry_attempts: u64,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            poll_interval_secs: 180,
            idle_threshold_secs: 600,
            active_threshold_secs: 300,
            top_n_size: 10,
            count_truncated_plays: true,
            source_retry_attempts: 3,
            source_backoff_base_secs: 4,
            source_backoff_cap_secs: 10,
            storage_retry_attempts: 3,
        }
    }
}

impl TrackerParams {
    /// Load parameters from the settings table, falling back to defaults
    /// for missing or unparseable values.
    pub async fn from_database(pool: &SqlitePool) -> Self {
        let mut params = Self::default();

        params.poll_interval_secs =
            load_u64(pool, "poll_interval_secs", params.poll_interval_secs).await;
        params.idle_threshold_secs =
            load_u64(pool, "idle_threshold_secs", params.idle_threshold_secs).await;
        params.active_threshold_secs =
            load_u64(pool, "active_threshold_secs", params.active_threshold_secs).await;
        params.top_n_size = load_u64(pool, "top_n_size", params.top_n_size).await;
        params.count_truncated_plays = load_bool(
            pool,
            "count_truncated_plays",
            params.count_truncated_plays,
        )
        .await;
        params.source_retry_attempts =
            load_u64(pool, "source_retry_attempts", params.source_retry_attempts).await;
        params.source_backoff_base_secs = load_u64(
            pool,
            "source_backoff_base_secs",
            params.source_backoff_base_secs,
        )
        .await;
        params.source_backoff_cap_secs = load_u64(
            pool,
            "source_backoff_cap_secs",
            params.source_backoff_cap_secs,
        )
        .await;
        params.storage_retry_attempts =
            load_u64(pool, "storage_retry_attempts", params.storage_retry_attempts).await;

        params
    }

    /// Delay between buddylist polls
    pub fn poll_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Idle gap after which an open event is force-closed
    pub fn idle_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_threshold_secs.max(1) as i64)
    }

    /// Feed entries older than this are treated as offline
    pub fn active_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.active_threshold_secs.max(1) as i64)
    }

    /// Cadence of the idle sweep between polls. Half the idle threshold
    /// keeps the close timestamp within T_idle/2 of its ideal value.
    pub fn sweep_interval(&self) -> StdDuration {
        StdDuration::from_secs((self.idle_threshold_secs / 2).max(1))
    }

    /// Staleness cutoff for the status endpoint: two missed polls
    pub fn staleness_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds((self.poll_interval_secs.max(1) * 2) as i64)
    }
}

async fn load_value(pool: &SqlitePool, key: &str) -> Option<String> {
    match sqlx::query_scalar::<_, Option<String>>("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
    {
        Ok(value) => value.flatten(),
        Err(e) => {
            warn!("Failed to read setting {}: {}", key, e);
            None
        }
    }
}

async fn load_u64(pool: &SqlitePool, key: &str, default: u64) -> u64 {
    match load_value(pool, key).await {
        Some(raw) => match raw.parse::<u64>() {
            Ok(value) => value,
            Err(_) => {
                warn!(
                    "Setting {} has invalid value '{}', using default {}",
                    key, raw, default
                );
                default
            }
        },
        None => default,
    }
}

async fn load_bool(pool: &SqlitePool, key: &str, default: bool) -> bool {
    match load_value(pool, key).await {
        Some(raw) => match raw.parse::<bool>() {
            Ok(value) => value,
            Err(_) => {
                warn!(
                    "Setting {} has invalid value '{}', using default {}",
                    key, raw, default
                );
                default
            }
        },
        None => default,
    }
}
