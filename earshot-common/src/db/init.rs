//! Database initialization
//!
//! Creates the SQLite schema on first run and re-seeds defaults on every
//! start. All statements are idempotent, so concurrent or repeated
//! initialization is safe.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::{info, warn};

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Use sqlite options to create database if it doesn't exist
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // Enable foreign keys
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;

    // WAL keeps dashboard reads from blocking on the ingestion writer
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;

    // Bounded wait on lock contention between ingest and query connections
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    // Schema creation (idempotent - safe to call multiple times).
    // Catalog tables come first: play_events references all three.
    create_settings_table(&pool).await?;
    create_friends_table(&pool).await?;
    create_artists_table(&pool).await?;
    create_tracks_table(&pool).await?;
    create_play_events_table(&pool).await?;

    init_default_settings(&pool).await?;

    Ok(pool)
}

/// Create the settings table
///
/// Stores runtime tunables as key-value pairs.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the friends catalog table
///
/// One row per friend ever observed in the presence feed, refreshed on every
/// ingested snapshot so query responses can carry display names.
pub async fn create_friends_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS friends (
            friend_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            image_url TEXT,
            first_seen_at INTEGER NOT NULL,
            last_seen_at INTEGER NOT NULL,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            CHECK (first_seen_at >= 0),
            CHECK (last_seen_at >= first_seen_at)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_friends_last_seen ON friends(last_seen_at)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the artists catalog table
pub async fn create_artists_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artists (
            artist_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the tracks catalog table
pub async fn create_tracks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tracks (
            track_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            artist_id TEXT NOT NULL REFERENCES artists(artist_id),
            album_id TEXT,
            album_name TEXT,
            image_url TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tracks_artist ON tracks(artist_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the play_events table
///
/// The append-only event log. `UNIQUE (friend_id, started_at)` is the
/// idempotency key for at-least-once delivery from the ingestion pipeline;
/// timestamps are integer Unix seconds so the key compares exactly.
pub async fn create_play_events_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS play_events (
            event_id TEXT PRIMARY KEY,
            friend_id TEXT NOT NULL REFERENCES friends(friend_id),
            track_id TEXT NOT NULL REFERENCES tracks(track_id),
            artist_id TEXT NOT NULL REFERENCES artists(artist_id),
            context_id TEXT,
            started_at INTEGER NOT NULL,
            ended_at INTEGER,
            end_reason TEXT CHECK (end_reason IS NULL OR end_reason IN ('track_change', 'idle')),
            last_seen_at INTEGER NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (friend_id, started_at),
            CHECK (started_at >= 0),
            CHECK (ended_at IS NULL OR ended_at > started_at),
            CHECK ((ended_at IS NULL) = (end_reason IS NULL)),
            CHECK (last_seen_at >= started_at)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for the query filters (time range, artist, track).
    // The UNIQUE constraint already indexes (friend_id, started_at).
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_play_events_started ON play_events(started_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_play_events_artist ON play_events(artist_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_play_events_track ON play_events(track_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_play_events_ended ON play_events(ended_at)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Initialize or update default settings
///
/// Ensures all required settings exist with default values, and resets NULL
/// values back to their defaults.
async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    // Ingestion loop
    ensure_setting(pool, "poll_interval_secs", "180").await?;
    ensure_setting(pool, "idle_threshold_secs", "600").await?;
    ensure_setting(pool, "active_threshold_secs", "300").await?;

    // Aggregation
    ensure_setting(pool, "top_n_size", "10").await?;
    ensure_setting(pool, "count_truncated_plays", "true").await?;

    // Snapshot source retry policy
    ensure_setting(pool, "source_retry_attempts", "3").await?;
    ensure_setting(pool, "source_backoff_base_secs", "4").await?;
    ensure_setting(pool, "source_backoff_cap_secs", "10").await?;

    // Event store retry policy
    ensure_setting(pool, "storage_retry_attempts", "3").await?;

    info!("Default settings initialized");
    Ok(())
}

/// Ensure a setting exists with the specified default value
///
/// If the setting doesn't exist, it will be created with the default.
/// If the setting exists but has a NULL value, it will be reset to the default.
async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM settings WHERE key = ?)")
        .bind(key)
        .fetch_one(pool)
        .await?;

    if !exists {
        // INSERT OR IGNORE handles concurrent initialization: multiple
        // connections may pass the exists check simultaneously
        sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(default_value)
            .execute(pool)
            .await?;

        info!(
            "Initialized setting '{}' with default value: {}",
            key, default_value
        );
        return Ok(());
    }

    let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_one(pool)
        .await?;

    if value.is_none() {
        sqlx::query("UPDATE settings SET value = ? WHERE key = ?")
            .bind(default_value)
            .bind(key)
            .execute(pool)
            .await?;

        warn!(
            "Setting '{}' was NULL, reset to default: {}",
            key, default_value
        );
    }

    Ok(())
}
