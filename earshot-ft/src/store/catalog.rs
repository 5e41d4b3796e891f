//! Catalog upserts and lookups
//!
//! The catalog tables (friends, artists, tracks) cache display metadata
//! keyed by Spotify URI. Every accepted snapshot refreshes them inside the
//! batch transaction, so play events always have their referents in place
//! before insertion.

use crate::error::Result;
use crate::source::Snapshot;
use earshot_common::db::models::Friend;
use earshot_common::time;
use sqlx::{Row, SqliteConnection, SqlitePool};

/// Refresh the catalog rows a snapshot references.
///
/// Parents first: artist, then track, then friend. `first_seen_at` is set
/// on insert and preserved on update; `last_seen_at` only moves forward.
pub async fn upsert_snapshot(conn: &mut SqliteConnection, snapshot: &Snapshot) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO artists (artist_id, name)
        VALUES (?, ?)
        ON CONFLICT(artist_id) DO UPDATE SET
            name = excluded.name,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(&snapshot.artist_id)
    .bind(&snapshot.artist_name)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO tracks (track_id, name, artist_id, album_id, album_name, image_url)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(track_id) DO UPDATE SET
            name = excluded.name,
            artist_id = excluded.artist_id,
            album_id = excluded.album_id,
            album_name = excluded.album_name,
            image_url = excluded.image_url,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(&snapshot.track_id)
    .bind(&snapshot.track_name)
    .bind(&snapshot.artist_id)
    .bind(&snapshot.album_id)
    .bind(&snapshot.album_name)
    .bind(&snapshot.track_image_url)
    .execute(&mut *conn)
    .await?;

    let observed_at = snapshot.observed_at.timestamp();
    sqlx::query(
        r#"
        INSERT INTO friends (friend_id, name, image_url, first_seen_at, last_seen_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(friend_id) DO UPDATE SET
            name = excluded.name,
            image_url = excluded.image_url,
            last_seen_at = MAX(friends.last_seen_at, excluded.last_seen_at),
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(&snapshot.friend_id)
    .bind(&snapshot.friend_name)
    .bind(&snapshot.friend_image_url)
    .bind(observed_at)
    .bind(observed_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// All known friends, most recently seen first.
pub async fn list_friends(pool: &SqlitePool) -> Result<Vec<Friend>> {
    let rows = sqlx::query(
        r#"
        SELECT friend_id, name, image_url, first_seen_at, last_seen_at
        FROM friends
        ORDER BY last_seen_at DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| Friend {
            friend_id: row.get("friend_id"),
            name: row.get("name"),
            image_url: row.get("image_url"),
            first_seen_at: time::from_unix_seconds(row.get("first_seen_at")),
            last_seen_at: time::from_unix_seconds(row.get("last_seen_at")),
        })
        .collect())
}

pub async fn count_friends(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM friends")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Display name for an artist, if it has been catalogued.
pub async fn artist_name(pool: &SqlitePool, artist_id: &str) -> Result<Option<String>> {
    let name = sqlx::query_scalar("SELECT name FROM artists WHERE artist_id = ?")
        .bind(artist_id)
        .fetch_optional(pool)
        .await?;
    Ok(name)
}

/// Display name for a track, if it has been catalogued.
pub async fn track_name(pool: &SqlitePool, track_id: &str) -> Result<Option<String>> {
    let name = sqlx::query_scalar("SELECT name FROM tracks WHERE track_id = ?")
        .bind(track_id)
        .fetch_optional(pool)
        .await?;
    Ok(name)
}

/// Display name for a friend, if they have been catalogued.
pub async fn friend_name(pool: &SqlitePool, friend_id: &str) -> Result<Option<String>> {
    let name = sqlx::query_scalar("SELECT name FROM friends WHERE friend_id = ?")
        .bind(friend_id)
        .fetch_optional(pool)
        .await?;
    Ok(name)
}
