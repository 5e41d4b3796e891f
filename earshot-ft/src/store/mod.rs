//! Durable play-event store
//!
//! All writes go through the ingestion pipeline; the API only reads. An
//! event's natural key is `(friend_id, started_at)` and appends are
//! idempotent on it, so redelivered batches collapse onto the canonical
//! rows instead of duplicating them.

pub mod catalog;

use crate::error::{Error, Result};
use crate::source::Snapshot;
use chrono::{DateTime, Utc};
use earshot_common::db::models::{EndReason, PlayEvent};
use earshot_common::time;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::warn;
use uuid::Uuid;

/// A staged store mutation, applied inside one batch transaction.
#[derive(Debug, Clone)]
pub enum EventOp {
    /// Append a new open event. Idempotent on `(friend_id, started_at)`.
    Open(PlayEvent),
    /// Close an open event. The first close wins; the payload carries the
    /// fully-closed event so aggregates can apply it without a re-read.
    Close(PlayEvent),
    /// Advance `last_seen_at` on an open event.
    Touch {
        event_id: Uuid,
        last_seen_at: DateTime<Utc>,
    },
}

/// Result of appending a single event.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Inserted,
    /// The idempotency key already existed. `canonical_event_id` is the id
    /// of the row that won the original insert.
    Duplicate { canonical_event_id: Uuid },
}

/// Counters and id remappings from one applied batch.
#[derive(Debug, Default, Clone)]
pub struct BatchApply {
    pub inserted: u64,
    pub deduplicated: u64,
    pub closed: u64,
    pub already_closed: u64,
    pub touched: u64,
    /// Staged event id -> canonical event id, for opens that hit an
    /// existing row
    pub remapped: Vec<(Uuid, Uuid)>,
}

/// Filter for [`EventStore::query`]. Unset fields match everything.
#[derive(Debug, Default, Clone)]
pub struct EventFilter {
    pub friend_id: Option<String>,
    pub artist_id: Option<String>,
    pub track_id: Option<String>,
    /// Inclusive lower bound on `started_at`
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `started_at`
    pub to: Option<DateTime<Utc>>,
    pub only_closed: bool,
    pub newest_first: bool,
    pub limit: Option<u32>,
}

#[derive(Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Append an open event. On an idempotency-key collision the existing
    /// row is left untouched and its id is returned.
    pub async fn append(&self, event: &PlayEvent) -> Result<AppendOutcome> {
        let result = insert_open_event(&self.pool, event).await?;
        if result.rows_affected() > 0 {
            return Ok(AppendOutcome::Inserted);
        }
        let canonical = canonical_event_id(&self.pool, &event.friend_id, event.started_at).await?;
        Ok(AppendOutcome::Duplicate {
            canonical_event_id: canonical,
        })
    }

    /// Close an open event. Returns [`Error::AlreadyClosed`] if the event
    /// already has an end timestamp; the stored interval is not modified.
    pub async fn close(
        &self,
        event_id: Uuid,
        ended_at: DateTime<Utc>,
        reason: EndReason,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE play_events
            SET ended_at = ?, end_reason = ?
            WHERE event_id = ? AND ended_at IS NULL
            "#,
        )
        .bind(ended_at.timestamp())
        .bind(reason.to_db_string())
        .bind(event_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM play_events WHERE event_id = ?")
            .bind(event_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Err(Error::AlreadyClosed(event_id)),
            None => Err(Error::InvalidInput(format!("unknown event {}", event_id))),
        }
    }

    /// Apply a synthesized batch in one transaction: catalog refreshes for
    /// every accepted snapshot, then the event ops in order. Either the
    /// whole batch lands or none of it does.
    pub async fn apply_batch(&self, snapshots: &[Snapshot], ops: &[EventOp]) -> Result<BatchApply> {
        let mut tx = self.pool.begin().await?;
        let mut applied = BatchApply::default();

        for snapshot in snapshots {
            catalog::upsert_snapshot(&mut tx, snapshot).await?;
        }

        for op in ops {
            match op {
                EventOp::Open(event) => {
                    let result = insert_open_event(&mut *tx, event).await?;
                    if result.rows_affected() > 0 {
                        applied.inserted += 1;
                    } else {
                        let canonical =
                            canonical_event_id(&mut *tx, &event.friend_id, event.started_at)
                                .await?;
                        applied.remapped.push((event.event_id, canonical));
                        applied.deduplicated += 1;
                    }
                }
                EventOp::Close(event) => {
                    let (ended_at, reason) = match (event.ended_at, event.end_reason) {
                        (Some(ended_at), Some(reason)) => (ended_at, reason),
                        _ => {
                            warn!(event_id = %event.event_id, "close op without end data, skipping");
                            applied.already_closed += 1;
                            continue;
                        }
                    };
                    let result = sqlx::query(
                        r#"
                        UPDATE play_events
                        SET ended_at = ?, end_reason = ?
                        WHERE event_id = ? AND ended_at IS NULL
                        "#,
                    )
                    .bind(ended_at.timestamp())
                    .bind(reason.to_db_string())
                    .bind(event.event_id.to_string())
                    .execute(&mut *tx)
                    .await?;

                    if result.rows_affected() > 0 {
                        applied.closed += 1;
                    } else {
                        // First close won earlier; keep the stored interval
                        warn!(event_id = %event.event_id, "event already closed, close op skipped");
                        applied.already_closed += 1;
                    }
                }
                EventOp::Touch {
                    event_id,
                    last_seen_at,
                } => {
                    let result = sqlx::query(
                        r#"
                        UPDATE play_events
                        SET last_seen_at = ?
                        WHERE event_id = ? AND ended_at IS NULL
                        "#,
                    )
                    .bind(last_seen_at.timestamp())
                    .bind(event_id.to_string())
                    .execute(&mut *tx)
                    .await?;
                    if result.rows_affected() > 0 {
                        applied.touched += 1;
                    }
                }
            }
        }

        tx.commit().await?;
        Ok(applied)
    }

    /// Events matching a filter, ordered by `started_at`.
    pub async fn query(&self, filter: &EventFilter) -> Result<Vec<PlayEvent>> {
        let mut sql = String::from(
            "SELECT event_id, friend_id, track_id, artist_id, context_id, \
             started_at, ended_at, end_reason, last_seen_at FROM play_events",
        );

        let mut conditions: Vec<&str> = Vec::new();
        if filter.friend_id.is_some() {
            conditions.push("friend_id = ?");
        }
        if filter.artist_id.is_some() {
            conditions.push("artist_id = ?");
        }
        if filter.track_id.is_some() {
            conditions.push("track_id = ?");
        }
        if filter.from.is_some() {
            conditions.push("started_at >= ?");
        }
        if filter.to.is_some() {
            conditions.push("started_at < ?");
        }
        if filter.only_closed {
            conditions.push("ended_at IS NOT NULL");
        }
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(if filter.newest_first {
            " ORDER BY started_at DESC"
        } else {
            " ORDER BY started_at ASC"
        });
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(friend_id) = &filter.friend_id {
            query = query.bind(friend_id);
        }
        if let Some(artist_id) = &filter.artist_id {
            query = query.bind(artist_id);
        }
        if let Some(track_id) = &filter.track_id {
            query = query.bind(track_id);
        }
        if let Some(from) = filter.from {
            query = query.bind(from.timestamp());
        }
        if let Some(to) = filter.to {
            query = query.bind(to.timestamp());
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit as i64);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_event).collect()
    }

    /// All events with no end timestamp yet.
    pub async fn open_events(&self) -> Result<Vec<PlayEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, friend_id, track_id, artist_id, context_id,
                   started_at, ended_at, end_reason, last_seen_at
            FROM play_events
            WHERE ended_at IS NULL
            ORDER BY friend_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    /// The most recent event per friend, open or closed. This is the
    /// recovery set: it reconstructs each friend's last-known state after
    /// a restart.
    pub async fn latest_per_friend(&self) -> Result<Vec<PlayEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT p.event_id, p.friend_id, p.track_id, p.artist_id, p.context_id,
                   p.started_at, p.ended_at, p.end_reason, p.last_seen_at
            FROM play_events p
            JOIN (
                SELECT friend_id, MAX(started_at) AS max_started_at
                FROM play_events
                GROUP BY friend_id
            ) latest
              ON p.friend_id = latest.friend_id
             AND p.started_at = latest.max_started_at
            ORDER BY p.friend_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    pub async fn count_events(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM play_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Friends holding more than one open event. Always empty unless the
    /// single-writer discipline has been broken; the pipeline logs any
    /// rows it finds here.
    pub async fn open_event_violations(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT friend_id, COUNT(*) AS open_count
            FROM play_events
            WHERE ended_at IS NULL
            GROUP BY friend_id
            HAVING open_count > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

async fn insert_open_event<'e, E>(executor: E, event: &PlayEvent) -> Result<sqlx::sqlite::SqliteQueryResult>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO play_events
            (event_id, friend_id, track_id, artist_id, context_id,
             started_at, ended_at, end_reason, last_seen_at)
        VALUES (?, ?, ?, ?, ?, ?, NULL, NULL, ?)
        ON CONFLICT(friend_id, started_at) DO NOTHING
        "#,
    )
    .bind(event.event_id.to_string())
    .bind(&event.friend_id)
    .bind(&event.track_id)
    .bind(&event.artist_id)
    .bind(&event.context_id)
    .bind(event.started_at.timestamp())
    .bind(event.last_seen_at.timestamp())
    .execute(executor)
    .await?;
    Ok(result)
}

async fn canonical_event_id<'e, E>(
    executor: E,
    friend_id: &str,
    started_at: DateTime<Utc>,
) -> Result<Uuid>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let id: String = sqlx::query_scalar(
        "SELECT event_id FROM play_events WHERE friend_id = ? AND started_at = ?",
    )
    .bind(friend_id)
    .bind(started_at.timestamp())
    .fetch_one(executor)
    .await?;
    parse_event_id(&id)
}

fn row_to_event(row: &SqliteRow) -> Result<PlayEvent> {
    let end_reason = match row.get::<Option<String>, _>("end_reason") {
        Some(raw) => Some(EndReason::from_db_str(&raw).ok_or_else(|| {
            Error::Internal(format!("unrecognized end_reason '{}' in store", raw))
        })?),
        None => None,
    };

    Ok(PlayEvent {
        event_id: parse_event_id(&row.get::<String, _>("event_id"))?,
        friend_id: row.get("friend_id"),
        track_id: row.get("track_id"),
        artist_id: row.get("artist_id"),
        context_id: row.get("context_id"),
        started_at: time::from_unix_seconds(row.get("started_at")),
        ended_at: row
            .get::<Option<i64>, _>("ended_at")
            .map(time::from_unix_seconds),
        end_reason,
        last_seen_at: time::from_unix_seconds(row.get("last_seen_at")),
    })
}

fn parse_event_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| Error::Internal(format!("invalid event id '{}' in store: {}", raw, e)))
}
