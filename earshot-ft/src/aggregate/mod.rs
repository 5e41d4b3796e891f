//! Incremental in-memory aggregates
//!
//! Hourly play counts across four dimensions plus bounded top-N rankings,
//! updated as events close. The store remains the source of truth:
//! [`Aggregator::rebuild`] replays every closed event and must land on the
//! same numbers the incremental path produced.

pub mod topn;

pub use topn::{RankedEntry, TopNRanking};

use crate::error::Result;
use crate::params::TrackerParams;
use crate::store::{EventFilter, EventStore};
use chrono::{DateTime, Utc};
use earshot_common::db::models::{EndReason, PlayEvent};
use earshot_common::time;
use std::collections::{BTreeMap, HashMap};
use tracing::info;

/// Aggregation dimensions. `HourOfDay` is the global bucket set; the
/// others are keyed by entity id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dimension {
    HourOfDay,
    Artist,
    Track,
    Friend,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::HourOfDay => "hour_of_day",
            Dimension::Artist => "artist",
            Dimension::Track => "track",
            Dimension::Friend => "friend",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "hour_of_day" => Some(Dimension::HourOfDay),
            "artist" => Some(Dimension::Artist),
            "track" => Some(Dimension::Track),
            "friend" => Some(Dimension::Friend),
            _ => None,
        }
    }
}

/// In-memory aggregate state. Owned behind the shared state's `RwLock`;
/// the pipeline writes, handlers read.
pub struct Aggregator {
    top_n_size: usize,
    count_truncated_plays: bool,
    /// Hourly play counts keyed by (dimension, entity, epoch hour), each
    /// with the end time of the newest event folded in. A BTreeMap so
    /// time-range queries are contiguous range scans.
    buckets: BTreeMap<(Dimension, String, i64), (u64, DateTime<Utc>)>,
    top_artists: TopNRanking,
    top_tracks: TopNRanking,
    top_artists_by_friend: HashMap<String, TopNRanking>,
    top_tracks_by_friend: HashMap<String, TopNRanking>,
    events_applied: u64,
}

impl Aggregator {
    pub fn new(params: &TrackerParams) -> Self {
        let top_n_size = params.top_n_size.max(1) as usize;
        Self {
            top_n_size,
            count_truncated_plays: params.count_truncated_plays,
            buckets: BTreeMap::new(),
            top_artists: TopNRanking::new(top_n_size),
            top_tracks: TopNRanking::new(top_n_size),
            top_artists_by_friend: HashMap::new(),
            top_tracks_by_friend: HashMap::new(),
            events_applied: 0,
        }
    }

    /// Fold one closed event into every dimension. Open events are
    /// ignored; so are idle-truncated plays when the policy excludes them.
    pub fn apply(&mut self, event: &PlayEvent) {
        let (ended_at, reason) = match (event.ended_at, event.end_reason) {
            (Some(ended_at), Some(reason)) => (ended_at, reason),
            _ => return,
        };
        if !self.count_truncated_plays && reason == EndReason::Idle {
            return;
        }

        let hour = time::epoch_hour(event.started_at);
        self.bump(Dimension::HourOfDay, String::new(), hour, ended_at);
        self.bump(Dimension::Artist, event.artist_id.clone(), hour, ended_at);
        self.bump(Dimension::Track, event.track_id.clone(), hour, ended_at);
        self.bump(Dimension::Friend, event.friend_id.clone(), hour, ended_at);

        self.top_artists.increment(&event.artist_id, ended_at);
        self.top_tracks.increment(&event.track_id, ended_at);
        self.top_artists_by_friend
            .entry(event.friend_id.clone())
            .or_insert_with(|| TopNRanking::new(self.top_n_size))
            .increment(&event.artist_id, ended_at);
        self.top_tracks_by_friend
            .entry(event.friend_id.clone())
            .or_insert_with(|| TopNRanking::new(self.top_n_size))
            .increment(&event.track_id, ended_at);

        self.events_applied += 1;
    }

    /// Drop all aggregate state and replay every closed event from the
    /// store in start order. Returns the number of events applied.
    pub async fn rebuild(&mut self, store: &EventStore) -> Result<u64> {
        self.clear();
        let filter = EventFilter {
            only_closed: true,
            ..Default::default()
        };
        let events = store.query(&filter).await?;
        for event in &events {
            self.apply(event);
        }
        info!("Rebuilt aggregates from {} closed events", self.events_applied);
        Ok(self.events_applied)
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.top_artists = TopNRanking::new(self.top_n_size);
        self.top_tracks = TopNRanking::new(self.top_n_size);
        self.top_artists_by_friend.clear();
        self.top_tracks_by_friend.clear();
        self.events_applied = 0;
    }

    pub fn events_applied(&self) -> u64 {
        self.events_applied
    }

    /// Total plays for one entity over an optional time range. The range
    /// resolves at hour granularity.
    pub fn count(
        &self,
        dimension: Dimension,
        key: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> u64 {
        let (lo, hi) = hour_bounds(from, to);
        if lo > hi {
            return 0;
        }
        self.buckets
            .range((dimension, key.to_string(), lo)..=(dimension, key.to_string(), hi))
            .map(|(_, (count, _))| *count)
            .sum()
    }

    /// Plays per hour of day, 24 slots, UTC. Global when `friend_id` is
    /// `None`, otherwise that friend's buckets only.
    pub fn heatmap(
        &self,
        friend_id: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> [u64; 24] {
        let (dimension, key) = match friend_id {
            Some(friend_id) => (Dimension::Friend, friend_id.to_string()),
            None => (Dimension::HourOfDay, String::new()),
        };
        let (lo, hi) = hour_bounds(from, to);
        let mut hours = [0u64; 24];
        if lo > hi {
            return hours;
        }
        for ((_, _, hour), (count, _)) in self
            .buckets
            .range((dimension, key.clone(), lo)..=(dimension, key, hi))
        {
            hours[time::hour_of_day(*hour)] += count;
        }
        hours
    }

    pub fn top_artists(&self, friend_id: Option<&str>, n: usize) -> Vec<RankedEntry> {
        match friend_id {
            None => self.top_artists.top(n),
            Some(friend_id) => self
                .top_artists_by_friend
                .get(friend_id)
                .map(|ranking| ranking.top(n))
                .unwrap_or_default(),
        }
    }

    pub fn top_tracks(&self, friend_id: Option<&str>, n: usize) -> Vec<RankedEntry> {
        match friend_id {
            None => self.top_tracks.top(n),
            Some(friend_id) => self
                .top_tracks_by_friend
                .get(friend_id)
                .map(|ranking| ranking.top(n))
                .unwrap_or_default(),
        }
    }

    fn bump(&mut self, dimension: Dimension, key: String, hour: i64, at: DateTime<Utc>) {
        let bucket = self
            .buckets
            .entry((dimension, key, hour))
            .or_insert((0, at));
        bucket.0 += 1;
        if at > bucket.1 {
            bucket.1 = at;
        }
    }
}

/// Inclusive epoch-hour bounds for an optional [from, to) time range.
/// An hour is included when the range touches any part of it.
fn hour_bounds(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> (i64, i64) {
    if let (Some(from), Some(to)) = (from, to) {
        if from >= to {
            return (1, 0);
        }
    }
    let lo = from.map(time::epoch_hour).unwrap_or(i64::MIN);
    // `to` is exclusive: a boundary exactly on the hour excludes that hour
    let hi = to
        .map(|to| (to.timestamp() - 1).div_euclid(3600))
        .unwrap_or(i64::MAX);
    (lo, hi)
}
