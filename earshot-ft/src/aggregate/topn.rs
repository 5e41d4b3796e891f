//! Bounded top-N ranking
//!
//! Keeps full tallies in a map and a small ordered list of the current
//! leaders. Because comparisons always use the full tallies, the leader
//! list is exact: an entity outside it can never silently hold a better
//! score than one inside it. Ties on count rank the more recently played
//! entity first.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct RankedEntry {
    pub id: String,
    pub count: u64,
    pub last_played_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TopNRanking {
    limit: usize,
    /// Full tallies: count and most recent play per entity
    counts: HashMap<String, (u64, DateTime<Utc>)>,
    /// Current leaders, best first, at most `limit` long
    ranked: Vec<String>,
}

impl TopNRanking {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            counts: HashMap::new(),
            ranked: Vec::new(),
        }
    }

    /// Record one play for `id`.
    pub fn increment(&mut self, id: &str, played_at: DateTime<Utc>) {
        let entry = self
            .counts
            .entry(id.to_string())
            .or_insert((0, played_at));
        entry.0 += 1;
        if played_at > entry.1 {
            entry.1 = played_at;
        }
        self.reposition(id);
    }

    /// The current leaders, truncated to `n`.
    pub fn top(&self, n: usize) -> Vec<RankedEntry> {
        self.ranked
            .iter()
            .take(n)
            .map(|id| {
                let (count, last_played_at) =
                    self.counts.get(id).copied().unwrap_or((0, DateTime::UNIX_EPOCH));
                RankedEntry {
                    id: id.clone(),
                    count,
                    last_played_at,
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
        self.ranked.clear();
    }

    fn reposition(&mut self, id: &str) {
        if let Some(pos) = self.ranked.iter().position(|ranked_id| ranked_id == id) {
            self.ranked.remove(pos);
        }
        let insert_at = self
            .ranked
            .iter()
            .position(|ranked_id| self.beats(id, ranked_id))
            .unwrap_or(self.ranked.len());
        if insert_at < self.limit {
            self.ranked.insert(insert_at, id.to_string());
            self.ranked.truncate(self.limit);
        }
    }

    fn beats(&self, a: &str, b: &str) -> bool {
        let score_a = self.counts.get(a).copied().unwrap_or((0, DateTime::UNIX_EPOCH));
        let score_b = self.counts.get(b).copied().unwrap_or((0, DateTime::UNIX_EPOCH));
        match score_a.0.cmp(&score_b.0) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => score_a.1 > score_b.1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use earshot_common::time;

    fn at(secs: i64) -> DateTime<Utc> {
        time::from_unix_seconds(secs)
    }

    #[test]
    fn test_ranks_by_count() {
        let mut ranking = TopNRanking::new(3);
        for _ in 0..3 {
            ranking.increment("a", at(100));
        }
        ranking.increment("b", at(200));
        ranking.increment("b", at(201));
        ranking.increment("c", at(300));

        let top = ranking.top(3);
        let ids: Vec<&str> = top.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(top[0].count, 3);
        assert_eq!(top[1].count, 2);
    }

    #[test]
    fn test_tie_broken_by_recency() {
        let mut ranking = TopNRanking::new(5);
        for i in 0..5 {
            ranking.increment("a", at(100 + i));
        }
        for i in 0..5 {
            ranking.increment("b", at(200 + i));
        }
        for i in 0..3 {
            ranking.increment("c", at(300 + i));
        }

        // a and b tie at 5 plays; b played more recently
        let ids: Vec<String> = ranking.top(3).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_entity_outside_leaders_can_climb_in() {
        let mut ranking = TopNRanking::new(2);
        ranking.increment("a", at(10));
        ranking.increment("a", at(11));
        ranking.increment("b", at(20));
        ranking.increment("b", at(21));
        // c starts below the leader board
        ranking.increment("c", at(30));
        assert_eq!(ranking.top(2).len(), 2);
        assert!(!ranking.top(2).iter().any(|e| e.id == "c"));

        // two more plays push c past both; b keeps second on recency
        ranking.increment("c", at(31));
        ranking.increment("c", at(32));
        let ids: Vec<String> = ranking.top(2).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[test]
    fn test_top_clamped_to_leader_list() {
        let mut ranking = TopNRanking::new(2);
        ranking.increment("a", at(1));
        ranking.increment("b", at(2));
        ranking.increment("c", at(3));

        // Asking for more than the limit yields only the tracked leaders
        assert_eq!(ranking.top(10).len(), 2);
        assert_eq!(ranking.top(1).len(), 1);
    }

    #[test]
    fn test_recency_updates_on_each_play() {
        let mut ranking = TopNRanking::new(3);
        ranking.increment("a", at(100));
        ranking.increment("a", at(50));

        let top = ranking.top(1);
        assert_eq!(top[0].count, 2);
        // An older play never moves last_played_at backwards
        assert_eq!(top[0].last_played_at, at(100));
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut ranking = TopNRanking::new(3);
        ranking.increment("a", at(1));
        ranking.clear();
        assert!(ranking.is_empty());
        assert!(ranking.top(3).is_empty());
    }
}
