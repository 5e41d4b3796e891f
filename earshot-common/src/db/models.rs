//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why a play event was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The friend switched to a different track, artist, or context
    TrackChange,
    /// No observation arrived within the idle threshold
    Idle,
}

impl EndReason {
    pub fn from_db_str(s: &str) -> Option<EndReason> {
        match s {
            "track_change" => Some(EndReason::TrackChange),
            "idle" => Some(EndReason::Idle),
            _ => None,
        }
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            EndReason::TrackChange => "track_change",
            EndReason::Idle => "idle",
        }
    }
}

/// A deduplicated interval during which a friend was observed listening to
/// one track.
///
/// Immutable once `ended_at` is set. `last_seen_at` is the newest observation
/// covered by the event; it keeps advancing only while the event is open and
/// is what restart recovery reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayEvent {
    pub event_id: Uuid,
    pub friend_id: String,
    pub track_id: String,
    pub artist_id: String,
    pub context_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    pub last_seen_at: DateTime<Utc>,
}

impl PlayEvent {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Catalog row for a friend seen in the presence feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Friend {
    pub friend_id: String,
    pub name: String,
    pub image_url: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_reason_db_round_trip() {
        assert_eq!(
            EndReason::from_db_str("track_change"),
            Some(EndReason::TrackChange)
        );
        assert_eq!(EndReason::from_db_str("idle"), Some(EndReason::Idle));
        assert_eq!(EndReason::from_db_str("unknown"), None);

        assert_eq!(EndReason::TrackChange.to_db_string(), "track_change");
        assert_eq!(EndReason::Idle.to_db_string(), "idle");
    }

    #[test]
    fn test_end_reason_serde_snake_case() {
        let json = serde_json::to_string(&EndReason::TrackChange).unwrap();
        assert_eq!(json, "\"track_change\"");
    }

    #[test]
    fn test_play_event_is_open() {
        let mut event = PlayEvent {
            event_id: Uuid::new_v4(),
            friend_id: "spotify:user:alice".to_string(),
            track_id: "spotify:track:t1".to_string(),
            artist_id: "spotify:artist:a1".to_string(),
            context_id: None,
            started_at: crate::time::from_unix_seconds(1_000),
            ended_at: None,
            end_reason: None,
            last_seen_at: crate::time::from_unix_seconds(1_000),
        };
        assert!(event.is_open());

        event.ended_at = Some(crate::time::from_unix_seconds(1_200));
        event.end_reason = Some(EndReason::TrackChange);
        assert!(!event.is_open());
    }
}
