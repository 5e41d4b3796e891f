//! Spotify buddylist client
//!
//! Talks to the undocumented web-player presence endpoint. Two credential
//! paths: a ready-made web-player bearer token, or an `sp_dc` cookie that
//! is exchanged for a bearer token at startup. Bearer tokens expire after
//! roughly an hour; when that happens polls fail with
//! [`SourceError::AuthExpired`] and the ingestion loop halts.

use super::{Snapshot, SnapshotSource, SourceError};
use chrono::{DateTime, Duration, Utc};
use earshot_common::time;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

const BUDDYLIST_URL: &str = "https://guc-spclient.spotify.com/presence-view/v1/buddylist";
const TOKEN_URL: &str =
    "https://open.spotify.com/get_access_token?reason=transport&productType=web_player";
const USER_AGENT: &str = "earshot/0.1 (friend activity tracker)";
const REQUEST_TIMEOUT_SECS: u64 = 30;

// ===== Wire Types =====

#[derive(Debug, Deserialize)]
struct BuddylistResponse {
    #[serde(default)]
    friends: Vec<BuddyEntry>,
}

#[derive(Debug, Deserialize)]
struct BuddyEntry {
    /// Milliseconds since the Unix epoch of the friend's last transition
    timestamp: i64,
    user: BuddyUser,
    track: Option<BuddyTrack>,
}

#[derive(Debug, Deserialize)]
struct BuddyUser {
    uri: String,
    name: Option<String>,
    #[serde(rename = "imageUrl")]
    image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BuddyTrack {
    uri: String,
    name: String,
    #[serde(rename = "imageUrl")]
    image_url: Option<String>,
    album: Option<BuddyAlbum>,
    artist: Option<BuddyArtist>,
    context: Option<BuddyContext>,
}

#[derive(Debug, Deserialize)]
struct BuddyAlbum {
    uri: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BuddyArtist {
    uri: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BuddyContext {
    uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "isAnonymous", default)]
    is_anonymous: bool,
}

// ===== Client =====

/// Client for the Spotify presence-view buddylist endpoint.
pub struct SpotifyPresenceClient {
    http_client: reqwest::Client,
    bearer_token: String,
    active_threshold: Duration,
}

impl SpotifyPresenceClient {
    /// Create a client from an existing web-player bearer token.
    pub fn new(bearer_token: String, active_threshold: Duration) -> Result<Self, SourceError> {
        Ok(Self {
            http_client: build_http_client()?,
            bearer_token,
            active_threshold,
        })
    }

    /// Exchange an `sp_dc` cookie for a bearer token and create a client.
    ///
    /// An anonymous token means the cookie itself has expired: the endpoint
    /// answers 200 with a token that cannot see the buddylist.
    pub async fn from_sp_dc(
        sp_dc: &str,
        active_threshold: Duration,
    ) -> Result<Self, SourceError> {
        let http_client = build_http_client()?;

        let response = http_client
            .get(TOKEN_URL)
            .header(reqwest::header::COOKIE, format!("sp_dc={}", sp_dc))
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(format!("token exchange failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SourceError::AuthExpired);
        }
        if !status.is_success() {
            return Err(SourceError::Unavailable(format!(
                "token exchange returned HTTP {}",
                status.as_u16()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| SourceError::Malformed(format!("token response: {}", e)))?;

        if token.is_anonymous {
            return Err(SourceError::AuthExpired);
        }

        debug!("Exchanged sp_dc cookie for web-player access token");
        Ok(Self {
            http_client,
            bearer_token: token.access_token,
            active_threshold,
        })
    }
}

impl SnapshotSource for SpotifyPresenceClient {
    async fn poll(&self) -> Result<Vec<Snapshot>, SourceError> {
        let response = self
            .http_client
            .get(BUDDYLIST_URL)
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SourceError::AuthExpired);
        }
        if !status.is_success() {
            return Err(SourceError::Unavailable(format!(
                "buddylist returned HTTP {}",
                status.as_u16()
            )));
        }

        let buddylist: BuddylistResponse = response
            .json()
            .await
            .map_err(|e| SourceError::Malformed(e.to_string()))?;

        Ok(filter_active(
            buddylist.friends,
            time::now(),
            self.active_threshold,
        ))
    }
}

fn build_http_client() -> Result<reqwest::Client, SourceError> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()
        .map_err(|e| SourceError::Unavailable(format!("failed to build HTTP client: {}", e)))
}

/// Convert feed entries to snapshots, dropping inactive and malformed ones.
///
/// One bad entry never discards the batch: entries missing the track or
/// artist block are skipped individually.
fn filter_active(entries: Vec<BuddyEntry>, now: DateTime<Utc>, threshold: Duration) -> Vec<Snapshot> {
    let mut snapshots = Vec::with_capacity(entries.len());
    for entry in entries {
        let observed_at = time::from_unix_millis(entry.timestamp);
        if now.signed_duration_since(observed_at) > threshold {
            debug!(
                friend = %entry.user.uri,
                observed_at = %observed_at,
                "skipping inactive feed entry"
            );
            continue;
        }
        match convert_entry(entry, observed_at) {
            Some(snapshot) => snapshots.push(snapshot),
            None => warn!("skipping feed entry with missing track or artist data"),
        }
    }
    snapshots
}

fn convert_entry(entry: BuddyEntry, observed_at: DateTime<Utc>) -> Option<Snapshot> {
    let track = entry.track?;
    let artist = track.artist?;
    let friend_name = entry.user.name.unwrap_or_else(|| entry.user.uri.clone());
    let artist_name = artist.name.unwrap_or_else(|| artist.uri.clone());
    let (album_id, album_name) = match track.album {
        Some(album) => (Some(album.uri), album.name),
        None => (None, None),
    };

    Some(Snapshot {
        friend_id: entry.user.uri,
        observed_at,
        track_id: track.uri,
        artist_id: artist.uri,
        context_id: track.context.and_then(|c| c.uri),
        friend_name,
        friend_image_url: entry.user.image_url,
        track_name: track.name,
        artist_name,
        album_id,
        album_name,
        track_image_url: track.image_url,
    })
}
