//! # Earshot Friend Tracker (earshot-ft)
//!
//! Daemon that polls Spotify's friend-activity feed, synthesizes
//! deduplicated play events from the raw snapshots, persists them to the
//! shared SQLite event store, and maintains in-memory aggregates for the
//! dashboard query API.
//!
//! ## Architecture
//!
//! A single ingestion pipeline owns all writes:
//!
//! ```text
//! source (poll) -> synthesizer (per-friend state) -> store (one tx per batch)
//!                                                 -> aggregates + SSE fanout
//! ```
//!
//! The HTTP API is read-only (plus one operational rebuild endpoint) and
//! never touches the synthesizer state.

pub mod aggregate;
pub mod api;
pub mod error;
pub mod ingest;
pub mod params;
pub mod source;
pub mod state;
pub mod store;

pub use error::{Error, Result};
pub use params::TrackerParams;
pub use state::SharedState;
