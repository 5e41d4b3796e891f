//! Ingestion: snapshot batches in, play events out
//!
//! [`synthesizer`] holds the pure per-friend state machine;
//! [`pipeline`] drives it on timers and owns all store writes.

pub mod pipeline;
pub mod synthesizer;

pub use pipeline::IngestPipeline;
pub use synthesizer::{FriendState, SynthesisOutcome, Synthesizer};
