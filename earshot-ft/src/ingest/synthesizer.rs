//! Play-event synthesis
//!
//! Turns raw snapshot batches into open/close/touch operations against the
//! event store. The synthesizer holds the last-known state per friend and
//! is the only component allowed to decide event boundaries.
//!
//! Processing is staged: [`Synthesizer::process`] and
//! [`Synthesizer::sweep`] are read-only and return a [`SynthesisOutcome`];
//! committed state only changes via [`Synthesizer::commit`] after the
//! store transaction has landed. A failed write therefore leaves the state
//! machine exactly where it was, and the next poll re-synthesizes the same
//! operations.

use crate::error::Error;
use crate::source::Snapshot;
use crate::store::EventOp;
use chrono::{DateTime, Duration, Utc};
use earshot_common::db::models::{EndReason, PlayEvent};
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

/// Last-known listening state for one friend.
#[derive(Debug, Clone)]
pub struct FriendState {
    pub friend_id: String,
    pub track_id: String,
    pub artist_id: String,
    pub context_id: Option<String>,
    /// Newest feed timestamp accepted for this friend. Snapshots older
    /// than this are stale.
    pub last_seen_at: DateTime<Utc>,
    /// Start of the current listening session (survives track changes)
    pub session_started_at: DateTime<Utc>,
    /// The friend's open event, if any. `None` after an idle close.
    pub open_event_id: Option<Uuid>,
    pub open_started_at: Option<DateTime<Utc>>,
}

/// Result of synthesizing one batch or one idle sweep.
#[derive(Debug, Default)]
pub struct SynthesisOutcome {
    /// Store operations, in application order
    pub ops: Vec<EventOp>,
    /// State replacements to commit once the store transaction lands
    pub staged: HashMap<String, FriendState>,
    /// Snapshots accepted for catalog refresh; stale ones are excluded
    pub catalog: Vec<Snapshot>,
    /// Snapshots that repeated an already-known observation
    pub deduped: usize,
    /// Snapshots dropped for being older than committed state
    pub stale_dropped: usize,
}

impl SynthesisOutcome {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.staged.is_empty() && self.catalog.is_empty()
    }
}

struct Step {
    ops: Vec<EventOp>,
    /// Replacement state, or `None` when the snapshot changed nothing
    next: Option<FriendState>,
    deduped: bool,
}

pub struct Synthesizer {
    idle_threshold: Duration,
    states: HashMap<String, FriendState>,
}

impl Synthesizer {
    pub fn new(idle_threshold: Duration) -> Self {
        Self {
            idle_threshold,
            states: HashMap::new(),
        }
    }

    /// Rebuild per-friend state from the newest stored event per friend.
    ///
    /// Open events resume exactly where they left off. Closed events still
    /// seed the comparison state, so a lingering feed entry for a play we
    /// already closed dedups instead of opening a duplicate.
    pub fn from_latest_events(idle_threshold: Duration, latest: &[PlayEvent]) -> Self {
        let mut states = HashMap::new();
        for event in latest {
            // A closed event has already recorded the interval through
            // ended_at; observations inside it must read as stale
            let last_seen_at = match event.ended_at {
                Some(ended_at) => ended_at.max(event.last_seen_at),
                None => event.last_seen_at,
            };
            let state = FriendState {
                friend_id: event.friend_id.clone(),
                track_id: event.track_id.clone(),
                artist_id: event.artist_id.clone(),
                context_id: event.context_id.clone(),
                last_seen_at,
                session_started_at: event.started_at,
                open_event_id: event.is_open().then_some(event.event_id),
                open_started_at: event.is_open().then_some(event.started_at),
            };
            states.insert(event.friend_id.clone(), state);
        }
        Self {
            idle_threshold,
            states,
        }
    }

    pub fn friend_count(&self) -> usize {
        self.states.len()
    }

    pub fn state(&self, friend_id: &str) -> Option<&FriendState> {
        self.states.get(friend_id)
    }

    /// Synthesize operations for one snapshot batch. Does not mutate the
    /// committed state; later snapshots in the batch see the staged state
    /// of earlier ones, so a batch may carry several transitions for the
    /// same friend.
    pub fn process(&self, batch: &[Snapshot]) -> SynthesisOutcome {
        let mut outcome = SynthesisOutcome::default();

        for snapshot in batch {
            let prior = outcome
                .staged
                .get(&snapshot.friend_id)
                .or_else(|| self.states.get(&snapshot.friend_id))
                .cloned();

            match self.step(prior.as_ref(), snapshot) {
                Ok(step) => {
                    outcome.ops.extend(step.ops);
                    if let Some(next) = step.next {
                        outcome.staged.insert(snapshot.friend_id.clone(), next);
                    }
                    outcome.catalog.push(snapshot.clone());
                    if step.deduped {
                        outcome.deduped += 1;
                    }
                }
                Err(Error::StaleSnapshot {
                    friend_id,
                    observed_at,
                    last_seen_at,
                }) => {
                    warn!(
                        friend_id = %friend_id,
                        observed_at = %observed_at,
                        last_seen_at = %last_seen_at,
                        "dropping stale snapshot"
                    );
                    outcome.stale_dropped += 1;
                }
                Err(e) => {
                    warn!(friend_id = %snapshot.friend_id, "snapshot rejected: {}", e);
                    outcome.stale_dropped += 1;
                }
            }
        }

        outcome
    }

    /// Close events whose friends have gone quiet. An open event whose
    /// `last_seen_at` is more than the idle threshold behind `now` is
    /// closed at `last_seen_at + idle_threshold` with [`EndReason::Idle`].
    ///
    /// The staged state's `last_seen_at` advances to the close boundary:
    /// the interval up to there has been recorded, so any later snapshot
    /// observed inside it is stale.
    pub fn sweep(&self, now: DateTime<Utc>) -> SynthesisOutcome {
        let mut outcome = SynthesisOutcome::default();

        for state in self.states.values() {
            if state.open_event_id.is_none() {
                continue;
            }
            if now.signed_duration_since(state.last_seen_at) <= self.idle_threshold {
                continue;
            }
            let boundary = state.last_seen_at + self.idle_threshold;
            if let Some(closed) = close_open(state, boundary) {
                debug!(
                    friend_id = %state.friend_id,
                    event_id = %closed.event_id,
                    "idle sweep closing event"
                );
                outcome.ops.push(EventOp::Close(closed));
                let mut next = state.clone();
                next.last_seen_at = boundary;
                next.open_event_id = None;
                next.open_started_at = None;
                outcome.staged.insert(state.friend_id.clone(), next);
            }
        }

        outcome
    }

    /// Fold staged states into committed state. Called only after the
    /// corresponding store transaction has committed.
    pub fn commit(&mut self, staged: HashMap<String, FriendState>) {
        for (friend_id, state) in staged {
            self.states.insert(friend_id, state);
        }
    }

    fn step(&self, prior: Option<&FriendState>, snapshot: &Snapshot) -> Result<Step, Error> {
        let prior = match prior {
            None => {
                debug!(
                    friend_id = %snapshot.friend_id,
                    track_id = %snapshot.track_id,
                    "first observation, opening event"
                );
                let (event, next) = open_state(snapshot);
                return Ok(Step {
                    ops: vec![EventOp::Open(event)],
                    next: Some(next),
                    deduped: false,
                });
            }
            Some(prior) => prior,
        };

        if snapshot.observed_at < prior.last_seen_at {
            return Err(stale(snapshot, prior));
        }

        let unchanged = snapshot.track_id == prior.track_id
            && snapshot.artist_id == prior.artist_id
            && snapshot.context_id == prior.context_id;
        let gap = snapshot.observed_at.signed_duration_since(prior.last_seen_at);

        if gap == Duration::zero() {
            if unchanged {
                // The feed repeats the last transition until the next one
                return Ok(Step {
                    ops: Vec::new(),
                    next: None,
                    deduped: true,
                });
            }
            // A real transition always advances the feed timestamp; a
            // changed triple at the same instant is reordered history
            return Err(stale(snapshot, prior));
        }

        if gap <= self.idle_threshold {
            if unchanged {
                let mut next = prior.clone();
                next.last_seen_at = snapshot.observed_at;
                return Ok(match prior.open_event_id {
                    Some(event_id) => Step {
                        ops: vec![EventOp::Touch {
                            event_id,
                            last_seen_at: snapshot.observed_at,
                        }],
                        next: Some(next),
                        deduped: true,
                    },
                    // Listening resumed after an idle close: new event,
                    // same session
                    None => {
                        let (event, mut reopened) = open_state(snapshot);
                        reopened.session_started_at = prior.session_started_at;
                        Step {
                            ops: vec![EventOp::Open(event)],
                            next: Some(reopened),
                            deduped: false,
                        }
                    }
                });
            }

            // Track or context changed within the session
            let mut ops = Vec::new();
            if let Some(mut closed) = close_open(prior, snapshot.observed_at) {
                closed.end_reason = Some(EndReason::TrackChange);
                ops.push(EventOp::Close(closed));
            }
            let (event, mut next) = open_state(snapshot);
            next.session_started_at = prior.session_started_at;
            ops.push(EventOp::Open(event));
            return Ok(Step {
                ops,
                next: Some(next),
                deduped: false,
            });
        }

        // Gap beyond the idle threshold: the old play ended when the
        // friend went quiet, and a new session starts here
        let mut ops = Vec::new();
        if let Some(closed) = close_open(prior, prior.last_seen_at + self.idle_threshold) {
            ops.push(EventOp::Close(closed));
        }
        let (event, next) = open_state(snapshot);
        ops.push(EventOp::Open(event));
        Ok(Step {
            ops,
            next: Some(next),
            deduped: false,
        })
    }
}

fn stale(snapshot: &Snapshot, prior: &FriendState) -> Error {
    Error::StaleSnapshot {
        friend_id: snapshot.friend_id.clone(),
        observed_at: snapshot.observed_at,
        last_seen_at: prior.last_seen_at,
    }
}

/// Build the open event and replacement state for a snapshot.
fn open_state(snapshot: &Snapshot) -> (PlayEvent, FriendState) {
    let event = PlayEvent {
        event_id: Uuid::new_v4(),
        friend_id: snapshot.friend_id.clone(),
        track_id: snapshot.track_id.clone(),
        artist_id: snapshot.artist_id.clone(),
        context_id: snapshot.context_id.clone(),
        started_at: snapshot.observed_at,
        ended_at: None,
        end_reason: None,
        last_seen_at: snapshot.observed_at,
    };
    let state = FriendState {
        friend_id: snapshot.friend_id.clone(),
        track_id: snapshot.track_id.clone(),
        artist_id: snapshot.artist_id.clone(),
        context_id: snapshot.context_id.clone(),
        last_seen_at: snapshot.observed_at,
        session_started_at: snapshot.observed_at,
        open_event_id: Some(event.event_id),
        open_started_at: Some(event.started_at),
    };
    (event, state)
}

/// The closed form of a friend's open event, defaulting to an idle close.
/// Returns `None` when the friend has no open event.
fn close_open(prior: &FriendState, ended_at: DateTime<Utc>) -> Option<PlayEvent> {
    let event_id = prior.open_event_id?;
    let started_at = prior.open_started_at?;
    Some(PlayEvent {
        event_id,
        friend_id: prior.friend_id.clone(),
        track_id: prior.track_id.clone(),
        artist_id: prior.artist_id.clone(),
        context_id: prior.context_id.clone(),
        started_at,
        ended_at: Some(ended_at),
        end_reason: Some(EndReason::Idle),
        last_seen_at: prior.last_seen_at,
    })
}
