//! Ingestion pipeline
//!
//! The single writer. Drives the snapshot source on a poll timer and the
//! idle sweep on a second timer, feeds batches through the synthesizer,
//! applies the resulting operations to the store, and only then updates
//! aggregates and notifies subscribers.
//!
//! Failure containment: a failed store write leaves the synthesizer
//! uncommitted, so the next cycle re-synthesizes the same operations and
//! the idempotent append collapses any partial redelivery. Expired
//! credentials halt the loop; the query API keeps serving whatever was
//! ingested up to that point.

use crate::error::{Error, Result};
use crate::ingest::synthesizer::{SynthesisOutcome, Synthesizer};
use crate::params::TrackerParams;
use crate::source::{Snapshot, SnapshotSource, SourceError};
use crate::state::SharedState;
use crate::store::{BatchApply, EventOp, EventStore};
use earshot_common::events::TrackerEvent;
use earshot_common::time;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct IngestPipeline<S: SnapshotSource> {
    source: S,
    store: EventStore,
    synthesizer: Synthesizer,
    params: TrackerParams,
    state: Arc<SharedState>,
}

impl<S: SnapshotSource> IngestPipeline<S> {
    /// Build the pipeline, recovering per-friend state from the newest
    /// stored event per friend.
    pub async fn new(
        source: S,
        store: EventStore,
        params: TrackerParams,
        state: Arc<SharedState>,
    ) -> Result<Self> {
        let latest = store.latest_per_friend().await?;
        let synthesizer = Synthesizer::from_latest_events(params.idle_threshold(), &latest);
        info!(
            "Recovered state for {} friends ({} stored events total)",
            synthesizer.friend_count(),
            store.count_events().await?
        );
        Ok(Self {
            source,
            store,
            synthesizer,
            params,
            state,
        })
    }

    /// Run until credentials expire. Intended to be spawned as a task.
    pub async fn run(mut self) -> Result<()> {
        let mut poll_timer = interval(self.params.poll_interval());
        poll_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep_timer = interval(self.params.sweep_interval());
        sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            poll_interval_secs = self.params.poll_interval_secs,
            idle_threshold_secs = self.params.idle_threshold_secs,
            "Ingestion pipeline started"
        );

        loop {
            tokio::select! {
                _ = poll_timer.tick() => {
                    match self.poll_cycle().await {
                        Ok(()) => {}
                        Err(Error::AuthExpired) => {
                            error!("Source credentials expired; ingestion halted, query API stays up");
                            self.state.mark_halted("source credentials expired").await;
                            self.state.broadcast_event(TrackerEvent::IngestStalled {
                                reason: "source credentials expired".to_string(),
                                stale_since: self.state.stale_since().await,
                                timestamp: time::now(),
                            });
                            return Err(Error::AuthExpired);
                        }
                        Err(e) => {
                            let failures = self.state.record_failure().await;
                            warn!("Poll cycle failed ({} consecutive): {}", failures, e);
                            self.state.broadcast_event(TrackerEvent::IngestStalled {
                                reason: e.to_string(),
                                stale_since: self.state.stale_since().await,
                                timestamp: time::now(),
                            });
                        }
                    }
                }
                _ = sweep_timer.tick() => {
                    if let Err(e) = self.sweep_cycle().await {
                        warn!("Idle sweep failed: {}", e);
                    }
                }
            }
        }
    }

    /// One poll: fetch, synthesize, apply.
    pub async fn poll_cycle(&mut self) -> Result<()> {
        self.state.record_attempt().await;
        let snapshots = self.poll_with_retry().await?;
        let snapshot_count = snapshots.len();
        debug!("Poll returned {} active snapshots", snapshot_count);

        let outcome = self.synthesizer.process(&snapshots);
        self.apply_outcome(outcome, Some(snapshot_count)).await
    }

    /// One idle sweep: close events for friends gone quiet.
    pub async fn sweep_cycle(&mut self) -> Result<()> {
        let outcome = self.synthesizer.sweep(time::now());
        if outcome.is_empty() {
            return Ok(());
        }
        self.apply_outcome(outcome, None).await
    }

    async fn poll_with_retry(&self) -> Result<Vec<Snapshot>> {
        let attempts = self.params.source_retry_attempts.max(1);
        let base = self.params.source_backoff_base_secs.max(1);
        let cap = self.params.source_backoff_cap_secs.max(base);
        let mut delay = base;

        for attempt in 1..=attempts {
            match self.source.poll().await {
                Ok(snapshots) => {
                    if attempt > 1 {
                        info!("Snapshot source recovered on attempt {}", attempt);
                    }
                    return Ok(snapshots);
                }
                Err(SourceError::AuthExpired) => return Err(Error::AuthExpired),
                // Retrying a parse failure within the cycle buys nothing
                Err(SourceError::Malformed(detail)) => return Err(Error::MalformedFeed(detail)),
                Err(SourceError::Unavailable(detail)) => {
                    if attempt == attempts {
                        return Err(Error::SourceUnavailable(detail));
                    }
                    warn!(
                        "Snapshot poll failed (attempt {}/{}): {}; retrying in {}s",
                        attempt, attempts, detail, delay
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
                    delay = (delay * 2).min(cap);
                }
            }
        }
        Err(Error::SourceUnavailable("retry budget exhausted".to_string()))
    }

    /// Apply a synthesis outcome: store transaction first, then staged
    /// state, aggregates, and broadcasts. `poll_snapshots` is `Some` for
    /// poll batches (which refresh the staleness clock) and `None` for
    /// sweep passes.
    async fn apply_outcome(
        &mut self,
        outcome: SynthesisOutcome,
        poll_snapshots: Option<usize>,
    ) -> Result<()> {
        let SynthesisOutcome {
            ops,
            mut staged,
            catalog,
            deduped,
            stale_dropped,
        } = outcome;

        let applied = if ops.is_empty() && catalog.is_empty() {
            BatchApply::default()
        } else {
            self.apply_with_retry(&catalog, &ops).await?
        };

        // Duplicate appends resolved to existing rows: point the staged
        // states at the canonical ids before committing them
        for (staged_id, canonical_id) in &applied.remapped {
            for state in staged.values_mut() {
                if state.open_event_id == Some(*staged_id) {
                    state.open_event_id = Some(*canonical_id);
                }
            }
        }
        self.synthesizer.commit(staged);

        {
            let mut aggregator = self.state.aggregator.write().await;
            for op in &ops {
                if let EventOp::Close(event) = op {
                    aggregator.apply(event);
                }
            }
        }

        let remap: HashMap<Uuid, Uuid> = applied.remapped.iter().copied().collect();
        let mut opened = 0usize;
        let mut closed = 0usize;
        for op in &ops {
            match op {
                EventOp::Open(event) => {
                    opened += 1;
                    let event_id = remap.get(&event.event_id).copied().unwrap_or(event.event_id);
                    self.state.broadcast_event(TrackerEvent::PlayStarted {
                        event_id,
                        friend_id: event.friend_id.clone(),
                        track_id: event.track_id.clone(),
                        artist_id: event.artist_id.clone(),
                        timestamp: event.started_at,
                    });
                }
                EventOp::Close(event) => {
                    closed += 1;
                    if let (Some(ended_at), Some(reason)) = (event.ended_at, event.end_reason) {
                        self.state.broadcast_event(TrackerEvent::PlayEnded {
                            event_id: event.event_id,
                            friend_id: event.friend_id.clone(),
                            track_id: event.track_id.clone(),
                            end_reason: reason,
                            timestamp: ended_at,
                        });
                    }
                }
                EventOp::Touch { .. } => {}
            }
        }

        if let Some(snapshot_count) = poll_snapshots {
            let now = time::now();
            self.state.record_success(now).await;
            self.state.broadcast_event(TrackerEvent::BatchIngested {
                snapshot_count,
                events_opened: opened,
                events_closed: closed,
                timestamp: now,
            });
            if opened + closed > 0 {
                info!(
                    "Batch applied: {} snapshots, {} opened, {} closed, {} deduped, {} stale",
                    snapshot_count, opened, closed, deduped, stale_dropped
                );
            } else {
                debug!(
                    "Batch applied: {} snapshots, no transitions ({} deduped, {} stale)",
                    snapshot_count, deduped, stale_dropped
                );
            }
        } else if closed > 0 {
            info!("Idle sweep closed {} events", closed);
        }

        if !ops.is_empty() {
            for (friend_id, open_count) in self.store.open_event_violations().await? {
                error!(
                    friend_id = %friend_id,
                    open_count,
                    "open-event invariant violated"
                );
            }
        }

        Ok(())
    }

    async fn apply_with_retry(&self, catalog: &[Snapshot], ops: &[EventOp]) -> Result<BatchApply> {
        let attempts = self.params.storage_retry_attempts.max(1);
        let mut last_error: Option<Error> = None;

        for attempt in 1..=attempts {
            match self.store.apply_batch(catalog, ops).await {
                Ok(applied) => {
                    if attempt > 1 {
                        info!("Storage write succeeded on attempt {}", attempt);
                    }
                    return Ok(applied);
                }
                Err(e) => {
                    warn!(
                        "Storage write failed (attempt {}/{}): {}",
                        attempt, attempts, e
                    );
                    last_error = Some(e);
                }
            }
        }

        let detail = match last_error {
            Some(e) => e.to_string(),
            None => "no attempts made".to_string(),
        };
        Err(Error::StorageWrite(detail))
    }
}
