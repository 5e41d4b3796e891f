//! Multi-batch synthesis scenarios
//!
//! The unit tests in the synthesizer module cover single transitions;
//! these walk whole listening sessions through repeated process/commit
//! rounds, the way the pipeline drives them.

use chrono::Duration;
use earshot_common::db::models::EndReason;
use earshot_common::time;
use earshot_ft::ingest::Synthesizer;
use earshot_ft::source::Snapshot;
use earshot_ft::store::EventOp;

const T0: i64 = 1_700_000_000;
const IDLE_SECS: i64 = 1200;

fn synthesizer() -> Synthesizer {
    Synthesizer::new(Duration::seconds(IDLE_SECS))
}

fn snap(friend: &str, track: &str, observed_secs: i64) -> Snapshot {
    Snapshot {
        friend_id: friend.to_string(),
        observed_at: time::from_unix_seconds(observed_secs),
        track_id: track.to_string(),
        artist_id: format!("artist-of-{}", track),
        context_id: None,
        friend_name: friend.to_string(),
        friend_image_url: None,
        track_name: track.to_string(),
        artist_name: format!("artist-of-{}", track),
        album_id: None,
        album_name: None,
        track_image_url: None,
    }
}

/// Process one batch and commit it, returning the ops it produced.
fn round(synthesizer: &mut Synthesizer, batch: &[Snapshot]) -> Vec<EventOp> {
    let outcome = synthesizer.process(batch);
    let ops = outcome.ops.clone();
    synthesizer.commit(outcome.staged);
    ops
}

#[test]
fn test_session_lifecycle_across_batches() {
    let mut synthesizer = synthesizer();

    // Poll 1: alice starts t1
    let ops = round(&mut synthesizer, &[snap("alice", "t1", T0)]);
    assert_eq!(ops.len(), 1);
    let first_id = match &ops[0] {
        EventOp::Open(event) => {
            assert_eq!(event.track_id, "t1");
            assert_eq!(event.started_at.timestamp(), T0);
            event.event_id
        }
        other => panic!("expected open, got {:?}", other),
    };

    // Poll 2: still t1, last_seen advances
    let ops = round(&mut synthesizer, &[snap("alice", "t1", T0 + 300)]);
    assert!(matches!(&ops[0], EventOp::Touch { event_id, last_seen_at }
        if *event_id == first_id && last_seen_at.timestamp() == T0 + 300));

    // Poll 3: switch to t2; close lands at the new observation time
    let ops = round(&mut synthesizer, &[snap("alice", "t2", T0 + 600)]);
    assert_eq!(ops.len(), 2);
    match &ops[0] {
        EventOp::Close(event) => {
            assert_eq!(event.event_id, first_id);
            assert_eq!(event.ended_at.map(|t| t.timestamp()), Some(T0 + 600));
            assert_eq!(event.end_reason, Some(EndReason::TrackChange));
        }
        other => panic!("expected close, got {:?}", other),
    }
    let second_id = match &ops[1] {
        EventOp::Open(event) => {
            assert_eq!(event.started_at.timestamp(), T0 + 600);
            event.event_id
        }
        other => panic!("expected open, got {:?}", other),
    };

    // The track change did not start a new session
    let state = synthesizer.state("alice").unwrap();
    assert_eq!(state.session_started_at.timestamp(), T0);

    // Alice goes quiet; the sweep closes t2 at the idle boundary
    let outcome = synthesizer.sweep(time::from_unix_seconds(T0 + 600 + IDLE_SECS + 600));
    assert_eq!(outcome.ops.len(), 1);
    match &outcome.ops[0] {
        EventOp::Close(event) => {
            assert_eq!(event.event_id, second_id);
            assert_eq!(
                event.ended_at.map(|t| t.timestamp()),
                Some(T0 + 600 + IDLE_SECS)
            );
            assert_eq!(event.end_reason, Some(EndReason::Idle));
        }
        other => panic!("expected close, got {:?}", other),
    }
    synthesizer.commit(outcome.staged);
    assert!(synthesizer.state("alice").unwrap().open_event_id.is_none());

    // She comes back shortly after the granted idle window: a fresh
    // event opens, but the session start is preserved
    let resumed_at = T0 + 600 + IDLE_SECS + 100;
    let ops = round(&mut synthesizer, &[snap("alice", "t2", resumed_at)]);
    assert_eq!(ops.len(), 1);
    match &ops[0] {
        EventOp::Open(event) => {
            assert_eq!(event.started_at.timestamp(), resumed_at);
            assert_ne!(event.event_id, second_id);
        }
        other => panic!("expected open, got {:?}", other),
    }
    let state = synthesizer.state("alice").unwrap();
    assert_eq!(state.session_started_at.timestamp(), T0);
    assert!(state.open_event_id.is_some());
}

#[test]
fn test_redelivered_batch_changes_nothing() {
    let mut synthesizer = synthesizer();
    let batch = vec![snap("alice", "t1", T0)];

    let ops = round(&mut synthesizer, &batch);
    assert_eq!(ops.len(), 1);

    // Same feed contents on the next poll
    let outcome = synthesizer.process(&batch);
    assert!(outcome.ops.is_empty());
    assert!(outcome.staged.is_empty());
    assert_eq!(outcome.deduped, 1);
    // The snapshot still refreshes catalog metadata
    assert_eq!(outcome.catalog.len(), 1);
}

#[test]
fn test_friends_age_out_independently() {
    let mut synthesizer = synthesizer();

    let ops = round(
        &mut synthesizer,
        &[snap("alice", "t1", T0), snap("bob", "t2", T0 + 900)],
    );
    assert_eq!(ops.len(), 2);
    assert_eq!(synthesizer.friend_count(), 2);

    // Only alice has crossed the idle threshold at this point
    let outcome = synthesizer.sweep(time::from_unix_seconds(T0 + IDLE_SECS + 300));
    assert_eq!(outcome.ops.len(), 1);
    match &outcome.ops[0] {
        EventOp::Close(event) => {
            assert_eq!(event.friend_id, "alice");
            assert_eq!(event.ended_at.map(|t| t.timestamp()), Some(T0 + IDLE_SECS));
        }
        other => panic!("expected close, got {:?}", other),
    }
    synthesizer.commit(outcome.staged);

    assert!(synthesizer.state("alice").unwrap().open_event_id.is_none());
    assert!(synthesizer.state("bob").unwrap().open_event_id.is_some());
}

#[test]
fn test_uncommitted_outcome_resynthesizes_identically() {
    let mut synthesizer = synthesizer();
    round(&mut synthesizer, &[snap("alice", "t1", T0)]);

    // The store write failed, so the outcome was never committed
    let batch = vec![snap("alice", "t2", T0 + 300)];
    let dropped = synthesizer.process(&batch);
    assert_eq!(dropped.ops.len(), 2);

    // The next poll reproduces the same close boundary and start
    let retried = synthesizer.process(&batch);
    assert_eq!(retried.ops.len(), 2);
    match (&dropped.ops[0], &retried.ops[0]) {
        (EventOp::Close(a), EventOp::Close(b)) => {
            assert_eq!(a.event_id, b.event_id);
            assert_eq!(a.ended_at, b.ended_at);
        }
        other => panic!("expected two closes, got {:?}", other),
    }
    match (&dropped.ops[1], &retried.ops[1]) {
        (EventOp::Open(a), EventOp::Open(b)) => {
            assert_eq!(a.started_at, b.started_at);
            assert_eq!(a.friend_id, b.friend_id);
        }
        other => panic!("expected two opens, got {:?}", other),
    }
}
