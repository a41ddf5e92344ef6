use std::sync::Arc;

use bytes::Bytes;
use maplit::btreeset;
use pretty_assertions::assert_eq;

use crate::Config;
use crate::OpId;
use crate::Operation;
use crate::OperationStatusTracker;
use crate::PeerMessageQueue;
use crate::PeerRequest;
use crate::PeerStatus;
use crate::QueueError;

fn op_id(term: u64, index: u64) -> OpId {
    OpId::new(term, index)
}

fn replicate(index: u64, size: usize) -> Operation {
    Operation::replicate(op_id(1, index), Bytes::from(vec![0u8; size]))
}

fn commit(index: u64, committed_index: u64, size: usize) -> Operation {
    Operation::commit(op_id(1, index), op_id(1, committed_index), Bytes::from(vec![0u8; size]))
}

/// Tracker for the canonical 3-peer quorum-2 setup.
fn tracked(op: Operation) -> Arc<OperationStatusTracker> {
    Arc::new(OperationStatusTracker::new(op, 2, 3))
}

fn status(received: OpId, replicated: OpId, safe_commit: OpId) -> PeerStatus {
    PeerStatus::new(received, replicated, safe_commit)
}

/// A config whose parent tracker id is unique per test, so tests do not
/// share global budget through the process-wide registry.
fn test_config(name: &str) -> Config {
    Config {
        parent_tracker_id: format!("{}_parent", name),
        ..Default::default()
    }
}

fn new_queue(name: &str) -> PeerMessageQueue {
    PeerMessageQueue::new(&test_config(name), name)
}

fn track_abc(queue: &PeerMessageQueue) {
    for uuid in ["a", "b", "c"] {
        queue.track_peer(uuid, op_id(0, 0)).unwrap();
    }
}

/// Check the cross-component invariants a single call cannot break: the
/// tracker consumption matches the stats gauge, and the state counters
/// partition the buffer.
fn check(queue: &PeerMessageQueue) {
    let stats = queue.stats();
    assert_eq!(stats.queue_bytes, queue.queued_bytes());
    assert_eq!(
        stats.total_ops,
        stats.all_done_ops + stats.majority_done_ops + stats.in_progress_ops
    );
}

#[test]
fn test_append_and_lookup() -> anyhow::Result<()> {
    let queue = new_queue("append_and_lookup");

    queue.append_operation(tracked(replicate(1, 10)))?;
    queue.append_operation(tracked(replicate(2, 10)))?;

    let ost = queue.operation_status(&op_id(1, 1))?;
    assert_eq!(op_id(1, 1), ost.op_id());

    let err = queue.operation_status(&op_id(1, 9)).unwrap_err();
    assert_eq!(QueueError::NotFound(op_id(1, 9)), err);

    assert_eq!(2, queue.stats().total_ops);
    assert_eq!(20, queue.queued_bytes());
    check(&queue);
    Ok(())
}

#[test]
fn test_append_rejects_duplicate_op_id() -> anyhow::Result<()> {
    let queue = new_queue("duplicate_op_id");

    queue.append_operation(tracked(replicate(1, 10)))?;
    let err = queue.append_operation(tracked(replicate(1, 10))).unwrap_err();
    assert_eq!(QueueError::DuplicateOpId(op_id(1, 1)), err);

    // The failed append reserved nothing.
    assert_eq!(10, queue.queued_bytes());
    assert_eq!(1, queue.stats().total_ops);
    check(&queue);
    Ok(())
}

#[test]
fn test_track_peer_twice() -> anyhow::Result<()> {
    let queue = new_queue("track_peer_twice");

    queue.track_peer("a", op_id(0, 0))?;
    let err = queue.track_peer("a", op_id(1, 1)).unwrap_err();
    assert_eq!(QueueError::AlreadyTracked("a".to_string()), err);

    // Untracking frees the slot.
    queue.untrack_peer("a");
    queue.track_peer("a", op_id(1, 1))?;
    Ok(())
}

#[test]
fn test_request_for_unknown_peer() {
    let queue = new_queue("unknown_peer");

    let mut request = PeerRequest::new();
    let err = queue.request_for_peer("nobody", &mut request).unwrap_err();
    assert_eq!(QueueError::UnknownPeer("nobody".to_string()), err);
}

#[test]
fn test_majority_then_all_done() -> anyhow::Result<()> {
    // Five 100-byte REPLICATEs move from in-progress to majority-done to
    // all-done as the three peers acknowledge in turn.
    let queue = new_queue("majority_then_all");
    track_abc(&queue);

    for i in 1..=5 {
        queue.append_operation(tracked(replicate(i, 100)))?;
    }

    let ack_all = status(op_id(1, 5), op_id(1, 5), op_id(0, 0));

    let more = queue.response_from_peer("a", &ack_all);
    assert!(!more);
    let stats = queue.stats();
    assert_eq!(5, stats.total_ops);
    assert_eq!(5, stats.in_progress_ops);
    assert_eq!(0, stats.majority_done_ops);
    assert_eq!(500, stats.queue_bytes);
    check(&queue);

    queue.response_from_peer("b", &ack_all);
    let stats = queue.stats();
    assert_eq!(5, stats.majority_done_ops);
    assert_eq!(0, stats.in_progress_ops);
    assert_eq!(0, stats.all_done_ops);
    check(&queue);

    queue.response_from_peer("c", &ack_all);
    let stats = queue.stats();
    assert_eq!(5, stats.all_done_ops);
    assert_eq!(0, stats.majority_done_ops);
    assert_eq!(500, stats.queue_bytes);
    check(&queue);
    Ok(())
}

#[test]
fn test_soft_limit_triggers_trim() -> anyhow::Result<()> {
    let config = Config {
        entry_cache_soft_limit: 1024,
        entry_cache_hard_limit: 2048,
        ..test_config("soft_limit_trim")
    };
    let queue = PeerMessageQueue::new(&config, "soft_limit_trim");
    track_abc(&queue);

    for i in 1..=4 {
        queue.append_operation(tracked(replicate(i, 300)))?;
    }

    // All three peers acknowledge the first two operations.
    let ack_two = status(op_id(1, 2), op_id(1, 2), op_id(0, 0));
    for uuid in ["a", "b", "c"] {
        queue.response_from_peer(uuid, &ack_two);
    }
    assert_eq!(2, queue.stats().all_done_ops);

    // The next append is over the soft limit and evicts the acknowledged
    // prefix.
    queue.append_operation(tracked(replicate(5, 300)))?;

    assert_eq!(900, queue.queued_bytes());
    let stats = queue.stats();
    assert_eq!(3, stats.total_ops);
    assert_eq!(0, stats.all_done_ops);

    assert_eq!(
        QueueError::NotFound(op_id(1, 1)),
        queue.operation_status(&op_id(1, 1)).unwrap_err()
    );
    assert_eq!(
        QueueError::NotFound(op_id(1, 2)),
        queue.operation_status(&op_id(1, 2)).unwrap_err()
    );
    assert!(queue.operation_status(&op_id(1, 3)).is_ok());
    assert!(queue.operation_status(&op_id(1, 5)).is_ok());
    check(&queue);
    Ok(())
}

#[test]
fn test_trim_stops_at_first_unacknowledged_entry() -> anyhow::Result<()> {
    let config = Config {
        entry_cache_soft_limit: 1024,
        entry_cache_hard_limit: 1024 * 1024,
        ..test_config("trim_stops")
    };
    let queue = PeerMessageQueue::new(&config, "trim_stops");
    track_abc(&queue);

    // An unacknowledged COMMIT at (1,2) punches a hole in the prefix: the
    // peers acknowledge the REPLICATEs up to (1,3) but commit nothing.
    queue.append_operation(tracked(replicate(1, 300)))?;
    queue.append_operation(tracked(commit(2, 1, 300)))?;
    queue.append_operation(tracked(replicate(3, 300)))?;
    queue.append_operation(tracked(replicate(4, 300)))?;

    let ack_replicates = status(op_id(1, 3), op_id(1, 3), op_id(0, 0));
    for uuid in ["a", "b", "c"] {
        queue.response_from_peer(uuid, &ack_replicates);
    }

    queue.append_operation(tracked(replicate(5, 300)))?;

    // (1,1) and (1,3) are fully acknowledged, but eviction stops at the
    // hole: only (1,1) goes.
    assert_eq!(
        QueueError::NotFound(op_id(1, 1)),
        queue.operation_status(&op_id(1, 1)).unwrap_err()
    );
    assert!(queue.operation_status(&op_id(1, 2)).is_ok());
    assert!(queue.operation_status(&op_id(1, 3)).is_ok());
    assert_eq!(1200, queue.queued_bytes());
    check(&queue);
    Ok(())
}

#[test]
fn test_hard_limit_rejects_replicate() -> anyhow::Result<()> {
    let config = Config {
        entry_cache_soft_limit: 1024,
        entry_cache_hard_limit: 2048,
        ..test_config("hard_limit_reject")
    };
    let queue = PeerMessageQueue::new(&config, "hard_limit_reject");
    track_abc(&queue);

    // With no acknowledgements, appends overshoot the soft limit while the
    // hard limit holds.
    for i in 1..=6 {
        queue.append_operation(tracked(replicate(i, 300)))?;
    }
    assert_eq!(1800, queue.queued_bytes());

    let err = queue.append_operation(tracked(replicate(7, 300))).unwrap_err();
    assert_eq!(QueueError::QueueFull, err);

    // The rejected append changed nothing.
    let stats = queue.stats();
    assert_eq!(6, stats.total_ops);
    assert_eq!(6, stats.in_progress_ops);
    assert_eq!(1800, stats.queue_bytes);
    check(&queue);
    Ok(())
}

#[test]
fn test_commit_bypasses_full_queue() -> anyhow::Result<()> {
    let config = Config {
        entry_cache_soft_limit: 1024,
        entry_cache_hard_limit: 2048,
        ..test_config("commit_bypass")
    };
    let queue = PeerMessageQueue::new(&config, "commit_bypass");
    track_abc(&queue);

    for i in 1..=6 {
        queue.append_operation(tracked(replicate(i, 300)))?;
    }
    assert_eq!(
        QueueError::QueueFull,
        queue.append_operation(tracked(replicate(7, 300))).unwrap_err()
    );

    // A COMMIT is admitted even though both budgets are exhausted.
    queue.append_operation(tracked(commit(8, 6, 300)))?;

    assert_eq!(2100, queue.queued_bytes());
    assert!(queue.queued_bytes() > config.entry_cache_hard_limit);
    assert_eq!(7, queue.stats().total_ops);
    check(&queue);
    Ok(())
}

#[test]
fn test_replicate_and_commit_acks_advance_independently() -> anyhow::Result<()> {
    let queue = new_queue("independent_acks");
    track_abc(&queue);

    queue.append_operation(tracked(replicate(1, 10)))?;
    queue.append_operation(tracked(commit(2, 1, 10)))?;

    // The peer has made (1,1) durable but committed nothing yet: only the
    // REPLICATE gains the ack.
    queue.response_from_peer("a", &status(op_id(1, 2), op_id(1, 1), op_id(0, 0)));

    let rep = queue.operation_status(&op_id(1, 1))?;
    let cmt = queue.operation_status(&op_id(1, 2))?;
    assert_eq!(btreeset! {"a".to_string()}, rep.acked_by());
    assert!(cmt.acked_by().is_empty());

    // The safe-commit watermark catches up: now the COMMIT gains the ack.
    queue.response_from_peer("a", &status(op_id(1, 2), op_id(1, 2), op_id(1, 2)));

    assert_eq!(btreeset! {"a".to_string()}, rep.acked_by());
    assert_eq!(btreeset! {"a".to_string()}, cmt.acked_by());
    check(&queue);
    Ok(())
}

#[test]
fn test_request_respects_batch_cap() -> anyhow::Result<()> {
    let config = Config {
        max_batch_bytes: 500,
        ..test_config("batch_cap")
    };
    let queue = PeerMessageQueue::new(&config, "batch_cap");
    queue.track_peer("a", op_id(0, 0))?;

    for i in 1..=5 {
        queue.append_operation(tracked(replicate(i, 200)))?;
    }

    // Adding (1,3) would reach 600 bytes, so the batch stops at two ops.
    let mut request = PeerRequest::new();
    queue.request_for_peer("a", &mut request)?;
    assert_eq!(
        vec![op_id(1, 1), op_id(1, 2)],
        request.ops().iter().map(|op| op.op_id()).collect::<Vec<_>>()
    );
    assert_eq!(400, request.byte_size());

    // After the peer receives those, the next batch picks up at (1,3).
    let more = queue.response_from_peer("a", &status(op_id(1, 2), op_id(0, 0), op_id(0, 0)));
    assert!(more);

    queue.request_for_peer("a", &mut request)?;
    assert_eq!(
        vec![op_id(1, 3), op_id(1, 4)],
        request.ops().iter().map(|op| op.op_id()).collect::<Vec<_>>()
    );
    Ok(())
}

#[test]
fn test_single_oversized_op_is_still_sent() -> anyhow::Result<()> {
    let config = Config {
        max_batch_bytes: 500,
        ..test_config("oversized_singleton")
    };
    let queue = PeerMessageQueue::new(&config, "oversized_singleton");
    queue.track_peer("a", op_id(0, 0))?;

    queue.append_operation(tracked(replicate(1, 800)))?;

    let mut request = PeerRequest::new();
    queue.request_for_peer("a", &mut request)?;
    assert_eq!(1, request.len());
    assert_eq!(800, request.byte_size());
    Ok(())
}

#[test]
fn test_request_is_pure() -> anyhow::Result<()> {
    let queue = new_queue("request_is_pure");
    queue.track_peer("a", op_id(0, 0))?;

    for i in 1..=3 {
        queue.append_operation(tracked(replicate(i, 100)))?;
    }

    let mut first = PeerRequest::new();
    queue.request_for_peer("a", &mut first)?;
    let mut second = PeerRequest::new();
    queue.request_for_peer("a", &mut second)?;

    assert_eq!(
        first.ops().iter().map(|op| op.op_id()).collect::<Vec<_>>(),
        second.ops().iter().map(|op| op.op_id()).collect::<Vec<_>>()
    );
    assert_eq!(first.byte_size(), second.byte_size());

    // Building requests advanced nothing.
    assert_eq!(3, queue.stats().in_progress_ops);
    Ok(())
}

#[test]
fn test_response_is_idempotent() -> anyhow::Result<()> {
    let queue = new_queue("response_idempotent");
    track_abc(&queue);

    for i in 1..=3 {
        queue.append_operation(tracked(replicate(i, 100)))?;
    }

    let ack = status(op_id(1, 3), op_id(1, 3), op_id(0, 0));
    let more_first = queue.response_from_peer("a", &ack);
    let stats_first = queue.stats();

    let more_second = queue.response_from_peer("a", &ack);
    let stats_second = queue.stats();

    assert_eq!(more_first, more_second);
    assert_eq!(stats_first, stats_second);
    for i in 1..=3 {
        let ost = queue.operation_status(&op_id(1, i))?;
        assert_eq!(btreeset! {"a".to_string()}, ost.acked_by());
    }
    check(&queue);
    Ok(())
}

#[test]
fn test_peer_tracked_above_buffer_sees_nothing() -> anyhow::Result<()> {
    let queue = new_queue("tracked_above_buffer");

    for i in 1..=3 {
        queue.append_operation(tracked(replicate(i, 100)))?;
    }

    // The peer starts above everything buffered.
    queue.track_peer("d", op_id(9, 9))?;

    let mut request = PeerRequest::new();
    queue.request_for_peer("d", &mut request)?;
    assert!(request.is_empty());

    let more = queue.response_from_peer("d", &status(op_id(9, 9), op_id(9, 9), op_id(9, 9)));
    assert!(!more);
    Ok(())
}

#[test]
fn test_more_pending_when_peer_is_behind() -> anyhow::Result<()> {
    let queue = new_queue("more_pending");
    queue.track_peer("a", op_id(0, 0))?;

    for i in 1..=5 {
        queue.append_operation(tracked(replicate(i, 100)))?;
    }

    let more = queue.response_from_peer("a", &status(op_id(1, 2), op_id(1, 2), op_id(0, 0)));
    assert!(more);

    let more = queue.response_from_peer("a", &status(op_id(1, 5), op_id(1, 5), op_id(0, 0)));
    assert!(!more);
    Ok(())
}

#[test]
fn test_response_for_untracked_peer_is_dropped() -> anyhow::Result<()> {
    let queue = new_queue("untracked_response");
    queue.append_operation(tracked(replicate(1, 100)))?;

    let more = queue.response_from_peer("ghost", &status(op_id(1, 1), op_id(1, 1), op_id(0, 0)));
    assert!(!more);

    let ost = queue.operation_status(&op_id(1, 1))?;
    assert!(ost.acked_by().is_empty());
    Ok(())
}

#[test]
fn test_close_rejects_mutations() -> anyhow::Result<()> {
    let queue = new_queue("close");
    track_abc(&queue);
    queue.append_operation(tracked(replicate(1, 100)))?;

    queue.close();
    // Idempotent.
    queue.close();

    assert_eq!(
        QueueError::QueueClosed,
        queue.append_operation(tracked(replicate(2, 100))).unwrap_err()
    );
    assert_eq!(
        QueueError::QueueClosed,
        queue.track_peer("d", op_id(0, 0)).unwrap_err()
    );

    let mut request = PeerRequest::new();
    assert_eq!(
        QueueError::QueueClosed,
        queue.request_for_peer("a", &mut request).unwrap_err()
    );

    // Responses are dropped without touching the buffer.
    let more = queue.response_from_peer("a", &status(op_id(1, 1), op_id(1, 1), op_id(0, 0)));
    assert!(!more);
    let ost = queue.operation_status(&op_id(1, 1))?;
    assert!(ost.acked_by().is_empty());
    assert_eq!(1, queue.stats().total_ops);
    Ok(())
}

#[test]
fn test_global_budget_shared_across_queues() -> anyhow::Result<()> {
    let config = Config {
        entry_cache_soft_limit: 1024 * 1024,
        entry_cache_hard_limit: 1024 * 1024,
        global_entry_cache_soft_limit: 1000,
        global_entry_cache_hard_limit: 1000,
        ..test_config("global_budget")
    };
    let q1 = PeerMessageQueue::new(&config, "tablet-1");
    let q2 = PeerMessageQueue::new(&config, "tablet-2");

    q1.append_operation(tracked(replicate(1, 600)))?;

    // Budget checks run before the reservation, so this overshoots the
    // shared limit rather than being rejected.
    q2.append_operation(tracked(replicate(1, 600)))?;
    assert_eq!(1200, q1.parent_tracker().consumption());

    // Now the global budget is visibly exhausted and nothing in q2 can be
    // trimmed: a REPLICATE is rejected, a COMMIT still flows.
    assert_eq!(
        QueueError::QueueFull,
        q2.append_operation(tracked(replicate(2, 10))).unwrap_err()
    );
    q2.append_operation(tracked(commit(3, 1, 10)))?;

    // Dropping a queue returns its consumption to the parent.
    let parent = q1.parent_tracker().clone();
    drop(q1);
    assert_eq!(610, parent.consumption());
    Ok(())
}

#[test]
fn test_dump_to_strings() -> anyhow::Result<()> {
    let queue = new_queue("dump");
    queue.track_peer("a", op_id(0, 0))?;

    queue.append_operation(tracked(replicate(1, 7)))?;
    queue.append_operation(tracked(commit(2, 1, 3)))?;
    queue.response_from_peer("a", &status(op_id(1, 1), op_id(1, 1), op_id(0, 0)));

    let lines = queue.dump_to_strings();
    assert_eq!("Watermarks:", lines[0]);
    assert_eq!(
        "Peer: a Watermark: {received: 1.1, replicated: 1.1, safe_commit: 0.0}",
        lines[1]
    );
    assert_eq!("Messages:", lines[2]);
    assert_eq!(
        "Message[0] 1.1 : REPLICATE. Size: 7, Status: acked by 1/3 peers (quorum=2)",
        lines[3]
    );
    assert_eq!(
        "Message[1] 1.2 : COMMIT. Committed OpId: 1.1 Size: 3, Status: acked by 0/3 peers (quorum=2)",
        lines[4]
    );
    Ok(())
}

#[test]
fn test_queue_display() -> anyhow::Result<()> {
    let queue = new_queue("display");
    queue.append_operation(tracked(replicate(1, 100)))?;

    let s = queue.to_string();
    assert!(s.starts_with("Consensus queue metrics: Total Ops: 1"), "got: {}", s);
    assert!(s.contains("Queue Size (bytes): 100/"), "got: {}", s);
    Ok(())
}

#[test]
fn test_drop_releases_tracker_consumption() -> anyhow::Result<()> {
    let queue = new_queue("drop_releases");
    queue.append_operation(tracked(replicate(1, 250)))?;

    let parent = queue.parent_tracker().clone();
    assert_eq!(250, parent.consumption());

    drop(queue);
    assert_eq!(0, parent.consumption());
    Ok(())
}

#[test]
fn test_in_flight_request_survives_trim() -> anyhow::Result<()> {
    let config = Config {
        entry_cache_soft_limit: 1024,
        entry_cache_hard_limit: 2048,
        ..test_config("in_flight_survives")
    };
    let queue = PeerMessageQueue::new(&config, "in_flight_survives");
    track_abc(&queue);

    for i in 1..=4 {
        queue.append_operation(tracked(replicate(i, 300)))?;
    }

    let mut request = PeerRequest::new();
    queue.request_for_peer("a", &mut request)?;
    assert_eq!(4, request.len());

    // Everything gets acknowledged and trimmed away while the request is
    // still in flight.
    let ack_all = status(op_id(1, 4), op_id(1, 4), op_id(0, 0));
    for uuid in ["a", "b", "c"] {
        queue.response_from_peer(uuid, &ack_all);
    }
    queue.append_operation(tracked(replicate(5, 300)))?;
    assert_eq!(
        QueueError::NotFound(op_id(1, 1)),
        queue.operation_status(&op_id(1, 1)).unwrap_err()
    );

    // The lent references are unaffected.
    assert_eq!(4, request.len());
    assert_eq!(op_id(1, 1), request.ops()[0].op_id());
    assert_eq!(300, request.ops()[0].byte_size());
    Ok(())
}
