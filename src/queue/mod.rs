//! The queue of operations a leader holds in memory for replication to its
//! peers.
//!
//! Operations enter through [`PeerMessageQueue::append_operation`] in
//! strictly ascending OpId order. Each tracked peer drains the queue at its
//! own pace: [`PeerMessageQueue::request_for_peer`] builds the next batch
//! above the peer's received watermark, and
//! [`PeerMessageQueue::response_from_peer`] ingests the peer's
//! acknowledgements and advances its watermarks. Operations acknowledged by
//! every peer are evicted when a memory budget asks for room.

#[cfg(test)] mod tests;

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::Display;
use std::fmt::Formatter;
use std::ops::Bound::Excluded;
use std::ops::Bound::Unbounded;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use validit::Validate;

use crate::Config;
use crate::MemTracker;
use crate::OpId;
use crate::Operation;
use crate::OperationPayload;
use crate::OperationStatusTracker;
use crate::PeerStatus;
use crate::QueueError;
use crate::QueueStats;

/// An outgoing batch of operations for one peer.
///
/// Operations are lent into the batch by shared reference: building a
/// request copies no payload and mutates neither the buffer nor any
/// tracker. The references stay valid even if the queue evicts the
/// operations while the request is in flight.
#[derive(Debug, Clone, Default)]
pub struct PeerRequest {
    ops: Vec<Arc<Operation>>,
    bytes: u64,
}

impl PeerRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> &[Arc<Operation>] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Total payload bytes of the operations in this batch.
    pub fn byte_size(&self) -> u64 {
        self.bytes
    }

    /// Drop this batch's operation references. Entries stay alive as long
    /// as the buffer or another in-flight request still holds them.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.bytes = 0;
    }

    pub fn first_op_id(&self) -> Option<OpId> {
        self.ops.first().map(|op| op.op_id())
    }

    pub fn last_op_id(&self) -> Option<OpId> {
        self.ops.last().map(|op| op.op_id())
    }

    fn push(&mut self, op: Arc<Operation>) {
        self.bytes += u64::from(op.byte_size());
        self.ops.push(op);
    }

    fn pop(&mut self) {
        if let Some(op) = self.ops.pop() {
            self.bytes -= u64::from(op.byte_size());
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Open,
    Closed,
}

struct QueueInner {
    state: State,

    /// Ordered buffer of tracked operations; iteration yields strictly
    /// ascending OpIds.
    messages: BTreeMap<OpId, Arc<OperationStatusTracker>>,

    /// Per-peer watermarks, keyed by peer uuid. Dropped on close.
    watermarks: BTreeMap<String, PeerStatus>,

    stats: QueueStats,
}

impl Validate for QueueInner {
    fn validate(&self) -> Result<(), Box<dyn Error>> {
        let stats = &self.stats;
        let by_state = stats.all_done_ops + stats.majority_done_ops + stats.in_progress_ops;
        if stats.total_ops != by_state {
            return Err(format!(
                "total_ops({}) != all_done({}) + majority_done({}) + in_progress({})",
                stats.total_ops, stats.all_done_ops, stats.majority_done_ops, stats.in_progress_ops
            )
            .into());
        }
        if stats.total_ops != self.messages.len() as i64 {
            return Err(
                format!("total_ops({}) != buffered({})", stats.total_ops, self.messages.len()).into(),
            );
        }
        for (uuid, status) in &self.watermarks {
            status.validate().map_err(|e| format!("peer {}: {}", uuid, e))?;
        }
        Ok(())
    }
}

/// The leader-side replication queue.
///
/// The queue is passive: all calls run on the caller's thread and are
/// serialized by one internal lock, held only for map updates and integer
/// arithmetic. Long-latency work (network, log fsync) happens outside, with
/// only shared operation references crossing the boundary.
///
/// Memory is accounted against a per-queue tracker parented to a
/// process-wide tracker shared by every queue created with the same
/// `parent_tracker_id`. Exceeding a soft limit triggers eviction of the
/// fully acknowledged prefix on the next append; exceeding a hard limit
/// rejects REPLICATE appends. COMMIT appends are always admitted.
pub struct PeerMessageQueue {
    max_batch_bytes: u64,
    dump_queue_on_full: bool,

    parent_tracker: Arc<MemTracker>,
    tracker: Arc<MemTracker>,

    inner: Mutex<QueueInner>,
}

impl PeerMessageQueue {
    /// Create a queue for the tablet identified by `queue_id`.
    ///
    /// The parent tracker is discovered or created in the process-wide
    /// registry under `config.parent_tracker_id`; the per-queue tracker is
    /// named `"{parent_tracker_id}-{queue_id}"`.
    pub fn new(config: &Config, queue_id: &str) -> Self {
        let parent_tracker = MemTracker::find_or_create_root(
            config.global_entry_cache_soft_limit,
            config.global_entry_cache_hard_limit,
            &config.parent_tracker_id,
        );

        let tracker = MemTracker::create(
            config.entry_cache_soft_limit,
            config.entry_cache_hard_limit,
            format!("{}-{}", config.parent_tracker_id, queue_id),
            Some(parent_tracker.clone()),
        );

        Self {
            max_batch_bytes: config.max_batch_bytes,
            dump_queue_on_full: config.dump_queue_on_full,
            parent_tracker,
            tracker,
            inner: Mutex::new(QueueInner {
                state: State::Open,
                messages: BTreeMap::new(),
                watermarks: BTreeMap::new(),
                stats: QueueStats::default(),
            }),
        }
    }

    /// Start tracking a peer, with all three watermarks at
    /// `initial_watermark`.
    ///
    /// Earlier operations are not replayed: a peer starting below the
    /// lowest buffered OpId only receives what is still buffered.
    pub fn track_peer(&self, uuid: &str, initial_watermark: OpId) -> Result<(), QueueError> {
        let mut inner = self.lock_inner();
        if inner.state == State::Closed {
            return Err(QueueError::QueueClosed);
        }
        if inner.watermarks.contains_key(uuid) {
            return Err(QueueError::AlreadyTracked(uuid.to_string()));
        }
        inner.watermarks.insert(uuid.to_string(), PeerStatus::at(initial_watermark));
        Ok(())
    }

    /// Stop tracking a peer. Outstanding request batches that reference
    /// operations remain valid.
    pub fn untrack_peer(&self, uuid: &str) {
        let mut inner = self.lock_inner();
        inner.watermarks.remove(uuid);
    }

    /// Admit an operation into the queue.
    ///
    /// Callers must append in strictly ascending OpId order; a duplicate
    /// OpId is rejected with [`QueueError::DuplicateOpId`].
    ///
    /// When a soft budget is exceeded, the fully acknowledged prefix is
    /// evicted first. A REPLICATE that still cannot fit under the hard
    /// budgets is rejected with [`QueueError::QueueFull`] and no state is
    /// changed; a COMMIT is always admitted.
    pub fn append_operation(&self, status: Arc<OperationStatusTracker>) -> Result<(), QueueError> {
        let mut inner = self.lock_inner();
        if inner.state == State::Closed {
            return Err(QueueError::QueueClosed);
        }

        let operation = status.operation().clone();
        let id = operation.op_id();

        // A duplicate is reported as an error; appending below the buffer
        // tail is a programmer error.
        debug_assert!(
            inner.messages.last_key_value().map_or(true, |(last, _)| *last <= id),
            "appends must arrive in ascending OpId order: last={:?}, new={}",
            inner.messages.last_key_value().map(|(last, _)| *last),
            id
        );
        if inner.messages.contains_key(&id) {
            return Err(QueueError::DuplicateOpId(id));
        }

        // Once either the local or the global soft limit is exceeded, try
        // to trim the queue.
        if self.tracker.any_soft_limit_exceeded() {
            if let Err(e) = self.trim_for_operation(&mut inner, &operation) {
                if self.dump_queue_on_full || tracing::enabled!(tracing::Level::DEBUG) {
                    drop(inner);
                    tracing::info!("queue full, dumping state:");
                    for line in self.dump_to_strings() {
                        tracing::info!("{}", line);
                    }
                }
                return Err(e);
            }
        }

        // Reaching this point means one of:
        //
        // 1) trimming brought consumption back under every soft limit;
        // 2) trimming could not, but no hard limit is violated;
        // 3) the operation is a COMMIT, which is always admitted.
        let bytes = u64::from(operation.byte_size());
        self.tracker.consume(bytes);

        tracing::debug!(
            op = display(&*operation),
            status = display(&*status),
            "appended operation to queue"
        );

        inner.stats.queue_bytes += bytes;
        inner.stats.total_ops += 1;
        // Operations may arrive already acknowledged, e.g. when replicating
        // only to learners.
        if status.is_all_done() {
            inner.stats.all_done_ops += 1;
        } else if status.is_done() {
            inner.stats.majority_done_ops += 1;
        } else {
            inner.stats.in_progress_ops += 1;
        }

        inner.messages.insert(id, status);

        debug_assert!(inner.validate().is_ok(), "queue state: {:?}", inner.validate().err());
        Ok(())
    }

    /// Build the next batch for `uuid`: the contiguous run of operations
    /// strictly above the peer's received watermark, capped at
    /// `max_batch_bytes`. A batch holding exactly one operation may exceed
    /// the cap, otherwise an oversized operation could never be sent.
    ///
    /// The peer's watermarks are not advanced; only a response does that.
    /// Without intervening appends or responses, repeated calls return
    /// structurally identical batches.
    pub fn request_for_peer(&self, uuid: &str, request: &mut PeerRequest) -> Result<(), QueueError> {
        // Clear the previous batch without touching the entries; they may
        // still be referenced by other peers' requests.
        request.clear();

        let inner = self.lock_inner();
        if inner.state == State::Closed {
            return Err(QueueError::QueueClosed);
        }
        let Some(current) = inner.watermarks.get(uuid) else {
            return Err(QueueError::UnknownPeer(uuid.to_string()));
        };

        for (_, ost) in inner.messages.range((Excluded(current.received), Unbounded)) {
            request.push(ost.operation().clone());
            if request.byte_size() > self.max_batch_bytes {
                if request.len() > 1 {
                    request.pop();
                }
                tracing::debug!(
                    peer = display(uuid),
                    ops = display(request.len()),
                    bytes = display(request.byte_size()),
                    max = display(self.max_batch_bytes),
                    "request reached max batch size for peer"
                );
                break;
            }
        }

        match (request.first_op_id(), request.last_op_id()) {
            (Some(first), Some(last)) => {
                tracing::debug!(
                    peer = display(uuid),
                    ops = display(request.len()),
                    from = display(first),
                    to = display(last),
                    "sending request with operations to peer"
                );
            }
            _ => {
                tracing::debug!(peer = display(uuid), "sending status only request to peer");
            }
        }
        Ok(())
    }

    /// Ingest a peer's response and advance its watermarks.
    ///
    /// Acknowledgements are recorded on every buffered operation between
    /// the peer's lowest previously acknowledged point and its new received
    /// watermark: COMMITs gain an ack when they fall inside the advanced
    /// safe-commit window, REPLICATEs when they fall inside the advanced
    /// replicated window. The two windows move independently, since a peer
    /// makes an operation durable well before it commits it.
    ///
    /// Returns whether operations above the peer's new received watermark
    /// are still buffered.
    ///
    /// A response for an unknown peer, or after close, is logged and
    /// dropped. Watermarks in `new_status` must not regress; the layer
    /// above is expected to validate.
    pub fn response_from_peer(&self, uuid: &str, new_status: &PeerStatus) -> bool {
        debug_assert!(
            new_status.validate().is_ok(),
            "malformed peer status: {}",
            new_status
        );

        let mut inner = self.lock_inner();
        let QueueInner {
            state,
            messages,
            watermarks,
            stats,
        } = &mut *inner;

        if *state == State::Closed {
            tracing::warn!(peer = display(uuid), "queue is closed, disregarding peer response");
            return false;
        }
        let Some(current) = watermarks.get_mut(uuid) else {
            tracing::warn!(peer = display(uuid), "peer is not tracked, disregarding peer response");
            return false;
        };

        debug_assert!(current.received <= new_status.received, "received watermark regressed");
        debug_assert!(
            current.replicated <= new_status.replicated,
            "replicated watermark regressed"
        );
        debug_assert!(
            current.safe_commit <= new_status.safe_commit,
            "safe_commit watermark regressed"
        );

        tracing::debug!(
            peer = display(uuid),
            current = display(&*current),
            new = display(new_status),
            "received response from peer"
        );

        // Processing starts from the lowest watermark, which might be the
        // replicated or the safe-commit one.
        let low = current.lowest_ack_point();

        for (id, ost) in messages.range((Excluded(low), Unbounded)) {
            if *id > new_status.received {
                break;
            }
            let was_done = ost.is_done();
            let was_all_done = ost.is_all_done();

            if ost.operation().is_commit() {
                if *id > current.safe_commit && *id <= new_status.safe_commit {
                    ost.ack_peer(uuid);
                }
            } else if *id > current.replicated && *id <= new_status.replicated {
                ost.ack_peer(uuid);
            }

            if ost.is_done() && !was_done {
                stats.majority_done_ops += 1;
                stats.in_progress_ops -= 1;
            }
            if ost.is_all_done() && !was_all_done {
                stats.all_done_ops += 1;
                stats.majority_done_ops -= 1;
            }
        }

        *current = *new_status;

        debug_assert!(inner.validate().is_ok(), "queue state: {:?}", inner.validate().err());

        // More operations are pending when the buffer extends past the
        // peer's new received watermark.
        inner
            .messages
            .range((Excluded(new_status.received), Unbounded))
            .next()
            .is_some()
    }

    /// Look up the status tracker of a buffered operation.
    pub fn operation_status(&self, op_id: &OpId) -> Result<Arc<OperationStatusTracker>, QueueError> {
        let inner = self.lock_inner();
        inner.messages.get(op_id).cloned().ok_or(QueueError::NotFound(*op_id))
    }

    /// Bytes currently accounted to this queue's tracker.
    pub fn queued_bytes(&self) -> u64 {
        self.tracker.consumption()
    }

    /// A snapshot of the queue's gauges, consistent with the buffer.
    pub fn stats(&self) -> QueueStats {
        let inner = self.lock_inner();
        inner.stats
    }

    pub fn tracker(&self) -> &Arc<MemTracker> {
        &self.tracker
    }

    pub fn parent_tracker(&self) -> &Arc<MemTracker> {
        &self.parent_tracker
    }

    /// Render the watermark table and every buffered message, one line
    /// each, for diagnostics.
    pub fn dump_to_strings(&self) -> Vec<String> {
        let inner = self.lock_inner();
        Self::dump_inner(&inner)
    }

    /// Close the queue: no further admissions, responses are dropped, the
    /// watermark table is released. In-flight request batches keep their
    /// operation references. Idempotent.
    pub fn close(&self) {
        let mut inner = self.lock_inner();
        inner.state = State::Closed;
        inner.watermarks.clear();
    }

    fn lock_inner(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Evict fully acknowledged operations from the front of the buffer
    /// until `operation` fits under every soft limit.
    ///
    /// If the prefix runs out first, the operation is still admitted when
    /// the hard limits permit, and a COMMIT is admitted unconditionally;
    /// only a REPLICATE over a hard limit is rejected.
    fn trim_for_operation(
        &self,
        inner: &mut QueueInner,
        operation: &Operation,
    ) -> Result<(), QueueError> {
        // TODO: a single lagging peer can pin the whole buffer and force
        // rejections here. Evicting the peer and re-replicating it from the
        // log, or paging trimmed entries back in from the log, needs the
        // log-fetch interface.
        let bytes = operation.byte_size();

        while i64::from(bytes) > self.tracker.spare_soft_capacity() {
            // The buffer may already be empty while a global limit is still
            // exceeded by other queues sharing the parent tracker.
            let head_all_done = inner
                .messages
                .first_key_value()
                .map_or(false, |(_, ost)| ost.is_all_done());

            if !head_all_done {
                if !self.tracker.would_violate_hard(u64::from(bytes)) || operation.is_commit() {
                    return Ok(());
                }
                return Err(QueueError::QueueFull);
            }

            if let Some((id, ost)) = inner.messages.pop_first() {
                let freed = u64::from(ost.byte_size());
                self.tracker.release(freed);
                inner.stats.total_ops -= 1;
                inner.stats.all_done_ops -= 1;
                inner.stats.queue_bytes -= freed;
                tracing::trace!(
                    op_id = display(id),
                    bytes = display(freed),
                    "evicted fully acknowledged operation"
                );
            }
        }
        Ok(())
    }

    fn dump_inner(inner: &QueueInner) -> Vec<String> {
        let mut lines = Vec::new();

        lines.push("Watermarks:".to_string());
        for (uuid, status) in &inner.watermarks {
            lines.push(format!("Peer: {} Watermark: {}", uuid, status));
        }

        lines.push("Messages:".to_string());
        for (counter, (id, ost)) in inner.messages.iter().enumerate() {
            let operation = ost.operation();
            match operation.payload() {
                OperationPayload::Replicate(_) => {
                    lines.push(format!(
                        "Message[{}] {} : REPLICATE. Size: {}, Status: {}",
                        counter,
                        id,
                        operation.byte_size(),
                        ost
                    ));
                }
                OperationPayload::Commit { committed_op_id, .. } => {
                    lines.push(format!(
                        "Message[{}] {} : COMMIT. Committed OpId: {} Size: {}, Status: {}",
                        counter,
                        id,
                        committed_op_id,
                        operation.byte_size(),
                        ost
                    ));
                }
            }
        }
        lines
    }
}

impl Display for PeerMessageQueue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // Counters are only mutated under the lock; taking it yields a
        // consistent snapshot.
        let inner = self.lock_inner();
        write!(
            f,
            "Consensus queue metrics: {}/{}",
            inner.stats,
            self.tracker.hard_limit()
        )
    }
}

impl Drop for PeerMessageQueue {
    fn drop(&mut self) {
        self.close();
        // Outstanding batches keep their operation references; the queue's
        // remaining consumption is returned to the parent tracker.
        self.tracker.release(self.tracker.consumption());
    }
}
