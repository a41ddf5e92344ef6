use std::collections::BTreeSet;
use std::fmt::Display;
use std::fmt::Formatter;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use crate::OpId;
use crate::Operation;

/// Tracks which peers have acknowledged a single operation.
///
/// A tracker is shared between the queue's buffer and any in-flight request
/// batches, and stays valid after eviction for as long as a batch still
/// references it. The ack set has its own lock so that acknowledgements do
/// not require the queue lock.
///
/// `quorum_size` and `total_peers` are fixed at creation.
pub struct OperationStatusTracker {
    operation: Arc<Operation>,

    /// Number of acks required for `is_done`.
    quorum_size: u32,

    /// Number of acks required for `is_all_done`.
    total_peers: u32,

    acked_by: Mutex<BTreeSet<String>>,
}

impl OperationStatusTracker {
    pub fn new(operation: Operation, quorum_size: u32, total_peers: u32) -> Self {
        debug_assert!(quorum_size <= total_peers);
        Self {
            operation: Arc::new(operation),
            quorum_size,
            total_peers,
            acked_by: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn op_id(&self) -> OpId {
        self.operation.op_id()
    }

    /// The operation this tracker owns. Cloning the `Arc` lends the
    /// operation to a request batch without copying the payload.
    pub fn operation(&self) -> &Arc<Operation> {
        &self.operation
    }

    pub fn byte_size(&self) -> u32 {
        self.operation.byte_size()
    }

    pub fn quorum_size(&self) -> u32 {
        self.quorum_size
    }

    pub fn total_peers(&self) -> u32 {
        self.total_peers
    }

    /// Record an acknowledgement from `uuid`. Idempotent: the ack set only
    /// grows.
    pub fn ack_peer(&self, uuid: &str) {
        let mut acked = self.acked();
        if !acked.contains(uuid) {
            acked.insert(uuid.to_string());
        }
    }

    /// Whether a quorum of peers has acknowledged.
    pub fn is_done(&self) -> bool {
        self.acked().len() as u32 >= self.quorum_size
    }

    /// Whether every tracked peer has acknowledged. Once true, the operation
    /// is eligible for eviction from the queue.
    pub fn is_all_done(&self) -> bool {
        self.acked().len() as u32 == self.total_peers
    }

    pub fn ack_count(&self) -> u32 {
        self.acked().len() as u32
    }

    /// A snapshot of the peers that have acknowledged.
    pub fn acked_by(&self) -> BTreeSet<String> {
        self.acked().clone()
    }

    fn acked(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.acked_by.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Display for OperationStatusTracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "acked by {}/{} peers (quorum={})",
            self.ack_count(),
            self.total_peers,
            self.quorum_size
        )
    }
}

impl std::fmt::Debug for OperationStatusTracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationStatusTracker")
            .field("operation", &self.operation)
            .field("quorum_size", &self.quorum_size)
            .field("total_peers", &self.total_peers)
            .field("acked_by", &self.acked())
            .finish()
    }
}
