use std::fmt::Display;
use std::fmt::Formatter;

/// A point-in-time snapshot of the queue's gauges.
///
/// All counters are updated under the queue lock, so a snapshot is
/// consistent with the buffer: `total_ops` equals the number of buffered
/// operations and equals `all_done_ops + majority_done_ops +
/// in_progress_ops`.
/// The state counters are signed gauges: an acknowledgement recorded on a
/// shared tracker outside the response path skews a bucket negative rather
/// than breaking the sum.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct QueueStats {
    /// Total number of queued operations.
    pub total_ops: i64,

    /// Operations acknowledged by all peers.
    pub all_done_ops: i64,

    /// Operations acknowledged by a majority but not all peers.
    pub majority_done_ops: i64,

    /// Operations acknowledged by a minority of peers.
    pub in_progress_ops: i64,

    /// Total payload bytes held by the queue.
    pub queue_bytes: u64,
}

impl Display for QueueStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Total Ops: {}, All Done Ops: {}, Only Majority Done Ops: {}, In Progress Ops: {}, Queue Size (bytes): {}",
            self.total_ops,
            self.all_done_ops,
            self.majority_done_ops,
            self.in_progress_ops,
            self.queue_bytes
        )
    }
}
