use crate::OpId;

/// Error variants returned by queue operations.
///
/// Errors are returned synchronously and never leave the queue in an
/// inconsistent state: a failed call releases any budget reservation it
/// made. The caller decides whether to retry, shed load, or evict a peer.
#[derive(Debug, thiserror::Error)]
#[derive(PartialEq, Eq)]
pub enum QueueError {
    /// A hard limit would be violated and no fully acknowledged prefix is
    /// left to trim. Only REPLICATE appends are rejected this way.
    #[error("cannot append replicate message: queue is full")]
    QueueFull,

    /// An append carried an OpId that is already buffered.
    #[error("operation {0} is already in the queue")]
    DuplicateOpId(OpId),

    /// The looked-up operation is not buffered (never appended, or already
    /// trimmed).
    #[error("operation {0} is not in the queue")]
    NotFound(OpId),

    /// The peer was never tracked or has been untracked.
    #[error("peer {0} is not tracked")]
    UnknownPeer(String),

    /// `track_peer` was called twice for the same peer.
    #[error("peer {0} is already tracked")]
    AlreadyTracked(String),

    /// A mutating call arrived after `close()`.
    #[error("queue is closed")]
    QueueClosed,
}
