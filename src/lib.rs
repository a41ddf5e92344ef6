//! Leader-side replication queue of a Raft-like consensus module.
//!
//! A leader keeps every operation awaiting replication in a
//! [`PeerMessageQueue`]: an ordered in-memory buffer shared by all follower
//! peers, each draining it at its own pace through per-peer watermarks.
//! The queue admits operations under two-tier memory budgets (per queue and
//! process-wide), evicts operations once every peer has acknowledged them,
//! and rejects writes when a hard budget would otherwise be violated.
//!
//! What the queue does *not* do: persist anything, elect leaders, talk to
//! the network, or re-fetch trimmed operations from the durable log. It is
//! the passive heart of the replication path; the surrounding service wires
//! it to transport and storage.
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use bytes::Bytes;
//! use consensus_queue::{Config, OpId, Operation, OperationStatusTracker, PeerMessageQueue, PeerRequest, PeerStatus};
//!
//! let config = Config::default().validate()?;
//! let queue = PeerMessageQueue::new(&config, "tablet-1");
//!
//! queue.track_peer("peer-a", OpId::default())?;
//!
//! let op = Operation::replicate(OpId::new(1, 1), Bytes::from_static(b"row"));
//! queue.append_operation(Arc::new(OperationStatusTracker::new(op, 2, 3)))?;
//!
//! let mut request = PeerRequest::new();
//! queue.request_for_peer("peer-a", &mut request)?;
//! // ... send `request` over the wire, then feed the peer's status back:
//! let more = queue.response_from_peer("peer-a", &PeerStatus::at(OpId::new(1, 1)));
//! ```

#![deny(unused_qualifications)]

mod config;
mod error;
mod mem_tracker;
mod metrics;
mod op_id;
mod operation;
mod queue;
mod status_tracker;
mod watermark;

pub use crate::config::Config;
pub use crate::config::ConfigError;
pub use crate::error::QueueError;
pub use crate::mem_tracker::MemTracker;
pub use crate::metrics::QueueStats;
pub use crate::op_id::OpId;
pub use crate::operation::OpKind;
pub use crate::operation::Operation;
pub use crate::operation::OperationPayload;
pub use crate::queue::PeerMessageQueue;
pub use crate::queue::PeerRequest;
pub use crate::status_tracker::OperationStatusTracker;
pub use crate::watermark::PeerStatus;
