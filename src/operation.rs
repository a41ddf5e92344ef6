use std::fmt::Display;
use std::fmt::Formatter;

use bytes::Bytes;

use crate::OpId;

/// The kind of work an operation carries.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum OpKind {
    /// A user write to be durably replicated.
    Replicate,

    /// Notification that a previously replicated operation is now committed
    /// and may be applied.
    Commit,
}

/// Payload variants of an operation.
///
/// The payload bytes are opaque to the queue; it only measures their size.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum OperationPayload {
    Replicate(Bytes),

    /// A commit of `committed_op_id`, which must already have been
    /// replicated.
    Commit { committed_op_id: OpId, data: Bytes },
}

/// A consensus operation awaiting replication.
///
/// Operations are immutable once enqueued. They are shared between the
/// queue's buffer and any in-flight request batches.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Operation {
    id: OpId,
    payload: OperationPayload,
}

impl Operation {
    pub fn replicate(id: OpId, data: Bytes) -> Self {
        Self {
            id,
            payload: OperationPayload::Replicate(data),
        }
    }

    pub fn commit(id: OpId, committed_op_id: OpId, data: Bytes) -> Self {
        Self {
            id,
            payload: OperationPayload::Commit { committed_op_id, data },
        }
    }

    pub fn op_id(&self) -> OpId {
        self.id
    }

    pub fn kind(&self) -> OpKind {
        match self.payload {
            OperationPayload::Replicate(_) => OpKind::Replicate,
            OperationPayload::Commit { .. } => OpKind::Commit,
        }
    }

    pub fn is_replicate(&self) -> bool {
        self.kind() == OpKind::Replicate
    }

    pub fn is_commit(&self) -> bool {
        self.kind() == OpKind::Commit
    }

    /// The serialized size of the payload in bytes.
    pub fn byte_size(&self) -> u32 {
        let data = match &self.payload {
            OperationPayload::Replicate(data) => data,
            OperationPayload::Commit { data, .. } => data,
        };
        data.len() as u32
    }

    /// The operation this COMMIT refers to; `None` for a REPLICATE.
    pub fn committed_op_id(&self) -> Option<OpId> {
        match &self.payload {
            OperationPayload::Replicate(_) => None,
            OperationPayload::Commit { committed_op_id, .. } => Some(*committed_op_id),
        }
    }

    pub fn payload(&self) -> &OperationPayload {
        &self.payload
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.payload {
            OperationPayload::Replicate(_) => {
                write!(f, "{} REPLICATE({} bytes)", self.id, self.byte_size())
            }
            OperationPayload::Commit { committed_op_id, .. } => {
                write!(f, "{} COMMIT(of {}, {} bytes)", self.id, committed_op_id, self.byte_size())
            }
        }
    }
}
