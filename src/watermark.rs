use std::error::Error;
use std::fmt::Display;
use std::fmt::Formatter;

use validit::Validate;

use crate::OpId;

/// A peer's progress along the three replication axes.
///
/// - `received`: highest OpId the peer has seen in a request.
/// - `replicated`: highest OpId the peer has made durable locally.
/// - `safe_commit`: highest OpId the peer considers committed.
///
/// At rest `safe_commit <= replicated <= received`, and each field only
/// advances for the lifetime of the peer's tracking. The same struct is the
/// status a peer reports back in a response; applying a response replaces
/// the stored status field by field.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct PeerStatus {
    pub received: OpId,
    pub replicated: OpId,
    pub safe_commit: OpId,
}

impl PeerStatus {
    pub fn new(received: OpId, replicated: OpId, safe_commit: OpId) -> Self {
        Self {
            received,
            replicated,
            safe_commit,
        }
    }

    /// The status of a peer that starts tracking at `initial_watermark`:
    /// all three axes equal.
    pub fn at(initial_watermark: OpId) -> Self {
        Self {
            received: initial_watermark,
            replicated: initial_watermark,
            safe_commit: initial_watermark,
        }
    }

    /// The lowest point at which either a REPLICATE or a COMMIT ack could
    /// still advance for this peer.
    pub(crate) fn lowest_ack_point(&self) -> OpId {
        self.replicated.min(self.safe_commit)
    }
}

impl Display for PeerStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{received: {}, replicated: {}, safe_commit: {}}}",
            self.received, self.replicated, self.safe_commit
        )
    }
}

impl Validate for PeerStatus {
    fn validate(&self) -> Result<(), Box<dyn Error>> {
        validit::less_equal!(self.safe_commit, self.replicated);
        validit::less_equal!(self.replicated, self.received);
        Ok(())
    }
}
