use std::fmt::Display;
use std::fmt::Formatter;

/// The identity of a consensus operation.
///
/// A term and an index identify an operation globally. The order is
/// lexicographic on `(term, index)`: all operations of an earlier term sort
/// before any operation of a later term. Indexes are dense within a term but
/// not across terms.
#[derive(Debug, Default, Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct OpId {
    pub term: u64,
    pub index: u64,
}

impl OpId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl Display for OpId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}
