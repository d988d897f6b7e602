//! Error types for the core library.

use crate::node::Address;
use crate::partition::PartitionId;

/// Result type alias for the core library.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the core library.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Partition id outside `0..partition_count`.
    #[error("invalid partition id {id} (partition count {count})")]
    InvalidPartition { id: PartitionId, count: u32 },

    /// Replica index outside `0..MAX_REPLICA_COUNT`.
    #[error("invalid replica index {0}")]
    InvalidReplicaIndex(usize),

    /// Illegal state transition (e.g. assigning a replica with no active migration).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A required argument was missing.
    #[error("argument must not be null: {0}")]
    NullArgument(&'static str),

    /// An argument had an unusable value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Address is not part of the current member list.
    #[error("{0} is not a member of the cluster")]
    NotMember(Address),

    /// Configuration error.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Partition state could not be encoded or decoded.
    #[error("partition state codec error: {0}")]
    Codec(String),
}

impl Error {
    /// Shorthand for [`Error::InvalidState`].
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }
}
