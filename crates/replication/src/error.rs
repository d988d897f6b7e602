//! Replication error types.

use corelib::{Address, PartitionId};

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicationError {
    #[error(transparent)]
    Core(#[from] corelib::Error),

    /// The replica could not be brought up to date.
    #[error("sync of partition {partition_id} replica {replica_index} on {target} failed: {reason}")]
    SyncFailed {
        partition_id: PartitionId,
        replica_index: usize,
        target: Address,
        reason: String,
    },

    /// The sync target no longer holds the replica.
    #[error("{0} no longer holds the replica")]
    TargetGone(Address),

    #[error("replica sync scheduler stopped")]
    Stopped,
}
