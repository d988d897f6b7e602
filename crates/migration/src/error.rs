//! Migration error types.

use corelib::{Address, PartitionId};
use replication::ReplicationError;

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrationError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MigrationError {
    #[error(transparent)]
    Core(#[from] corelib::Error),

    #[error(transparent)]
    Replication(#[from] ReplicationError),

    /// Copying replica data to the destination failed.
    #[error("replica copy of partition {partition_id} to {destination} failed: {reason}")]
    Transfer {
        partition_id: PartitionId,
        destination: Address,
        reason: String,
    },

    /// A member taking part in the migration left the cluster.
    #[error("{0} left the cluster during migration")]
    MemberLeft(Address),

    /// The plan no longer matches the partition table.
    #[error("stale migration plan: {0}")]
    Stale(String),
}

impl MigrationError {
    /// True if the failure means the plan itself is outdated, as opposed to
    /// a fault while executing a valid plan.
    pub fn is_stale_plan(&self) -> bool {
        matches!(
            self,
            Self::Stale(_) | Self::MemberLeft(_) | Self::Core(corelib::Error::InvalidState(_))
        )
    }
}
