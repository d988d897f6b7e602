//! Node engine errors.

use corelib::Address;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, GridError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GridError {
    #[error(transparent)]
    Core(#[from] corelib::Error),

    #[error(transparent)]
    Migration(#[from] migration::MigrationError),

    #[error(transparent)]
    Replication(#[from] replication::ReplicationError),

    /// The member to fetch state from cannot be reached.
    #[error("{0} is unreachable")]
    Unreachable(Address),

    /// Parked operations were still present when the merge deadline passed.
    #[error("merge did not settle within {timeout:?}: {parked} operations still parked")]
    MergeTimeout { timeout: Duration, parked: usize },

    #[error("node engine is shut down")]
    Stopped,
}
