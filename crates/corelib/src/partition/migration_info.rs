//! Planned replica moves.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::node::Address;
use crate::partition::PartitionId;

/// Identifier assigned to a migration when it is planned.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct MigrationId(pub u64);

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Lifecycle of a migration: `Planned -> Active -> {Success, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStatus {
    Planned,
    Active,
    Success,
    Failed,
}

impl MigrationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Planned => write!(f, "planned"),
            Self::Active => write!(f, "active"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One replica move of one partition.
///
/// `destination` takes slot `replica_index`. If it already held another slot
/// of the partition (`destination_current_index`), that slot is vacated.
/// The previous holder of the slot (`source`) is dropped from the partition,
/// or shifted to `source_new_index` when the move is an owner hand-off that
/// keeps the old owner as a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationInfo {
    pub id: MigrationId,
    pub partition_id: PartitionId,
    pub replica_index: usize,
    pub source: Option<Address>,
    pub destination: Address,
    pub destination_current_index: Option<usize>,
    pub source_new_index: Option<usize>,
    pub status: MigrationStatus,
}

impl MigrationInfo {
    pub fn new(
        partition_id: PartitionId,
        replica_index: usize,
        source: Option<Address>,
        destination: Address,
    ) -> Self {
        Self {
            id: MigrationId(0),
            partition_id,
            replica_index,
            source,
            destination,
            destination_current_index: None,
            source_new_index: None,
            status: MigrationStatus::Planned,
        }
    }

    /// True if the move changes the partition owner.
    pub fn is_ownership_change(&self) -> bool {
        self.replica_index == 0
    }

    /// True if the migration involves `address` as source or destination.
    pub fn involves(&self, address: &Address) -> bool {
        self.source.as_ref() == Some(address) || &self.destination == address
    }
}

impl fmt::Display for MigrationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} partition={} replica={} {} -> {} ({})",
            self.id,
            self.partition_id,
            self.replica_index,
            self.source
                .as_ref()
                .map_or_else(|| "-".to_string(), Address::to_string),
            self.destination,
            self.status
        )
    }
}
