//! Partitions and their replica assignment.
//!
//! A partition is a fixed-id shard of the keyspace. Each partition has up to
//! [`MAX_REPLICA_COUNT`] replica slots; slot 0 is the owner, the rest are
//! backups. The [`PartitionTable`] is the single source of truth for slot
//! contents and the [`planner`] computes the moves that restore balance
//! after membership changes.

mod migration_info;
pub mod planner;
mod table;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::node::Address;

pub use migration_info::{MigrationId, MigrationInfo, MigrationStatus};
pub use table::{PartitionStateSnapshot, PartitionTable};

/// Upper bound on replicas per partition (owner + 6 backups).
pub const MAX_REPLICA_COUNT: usize = 7;

/// Replica slots of one partition, indexed by replica index.
pub type ReplicaSlots = [Option<Address>; MAX_REPLICA_COUNT];

/// Identifier of a partition, `0..partition_count`.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl PartitionId {
    /// The id as a vector index.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<u32> for PartitionId {
    fn from(id: u32) -> Self {
        PartitionId(id)
    }
}

/// Returns a slot array with every replica unassigned.
pub fn empty_slots() -> ReplicaSlots {
    std::array::from_fn(|_| None)
}

/// Read-only copy of one partition's replica assignment.
///
/// `version` increases by one on every change to the slots.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub id: PartitionId,
    replicas: ReplicaSlots,
    pub version: u64,
}

impl Partition {
    /// An unassigned partition at version 0.
    pub fn new(id: PartitionId) -> Self {
        Self {
            id,
            replicas: empty_slots(),
            version: 0,
        }
    }

    /// The owner (replica 0), if assigned.
    pub fn owner(&self) -> Option<&Address> {
        self.replicas[0].as_ref()
    }

    pub fn replica(&self, index: usize) -> Option<&Address> {
        self.replicas.get(index).and_then(Option::as_ref)
    }

    pub fn replicas(&self) -> &ReplicaSlots {
        &self.replicas
    }

    /// Slot index held by `address`, if any.
    pub fn replica_index_of(&self, address: &Address) -> Option<usize> {
        self.replicas
            .iter()
            .position(|slot| slot.as_ref() == Some(address))
    }

    /// True if `local` owns this partition.
    pub fn is_local(&self, local: &Address) -> bool {
        self.owner() == Some(local)
    }

    pub fn is_assigned(&self) -> bool {
        self.replicas[0].is_some()
    }

    pub fn assigned_count(&self) -> usize {
        self.replicas.iter().filter(|slot| slot.is_some()).count()
    }

    pub(crate) fn slots_mut(&mut self) -> &mut ReplicaSlots {
        &mut self.replicas
    }
}
