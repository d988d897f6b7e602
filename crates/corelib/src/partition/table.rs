use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::node::Address;
use crate::partition::{
    planner, MigrationInfo, Partition, PartitionId, ReplicaSlots, MAX_REPLICA_COUNT,
};

#[derive(Debug)]
struct Shard {
    partition: Partition,
    active: Option<MigrationInfo>,
}

/// Authoritative partition to replica mapping.
///
/// One lock per partition; no operation takes more than one shard lock at a
/// time. Readers get copies, so a caller never sees a partition half way
/// through a migration commit.
#[derive(Debug)]
pub struct PartitionTable {
    partition_count: u32,
    replica_count: usize,
    shards: Vec<RwLock<Shard>>,
    version: AtomicU64,
    initialized: AtomicBool,
}

/// Versioned copy of the whole table, published by the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionStateSnapshot {
    pub version: u64,
    pub partitions: Vec<Partition>,
}

impl PartitionStateSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Codec(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Codec(e.to_string()))
    }
}

impl PartitionTable {
    /// Creates an unassigned table.
    pub fn new(partition_count: u32, replica_count: usize) -> Result<Self> {
        if partition_count == 0 {
            return Err(Error::Configuration("partition_count must be > 0".into()));
        }
        if replica_count == 0 || replica_count > MAX_REPLICA_COUNT {
            return Err(Error::Configuration(format!(
                "replica_count must be in 1..={MAX_REPLICA_COUNT}, got {replica_count}"
            )));
        }
        let shards = (0..partition_count)
            .map(|id| {
                RwLock::new(Shard {
                    partition: Partition::new(PartitionId(id)),
                    active: None,
                })
            })
            .collect();
        Ok(Self {
            partition_count,
            replica_count,
            shards,
            version: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
        })
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    pub fn replica_count(&self) -> usize {
        self.replica_count
    }

    /// Table-wide version; increases on every slot change of any partition.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// True once the first arrangement has been applied.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn shard(&self, id: PartitionId) -> Result<&RwLock<Shard>> {
        self.shards.get(id.index()).ok_or(Error::InvalidPartition {
            id,
            count: self.partition_count,
        })
    }

    fn bump(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Copy of one partition.
    pub fn get_partition(&self, id: PartitionId) -> Result<Partition> {
        Ok(self.shard(id)?.read().partition.clone())
    }

    pub fn owner_of(&self, id: PartitionId) -> Result<Option<Address>> {
        Ok(self.shard(id)?.read().partition.owner().cloned())
    }

    /// Copies of all partitions, one shard at a time.
    pub fn partitions(&self) -> Vec<Partition> {
        self.shards
            .iter()
            .map(|s| s.read().partition.clone())
            .collect()
    }

    /// Slots `0..replica_count` of one partition, owner first.
    pub fn get_replica_addresses(&self, id: PartitionId) -> Result<Vec<Option<Address>>> {
        let shard = self.shard(id)?.read();
        Ok(shard.partition.replicas()[..self.replica_count].to_vec())
    }

    /// [`get_replica_addresses`](Self::get_replica_addresses) for every
    /// partition.
    pub fn replica_addresses(&self) -> BTreeMap<PartitionId, Vec<Option<Address>>> {
        self.shards
            .iter()
            .map(|s| {
                let shard = s.read();
                (
                    shard.partition.id,
                    shard.partition.replicas()[..self.replica_count].to_vec(),
                )
            })
            .collect()
    }

    /// Every address that holds at least one replica.
    pub fn get_all_replica_addresses(&self) -> BTreeSet<Address> {
        self.shards
            .iter()
            .flat_map(|s| {
                s.read()
                    .partition
                    .replicas()
                    .iter()
                    .flatten()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn partitions_owned_by(&self, address: &Address) -> Vec<PartitionId> {
        self.shards
            .iter()
            .filter_map(|s| {
                let shard = s.read();
                (shard.partition.owner() == Some(address)).then_some(shard.partition.id)
            })
            .collect()
    }

    /// Marks `info` as the active migration of its partition.
    pub fn begin_migration(&self, info: &MigrationInfo) -> Result<()> {
        if info.replica_index >= MAX_REPLICA_COUNT {
            return Err(Error::InvalidReplicaIndex(info.replica_index));
        }
        let mut shard = self.shard(info.partition_id)?.write();
        if let Some(active) = &shard.active {
            return Err(Error::invalid_state(format!(
                "partition {} already migrating ({})",
                info.partition_id, active.id
            )));
        }
        shard.active = Some(info.clone());
        Ok(())
    }

    /// Clears the active migration of a partition. Returns it, if any.
    pub fn end_migration(&self, id: PartitionId) -> Result<Option<MigrationInfo>> {
        Ok(self.shard(id)?.write().active.take())
    }

    pub fn active_migration(&self, id: PartitionId) -> Result<Option<MigrationInfo>> {
        Ok(self.shard(id)?.read().active.clone())
    }

    pub fn is_migrating(&self, id: PartitionId) -> bool {
        self.shard(id).is_ok_and(|s| s.read().active.is_some())
    }

    /// Places `address` in slot `replica_index` as the commit step of the
    /// active migration and returns the partition's new version.
    ///
    /// When `address` is the destination of the active migration the whole
    /// move is applied at once, shifting the previous owner to its backup slot
    /// if the migration asks for it.
    pub fn assign(&self, id: PartitionId, replica_index: usize, address: Address) -> Result<u64> {
        if replica_index >= MAX_REPLICA_COUNT {
            return Err(Error::InvalidReplicaIndex(replica_index));
        }
        let mut shard = self.shard(id)?.write();
        let active = match &shard.active {
            Some(active) if active.replica_index == replica_index => active.clone(),
            _ => {
                return Err(Error::invalid_state(format!(
                    "no active migration for partition {id} replica {replica_index}"
                )))
            }
        };

        let slots = shard.partition.slots_mut();
        if active.destination == address {
            planner::apply(slots, &active);
        } else {
            for slot in slots.iter_mut() {
                if slot.as_ref() == Some(&address) {
                    *slot = None;
                }
            }
            slots[replica_index] = Some(address.clone());
        }
        shard.partition.version += 1;
        let version = shard.partition.version;
        drop(shard);

        self.bump();
        debug!(partition_id = %id, replica_index, destination = %address, version, "replica assigned");
        Ok(version)
    }

    /// Applies the first arrangement directly, without migrations.
    pub fn initialize(&self, target: &[ReplicaSlots]) -> Result<()> {
        if target.len() != self.shards.len() {
            return Err(Error::InvalidArgument(format!(
                "arrangement covers {} partitions, table has {}",
                target.len(),
                self.partition_count
            )));
        }
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(Error::invalid_state("partition table already initialized"));
        }
        for (shard, slots) in self.shards.iter().zip(target) {
            let mut shard = shard.write();
            if shard.partition.replicas() != slots {
                *shard.partition.slots_mut() = slots.clone();
                shard.partition.version += 1;
            }
        }
        let version = self.bump();
        info!(partitions = self.partition_count, version, "partition table initialized");
        Ok(())
    }

    /// Ordered migrations that rebalance the table over `members`.
    pub fn compute_rebalance(&self, members: &[Address]) -> Vec<MigrationInfo> {
        planner::plan(&self.partitions(), members, self.replica_count)
    }

    /// Target slots of every partition for `members`.
    pub fn compute_target(&self, members: &[Address]) -> Vec<ReplicaSlots> {
        planner::compute_target(&self.partitions(), members, self.replica_count)
    }

    pub fn snapshot(&self) -> PartitionStateSnapshot {
        let partitions = self.partitions();
        PartitionStateSnapshot {
            version: self.version(),
            partitions,
        }
    }

    /// Adopts a snapshot published by the master. Returns false and changes
    /// nothing if the snapshot is not newer than the local state.
    pub fn apply_snapshot(&self, snapshot: &PartitionStateSnapshot) -> Result<bool> {
        if snapshot.partitions.len() != self.shards.len() {
            return Err(Error::InvalidArgument(format!(
                "snapshot covers {} partitions, table has {}",
                snapshot.partitions.len(),
                self.partition_count
            )));
        }
        if snapshot.version <= self.version() {
            return Ok(false);
        }
        for (shard, partition) in self.shards.iter().zip(&snapshot.partitions) {
            let mut shard = shard.write();
            shard.partition = partition.clone();
        }
        self.version.fetch_max(snapshot.version, Ordering::AcqRel);
        self.initialized
            .store(snapshot.partitions.iter().any(Partition::is_assigned), Ordering::Release);
        debug!(version = snapshot.version, "partition state applied");
        Ok(true)
    }

    /// Removes `address` from every backup slot. Owner slots are kept so the
    /// planner can see the partition as orphaned and promote a backup first.
    /// Returns the number of slots cleared.
    pub fn purge_member(&self, address: &Address) -> usize {
        let mut cleared = 0;
        for shard in &self.shards {
            let mut shard = shard.write();
            let mut changed = false;
            for slot in shard.partition.slots_mut().iter_mut().skip(1) {
                if slot.as_ref() == Some(address) {
                    *slot = None;
                    changed = true;
                    cleared += 1;
                }
            }
            if changed {
                shard.partition.version += 1;
            }
        }
        if cleared > 0 {
            self.bump();
            debug!(member = %address, cleared, "backup replicas purged");
        }
        cleared
    }

    /// Unassigns every partition. Partition versions keep increasing so
    /// callers holding an old version still see it as stale.
    pub fn reset(&self) {
        for shard in &self.shards {
            let mut shard = shard.write();
            shard.active = None;
            if shard.partition.assigned_count() > 0 {
                *shard.partition.slots_mut() = super::empty_slots();
                shard.partition.version += 1;
            }
        }
        self.initialized.store(false, Ordering::Release);
        let version = self.bump();
        info!(version, "partition table reset");
    }

    /// Discards local state and adopts `snapshot` as is, version included.
    ///
    /// Used when the member joins another cluster: its own versions belong
    /// to a history that no longer applies.
    pub fn reset_to(&self, snapshot: &PartitionStateSnapshot) -> Result<()> {
        if snapshot.partitions.len() != self.shards.len() {
            return Err(Error::InvalidArgument(format!(
                "snapshot covers {} partitions, table has {}",
                snapshot.partitions.len(),
                self.partition_count
            )));
        }
        for (shard, partition) in self.shards.iter().zip(&snapshot.partitions) {
            let mut shard = shard.write();
            shard.active = None;
            shard.partition = partition.clone();
        }
        self.version.store(snapshot.version, Ordering::Release);
        self.initialized
            .store(snapshot.partitions.iter().any(Partition::is_assigned), Ordering::Release);
        info!(version = snapshot.version, "partition table replaced");
        Ok(())
    }
}
