//! Per-partition replica version vectors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use corelib::config::ReplicaSyncConfig;
use corelib::{Address, Error as CoreError, PartitionId, PartitionTable, MAX_REPLICA_COUNT};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::sync::{backoff_delay, ReplicaSyncInfo, ReplicaSyncer, SyncScheduler};

/// Version counters of one partition, one per replica index.
///
/// `versions[0]` is the owner's version. A replica index is dirty while its
/// version cannot be confirmed equal to the owner's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaVersionVector {
    pub partition_id: PartitionId,
    pub versions: [i64; MAX_REPLICA_COUNT],
    dirty: u8,
}

impl ReplicaVersionVector {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            versions: [0; MAX_REPLICA_COUNT],
            dirty: 0,
        }
    }

    pub fn owner_version(&self) -> i64 {
        self.versions[0]
    }

    /// True if any replica index is dirty.
    pub fn is_dirty(&self) -> bool {
        self.dirty != 0
    }

    pub fn is_replica_dirty(&self, replica_index: usize) -> bool {
        replica_index < MAX_REPLICA_COUNT && self.dirty & (1 << replica_index) != 0
    }

    /// Dirty replica indices in ascending order.
    pub fn dirty_indices(&self) -> Vec<usize> {
        (1..MAX_REPLICA_COUNT)
            .filter(|&i| self.is_replica_dirty(i))
            .collect()
    }

    fn set_dirty(&mut self, replica_index: usize) {
        self.dirty |= 1 << replica_index;
    }

    fn clear_dirty(&mut self, replica_index: usize) {
        self.dirty &= !(1 << replica_index);
    }

    fn vacate(&mut self, replica_index: usize) {
        self.clear_dirty(replica_index);
        self.versions[replica_index] = 0;
    }
}

/// Tracks replica versions of every partition on one member and drives
/// their repair.
///
/// Each partition's vector sits behind its own lock; aggregate accessors
/// copy one vector at a time and never hold two locks.
pub struct ReplicaVersionManager {
    local: Address,
    table: Arc<PartitionTable>,
    vectors: Vec<Mutex<ReplicaVersionVector>>,
    scheduler: SyncScheduler,
    config: ReplicaSyncConfig,
    driver: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ReplicaVersionManager {
    pub fn new(local: Address, table: Arc<PartitionTable>, config: ReplicaSyncConfig) -> Self {
        let vectors = (0..table.partition_count())
            .map(|id| Mutex::new(ReplicaVersionVector::new(PartitionId(id))))
            .collect();
        Self {
            local,
            table,
            vectors,
            scheduler: SyncScheduler::new(),
            config,
            driver: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    fn vector(&self, partition_id: PartitionId) -> Result<&Mutex<ReplicaVersionVector>> {
        self.vectors.get(partition_id.index()).ok_or_else(|| {
            CoreError::InvalidPartition {
                id: partition_id,
                count: self.table.partition_count(),
            }
            .into()
        })
    }

    fn check_backup_index(replica_index: usize) -> Result<()> {
        if replica_index == 0 || replica_index >= MAX_REPLICA_COUNT {
            return Err(CoreError::InvalidReplicaIndex(replica_index).into());
        }
        Ok(())
    }

    /// Increments the owner version after a mutating operation. Returns the
    /// new version.
    pub fn bump_owner_version(&self, partition_id: PartitionId) -> Result<i64> {
        let mut vector = self.vector(partition_id)?.lock();
        vector.versions[0] += 1;
        Ok(vector.versions[0])
    }

    /// Flags a replica as out of sync and schedules its repair.
    pub fn mark_dirty(&self, partition_id: PartitionId, replica_index: usize) -> Result<()> {
        Self::check_backup_index(replica_index)?;
        self.vector(partition_id)?.lock().set_dirty(replica_index);
        debug!(partition_id = %partition_id, replica_index, "replica marked dirty");
        self.schedule_sync(partition_id, replica_index)?;
        Ok(())
    }

    /// Schedules a first-attempt sync for the replica currently in the slot,
    /// carrying the current owner version.
    ///
    /// Returns `None` when the slot is empty. A vacant slot has nothing to
    /// repair, so its dirty flag is dropped.
    pub fn schedule_sync(
        &self,
        partition_id: PartitionId,
        replica_index: usize,
    ) -> Result<Option<ReplicaSyncInfo>> {
        Self::check_backup_index(replica_index)?;
        let partition = self.table.get_partition(partition_id)?;
        let vector = self.vector(partition_id)?;
        let Some(target) = partition.replica(replica_index).cloned() else {
            vector.lock().vacate(replica_index);
            return Ok(None);
        };
        let owner_version = vector.lock().owner_version();
        let info = self.scheduler.schedule(
            partition_id,
            replica_index,
            target,
            owner_version,
            0,
            self.config.base_delay,
        );
        Ok(Some(info))
    }

    /// Applies the outcome of a sync attempt.
    ///
    /// Success records the owner version the sync carried. The replica is
    /// clean only if the owner has not moved past that version meanwhile;
    /// otherwise another sync is scheduled. Nothing changes when a newer
    /// request for the same replica was scheduled in the meantime. Failure
    /// reschedules with backoff while the target still holds the replica.
    pub fn on_sync_result(&self, info: &ReplicaSyncInfo, success: bool) -> Result<()> {
        let superseded = self.scheduler.finish(info);
        let vector = self.vector(info.partition_id)?;

        if success {
            metrics::counter!("grid_replica_sync_total", "result" => "success").increment(1);
            if superseded {
                return Ok(());
            }
            let caught_up = {
                let mut vector = vector.lock();
                let slot = &mut vector.versions[info.replica_index];
                *slot = (*slot).max(info.owner_version);
                let caught_up = vector.owner_version() == info.owner_version;
                if caught_up {
                    vector.clear_dirty(info.replica_index);
                }
                caught_up
            };
            debug!(
                partition_id = %info.partition_id,
                replica_index = info.replica_index,
                target = %info.target_address,
                version = info.owner_version,
                caught_up,
                "replica synced"
            );
            if !caught_up {
                self.schedule_sync(info.partition_id, info.replica_index)?;
            }
            return Ok(());
        }

        metrics::counter!("grid_replica_sync_total", "result" => "failure").increment(1);
        if superseded {
            return Ok(());
        }
        let partition = self.table.get_partition(info.partition_id)?;
        if partition.replica(info.replica_index) != Some(&info.target_address) {
            debug!(
                partition_id = %info.partition_id,
                replica_index = info.replica_index,
                target = %info.target_address,
                "sync target no longer holds replica"
            );
            // repair whoever holds the slot now, or release it if vacant
            self.schedule_sync(info.partition_id, info.replica_index)?;
            return Ok(());
        }
        let retry_count = info.retry_count.saturating_add(1);
        let delay = backoff_delay(self.config.base_delay, self.config.max_delay, retry_count);
        warn!(
            partition_id = %info.partition_id,
            replica_index = info.replica_index,
            target = %info.target_address,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            "replica sync failed, rescheduling"
        );
        let owner_version = vector.lock().owner_version();
        self.scheduler.schedule(
            info.partition_id,
            info.replica_index,
            info.target_address.clone(),
            owner_version,
            retry_count,
            delay,
        );
        Ok(())
    }

    /// Drops the dirty flags of `partition_id` whose slot is now empty.
    /// Returns how many were dropped.
    pub fn release_vacant(&self, partition_id: PartitionId) -> Result<usize> {
        let partition = self.table.get_partition(partition_id)?;
        let mut vector = self.vector(partition_id)?.lock();
        let vacant: Vec<usize> = vector
            .dirty_indices()
            .into_iter()
            .filter(|&i| partition.replica(i).is_none())
            .collect();
        for &replica_index in &vacant {
            vector.vacate(replica_index);
        }
        Ok(vacant.len())
    }

    /// [`release_vacant`](Self::release_vacant) over every partition.
    pub fn release_all_vacant(&self) -> usize {
        let released: usize = (0..self.table.partition_count())
            .filter_map(|id| self.release_vacant(PartitionId(id)).ok())
            .sum();
        if released > 0 {
            debug!(released, "dirty flags of vacant replicas dropped");
        }
        released
    }

    /// Copy of one partition's vector.
    pub fn get_replica_versions(&self, partition_id: PartitionId) -> Result<ReplicaVersionVector> {
        Ok(*self.vector(partition_id)?.lock())
    }

    /// Copies of the vectors of partitions this member owns.
    pub fn get_owned_replica_versions(&self) -> Vec<ReplicaVersionVector> {
        self.table
            .partitions_owned_by(&self.local)
            .into_iter()
            .filter_map(|id| self.get_replica_versions(id).ok())
            .collect()
    }

    pub fn get_all_replica_versions(&self) -> Vec<ReplicaVersionVector> {
        self.vectors.iter().map(|v| *v.lock()).collect()
    }

    pub fn is_dirty(&self, partition_id: PartitionId) -> bool {
        self.vector(partition_id).is_ok_and(|v| v.lock().is_dirty())
    }

    /// True if any partition owned by this member has a dirty replica.
    pub fn has_dirty_owned_partition(&self) -> bool {
        self.get_owned_replica_versions()
            .iter()
            .any(ReplicaVersionVector::is_dirty)
    }

    pub fn get_ongoing_replica_sync_requests(&self) -> Vec<ReplicaSyncInfo> {
        self.scheduler.ongoing()
    }

    pub fn get_scheduled_replica_sync_requests(&self) -> Vec<ReplicaSyncInfo> {
        self.scheduler.scheduled()
    }

    /// Drops scheduled syncs whose target left the cluster, and the dirty
    /// flags of slots already emptied.
    pub fn cancel_syncs_for(&self, address: &Address) -> usize {
        let cancelled = self.scheduler.cancel_for(address);
        if cancelled > 0 {
            info!(member = %address, cancelled, "replica syncs cancelled");
        }
        self.release_all_vacant();
        cancelled
    }

    /// Forgets every version and sync request.
    pub fn reset(&self) {
        self.scheduler.clear();
        for vector in &self.vectors {
            let mut vector = vector.lock();
            *vector = ReplicaVersionVector::new(vector.partition_id);
        }
        debug!("replica versions reset");
    }

    /// Spawns the background task that runs due syncs through `syncer`.
    /// Must be called inside a tokio runtime.
    pub fn start(self: &Arc<Self>, syncer: Arc<dyn ReplicaSyncer>) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move { manager.drive(syncer).await });
        if let Some(previous) = self.driver.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn drive(self: Arc<Self>, syncer: Arc<dyn ReplicaSyncer>) {
        const IDLE_POLL: std::time::Duration = std::time::Duration::from_secs(1);

        while !self.stopped.load(Ordering::Acquire) {
            for info in self
                .scheduler
                .take_due(Instant::now(), self.config.parallelism)
            {
                let manager = Arc::clone(&self);
                let syncer = Arc::clone(&syncer);
                tokio::spawn(async move {
                    let success = match syncer.sync_replica(&info).await {
                        Ok(()) => true,
                        Err(e) => {
                            debug!(error = %e, request_id = info.request_id, "sync attempt failed");
                            false
                        }
                    };
                    if let Err(e) = manager.on_sync_result(&info, success) {
                        warn!(error = %e, "could not record sync result");
                    }
                });
            }

            let sleep = match self.scheduler.next_due() {
                Some(due) => due.saturating_duration_since(Instant::now()).min(IDLE_POLL),
                None => IDLE_POLL,
            };
            tokio::select! {
                _ = self.scheduler.wakeup().notified() => {}
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }

    /// Stops the background task. Pending requests stay observable.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ReplicaVersionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaVersionManager")
            .field("local", &self.local)
            .field("partitions", &self.vectors.len())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
