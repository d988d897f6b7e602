//! Migration execution.
//!
//! # Lifecycle
//!
//! Every migration goes `Planned -> Active -> {Success, Failed}`:
//!
//! 1. A worker takes it from the queue and validates it against the current
//!    membership and partition table.
//! 2. The table records it as the partition's active migration; listeners
//!    get `migration_started`.
//! 3. Replica data is copied, retrying up to `copy_attempts` times within
//!    the same active migration.
//! 4. The table commits the move, the affected backup slots are marked dirty
//!    for anti-entropy, and listeners get `migration_completed`.
//!
//! Any failure after step 2 fires `migration_failed` instead. A failure at
//! any step drops the rest of the plan and schedules a fresh rebalance for
//! when the coordinator goes idle, because the plan was computed against a
//! view that may no longer hold.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use corelib::config::MigrationConfig;
use corelib::{
    Address, MembershipService, MigrationId, MigrationInfo, MigrationStatus, PartitionTable,
};
use parking_lot::Mutex;
use replication::ReplicaVersionManager;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{MigrationError, Result};
use crate::listener::{EventKind, ListenerId, ListenerRegistry, MigrationEvent, MigrationListener};
use crate::queue::MigrationQueue;
use crate::transfer::{PartitionStatePublisher, ReplicaDataTransfer};

#[derive(Debug, Default)]
struct Counters {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Drains planned migrations with a fixed pool of workers.
pub struct MigrationCoordinator {
    table: Arc<PartitionTable>,
    versions: Arc<ReplicaVersionManager>,
    membership: Arc<dyn MembershipService>,
    transfer: Arc<dyn ReplicaDataTransfer>,
    publisher: Mutex<Option<Arc<dyn PartitionStatePublisher>>>,
    listeners: ListenerRegistry,
    queue: MigrationQueue,
    config: MigrationConfig,
    next_id: AtomicU64,
    counters: Counters,
    replan_requested: AtomicBool,
    planning: Mutex<()>,
    idle: Notify,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl MigrationCoordinator {
    pub fn new(
        table: Arc<PartitionTable>,
        versions: Arc<ReplicaVersionManager>,
        membership: Arc<dyn MembershipService>,
        transfer: Arc<dyn ReplicaDataTransfer>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            table,
            versions,
            membership,
            transfer,
            publisher: Mutex::new(None),
            listeners: ListenerRegistry::new(),
            queue: MigrationQueue::new(),
            config,
            next_id: AtomicU64::new(0),
            counters: Counters::default(),
            replan_requested: AtomicBool::new(false),
            planning: Mutex::new(()),
            idle: Notify::new(),
            workers: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Sets the hook that receives the table after every commit.
    pub fn set_publisher(&self, publisher: Arc<dyn PartitionStatePublisher>) {
        *self.publisher.lock() = Some(publisher);
    }

    /// Spawns `parallelism` workers. Must be called inside a tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        for worker in 0..self.config.parallelism {
            let coordinator = Arc::clone(self);
            workers.push(tokio::spawn(async move { coordinator.work(worker).await }));
        }
        debug!(workers = self.config.parallelism, "migration workers started");
    }

    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
        self.queue.clear_pending();
        self.idle.notify_waiters();
    }

    pub fn add_migration_listener(
        &self,
        listener: Option<Arc<dyn MigrationListener>>,
    ) -> Result<ListenerId> {
        self.listeners.add(listener)
    }

    pub fn remove_migration_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Assigns ids and appends the migrations to the queue.
    pub fn enqueue(&self, migrations: Vec<MigrationInfo>) -> usize {
        let migrations = migrations.into_iter().map(|mut info| {
            info.id = MigrationId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
            info.status = MigrationStatus::Planned;
            info
        });
        let added = self.queue.push_all(migrations);
        if added > 0 {
            debug!(added, queued = self.queue.len(), "migrations enqueued");
        }
        added
    }

    /// Brings the table towards balance for the current member list.
    ///
    /// An unassigned table gets its first arrangement directly. Otherwise
    /// the planned moves are queued; if migrations are already running, the
    /// rest of the current plan is dropped and a new one is computed once
    /// they finish. Returns the number of migrations queued.
    pub fn rebalance(&self) -> Result<usize> {
        if self.stopped.load(Ordering::Acquire) {
            return Ok(0);
        }
        let _planning = self.planning.lock();
        if !self.queue.is_idle() {
            let dropped = self.queue.clear_pending().len();
            self.replan_requested.store(true, Ordering::Release);
            if !self.queue.is_idle() {
                debug!(dropped, "rebalance deferred until running migrations finish");
                return Ok(0);
            }
        }
        let queued = self.plan_now();
        self.replan_requested.store(false, Ordering::Release);
        queued
    }

    fn plan_now(&self) -> Result<usize> {
        let list = self.membership.member_list();
        // only the master writes the table
        if list.master() != Some(&self.membership.local_address()) {
            return Ok(0);
        }
        let members = list.sorted_addresses();
        if !self.table.is_initialized() {
            if members.is_empty() {
                return Ok(0);
            }
            let target = self.table.compute_target(&members);
            self.table.initialize(&target)?;
            self.publish();
            return Ok(0);
        }
        let plan = self.table.compute_rebalance(&members);
        Ok(self.enqueue(plan))
    }

    /// Handles a departure on the master: clears the member's backup slots,
    /// publishes the result, drops the remaining plan and re-plans.
    pub fn on_member_removed(&self, address: &Address) -> Result<usize> {
        if self.membership.member_list().master() == Some(&self.membership.local_address()) {
            let cleared = self.table.purge_member(address);
            let released = self.versions.release_all_vacant();
            debug!(member = %address, cleared, released, "departed member purged");
            if cleared > 0 {
                self.publish();
            }
        }
        let dropped = self.queue.clear_pending();
        let involved = dropped.iter().filter(|m| m.involves(address)).count();
        info!(member = %address, dropped = dropped.len(), involved, "re-planning after member removal");
        self.rebalance()
    }

    /// Forgets the remaining plan and any pending re-plan, e.g. when the
    /// member merges into another cluster. Running migrations finish or fail
    /// on their own. Returns the number of migrations dropped.
    pub fn reset(&self) -> usize {
        let _planning = self.planning.lock();
        let dropped = self.queue.clear_pending().len();
        self.replan_requested.store(false, Ordering::Release);
        if self.is_idle() {
            self.idle.notify_waiters();
        }
        debug!(dropped, "migration plan reset");
        dropped
    }

    fn replan_if_idle(&self) {
        if self.replan_requested.load(Ordering::Acquire) && self.queue.is_idle() {
            let _planning = self.planning.lock();
            if self.replan_requested.load(Ordering::Acquire)
                && self.queue.is_idle()
                && !self.stopped.load(Ordering::Acquire)
            {
                match self.plan_now() {
                    Ok(queued) => debug!(queued, "re-plan queued"),
                    Err(e) => warn!(error = %e, "re-plan failed"),
                }
                self.replan_requested.store(false, Ordering::Release);
            }
        }
        if self.is_idle() {
            self.idle.notify_waiters();
        }
    }

    async fn work(self: Arc<Self>, worker: usize) {
        while !self.stopped.load(Ordering::Acquire) {
            let info = self.queue.next().await;
            let partition_id = info.partition_id;
            self.run_migration(worker, info).await;
            self.queue.complete(partition_id);
            self.replan_if_idle();
        }
    }

    async fn run_migration(&self, worker: usize, mut info: MigrationInfo) {
        if let Err(e) = self.validate(&info) {
            debug!(worker, migration = %info, error = %e, "migration rejected before start");
            self.on_failure(&mut info, e, false);
            return;
        }
        if let Err(e) = self.table.begin_migration(&info) {
            self.on_failure(&mut info, e.into(), false);
            return;
        }

        info.status = MigrationStatus::Active;
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("grid_migrations_started_total").increment(1);
        info!(
            worker,
            migration_id = %info.id,
            partition_id = %info.partition_id,
            replica_index = info.replica_index,
            source = ?info.source,
            destination = %info.destination,
            "migration started"
        );
        self.fire(EventKind::Started, &info);

        let outcome = match self.copy_with_retries(&info).await {
            Ok(()) => self.commit(&info),
            Err(e) => Err(e),
        };
        if let Err(e) = self.table.end_migration(info.partition_id) {
            warn!(error = %e, "could not clear active migration");
        }

        match outcome {
            Ok(()) => {
                info.status = MigrationStatus::Success;
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("grid_migrations_completed_total").increment(1);
                info!(migration_id = %info.id, partition_id = %info.partition_id, "migration completed");
                self.fire(EventKind::Completed, &info);
            }
            Err(e) => self.on_failure(&mut info, e, true),
        }
    }

    fn validate(&self, info: &MigrationInfo) -> Result<()> {
        if !self.membership.is_member(&info.destination) {
            return Err(MigrationError::MemberLeft(info.destination.clone()));
        }
        let partition = self.table.get_partition(info.partition_id)?;
        if partition.replica(info.replica_index) != info.source.as_ref() {
            return Err(MigrationError::Stale(format!(
                "partition {} replica {} is held by {:?}, plan expected {:?}",
                info.partition_id,
                info.replica_index,
                partition.replica(info.replica_index),
                info.source
            )));
        }
        Ok(())
    }

    async fn copy_with_retries(&self, info: &MigrationInfo) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .transfer
                .replicate_into(
                    info.partition_id,
                    info.replica_index,
                    info.source.as_ref(),
                    &info.destination,
                )
                .await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.config.copy_attempts => return Err(e),
                Err(e) => {
                    debug!(migration_id = %info.id, attempt, error = %e, "replica copy failed, retrying");
                    tokio::time::sleep(self.config.copy_retry_delay).await;
                    if !self.membership.is_member(&info.destination) {
                        return Err(MigrationError::MemberLeft(info.destination.clone()));
                    }
                }
            }
        }
    }

    fn commit(&self, info: &MigrationInfo) -> Result<()> {
        self.table.assign(
            info.partition_id,
            info.replica_index,
            info.destination.clone(),
        )?;

        // copied backups are stale until anti-entropy confirms them
        let mut dirty = Vec::with_capacity(2);
        if info.replica_index > 0 {
            dirty.push(info.replica_index);
        }
        if let Some(shifted) = info.source_new_index.filter(|&i| i > 0) {
            dirty.push(shifted);
        }
        for replica_index in dirty {
            self.versions.mark_dirty(info.partition_id, replica_index)?;
        }
        // a holder that moved out may have left its old slot empty
        self.versions.release_vacant(info.partition_id)?;
        self.publish();
        Ok(())
    }

    fn on_failure(&self, info: &mut MigrationInfo, error: MigrationError, started: bool) {
        info.status = MigrationStatus::Failed;
        let dropped = self.queue.clear_pending().len();
        self.replan_requested.store(true, Ordering::Release);
        warn!(
            migration_id = %info.id,
            partition_id = %info.partition_id,
            replica_index = info.replica_index,
            destination = %info.destination,
            stale = error.is_stale_plan(),
            dropped,
            error = %error,
            "migration failed"
        );
        if started {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("grid_migrations_failed_total").increment(1);
            self.fire(EventKind::Failed, info);
        }
    }

    fn fire(&self, kind: EventKind, info: &MigrationInfo) {
        if info.replica_index == 0 || self.config.notify_backup_migrations {
            self.listeners.fire(kind, &MigrationEvent::from(info));
        }
    }

    fn publish(&self) {
        let publisher = self.publisher.lock().clone();
        if let Some(publisher) = publisher {
            publisher.publish(self.table.snapshot());
        }
    }

    /// Planned migrations not yet started.
    pub fn migration_queue_size(&self) -> usize {
        self.queue.len()
    }

    pub fn active_migration_count(&self) -> usize {
        self.queue.active_count()
    }

    pub fn started_migration_count(&self) -> u64 {
        self.counters.started.load(Ordering::Relaxed)
    }

    pub fn completed_migration_count(&self) -> u64 {
        self.counters.completed.load(Ordering::Relaxed)
    }

    pub fn failed_migration_count(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    /// True if nothing is queued, running or waiting to be re-planned.
    pub fn is_idle(&self) -> bool {
        self.queue.is_idle() && !self.replan_requested.load(Ordering::Acquire)
    }

    /// Waits until the coordinator is idle. Returns false on timeout.
    pub async fn await_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            if self.is_idle() {
                return true;
            }
            // re-check periodically in case a re-plan was requested while idle
            let wait = deadline
                .saturating_duration_since(tokio::time::Instant::now())
                .min(Duration::from_millis(50));
            if wait.is_zero() {
                return self.is_idle();
            }
            let _ = tokio::time::timeout(wait, notified).await;
            self.replan_if_idle();
        }
    }
}

impl std::fmt::Debug for MigrationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationCoordinator")
            .field("queued", &self.queue.len())
            .field("active", &self.queue.active_count())
            .field("listeners", &self.listeners)
            .finish()
    }
}
