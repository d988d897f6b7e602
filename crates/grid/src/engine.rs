//! The node engine: one member of the grid.
//!
//! Wires the partition table, anti-entropy, migration and invocation
//! services of a member together and keeps them in step with membership.
//! Membership events are consumed by a background task; a departure is
//! handled in a fixed order so that nothing waits on the departed member by
//! the time the partition table is re-planned:
//!
//! 1. invocations on the wire to it fail with `MemberLeft`
//! 2. operations it parked here are purged
//! 3. anti-entropy requests targeting it are cancelled
//! 4. on the master, its backup slots are cleared and a re-plan is queued

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use corelib::{
    Address, GridConfig, MemberList, MembershipEvent, MembershipService, PartitionExecutor,
    PartitionId, PartitionRunnable, PartitionTable,
};
use invocation::{
    InvocationFuture, Operation, OperationInvocationService, OperationRunner, WaitNotifyRegistry,
};
use migration::{ListenerId, MigrationCoordinator, MigrationEvent, MigrationListener};
use parking_lot::Mutex;
use replication::{ReplicaSyncInfo, ReplicaVersionManager, ReplicaVersionVector};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{GridError, Result};
use crate::network::{Endpoint, LocalNetwork};

const MERGE_POLL: Duration = Duration::from_millis(10);

/// Replication health of the partitions this member is responsible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionServiceState {
    /// Nothing is migrating and every owned partition's backups are in sync.
    Safe,
    /// Migrations are queued or running.
    Migrating,
    /// Some owned partition has a backup waiting for anti-entropy.
    ReplicaNotSync,
}

impl fmt::Display for PartitionServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Safe => f.write_str("SAFE"),
            Self::Migrating => f.write_str("MIGRATING"),
            Self::ReplicaNotSync => f.write_str("REPLICA_NOT_SYNC"),
        }
    }
}

/// Releases operations parked on partitions the master hands away.
struct OwnershipWatch {
    local: Address,
    runner: Arc<OperationRunner>,
}

impl MigrationListener for OwnershipWatch {
    fn migration_started(&self, _: &MigrationEvent) {}

    fn migration_completed(&self, event: &MigrationEvent) {
        if event.replica_index == 0 && event.old_address.as_ref() == Some(&self.local) {
            self.runner.on_partition_migrated(event.partition_id);
        }
    }

    fn migration_failed(&self, _: &MigrationEvent) {}
}

/// One running member.
pub struct NodeEngine {
    config: GridConfig,
    local: Address,
    membership: Arc<dyn MembershipService>,
    network: Arc<LocalNetwork>,
    table: Arc<PartitionTable>,
    versions: Arc<ReplicaVersionManager>,
    parker: Arc<WaitNotifyRegistry>,
    executor: Arc<PartitionExecutor>,
    invocations: Arc<OperationInvocationService>,
    coordinator: Arc<MigrationCoordinator>,
    ownership_watch: ListenerId,
    events: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl NodeEngine {
    /// Builds every service of the member, joins it to `network` and starts
    /// its background tasks. Must be called inside a tokio runtime.
    ///
    /// A master with an unassigned table creates the first arrangement; any
    /// other member pulls the master's table.
    pub fn start(
        config: GridConfig,
        address: Address,
        membership: Arc<dyn MembershipService>,
        network: Arc<LocalNetwork>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if membership.local_address() != address {
            return Err(corelib::Error::InvalidArgument(format!(
                "membership view belongs to {}, not {address}",
                membership.local_address()
            ))
            .into());
        }

        let table = Arc::new(PartitionTable::new(
            config.partition_count,
            config.replica_count(),
        )?);
        let versions = Arc::new(ReplicaVersionManager::new(
            address.clone(),
            table.clone(),
            config.replica_sync.clone(),
        ));
        let executor = Arc::new(PartitionExecutor::new(config.executor.partition_threads)?);
        let parker = Arc::new(WaitNotifyRegistry::new());
        let runner = Arc::new(OperationRunner::new(
            address.clone(),
            table.clone(),
            versions.clone(),
            parker.clone(),
            executor.clone(),
        ));
        let wire = network.handle(address.clone(), membership.clone());

        let invocations = Arc::new(OperationInvocationService::new(
            table.clone(),
            membership.clone(),
            wire.clone(),
            runner.clone(),
            config.invocation.clone(),
        ));
        let coordinator = Arc::new(MigrationCoordinator::new(
            table.clone(),
            versions.clone(),
            membership.clone(),
            wire.clone(),
            config.migration.clone(),
        ));
        coordinator.set_publisher(wire.clone());
        let ownership_watch = coordinator.add_migration_listener(Some(Arc::new(OwnershipWatch {
            local: address.clone(),
            runner: runner.clone(),
        })))?;

        let events = membership.subscribe();
        let engine = Arc::new(Self {
            config,
            local: address,
            membership,
            network,
            table,
            versions,
            parker,
            executor,
            invocations,
            coordinator,
            ownership_watch,
            events: Mutex::new(None),
            running: AtomicBool::new(true),
        });

        engine.network.register(Endpoint {
            runner,
            table: engine.table.clone(),
            versions: engine.versions.clone(),
        });
        engine
            .parker
            .start_expiry_task(engine.config.parker.expiry_scan_interval);
        engine.versions.start(wire);
        engine.coordinator.start();

        let listener = Arc::clone(&engine);
        let handle = tokio::spawn(async move { listener.consume_membership(events).await });
        *engine.events.lock() = Some(handle);

        if engine.is_master() {
            engine.coordinator.rebalance()?;
        } else {
            engine.sync_from_master()?;
        }
        info!(
            member = %engine.local,
            master = engine.is_master(),
            partitions = engine.config.partition_count,
            "node engine started"
        );
        Ok(engine)
    }

    async fn consume_membership(
        self: Arc<Self>,
        mut events: tokio::sync::broadcast::Receiver<MembershipEvent>,
    ) {
        loop {
            match events.recv().await {
                Ok(event) => self.on_membership_event(event),
                Err(RecvError::Lagged(missed)) => {
                    warn!(member = %self.local, missed, "membership events lagged, re-planning");
                    self.replan();
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    fn on_membership_event(&self, event: MembershipEvent) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        match event {
            MembershipEvent::MemberAdded { member, version } => {
                info!(local = %self.local, member = %member.address, version, "member joined");
                self.replan();
            }
            MembershipEvent::MemberRemoved { member, version } => {
                info!(local = %self.local, member = %member.address, version, "member left");
                self.on_member_removed(&member.address);
            }
            MembershipEvent::MemberSuspected { address, version } => {
                // nothing moves until the suspicion is confirmed by removal
                debug!(local = %self.local, member = %address, version, "member suspected");
            }
        }
    }

    /// Releases everything tied to a departed member and re-plans.
    pub fn on_member_removed(&self, address: &Address) {
        let failed = self.invocations.on_member_removed(address);
        let purged = self.parker.purge_for_member(address);
        let cancelled = self.versions.cancel_syncs_for(address);
        debug!(member = %address, failed, purged, cancelled, "departure handled");

        if self.is_master() {
            if let Err(e) = self.coordinator.on_member_removed(address) {
                warn!(member = %address, error = %e, "re-plan after departure failed");
            }
        }
    }

    fn replan(&self) {
        if !self.is_master() {
            return;
        }
        if let Err(e) = self.coordinator.rebalance() {
            warn!(member = %self.local, error = %e, "rebalance failed");
        }
    }

    /// Replaces the local table with the master's.
    fn sync_from_master(&self) -> Result<()> {
        let Some(master) = self.membership.member_list().master().cloned() else {
            return Ok(());
        };
        match self.network.fetch_partition_state(&master, &self.local) {
            Some(snapshot) => {
                self.table.reset_to(&snapshot?)?;
                Ok(())
            }
            None => Err(GridError::Unreachable(master)),
        }
    }

    /// Joins the cluster whose member list is `target`.
    ///
    /// The local view adopts `target`, operations parked by members outside
    /// it are failed, and the local partition and replica state is replaced
    /// by the new master's. Completes once no operation is parked here any
    /// more, or fails with `MergeTimeout` after the configured call timeout.
    pub async fn merge(&self, target: &MemberList) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(GridError::Stopped);
        }
        let events = self.membership.merge_from(target);
        for event in &events {
            if let MembershipEvent::MemberRemoved { member, .. } = event {
                self.on_member_removed(&member.address);
            }
        }
        let members = self.membership.member_list().addresses();
        let absent = self.parker.purge_absent_callers(&members);

        let dropped = self.coordinator.reset();
        self.versions.reset();
        if self.is_master() {
            self.table.reset();
            self.coordinator.rebalance()?;
        } else {
            self.sync_from_master()?;
        }
        info!(
            member = %self.local,
            members = members.len(),
            absent,
            dropped,
            "merged into cluster"
        );

        let timeout = self.config.invocation.call_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let parked = self.parker.get_total_parked_operation_count();
            if parked == 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GridError::MergeTimeout { timeout, parked });
            }
            tokio::time::sleep(MERGE_POLL).await;
        }
    }

    pub fn is_master(&self) -> bool {
        self.membership.member_list().master() == Some(&self.local)
    }

    pub fn partition_service_state(&self) -> PartitionServiceState {
        let migrating = !self.coordinator.is_idle()
            || self
                .table
                .partitions()
                .iter()
                .any(|p| self.table.is_migrating(p.id));
        if migrating {
            PartitionServiceState::Migrating
        } else if self.versions.has_dirty_owned_partition() {
            PartitionServiceState::ReplicaNotSync
        } else {
            PartitionServiceState::Safe
        }
    }

    // -- invocation --

    pub fn invoke_on_partition(
        &self,
        service_name: &str,
        operation: Arc<dyn Operation>,
        partition_id: PartitionId,
    ) -> InvocationFuture {
        self.invocations
            .invoke_on_partition(service_name, operation, partition_id)
    }

    pub fn invoke_on_target(
        &self,
        service_name: &str,
        operation: Arc<dyn Operation>,
        target: Address,
    ) -> InvocationFuture {
        self.invocations
            .invoke_on_target(service_name, operation, target)
    }

    pub fn execute(&self, runnable: Box<dyn PartitionRunnable>) {
        self.invocations.execute(runnable);
    }

    // -- listeners --

    pub fn add_migration_listener(
        &self,
        listener: Option<Arc<dyn MigrationListener>>,
    ) -> Result<ListenerId> {
        Ok(self.coordinator.add_migration_listener(listener)?)
    }

    pub fn remove_migration_listener(&self, id: ListenerId) -> bool {
        id != self.ownership_watch && self.coordinator.remove_migration_listener(id)
    }

    // -- diagnostics --

    pub fn local_address(&self) -> &Address {
        &self.local
    }

    pub fn cluster_size(&self) -> usize {
        self.membership.member_list().len()
    }

    pub fn member_list(&self) -> MemberList {
        self.membership.member_list()
    }

    pub fn partition_table(&self) -> &Arc<PartitionTable> {
        &self.table
    }

    pub fn coordinator(&self) -> &Arc<MigrationCoordinator> {
        &self.coordinator
    }

    pub fn invocation_service(&self) -> &Arc<OperationInvocationService> {
        &self.invocations
    }

    pub fn get_total_parked_operation_count(&self) -> usize {
        self.parker.get_total_parked_operation_count()
    }

    pub fn get_migration_queue_size(&self) -> usize {
        self.coordinator.migration_queue_size()
    }

    pub fn get_all_replica_addresses(&self) -> BTreeSet<Address> {
        self.table.get_all_replica_addresses()
    }

    pub fn get_owned_replica_versions(&self) -> Vec<ReplicaVersionVector> {
        self.versions.get_owned_replica_versions()
    }

    pub fn get_replica_versions(&self, partition_id: PartitionId) -> Result<ReplicaVersionVector> {
        Ok(self.versions.get_replica_versions(partition_id)?)
    }

    pub fn get_ongoing_replica_sync_requests(&self) -> Vec<ReplicaSyncInfo> {
        self.versions.get_ongoing_replica_sync_requests()
    }

    pub fn get_scheduled_replica_sync_requests(&self) -> Vec<ReplicaSyncInfo> {
        self.versions.get_scheduled_replica_sync_requests()
    }

    /// Stops every background task and leaves the network. Pending
    /// invocations and parked operations fail with a shutdown error.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.events.lock().take() {
            handle.abort();
        }
        self.network.unregister(&self.local);
        self.invocations.shutdown();
        self.coordinator.shutdown();
        self.versions.shutdown();
        self.parker.shutdown();
        self.executor.shutdown();
        info!(member = %self.local, "node engine stopped");
    }
}

impl fmt::Debug for NodeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeEngine")
            .field("local", &self.local)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}
