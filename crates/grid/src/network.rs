//! In-process cluster wire.
//!
//! [`LocalNetwork`] connects the node engines of one process. Operations are
//! handed to the target's runner, partition tables travel bincode-encoded,
//! and replica copies and syncs succeed whenever the target is reachable.
//! Links can be cut in both directions to simulate network partitions.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use corelib::{Address, MembershipService, PartitionId, PartitionStateSnapshot, PartitionTable};
use dashmap::DashMap;
use invocation::{OperationRequest, OperationRunner, ReplyReceiver, Transport, TransportError};
use migration::{MigrationError, PartitionStatePublisher, ReplicaDataTransfer};
use parking_lot::RwLock;
use replication::{ReplicaSyncInfo, ReplicaSyncer, ReplicaVersionManager, ReplicationError};
use tracing::{debug, info, warn};

/// What the network needs to reach one member.
#[derive(Clone)]
pub(crate) struct Endpoint {
    pub runner: Arc<OperationRunner>,
    pub table: Arc<PartitionTable>,
    pub versions: Arc<ReplicaVersionManager>,
}

impl Endpoint {
    fn address(&self) -> &Address {
        self.runner.local_address()
    }

    /// Applies a published table. Parked operations of partitions this
    /// member no longer owns are released so their invokers retry, and
    /// dirty flags of backup slots the table emptied are dropped.
    fn receive_partition_state(&self, bytes: &[u8]) -> corelib::Result<bool> {
        let snapshot = PartitionStateSnapshot::from_bytes(bytes)?;
        let local = self.address();
        let owned_before = self.table.partitions_owned_by(local);
        if !self.table.apply_snapshot(&snapshot)? {
            return Ok(false);
        }
        for partition_id in owned_before {
            if self.table.owner_of(partition_id)?.as_ref() != Some(local) {
                self.runner.on_partition_migrated(partition_id);
            }
        }
        self.versions.release_all_vacant();
        Ok(true)
    }
}

/// Links between the members of one process.
#[derive(Default)]
pub struct LocalNetwork {
    endpoints: DashMap<Address, Endpoint>,
    cut: RwLock<HashSet<(Address, Address)>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn register(&self, endpoint: Endpoint) {
        let address = endpoint.address().clone();
        debug!(member = %address, "endpoint registered");
        self.endpoints.insert(address, endpoint);
    }

    pub(crate) fn unregister(&self, address: &Address) {
        self.endpoints.remove(address);
    }

    pub fn is_registered(&self, address: &Address) -> bool {
        self.endpoints.contains_key(address)
    }

    /// True if traffic from `from` arrives at `to`.
    pub fn can_reach(&self, from: &Address, to: &Address) -> bool {
        if !self.endpoints.contains_key(to) {
            return false;
        }
        from == to || !self.cut.read().contains(&(from.clone(), to.clone()))
    }

    /// Cuts the link between two members in both directions.
    pub fn disconnect(&self, a: &Address, b: &Address) {
        let mut cut = self.cut.write();
        cut.insert((a.clone(), b.clone()));
        cut.insert((b.clone(), a.clone()));
    }

    /// Cuts every link between the two sides.
    pub fn split(&self, left: &[Address], right: &[Address]) {
        for a in left {
            for b in right {
                self.disconnect(a, b);
            }
        }
        info!(?left, ?right, "network split");
    }

    /// Restores every link.
    pub fn heal(&self) {
        self.cut.write().clear();
        info!("network healed");
    }

    /// Bincode-encoded table of `from`, as seen by `to`.
    pub(crate) fn fetch_partition_state(
        &self,
        from: &Address,
        to: &Address,
    ) -> Option<corelib::Result<PartitionStateSnapshot>> {
        if !self.can_reach(to, from) || !self.can_reach(from, to) {
            return None;
        }
        let table = self.endpoints.get(from).map(|e| Arc::clone(&e.table))?;
        let encoded = table.snapshot().to_bytes();
        Some(encoded.and_then(|bytes| PartitionStateSnapshot::from_bytes(&bytes)))
    }

    fn endpoint(&self, address: &Address) -> Option<Endpoint> {
        self.endpoints.get(address).map(|e| e.clone())
    }

    /// Handle through which `local` talks to the rest of the cluster.
    pub(crate) fn handle(
        self: &Arc<Self>,
        local: Address,
        membership: Arc<dyn MembershipService>,
    ) -> Arc<NetworkHandle> {
        Arc::new(NetworkHandle {
            network: Arc::clone(self),
            local,
            membership,
        })
    }
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNetwork")
            .field("endpoints", &self.endpoints.len())
            .field("cut_links", &self.cut.read().len())
            .finish()
    }
}

/// One member's view of the [`LocalNetwork`].
pub struct NetworkHandle {
    network: Arc<LocalNetwork>,
    local: Address,
    membership: Arc<dyn MembershipService>,
}

impl NetworkHandle {
    fn reachable(&self, target: &Address) -> bool {
        self.network.can_reach(&self.local, target) && self.network.can_reach(target, &self.local)
    }
}

#[async_trait]
impl Transport for NetworkHandle {
    async fn send(
        &self,
        target: &Address,
        request: OperationRequest,
    ) -> Result<ReplyReceiver, TransportError> {
        if !self.reachable(target) {
            return Err(TransportError::Unreachable(target.clone()));
        }
        let endpoint = self
            .network
            .endpoint(target)
            .ok_or_else(|| TransportError::Unreachable(target.clone()))?;
        Ok(endpoint.runner.submit(request))
    }
}

#[async_trait]
impl ReplicaDataTransfer for NetworkHandle {
    async fn replicate_into(
        &self,
        partition_id: PartitionId,
        replica_index: usize,
        source: Option<&Address>,
        destination: &Address,
    ) -> migration::Result<()> {
        if !self.reachable(destination) {
            return Err(MigrationError::Transfer {
                partition_id,
                destination: destination.clone(),
                reason: "destination unreachable".into(),
            });
        }
        debug!(%partition_id, replica_index, ?source, %destination, "replica copied");
        Ok(())
    }
}

#[async_trait]
impl ReplicaSyncer for NetworkHandle {
    async fn sync_replica(&self, info: &ReplicaSyncInfo) -> replication::Result<()> {
        if !self.membership.is_member(&info.target_address) {
            return Err(ReplicationError::TargetGone(info.target_address.clone()));
        }
        if !self.reachable(&info.target_address) {
            return Err(ReplicationError::SyncFailed {
                partition_id: info.partition_id,
                replica_index: info.replica_index,
                target: info.target_address.clone(),
                reason: "target unreachable".into(),
            });
        }
        Ok(())
    }
}

impl PartitionStatePublisher for NetworkHandle {
    fn publish(&self, snapshot: PartitionStateSnapshot) {
        let bytes = match snapshot.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "could not encode partition state");
                return;
            }
        };
        for member in self.membership.member_list().addresses() {
            if member == self.local || !self.reachable(&member) {
                continue;
            }
            let Some(endpoint) = self.network.endpoint(&member) else {
                continue;
            };
            match endpoint.receive_partition_state(&bytes) {
                Ok(applied) => {
                    debug!(%member, version = snapshot.version, applied, "partition state delivered")
                }
                Err(e) => warn!(%member, error = %e, "partition state rejected"),
            }
        }
    }
}

impl std::fmt::Debug for NetworkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkHandle")
            .field("local", &self.local)
            .finish()
    }
}
