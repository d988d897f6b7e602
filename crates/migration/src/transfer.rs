//! Collaborator contracts used while executing migrations.

use async_trait::async_trait;
use corelib::{Address, PartitionId, PartitionStateSnapshot};

use crate::error::Result;

/// Copies one replica of a partition to its new holder.
///
/// Called with the partition's migration active. Implementations must be
/// idempotent; the coordinator may call again after a failed attempt.
#[async_trait]
pub trait ReplicaDataTransfer: Send + Sync + 'static {
    async fn replicate_into(
        &self,
        partition_id: PartitionId,
        replica_index: usize,
        source: Option<&Address>,
        destination: &Address,
    ) -> Result<()>;
}

/// Receives the partition table after every committed change.
pub trait PartitionStatePublisher: Send + Sync + 'static {
    fn publish(&self, snapshot: PartitionStateSnapshot);
}
