//! Core partitioner trait definitions.

use crate::partition::PartitionId;

/// A partitioner converts keys into partition ids.
///
/// Partitioners are stateless and thread-safe, allowing concurrent
/// lookups without synchronization overhead.
pub trait Partitioner: Send + Sync + 'static {
    /// Maps a key to its partition.
    ///
    /// The same key always maps to the same id for a given partition count.
    fn partition_id(&self, key: &[u8]) -> PartitionId;

    /// Size of the partition id space.
    fn partition_count(&self) -> u32;

    /// Returns the name of this partitioner.
    fn name(&self) -> &'static str;
}
