//! Replica versioning and anti-entropy for the partitioned grid.
//!
//! This crate tracks, per partition, which replicas are known to be in sync
//! with the owner and repairs the ones that are not:
//! - [`ReplicaVersionVector`]: per-replica version counters and dirty flags
//! - [`ReplicaVersionManager`]: bumps, dirty marking and sync bookkeeping
//! - [`SyncScheduler`]: keyed delay queue with exponential backoff
//! - [`ReplicaSyncer`]: the contract that performs one repair

pub mod error;
pub mod sync;
pub mod versions;

pub use error::{ReplicationError, Result};
pub use sync::{backoff_delay, ReplicaSyncInfo, ReplicaSyncer, SyncKey, SyncScheduler};
pub use versions::{ReplicaVersionManager, ReplicaVersionVector};
