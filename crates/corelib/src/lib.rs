//! Core library for the partitioned data grid.
//!
//! This crate provides the shared building blocks of the grid:
//! - Member identities and the membership contract
//! - Partition ids, replica slots and the authoritative partition table
//! - The deterministic rebalance planner
//! - The actor-per-partition executor
//! - Configuration and the common error type

pub mod config;
pub mod error;
pub mod executor;
pub mod membership;
pub mod node;
pub mod partition;
pub mod partitioner;

pub use config::GridConfig;
pub use error::{Error, Result};
pub use executor::{PartitionExecutor, PartitionRunnable};
pub use membership::{InMemoryMembership, MemberList, MembershipEvent, MembershipService};
pub use node::{Address, Member};
pub use partition::{
    MigrationId, MigrationInfo, MigrationStatus, Partition, PartitionId, PartitionStateSnapshot,
    PartitionTable, MAX_REPLICA_COUNT,
};
pub use partitioner::{HashPartitioner, Partitioner};
