//! Partition migration for the partitioned grid.
//!
//! This crate executes the moves the rebalance planner produces:
//! - [`MigrationQueue`]: planned moves, at most one active per partition
//! - [`MigrationCoordinator`]: worker pool, lifecycle and re-planning
//! - [`ListenerRegistry`]: id-keyed migration listeners
//! - [`ReplicaDataTransfer`]: the contract that copies replica data
//! - [`PartitionStatePublisher`]: pushes committed tables to other members

pub mod coordinator;
pub mod error;
pub mod listener;
pub mod queue;
pub mod transfer;

pub use coordinator::MigrationCoordinator;
pub use error::{MigrationError, Result};
pub use listener::{ListenerId, ListenerRegistry, MigrationEvent, MigrationListener};
pub use queue::MigrationQueue;
pub use transfer::{PartitionStatePublisher, ReplicaDataTransfer};
