//! A member of the partitioned data grid.
//!
//! [`NodeEngine`] assembles the partition table, anti-entropy, migration and
//! invocation services of one member and drives them from membership
//! changes. [`LocalNetwork`] links engines running in the same process and
//! can cut links between them to simulate split-brain.

pub mod engine;
pub mod error;
pub mod network;

pub use engine::{NodeEngine, PartitionServiceState};
pub use error::{GridError, Result};
pub use network::{LocalNetwork, NetworkHandle};
