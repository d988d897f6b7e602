//! Partitioner abstraction.
//!
//! Partitioners map keys onto the fixed partition id space. The id space is
//! `0..partition_count` and never changes for the lifetime of a cluster.

pub mod hashed;
pub mod traits;

pub use hashed::HashPartitioner;
pub use traits::Partitioner;
