//! Hash partitioner.

use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Error, Result};
use crate::partition::PartitionId;
use crate::partitioner::traits::Partitioner;

/// Partitions keys by `xxh3(key) % partition_count`.
#[derive(Clone, Debug)]
pub struct HashPartitioner {
    partition_count: u32,
}

impl HashPartitioner {
    pub fn new(partition_count: u32) -> Result<Self> {
        if partition_count == 0 {
            return Err(Error::Configuration("partition_count must be > 0".into()));
        }
        Ok(Self { partition_count })
    }
}

impl Partitioner for HashPartitioner {
    fn partition_id(&self, key: &[u8]) -> PartitionId {
        PartitionId((xxh3_64(key) % u64::from(self.partition_count)) as u32)
    }

    fn partition_count(&self) -> u32 {
        self.partition_count
    }

    fn name(&self) -> &'static str {
        "HashPartitioner"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable_and_in_range() {
        let p = HashPartitioner::new(271).unwrap();
        for i in 0..1000 {
            let key = format!("key-{i}");
            let id = p.partition_id(key.as_bytes());
            assert!(id.0 < 271);
            assert_eq!(id, p.partition_id(key.as_bytes()));
        }
    }

    #[test]
    fn keys_spread_over_partitions() {
        let p = HashPartitioner::new(16).unwrap();
        let mut hits = [0usize; 16];
        for i in 0..16_000 {
            hits[p.partition_id(format!("k{i}").as_bytes()).index()] += 1;
        }
        assert!(hits.iter().all(|&h| h > 500), "skewed distribution: {hits:?}");
    }

    #[test]
    fn zero_partitions_rejected() {
        assert!(HashPartitioner::new(0).is_err());
    }
}
