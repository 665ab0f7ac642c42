//! Partitioner contract.
//!
//! A store-version pins one partitioner class and parameter set at
//! creation time. The ingestor must use the exact same function the
//! producer used when it wrote the version topic, or keys land on the
//! wrong partition and reads against the local store silently miss.

use crate::types::PartitionId;

/// Maps a user key to a partition id for a given partition count.
pub trait Partitioner: Send + Sync {
    fn partition(&self, key: &[u8], partition_count: u32) -> PartitionId;
}

/// The default partitioner: `xxh3(key) % partition_count`, matching
/// the hashing scheme the producer-side partitioner pins for a store
/// version.
#[derive(Debug, Clone, Copy, Default)]
pub struct Xxh3Partitioner;

impl Partitioner for Xxh3Partitioner {
    fn partition(&self, key: &[u8], partition_count: u32) -> PartitionId {
        debug_assert!(partition_count > 0, "partition count must be positive");
        let hash = xxhash_rust::xxh3::xxh3_64(key);
        (hash % u64::from(partition_count)) as PartitionId
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_is_stable_for_same_key() {
        let p = Xxh3Partitioner;
        let a = p.partition(b"user-123", 12);
        let b = p.partition(b"user-123", 12);
        assert_eq!(a, b);
    }

    #[test]
    fn partition_is_in_range() {
        let p = Xxh3Partitioner;
        for i in 0..1000u32 {
            let key = format!("key-{i}");
            let part = p.partition(key.as_bytes(), 24);
            assert!(part >= 0 && part < 24);
        }
    }
}
