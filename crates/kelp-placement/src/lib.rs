//! Partition placement for Kelp.
//!
//! This module implements:
//! - CRC32 (Castagnoli) key hashing with the upper-half fold
//! - partition assignment as `hash mod num_partitions`
//!
//! CRITICAL: these must match the server and the other client SDKs
//! exactly, or keys get routed to the wrong node.

/// Fold a key's CRC32 into the 15-bit partition hash space.
///
/// The upper half of the checksum is used so that short common prefixes
/// (like `user:`) still spread across partitions.
///
/// # Examples
///
/// ```
/// use kelp_placement::partition_hash;
///
/// assert_eq!(partition_hash(b"user:42"), partition_hash(b"user:42"));
/// ```
pub fn partition_hash(key: &[u8]) -> u32 {
    (crc32c::crc32c(key) >> 16) & 0x7fff
}

/// Compute the partition for a given key.
///
/// `num_partitions` is typically 1024; any non-zero value works.
///
/// # Examples
///
/// ```
/// use kelp_placement::partition_for_key;
///
/// let partition = partition_for_key(b"user:42", 1024);
/// assert!(partition < 1024);
/// ```
pub fn partition_for_key(key: &[u8], num_partitions: u16) -> u16 {
    debug_assert!(num_partitions > 0, "partition count must be non-zero");
    (partition_hash(key) % u32::from(num_partitions)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_hash_deterministic() {
        let h1 = partition_hash(b"hello");
        let h2 = partition_hash(b"hello");
        assert_eq!(h1, h2, "partition hash should be deterministic");
    }

    #[test]
    fn test_partition_hash_fits_hash_space() {
        for i in 0u64..1000 {
            let h = partition_hash(&i.to_le_bytes());
            assert!(h < 0x8000, "hash {} escapes the 15-bit space", h);
        }
    }

    #[test]
    fn test_partition_for_key_in_range() {
        for num in [1u16, 64, 1024] {
            let p = partition_for_key(b"user:42", num);
            assert!(p < num, "partition {} out of range for {}", p, num);
        }
    }

    #[test]
    fn test_partition_for_key_stable() {
        let p1 = partition_for_key(b"user:123", 1024);
        let p2 = partition_for_key(b"user:123", 1024);
        assert_eq!(p1, p2, "same key should map to same partition");
    }

    #[test]
    fn test_distribution_over_partitions() {
        use std::collections::HashSet;
        let mut hit = HashSet::new();
        let num_partitions = 64;

        for i in 0u64..1000 {
            hit.insert(partition_for_key(format!("doc-{}", i).as_bytes(), num_partitions));
        }

        // With 1000 keys and 64 partitions we should hit nearly all of them.
        assert!(
            hit.len() > 56,
            "Expected > 56 unique partitions, got {}",
            hit.len()
        );
    }

    #[test]
    fn test_prefixed_keys_spread() {
        use std::collections::HashSet;
        let mut hit = HashSet::new();
        for i in 0..100 {
            hit.insert(partition_for_key(format!("user:{}", i).as_bytes(), 1024));
        }
        assert!(hit.len() > 90, "common prefix collapsed the spread: {}", hit.len());
    }
}
