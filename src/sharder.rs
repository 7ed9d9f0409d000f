//! Deterministic bucketing of strings.

/// Maps an input onto one of `total_shards` buckets.
pub trait Sharder {
    fn get_shard(&self, input: impl AsRef<[u8]>, total_shards: u64) -> u64;
}

/// Buckets by the first four bytes of the md5 digest, read big-endian. Stable across processes
/// and releases, so percentage rollouts and variant assignments never move.
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5Sharder;

impl Sharder for Md5Sharder {
    fn get_shard(&self, input: impl AsRef<[u8]>, total_shards: u64) -> u64 {
        let hash = md5::compute(input);
        let value = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
        u64::from(value) % total_shards.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shards_are_stable() {
        let first = Md5Sharder.get_shard("flag-user-1", 10_000);
        assert_eq!(first, Md5Sharder.get_shard("flag-user-1", 10_000));
        assert!(first < 10_000);
    }

    #[test]
    fn spreads_inputs() {
        let mut buckets = [0u32; 4];
        for i in 0..4_000 {
            buckets[Md5Sharder.get_shard(format!("subject-{i}"), 4) as usize] += 1;
        }
        assert!(buckets.iter().all(|&count| (800..1200).contains(&count)));
    }

    #[test]
    fn zero_shards_map_to_zero() {
        assert_eq!(Md5Sharder.get_shard("x", 0), 0);
    }
}
