use rdkafka::producer::Partitioner;

/// 32-bit FNV-1a over the message key. This is the hash the reference
/// hash-partitioner uses, so a mixed-fleet deployment keeps key-to-partition
/// assignments stable across writers.
fn fnv32a(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for &byte in data {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Partition for a keyed message: `abs(fnv32a(key)) mod partition_count`,
/// with the one unrepresentable negation clamped to zero.
pub fn partition_for_key(key: &[u8], partition_count: i32) -> i32 {
    let hash = fnv32a(key) as i32;
    let hash = if hash == i32::MIN { 0 } else { hash.abs() };
    hash % partition_count
}

/// Consistency-requiring keyed-hash partitioner registered with the producer.
///
/// Keyed messages hash to a stable partition for a given partition count.
/// Key-less messages (resolved-timestamp markers) are always
/// partition-addressed by the sink, so librdkafka never routes them through
/// here; the fallback arm exists only to keep the hook total.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyHashPartitioner;

impl Partitioner for KeyHashPartitioner {
    fn partition(
        &self,
        _topic_name: &str,
        key: Option<&[u8]>,
        partition_cnt: i32,
        _is_partition_available: impl Fn(i32) -> bool,
    ) -> i32 {
        match key {
            Some(key) if !key.is_empty() => partition_for_key(key, partition_cnt),
            _ => 0,
        }
    }
}
