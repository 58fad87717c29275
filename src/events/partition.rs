const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a. Stable across processes and builds, unlike `DefaultHasher`.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Partition owning `key` when the topic has `partitions` partitions.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    fnv1a(key.as_bytes()) % partitions.max(1)
}

/// Stream name of one partition.
pub fn partition_stream(topic: &str, partition: u32) -> String {
    format!("{topic}:{partition}")
}
