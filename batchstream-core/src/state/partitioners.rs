//! Partitioning functions for spreading keys over the partitions of a state store.
use std::hash::{Hash, Hasher};

/// Hash a key with a hasher that is stable across processes and releases.
/// State is persisted per key, so the hash must not change between the run which wrote a
/// checkpoint and the run which restores it.
pub fn stable_hash<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = seahash::SeaHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Select the partition a key belongs to by using its stable hash as a wrapping index.
///
/// **PANIC:** if `partitions` is zero
pub fn hash_select<K: Hash + ?Sized>(key: &K, partitions: usize) -> usize {
    // u64 -> usize may truncate on 32 bit targets, which is fine for a modulo
    (stable_hash(key) % partitions as u64) as usize
}
