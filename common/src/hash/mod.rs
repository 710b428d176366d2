use ahash::{AHashMap, AHashSet};
use xxhash_rust::xxh3::Xxh3;

pub use signature::*;

mod signature;

pub type FastHashMap<K, V> = AHashMap<K, V>;
pub type FastHashSet<T> = AHashSet<T>;

/// Hasher with a fixed seed. Values produced by it are stable across runs and processes,
/// which matters for anything that ends up in a cache key.
pub type StableHasher = Xxh3;
