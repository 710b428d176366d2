/// Byte-level storage behind the rollup result cache.
///
/// Implementations may drop entries at any time; the cache treats a missing entry as a miss.
pub trait RollupResultCacheStorage {
    /// Appends the value stored for `k` to `dst`. Returns false if there is no such entry.
    fn get(&mut self, k: &[u8], dst: &mut Vec<u8>) -> bool;

    /// Same as [`get`](Self::get) for values stored via [`set_big`](Self::set_big).
    fn get_big(&mut self, k: &[u8], dst: &mut Vec<u8>) -> bool {
        self.get(k, dst)
    }

    fn set(&mut self, k: &[u8], v: &[u8]);

    /// Stores a value which may be much larger than a typical index entry.
    fn set_big(&mut self, k: &[u8], v: &[u8]) {
        self.set(k, v)
    }

    /// Removes all cached values.
    fn clear(&mut self);

    /// Returns the number of stored entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of times a cached value was successfully retrieved.
    fn hits(&self) -> Option<u64> {
        None
    }

    /// The number of times a cached value was unable to be retrieved.
    fn misses(&self) -> Option<u64> {
        None
    }
}
