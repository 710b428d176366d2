use lru_time_cache::LruCache;

use crate::cache::RollupResultCacheStorage;

/// The smallest entry size used to derive the entry capacity from the byte budget.
const MIN_ENTRY_SIZE: usize = 1024;

/// Bounded in-memory storage.
///
/// Entries are evicted in LRU order once the entry capacity is reached. On top of that the
/// number of bytes written since the last flush is tracked, and the whole storage is flushed
/// when it would exceed `max_bytes`.
pub struct DefaultResultCacheStorage {
    cache: LruCache<Vec<u8>, Vec<u8>>,
    max_bytes: usize,
    written_bytes: usize,
    hits: u64,
    misses: u64,
}

impl DefaultResultCacheStorage {
    pub fn new(max_bytes: usize) -> Self {
        let capacity = (max_bytes / MIN_ENTRY_SIZE).max(16);
        Self {
            cache: LruCache::with_capacity(capacity),
            max_bytes,
            written_bytes: 0,
            hits: 0,
            misses: 0,
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}

impl RollupResultCacheStorage for DefaultResultCacheStorage {
    fn get(&mut self, k: &[u8], dst: &mut Vec<u8>) -> bool {
        match self.cache.get(k) {
            Some(v) => {
                self.hits += 1;
                dst.extend_from_slice(v);
                true
            }
            None => {
                self.misses += 1;
                false
            }
        }
    }

    fn set(&mut self, k: &[u8], v: &[u8]) {
        let size = k.len() + v.len();
        if size > self.max_bytes {
            return;
        }
        if self.written_bytes + size > self.max_bytes {
            self.cache.clear();
            self.written_bytes = 0;
        }
        self.written_bytes += size;
        self.cache.insert(k.to_vec(), v.to_vec());
    }

    fn clear(&mut self) {
        self.cache.clear();
        self.written_bytes = 0;
    }

    fn len(&self) -> usize {
        self.cache.len()
    }

    fn hits(&self) -> Option<u64> {
        Some(self.hits)
    }

    fn misses(&self) -> Option<u64> {
        Some(self.misses)
    }
}
