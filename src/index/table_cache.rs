use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, ErrorKind, Result};
use crate::index::segment_table::SegmentTable;

/// LRU cache of segment tables keyed by their engine key.
pub struct SegmentTableCache {
    cache: Mutex<LruCache<Vec<u8>, SegmentTable>>,
    capacity: usize,
    hit_count: AtomicUsize,
    miss_count: AtomicUsize,
}

impl SegmentTableCache {
    pub fn new(capacity: usize) -> Result<Self> {
        let cap = NonZeroUsize::new(capacity).ok_or_else(|| {
            Error::new(
                ErrorKind::Configuration,
                "Segment table cache size must be positive".to_string(),
            )
        })?;
        Ok(SegmentTableCache {
            cache: Mutex::new(LruCache::new(cap)),
            capacity,
            hit_count: AtomicUsize::new(0),
            miss_count: AtomicUsize::new(0),
        })
    }

    pub fn get(&self, key: &[u8]) -> Option<SegmentTable> {
        let mut cache = self.cache.lock();
        if let Some(table) = cache.get(key) {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
            Some(table.clone())
        } else {
            self.miss_count.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn put(&self, key: Vec<u8>, table: SegmentTable) {
        self.cache.lock().put(key, table);
    }

    pub fn invalidate(&self, key: &[u8]) {
        self.cache.lock().pop(key);
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hit_count: self.hit_count.load(Ordering::Relaxed),
            miss_count: self.miss_count.load(Ordering::Relaxed),
            size: self.cache.lock().len(),
            capacity: self.capacity,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hit_count: usize,
    pub miss_count: usize,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::segment_table::SegmentEntry;
    use crate::storage::codec::SegmentKind;

    #[test]
    fn test_lru_eviction_and_stats() {
        let cache = SegmentTableCache::new(2).unwrap();
        let mut table = SegmentTable::new();
        table.set(0, SegmentEntry { kind: SegmentKind::List, count: 1 });

        cache.put(b"a".to_vec(), table.clone());
        cache.put(b"b".to_vec(), SegmentTable::new());
        assert_eq!(cache.get(b"a"), Some(table));
        cache.put(b"c".to_vec(), SegmentTable::new());

        assert_eq!(cache.get(b"b"), None);
        assert!(cache.get(b"c").is_some());
        let stats = cache.stats();
        assert_eq!((stats.hit_count, stats.miss_count, stats.size), (2, 1, 2));

        cache.invalidate(b"c");
        assert_eq!(cache.get(b"c"), None);
        cache.clear();
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(SegmentTableCache::new(0).err().unwrap().kind, ErrorKind::Configuration);
    }
}
