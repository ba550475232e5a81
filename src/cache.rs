use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

pub const MAX_TOTAL_BYTES: usize = 200 * 1024 * 1024;
pub const MAX_ENTRY_BYTES: usize = 10 * 1024 * 1024;

/// In-memory LRU cache of complete HTTP responses, keyed by the absolute
/// request URL exactly as it appeared on the request line.
///
/// The cache is bounded by total byte size, not entry count. A value larger
/// than `max_entry_bytes` is silently rejected; after any insertion, entries
/// are evicted from the least-recently-used end until the total fits again.
/// Every operation takes the exclusive lock, so the recency order is always
/// exact.
pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    max_bytes: usize,
    max_entry_bytes: usize,
}

struct CacheInner {
    lru: LruCache<String, Bytes>,
    current_bytes: usize,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::with_limits(MAX_TOTAL_BYTES, MAX_ENTRY_BYTES)
    }

    pub fn with_limits(max_bytes: usize, max_entry_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                lru: LruCache::unbounded(),
                current_bytes: 0,
            }),
            max_bytes,
            max_entry_bytes,
        }
    }

    /// Returns the stored response and promotes the entry to most-recent.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.inner.lock().lru.get(key).cloned()
    }

    /// Inserts or replaces an entry, then evicts from the LRU end until the
    /// byte bound holds. Values over `max_entry_bytes` are dropped without
    /// touching any state.
    pub fn put(&self, key: String, value: Bytes) {
        if value.len() > self.max_entry_bytes {
            return;
        }

        let mut inner = self.inner.lock();
        inner.current_bytes += value.len();
        if let Some(previous) = inner.lru.put(key, value) {
            inner.current_bytes -= previous.len();
        }
        while inner.current_bytes > self.max_bytes {
            match inner.lru.pop_lru() {
                Some((_, evicted)) => inner.current_bytes -= evicted.len(),
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().lru.is_empty()
    }

    /// Sum of the sizes of all currently stored values.
    pub fn current_bytes(&self) -> usize {
        self.inner.lock().current_bytes
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}
