//! Scrub cache - bounded LRU of raw decoded frames keyed by frame index.
//!
//! Only explicit seek-and-decode results are inserted, so scrubbing back to a
//! visited position is a memcpy instead of a keyframe seek + decode-forward.
//!
//! Key: `round(seconds * fps)` (fps fallback 30), see `MediaInfo::frame_index`.
//! One mutex guards both the map and the recency order (`lru::LruCache` keeps
//! them in a single structure).

use log::{debug, trace};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Cached raw frame (no subtitles blended)
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// PTS of the frame the bytes came from
    pub pts: f64,
    /// Packed BGRA, stride = width * 4
    pub pixels: Arc<Vec<u8>>,
}

/// Cache statistics for monitoring scrub performance
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.hits() + self.misses()
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 { 0.0 } else { self.hits() as f64 / total as f64 }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }
}

/// Bounded LRU frame store
#[derive(Debug)]
pub struct FrameCache {
    cache: Mutex<LruCache<i64, CacheEntry>>,
    stats: CacheStats,
}

impl FrameCache {
    /// Create cache holding at most `capacity` frames (min 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        debug!("FrameCache created: capacity={}", capacity);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            stats: CacheStats::new(),
        }
    }

    /// Look up a frame; a hit moves the key to most-recently-used
    pub fn get(&self, key: i64) -> Option<CacheEntry> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let result = cache.get(&key).cloned();
        if result.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        result
    }

    /// Check presence without touching recency
    pub fn contains(&self, key: i64) -> bool {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).contains(&key)
    }

    /// Insert a frame.
    ///
    /// Existing key: only recency is refreshed, the stored bytes stay.
    /// New key over capacity: least-recently-used entry is evicted.
    pub fn put(&self, key: i64, pts: f64, pixels: Vec<u8>) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if cache.contains(&key) {
            cache.promote(&key);
            trace!("FrameCache touch: {}", key);
            return;
        }

        let entry = CacheEntry { pts, pixels: Arc::new(pixels) };
        if let Some((evicted, _)) = cache.push(key, entry) {
            self.stats.record_eviction();
            trace!("FrameCache evicted: {}", evicted);
        }
        trace!("FrameCache put: {} (len {})", key, cache.len());
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).cap().get()
    }

    /// Drop everything (media load, resolution change)
    pub fn clear(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
        debug!("FrameCache cleared");
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(v: u8) -> Vec<u8> {
        vec![v; 16]
    }

    #[test]
    fn test_overflow_evicts_least_recent() {
        let cache = FrameCache::new(3);
        for k in 0..5 {
            cache.put(k, k as f64, bytes(k as u8));
        }
        // N=5, bound=3 -> exactly keys 0 and 1 gone
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(0));
        assert!(!cache.contains(1));
        assert!(cache.contains(2) && cache.contains(3) && cache.contains(4));
        assert_eq!(cache.stats().evictions(), 2);
    }

    #[test]
    fn test_get_refreshes_recency() {
        let cache = FrameCache::new(2);
        cache.put(1, 0.0, bytes(1));
        cache.put(2, 0.0, bytes(2));
        // Touch 1 so 2 becomes the eviction candidate
        assert!(cache.get(1).is_some());
        cache.put(3, 0.0, bytes(3));
        assert!(cache.contains(1));
        assert!(!cache.contains(2));
    }

    #[test]
    fn test_put_existing_key_keeps_bytes() {
        let cache = FrameCache::new(2);
        cache.put(7, 1.0, bytes(7));
        cache.put(7, 2.0, bytes(9));
        let entry = cache.get(7).unwrap();
        assert_eq!(entry.pts, 1.0);
        assert_eq!(entry.pixels[0], 7);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_put_existing_key_refreshes_recency() {
        let cache = FrameCache::new(2);
        cache.put(1, 0.0, bytes(1));
        cache.put(2, 0.0, bytes(2));
        cache.put(1, 0.0, bytes(1));
        cache.put(3, 0.0, bytes(3));
        assert!(cache.contains(1));
        assert!(!cache.contains(2));
    }

    #[test]
    fn test_stats() {
        let cache = FrameCache::new(4);
        cache.put(0, 0.0, bytes(0));
        assert!(cache.get(0).is_some());
        assert!(cache.get(5).is_none());
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().misses(), 1);
        assert_eq!(cache.stats().hit_rate(), 0.5);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let cache = FrameCache::new(0);
        assert_eq!(cache.capacity(), 1);
    }
}
