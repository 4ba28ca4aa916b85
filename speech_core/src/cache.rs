// Content-keyed cache of speaker features extracted from reference clips.

use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use ahash::AHasher;
use lru::LruCache;
use tracing::warn;

use crate::audio::AudioClip;
use crate::stages::SpeakerFeatures;

pub struct EmbeddingCache {
    entries: Option<Mutex<LruCache<u64, SpeakerFeatures>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl EmbeddingCache {
    /// A zero capacity disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|c| Mutex::new(LruCache::new(c))),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Key derived from the clip content only, never from the request.
    pub fn key(clip: &AudioClip) -> u64 {
        let mut hasher = AHasher::default();
        clip.sample_rate.hash(&mut hasher);
        clip.samples.len().hash(&mut hasher);
        for s in &clip.samples {
            s.to_bits().hash(&mut hasher);
        }
        hasher.finish()
    }

    pub fn get(&self, key: u64) -> Option<SpeakerFeatures> {
        let found = self.entries.as_ref().and_then(|m| match m.lock() {
            Ok(mut cache) => cache.get(&key).cloned(),
            Err(_) => {
                warn!("embedding cache lock poisoned, bypassing cache");
                None
            }
        });
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub fn insert(&self, key: u64, features: SpeakerFeatures) {
        if let Some(Ok(mut cache)) = self.entries.as_ref().map(|m| m.lock()) {
            cache.put(key, features);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self
            .entries
            .as_ref()
            .and_then(|m| m.lock().ok().map(|c| c.len()))
            .unwrap_or(0);
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(v: f32) -> SpeakerFeatures {
        SpeakerFeatures { embedding: vec![v], prompt_tokens: vec![1] }
    }

    #[test]
    fn same_content_same_key() {
        let a = AudioClip::new(vec![0.1, 0.2, 0.3], 16_000);
        let b = AudioClip::new(vec![0.1, 0.2, 0.3], 16_000);
        let c = AudioClip::new(vec![0.1, 0.2, 0.3], 22_050);
        assert_eq!(EmbeddingCache::key(&a), EmbeddingCache::key(&b));
        assert_ne!(EmbeddingCache::key(&a), EmbeddingCache::key(&c));
    }

    #[test]
    fn hit_and_miss_are_counted() {
        let cache = EmbeddingCache::new(2);
        assert!(cache.get(1).is_none());
        cache.insert(1, features(0.5));
        assert_eq!(cache.get(1), Some(features(0.5)));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[test]
    fn least_recently_used_is_evicted() {
        let cache = EmbeddingCache::new(2);
        cache.insert(1, features(1.0));
        cache.insert(2, features(2.0));
        cache.get(1);
        cache.insert(3, features(3.0));
        assert!(cache.get(2).is_none());
        assert!(cache.get(1).is_some());
    }

    #[test]
    fn zero_capacity_disables_cache() {
        let cache = EmbeddingCache::new(0);
        cache.insert(1, features(1.0));
        assert!(cache.get(1).is_none());
    }
}
