//! In-memory LRU cache tier.

use super::fingerprint::Fingerprint;
use super::CacheEntry;
use crate::time::epoch_millis;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub struct MemoryTier {
    inner: Mutex<LruCache<Fingerprint, Arc<CacheEntry>>>,
    bytes: AtomicU64,
}

impl MemoryTier {
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).expect("max(1) is non-zero");
        Self { inner: Mutex::new(LruCache::new(capacity)), bytes: AtomicU64::new(0) }
    }

    /// Fetch a live entry, bumping its recency and hit counter. Expired
    /// entries are dropped on sight.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<CacheEntry>> {
        let now = epoch_millis();
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let found = inner.get(fingerprint).map(Arc::clone)?;
        if found.expired(now) {
            if let Some(stale) = inner.pop(fingerprint) {
                self.bytes.fetch_sub(stale.size_bytes, Ordering::Relaxed);
            }
            return None;
        }
        found.record_hit();
        Some(found)
    }

    /// Insert or atomically replace the entry for its fingerprint.
    pub fn put(&self, entry: Arc<CacheEntry>) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        self.bytes.fetch_add(entry.size_bytes, Ordering::Relaxed);
        if let Some(replaced) = inner.push(entry.fingerprint.clone(), entry) {
            // `push` hands back either the displaced same-key entry or the
            // LRU victim.
            self.bytes.fetch_sub(replaced.1.size_bytes, Ordering::Relaxed);
        }
    }

    /// Most recently used entries, newest first, up to `n`. Feeds the
    /// semantic scan, which is bounded by configuration.
    pub fn recent(&self, n: usize) -> Vec<Arc<CacheEntry>> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.iter().take(n).map(|(_, entry)| Arc::clone(entry)).collect()
    }

    /// Remove entries matched by the predicate; returns how many went.
    pub fn invalidate_matching(&self, predicate: impl Fn(&CacheEntry) -> bool) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let victims: Vec<Fingerprint> = inner
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(fp, _)| fp.clone())
            .collect();
        for fp in &victims {
            if let Some(entry) = inner.pop(fp) {
                self.bytes.fetch_sub(entry.size_bytes, Ordering::Relaxed);
            }
        }
        victims.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.clear();
        self.bytes.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Hottest fingerprints by hit count, for the stats surface.
    pub fn top_hits(&self, n: usize) -> Vec<(Fingerprint, u64)> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut entries: Vec<(Fingerprint, u64)> =
            inner.iter().map(|(fp, entry)| (fp.clone(), entry.hits())).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(n);
        entries
    }
}

impl std::fmt::Debug for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTier")
            .field("entries", &self.len())
            .field("bytes", &self.bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::entry_with;
    use super::*;
    use std::time::Duration;

    #[test]
    fn put_then_get_round_trips() {
        let tier = MemoryTier::new(10);
        let entry = entry_with("fp-1", "hello", Duration::from_secs(60));
        tier.put(Arc::clone(&entry));

        let hit = tier.get(&entry.fingerprint).expect("stored entry");
        assert_eq!(hit.response, entry.response);
        assert_eq!(hit.hits(), 1);
    }

    #[test]
    fn lru_eviction_keeps_byte_accounting() {
        let tier = MemoryTier::new(2);
        let a = entry_with("fp-a", "aaaa", Duration::from_secs(60));
        let b = entry_with("fp-b", "bbbb", Duration::from_secs(60));
        let c = entry_with("fp-c", "cccc", Duration::from_secs(60));
        let each = a.size_bytes;

        tier.put(a.clone());
        tier.put(b.clone());
        tier.put(c.clone());

        assert_eq!(tier.len(), 2);
        assert!(tier.get(&a.fingerprint).is_none(), "oldest entry evicted");
        assert_eq!(tier.bytes(), 2 * each);
    }

    #[test]
    fn replacement_is_atomic_per_fingerprint() {
        let tier = MemoryTier::new(10);
        let old = entry_with("fp", "old", Duration::from_secs(60));
        let new = entry_with("fp", "new-value", Duration::from_secs(60));

        tier.put(old);
        tier.put(Arc::clone(&new));

        assert_eq!(tier.len(), 1, "one live entry per fingerprint");
        let got = tier.get(&new.fingerprint).unwrap();
        assert_eq!(got.response, new.response);
        assert_eq!(tier.bytes(), new.size_bytes);
    }

    #[test]
    fn expired_entries_vanish_on_read() {
        let tier = MemoryTier::new(10);
        let entry = entry_with("fp", "soon gone", Duration::from_millis(20));
        tier.put(Arc::clone(&entry));

        std::thread::sleep(Duration::from_millis(30));
        assert!(tier.get(&entry.fingerprint).is_none());
        assert_eq!(tier.len(), 0);
        assert_eq!(tier.bytes(), 0);
    }

    #[test]
    fn recent_returns_newest_first() {
        let tier = MemoryTier::new(10);
        let a = entry_with("fp-a", "a", Duration::from_secs(60));
        let b = entry_with("fp-b", "b", Duration::from_secs(60));
        tier.put(a.clone());
        tier.put(b.clone());

        let recent = tier.recent(5);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].fingerprint, b.fingerprint);
        assert_eq!(recent[1].fingerprint, a.fingerprint);

        assert_eq!(tier.recent(1).len(), 1, "scan stays bounded");
    }

    #[test]
    fn invalidate_matching_removes_and_counts() {
        let tier = MemoryTier::new(10);
        tier.put(entry_with("fp-a", "about cats", Duration::from_secs(60)));
        tier.put(entry_with("fp-b", "about dogs", Duration::from_secs(60)));

        let removed =
            tier.invalidate_matching(|entry| entry.request.to_string().contains("cats"));
        assert_eq!(removed, 1);
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn top_hits_orders_by_count() {
        let tier = MemoryTier::new(10);
        let hot = entry_with("fp-hot", "hot", Duration::from_secs(60));
        let cold = entry_with("fp-cold", "cold", Duration::from_secs(60));
        tier.put(hot.clone());
        tier.put(cold.clone());

        for _ in 0..3 {
            tier.get(&hot.fingerprint);
        }
        tier.get(&cold.fingerprint);

        let top = tier.top_hits(2);
        assert_eq!(top[0].0, hot.fingerprint);
        assert_eq!(top[0].1, 3);
        assert_eq!(top[1].1, 1);
    }
}
