//! Bounded LRU map with an eviction hook

use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;

/// An LRU cache that hands every evicted entry to `on_evict` instead of
/// silently dropping it.
pub struct EvictingCache<K, V, F>
where
    K: Hash + Eq,
    F: FnMut(K, V),
{
    entries: LruCache<K, V>,
    on_evict: F,
}

impl<K, V, F> EvictingCache<K, V, F>
where
    K: Hash + Eq,
    F: FnMut(K, V),
{
    pub fn new(capacity: NonZeroUsize, on_evict: F) -> Self {
        Self {
            entries: LruCache::new(capacity),
            on_evict,
        }
    }

    /// Replace the entry for `key` with `f(current)` and mark it most
    /// recently used. Inserting a new key into a full cache evicts the least
    /// recently used entry through the hook.
    ///
    /// If `f` fails the entry for `key` is gone.
    pub fn compute<E>(
        &mut self,
        key: K,
        f: impl FnOnce(Option<V>) -> std::result::Result<V, E>,
    ) -> std::result::Result<(), E> {
        let current = self.entries.pop(&key);
        let value = f(current)?;
        if let Some((evicted_key, evicted)) = self.entries.push(key, value) {
            (self.on_evict)(evicted_key, evicted);
        }
        Ok(())
    }

    /// Evict everything, least recently used first
    pub fn evict_all(&mut self) {
        while let Some((key, value)) = self.entries.pop_lru() {
            (self.on_evict)(key, value);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::convert::Infallible;

    fn add(n: u32) -> impl FnOnce(Option<u32>) -> Result<u32, Infallible> {
        move |current| Ok(current.unwrap_or(0) + n)
    }

    #[test]
    fn evicts_least_recently_touched_entry() {
        let evicted = RefCell::new(Vec::new());
        let mut cache = EvictingCache::new(NonZeroUsize::new(2).unwrap(), |k: &'static str, v: u32| {
            evicted.borrow_mut().push((k, v))
        });

        cache.compute("a", add(1)).unwrap();
        cache.compute("b", add(1)).unwrap();
        cache.compute("a", add(1)).unwrap();
        cache.compute("c", add(1)).unwrap();

        drop(cache);
        assert_eq!(evicted.into_inner(), vec![("b", 1)]);
    }

    #[test]
    fn evict_all_drains_in_lru_order() {
        let evicted = RefCell::new(Vec::new());
        let mut cache = EvictingCache::new(NonZeroUsize::new(4).unwrap(), |k: u8, v: u32| {
            evicted.borrow_mut().push((k, v))
        });

        cache.compute(1, add(5)).unwrap();
        cache.compute(2, add(1)).unwrap();
        cache.compute(1, add(5)).unwrap();
        cache.evict_all();
        cache.evict_all();

        drop(cache);
        assert_eq!(evicted.into_inner(), vec![(2, 1), (1, 10)]);
    }

    #[test]
    fn failed_compute_leaves_cache_untouched_for_other_keys() {
        let evicted = RefCell::new(Vec::new());
        let mut cache = EvictingCache::new(NonZeroUsize::new(2).unwrap(), |k: u8, v: u32| {
            evicted.borrow_mut().push((k, v))
        });
        cache.compute(1, add(1)).unwrap();
        let result = cache.compute(2, |_| Err("bad value"));
        assert_eq!(result, Err("bad value"));

        // the failed key took no slot, so 3 fits without evicting 1
        cache.compute(3, add(1)).unwrap();
        assert!(evicted.borrow().is_empty());
        cache.evict_all();
        drop(cache);
        assert_eq!(evicted.into_inner(), vec![(1, 1), (3, 1)]);
    }
}
