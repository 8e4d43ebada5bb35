//! Bounded cache of decoded blocks with heat-based admission.
//!
//! Admission is deliberately lazy: a block index must be requested twice
//! before its payload is worth keeping, so a one-pass scan of the whole
//! image never churns the cache.

use std::collections::HashMap;

/// Default number of cached blocks per stream.
pub(crate) const DEFAULT_CACHE_CAPACITY: usize = 32;

struct CachedBlock {
    data: Box<[u8]>,
    uses: u64,
}

/// Cache keyed by block index, owning copies of decoded payloads.
///
/// The heat map counts every `get` ever issued per index and is consulted
/// on insertion; the per-entry `uses` counter counts hits and drives
/// eviction.
pub(crate) struct BlockCache {
    capacity: usize,
    blocks: HashMap<u32, CachedBlock>,
    heat: HashMap<u32, u64>,
}

impl BlockCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            blocks: HashMap::new(),
            heat: HashMap::new(),
        }
    }

    /// Looks up a decoded block. The heat map is updated whether or not the
    /// lookup hits.
    pub(crate) fn get(&mut self, index: u32) -> Option<&[u8]> {
        *self.heat.entry(index).or_insert(0) += 1;

        let block = self.blocks.get_mut(&index)?;
        block.uses += 1;
        Some(&block.data)
    }

    /// Offers a decoded payload for caching. Ignored unless the index has
    /// been requested at least twice; evicts the least-used entry (ties
    /// broken by smaller index) when full.
    pub(crate) fn insert(&mut self, index: u32, data: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        if self.heat.get(&index).copied().unwrap_or(0) < 2 {
            return;
        }
        if self.blocks.contains_key(&index) {
            return;
        }

        if self.blocks.len() >= self.capacity {
            let victim = self
                .blocks
                .iter()
                .min_by_key(|(idx, block)| (block.uses, **idx))
                .map(|(idx, _)| *idx);
            if let Some(victim) = victim {
                self.blocks.remove(&victim);
            }
        }

        self.blocks.insert(
            index,
            CachedBlock {
                data: Box::from(data),
                uses: 1,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_requires_second_access() {
        let mut cache = BlockCache::new(4);

        assert!(cache.get(7).is_none());
        cache.insert(7, b"payload");
        // only one observed access at insert time, so nothing was stored
        assert!(cache.get(7).is_none());

        // that get was the second access; now the insert sticks
        cache.insert(7, b"payload");
        assert_eq!(cache.get(7).unwrap(), b"payload");
    }

    #[test]
    fn zero_capacity_never_stores() {
        let mut cache = BlockCache::new(0);
        for _ in 0..3 {
            assert!(cache.get(1).is_none());
            cache.insert(1, b"x");
        }
    }

    fn warm(cache: &mut BlockCache, index: u32) {
        cache.get(index);
        cache.get(index);
        cache.insert(index, &[index as u8]);
    }

    #[test]
    fn eviction_removes_least_used() {
        let mut cache = BlockCache::new(2);
        warm(&mut cache, 1);
        warm(&mut cache, 2);

        // make block 2 hotter than block 1
        cache.get(2);

        warm(&mut cache, 3);
        assert!(cache.get(1).is_none(), "least-used entry evicted");
        assert!(cache.get(2).is_some());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn eviction_tie_breaks_on_smaller_index() {
        let mut cache = BlockCache::new(2);
        warm(&mut cache, 5);
        warm(&mut cache, 9);

        // both entries now have identical use counts
        warm(&mut cache, 11);
        assert!(cache.get(5).is_none(), "smaller index evicted on tie");
        assert!(cache.get(9).is_some());
    }
}
