//! Generational cache.
//!
//! Entries live in a bounded LRU and in a "round map" that remembers every
//! entry touched during the last `keep_rounds` rounds. An entry evicted from
//! the LRU stays reachable as long as it keeps being used, and is dropped by
//! `cleanup` once it has been idle for longer than that.

use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;
use serde::Serialize;

/// Lifecycle hooks for cached values.
pub trait Resource {
    /// Called the first time the value is used in a round.
    fn refresh(&mut self);
    /// Called when the value leaves the LRU, is swept, or on every `cleanup`
    /// while it is LRU resident. Must leave the value usable.
    fn cleanup(&mut self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct GCacheOptions {
    pub size: usize,
    pub keep_rounds: u64,
}

impl Default for GCacheOptions {
    fn default() -> Self {
        GCacheOptions {
            size: 1024,
            keep_rounds: 3,
        }
    }
}

struct Entry<V> {
    value: V,
    round: u64,
    in_round: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct EntryDebugInfo<D> {
    pub round: u64,
    pub in_lru: bool,
    pub in_round: bool,
    pub info: D,
}

pub struct GenerationalCache<K, V> {
    options: GCacheOptions,
    round: u64,
    lru: LruCache<K, ()>,
    entries: HashMap<K, Entry<V>>,
}

fn capacity(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}

impl<K, V> GenerationalCache<K, V>
where
    K: Hash + Eq + Clone + Default,
    V: Resource,
{
    pub fn new(options: GCacheOptions) -> Self {
        GenerationalCache {
            options,
            round: 0,
            lru: LruCache::new(capacity(options.size)),
            entries: HashMap::new(),
        }
    }

    pub fn options(&self) -> GCacheOptions {
        self.options
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    /// Looks `key` up in the LRU, then in the round map. The zero key never matches.
    pub fn get(&mut self, key: &K) -> Option<&mut V> {
        if *key == K::default() {
            return None;
        }
        let round = self.round;
        let entry = self.entries.get_mut(key)?;
        // promote
        self.lru.get(key);
        entry.in_round = true;
        if entry.round != round {
            entry.round = round;
            entry.value.refresh();
        }
        Some(&mut entry.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Inserts into both the LRU and the round map. The zero key is ignored.
    pub fn cache(&mut self, key: K, mut value: V) {
        if key == K::default() {
            return;
        }
        value.refresh();
        let entry = Entry {
            value,
            round: self.round,
            in_round: true,
        };
        if let Some(mut old) = self.entries.insert(key.clone(), entry) {
            old.value.cleanup();
        }
        if let Some((evicted, ())) = self.lru.push(key.clone(), ()) {
            if evicted != key {
                self.evicted(&evicted);
            }
        }
    }

    fn evicted(&mut self, key: &K) {
        let swept = match self.entries.get_mut(key) {
            Some(entry) => {
                entry.value.cleanup();
                !entry.in_round
            }
            None => false,
        };
        if swept {
            self.entries.remove(key);
        }
    }

    pub fn next_round(&mut self) {
        self.round += 1;
    }

    /// Cleans up every LRU resident value, then drops round map entries that
    /// were not touched in the last `keep_rounds` rounds. Each value sees at
    /// most one `cleanup` call.
    pub fn cleanup(&mut self) {
        for (key, ()) in self.lru.iter() {
            if let Some(entry) = self.entries.get_mut(key) {
                entry.value.cleanup();
            }
        }
        let oldest = self.round.saturating_sub(self.options.keep_rounds);
        let lru = &self.lru;
        self.entries.retain(|key, entry| {
            if !entry.in_round || entry.round >= oldest {
                return true;
            }
            entry.in_round = false;
            if lru.contains(key) {
                return true;
            }
            entry.value.cleanup();
            false
        });
    }

    pub fn remove(&mut self, key: &K) {
        self.lru.pop(key);
        if let Some(mut entry) = self.entries.remove(key) {
            entry.value.cleanup();
        }
    }

    /// Applies new options, evicting down to the new LRU size.
    pub fn update(&mut self, options: GCacheOptions) {
        self.options = options;
        let cap = capacity(options.size);
        while self.lru.len() > cap.get() {
            match self.lru.pop_lru() {
                Some((key, ())) => self.evicted(&key),
                None => break,
            }
        }
        self.lru.resize(cap);
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lru_size(&self) -> usize {
        self.lru.len()
    }

    pub fn round_size(&self) -> usize {
        self.entries.values().filter(|e| e.in_round).count()
    }

    pub fn debug_info<D>(&self, f: impl Fn(&K, &V) -> D) -> Vec<EntryDebugInfo<D>> {
        self.entries
            .iter()
            .map(|(k, e)| EntryDebugInfo {
                round: e.round,
                in_lru: self.lru.contains(k),
                in_round: e.in_round,
                info: f(k, &e.value),
            })
            .collect()
    }
}
