//! Sharded concurrent hash map — the storage substrate of every sparse array.
//!
//! The key space is split across `num_shards` independent `FxHashMap`s, each
//! behind its own `parking_lot::Mutex`. Every keyed operation hashes the key,
//! picks `hash % num_shards` and holds only that shard's lock, so threads
//! touching different shards never contend.
//!
//! ## Whole-map scans
//!
//! [`ShardedMap::for_each`] and [`ShardedMap::len`] visit the shards one after
//! another. They are not a snapshot: a writer running concurrently may be seen
//! in one shard and missed in another. The solvers only call them once every
//! writer of the current sweep has joined.

use std::fmt::Debug;
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};

use crate::constants::SHARDS_PER_THREAD;
use crate::error::{ComputeError, Result};

pub struct ShardedMap<K, V> {
    shards: Box<[Mutex<FxHashMap<K, V>>]>,
}

impl<K: Hash + Eq, V> Default for ShardedMap<K, V> {
    fn default() -> Self {
        Self::new(default_num_shards())
    }
}

/// `SHARDS_PER_THREAD` shards for every thread in the current rayon pool.
pub fn default_num_shards() -> usize {
    SHARDS_PER_THREAD * rayon::current_num_threads()
}

impl<K: Hash + Eq, V> ShardedMap<K, V> {
    /// Create a map with `num_shards` shards (at least one).
    pub fn new(num_shards: usize) -> Self {
        let n = num_shards.max(1);
        Self {
            shards: (0..n).map(|_| Mutex::new(FxHashMap::default())).collect(),
        }
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    fn shard(&self, key: &K) -> &Mutex<FxHashMap<K, V>> {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        let idx = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    pub fn contains(&self, key: &K) -> bool {
        self.shard(key).lock().contains_key(key)
    }

    /// Insert or overwrite. Returns the previous value, if any.
    pub fn set(&self, key: K, value: V) -> Option<V> {
        self.shard(&key).lock().insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.shard(key).lock().remove(key)
    }

    /// Run `f` on the value under `key` (or `None`) while its shard is locked.
    pub fn inspect<R>(&self, key: &K, f: impl FnOnce(Option<&V>) -> R) -> R {
        f(self.shard(key).lock().get(key))
    }

    /// Run `f` on the value under `key`, inserting `factory()` first if absent.
    ///
    /// The lookup, the insertion and `f` all happen under one shard lock.
    pub fn with_mut_or_insert<R>(
        &self,
        key: K,
        factory: impl FnOnce() -> V,
        f: impl FnOnce(&mut V) -> R,
    ) -> R {
        let mut shard = self.shard(&key).lock();
        f(shard.entry(key).or_insert_with(factory))
    }

    /// Total entry count, summed shard by shard.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.lock().is_empty())
    }

    /// Visit every entry, locking one shard at a time.
    ///
    /// Only meaningful once all concurrent writers have finished.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        for shard in self.shards.iter() {
            let guard = shard.lock();
            for (k, v) in guard.iter() {
                f(k, v);
            }
        }
    }
}

impl<K: Hash + Eq + Debug, V: Clone> ShardedMap<K, V> {
    /// Clone the value under `key`, or fail with `NotFound`.
    pub fn get(&self, key: &K) -> Result<V> {
        self.shard(key)
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| ComputeError::NotFound(format!("{key:?}")))
    }

    /// Clone the value under `key`, or return `default` if absent.
    pub fn get_or(&self, key: &K, default: V) -> V {
        self.shard(key).lock().get(key).cloned().unwrap_or(default)
    }

    /// Return the value under `key`, inserting `factory()` first if absent.
    ///
    /// If the key already exists the factory is not called.
    pub fn get_or_insert_with(&self, key: K, factory: impl FnOnce() -> V) -> V {
        self.shard(&key)
            .lock()
            .entry(key)
            .or_insert_with(factory)
            .clone()
    }
}

impl<K: Hash + Eq + Clone, V: Clone> ShardedMap<K, V> {
    /// Copy every entry into a fresh map with the same shard count.
    pub fn deep_clone(&self) -> Self {
        let out = Self::new(self.num_shards());
        self.for_each(|k, v| {
            out.set(k.clone(), v.clone());
        });
        out
    }
}
