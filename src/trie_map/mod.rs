//! A sharded, direct addressed trie map for highly concurrent writers.
//!
//! The map is split into 256 shards, each guarded by its own lock. A key's
//! coarse hash picks the shard and its fine hash is sliced into bytes that
//! address a path of 256 wide sectors down to the value slot. Because the
//! address *is* the key for the purposes of the map, no key comparison ever
//! takes place: if two keys produce the same shard and path they share a
//! slot. See [`crate::hasher`] for the collision properties of the default
//! hashes.
//!
//! Writers on different shards never contend. Reads take the shard lock too,
//! so this is not a read optimised structure: if your workload is read
//! mostly, the transactional maps in other crates will serve you better.
//!
//! Traversal callbacks run with no lock held, so they may read and write the
//! map. A thread driving one of the [`iter`] iterators may also use the map
//! between its own `advance` calls, including on the shard the iterator is
//! holding.
//!
//! ```
//! use shardtrie::ShardedTrieMap;
//!
//! let map: ShardedTrieMap<u64, u64> = ShardedTrieMap::new();
//! map.put(1, 100);
//! map.put(2, 200);
//! assert_eq!(map.put(1, 300), Some(100));
//! assert_eq!(map.len(), 2);
//! assert_eq!(map.get(&1), Some(300));
//! ```

pub mod iter;

use self::iter::{EntryIter, FastEntryIter, KeyIter, ValueIter};
use crate::error::TrieMapError;
use crate::hasher::{DefaultTrieHasher, TrieHasher, TrieKey};
use crate::internals::trie::shard::{Counter, Shard, ShardRef};

use crossbeam_utils::CachePadded;
use parking_lot::RwLock;
use tracing::{debug, trace};

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[cfg(feature = "serde")]
use crate::utils::MapCollector;
#[cfg(feature = "serde")]
use serde::{
    de::{Deserialize, Deserializer},
    ser::{Serialize, SerializeMap, Serializer},
};

/// The number of shards in every map. The low byte of the coarse hash
/// selects one.
pub const SHARD_COUNT: usize = 256;

/// The deepest supported trie. At depth 8 every byte of the fine hash is an
/// address byte, and byte 8 is read as zero.
pub const MAX_DEPTH: usize = 8;

/// Depth used by the builder when a custom hasher is given without a depth.
pub const DEFAULT_DEPTH: u8 = 7;

fn checked_depth(depth: usize) -> Result<u8, TrieMapError> {
    if depth > MAX_DEPTH {
        Err(TrieMapError::InvalidDepth(depth))
    } else {
        Ok(depth as u8)
    }
}

/// Configures and creates a [`ShardedTrieMap`].
///
/// ```
/// use shardtrie::ShardedTrieMapBuilder;
///
/// let map = ShardedTrieMapBuilder::new()
///     .set_depth(3)
///     .build::<u32, &'static str>()
///     .unwrap();
/// map.put(7, "seven");
/// assert_eq!(map.depth(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct ShardedTrieMapBuilder<H = DefaultTrieHasher> {
    depth: Option<usize>,
    hasher: H,
}

impl Default for ShardedTrieMapBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardedTrieMapBuilder {
    /// A builder with the default hasher and no depth set.
    pub fn new() -> Self {
        ShardedTrieMapBuilder {
            depth: None,
            hasher: DefaultTrieHasher,
        }
    }
}

impl<H> ShardedTrieMapBuilder<H> {
    /// Set the trie depth. It is validated by [`ShardedTrieMapBuilder::build`].
    #[must_use]
    pub fn set_depth(mut self, depth: usize) -> Self {
        self.depth = Some(depth);
        self
    }

    /// Replace the hash functions the map routes keys with.
    #[must_use]
    pub fn set_hasher<H2>(self, hasher: H2) -> ShardedTrieMapBuilder<H2> {
        ShardedTrieMapBuilder {
            depth: self.depth,
            hasher,
        }
    }

    /// Create the map. Fails if the depth is greater than [`MAX_DEPTH`].
    pub fn build<K, V>(self) -> Result<ShardedTrieMap<K, V, H>, TrieMapError>
    where
        H: TrieHasher<K>,
    {
        let depth = match self.depth {
            Some(depth) => checked_depth(depth)?,
            None => DEFAULT_DEPTH,
        };
        Ok(ShardedTrieMap::from_parts(self.hasher, depth))
    }
}

/// A concurrent map from keys to values, addressed by key hash.
///
/// All operations take `&self`. Share the map between threads with an `Arc`
/// or a scoped borrow.
pub struct ShardedTrieMap<K, V, H = DefaultTrieHasher> {
    // Slots are filled lazily on first write and released again when a
    // removal empties the shard.
    shards: RwLock<[Option<ShardRef<K, V>>; SHARD_COUNT]>,
    len: Counter,
    hasher: H,
    depth: u8,
}

impl<K: TrieKey, V> ShardedTrieMap<K, V> {
    /// Create a map using the key type's default hashes and depth.
    pub fn new() -> Self {
        Self::from_parts(DefaultTrieHasher, K::DEFAULT_DEPTH)
    }

    /// Create a map using the key type's default hashes and the given depth.
    pub fn with_depth(depth: usize) -> Result<Self, TrieMapError> {
        Ok(Self::from_parts(DefaultTrieHasher, checked_depth(depth)?))
    }
}

impl<K, V, H> ShardedTrieMap<K, V, H>
where
    H: TrieHasher<K>,
{
    /// Create a map with custom hash functions and the given depth.
    pub fn with_hasher(hasher: H, depth: usize) -> Result<Self, TrieMapError> {
        Ok(Self::from_parts(hasher, checked_depth(depth)?))
    }

    fn from_parts(hasher: H, depth: u8) -> Self {
        debug!(depth, "creating sharded trie map");
        ShardedTrieMap {
            shards: RwLock::new(std::array::from_fn(|_| None)),
            len: Arc::new(CachePadded::new(AtomicUsize::new(0))),
            hasher,
            depth,
        }
    }

    #[inline]
    fn route(&self, key: &K) -> (usize, u64) {
        let shard = (self.hasher.coarse_hash(key) & 0xFF) as usize;
        (shard, self.hasher.fine_hash(key))
    }

    pub(crate) fn shard_at(&self, idx: usize) -> Option<ShardRef<K, V>> {
        self.shards.read()[idx].clone()
    }

    fn shard_or_create(&self, idx: usize) -> ShardRef<K, V> {
        if let Some(shard) = self.shard_at(idx) {
            return shard;
        }
        let mut table = self.shards.write();
        table[idx]
            .get_or_insert_with(|| {
                trace!(shard = idx, "creating shard");
                Arc::new(CachePadded::new(Shard::new(self.depth, self.len.clone())))
            })
            .clone()
    }

    // Unlink an emptied shard. Writers that already hold the old handle see
    // it retired and route again through the table.
    fn release_shard(&self, idx: usize, shard: &ShardRef<K, V>) {
        let mut table = self.shards.write();
        let current = table[idx]
            .as_ref()
            .is_some_and(|held| Arc::ptr_eq(held, shard));
        if current && shard.try_retire() {
            table[idx] = None;
            trace!(shard = idx, "released empty shard");
        }
    }

    pub(crate) fn fine_hash(&self, key: &K) -> u64 {
        self.hasher.fine_hash(key)
    }

    /// Return a copy of the value stored at the key's address.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let (idx, hash) = self.route(key);
        self.shard_at(idx)?.get(hash)
    }

    /// Return copies of the entry stored at the key's address.
    ///
    /// The returned key is the one the entry was written with. It differs
    /// from `key` when the two collide.
    pub fn get_key_value(&self, key: &K) -> Option<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        let (idx, hash) = self.route(key);
        self.shard_at(idx)?.get_key_value(hash)
    }

    /// Store `value` at the key's address, returning the value it replaced.
    ///
    /// Whatever was stored at the same address is overwritten, even if it was
    /// written under a different key with the same hashes.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        let (idx, hash) = self.route(&key);
        let mut entry = (key, value);
        loop {
            let shard = self.shard_or_create(idx);
            match shard.put(hash, entry.0, entry.1) {
                Ok(prev) => return prev,
                // Lost a race with the release of an emptied shard.
                Err(back) => entry = back,
            }
        }
    }

    // Shared retry loop of the insert-if-missing family.
    fn get_or_insert_with<F>(&self, key: K, make: F) -> (V, bool)
    where
        V: Clone,
        F: FnOnce(&K) -> V,
    {
        let (idx, hash) = self.route(&key);
        let mut pending = (key, make);
        loop {
            let shard = self.shard_or_create(idx);
            match shard.get_or_insert_with(hash, pending.0, pending.1) {
                Ok(found) => return found,
                Err(back) => pending = back,
            }
        }
    }

    /// Store `value` only if the key's address is empty. Returns the value
    /// already stored there, leaving it in place, or `None` after inserting.
    ///
    /// ```
    /// use shardtrie::ShardedTrieMap;
    ///
    /// let map: ShardedTrieMap<u32, &str> = ShardedTrieMap::new();
    /// assert_eq!(map.put_if_absent(1, "a"), None);
    /// assert_eq!(map.put_if_absent(1, "b"), Some("a"));
    /// assert_eq!(map.get(&1), Some("a"));
    /// ```
    pub fn put_if_absent(&self, key: K, value: V) -> Option<V>
    where
        V: Clone,
    {
        match self.get_or_insert_with(key, move |_| value) {
            (_, true) => None,
            (existing, false) => Some(existing),
        }
    }

    /// Return the value stored at the key's address, storing `default` there
    /// first if the address is empty.
    pub fn get_or_insert(&self, key: K, default: V) -> V
    where
        V: Clone,
    {
        self.get_or_insert_with(key, move |_| default).0
    }

    /// Return the value stored at the key's address, storing `f(&key)` there
    /// first if the address is empty.
    ///
    /// `f` runs under the shard lock, at most once, and must not call back
    /// into this map.
    pub fn compute_if_absent<F>(&self, key: K, f: F) -> V
    where
        V: Clone,
        F: FnOnce(&K) -> V,
    {
        self.get_or_insert_with(key, f).0
    }

    /// Remove the entry at the key's address, returning its value.
    pub fn remove(&self, key: &K) -> Option<V> {
        let (idx, hash) = self.route(key);
        let shard = self.shard_at(idx)?;
        let prev = shard.remove(hash);
        if prev.is_some() && shard.len() == 0 {
            self.release_shard(idx, &shard);
        }
        prev
    }

    /// Whether an entry is stored at the key's address.
    pub fn contains_key(&self, key: &K) -> bool {
        let (idx, hash) = self.route(key);
        self.shard_at(idx)
            .is_some_and(|shard| shard.contains_key(hash))
    }

    /// Reverse lookup is not supported, since there is no index of values.
    /// This always returns [`TrieMapError::ValueLookupUnsupported`].
    pub fn contains_value(&self, _value: &V) -> Result<bool, TrieMapError> {
        Err(TrieMapError::ValueLookupUnsupported)
    }

    /// Remove every entry.
    ///
    /// Shards are cleared one at a time, so writes racing with a clear may
    /// survive it.
    pub fn clear(&self) {
        for idx in 0..SHARD_COUNT {
            if let Some(shard) = self.shard_at(idx) {
                shard.clear();
                self.release_shard(idx, &shard);
            }
        }
        trace!("cleared map");
    }

    /// Insert `keys[i] => values[i]` for every index.
    ///
    /// Does nothing if either slice is empty, and fails without inserting
    /// anything if the lengths differ.
    pub fn put_all(&self, keys: &[K], values: &[V]) -> Result<(), TrieMapError>
    where
        K: Clone,
        V: Clone,
    {
        if keys.is_empty() || values.is_empty() {
            return Ok(());
        }
        if keys.len() != values.len() {
            return Err(TrieMapError::LengthMismatch {
                keys: keys.len(),
                values: values.len(),
            });
        }
        keys.iter().zip(values).for_each(|(k, v)| {
            self.put(k.clone(), v.clone());
        });
        Ok(())
    }

    /// Copy every entry of `other` into this map.
    ///
    /// Entries are copied out one shard at a time before being inserted, so
    /// no lock of `other` is held while this map is written. Copying a map
    /// into itself is a no-op in effect.
    pub fn put_all_from<H2>(&self, other: &ShardedTrieMap<K, V, H2>)
    where
        K: Clone,
        V: Clone,
        H2: TrieHasher<K>,
    {
        other.visit_copies(
            |k, v| (k.clone(), v.clone()),
            |(k, v)| {
                self.put(k, v);
            },
        );
    }

    /// Remove the entry of every key in `keys`.
    pub fn remove_all<'k, I>(&self, keys: I)
    where
        I: IntoIterator<Item = &'k K>,
        K: 'k,
    {
        keys.into_iter().for_each(|k| {
            self.remove(k);
        });
    }

    // Copy each shard out under its lock, then hand the copies to `f` with
    // the lock released. Shards are visited in address order.
    fn visit_copies<T, C, F>(&self, mut copy: C, mut f: F)
    where
        C: FnMut(&K, &V) -> T,
        F: FnMut(T),
    {
        let mut batch = Vec::new();
        for idx in 0..SHARD_COUNT {
            if let Some(shard) = self.shard_at(idx) {
                shard.copy_into(&mut batch, &mut copy);
                batch.drain(..).for_each(&mut f);
            }
        }
    }

    /// Visit every entry, shard by shard in address order.
    ///
    /// Each shard's entries are copied out before the callback sees them, so
    /// no lock is held while it runs and it may use this map freely. Entries
    /// written to a shard after it was copied are not visited.
    pub fn for_each_entry<F>(&self, mut f: F)
    where
        K: Clone,
        V: Clone,
        F: FnMut(&K, &V),
    {
        self.visit_copies(|k, v| (k.clone(), v.clone()), |(k, v)| f(&k, &v));
    }

    /// As [`ShardedTrieMap::for_each_entry`], then call `complete` once.
    pub fn for_each_entry_then<F, C>(&self, f: F, complete: C)
    where
        K: Clone,
        V: Clone,
        F: FnMut(&K, &V),
        C: FnOnce(),
    {
        self.for_each_entry(f);
        complete();
    }

    /// Visit every key. See [`ShardedTrieMap::for_each_entry`].
    pub fn for_each_key<F>(&self, mut f: F)
    where
        K: Clone,
        F: FnMut(&K),
    {
        self.visit_copies(|k, _| k.clone(), |k| f(&k));
    }

    /// Visit every value. See [`ShardedTrieMap::for_each_entry`].
    pub fn for_each_value<F>(&self, mut f: F)
    where
        V: Clone,
        F: FnMut(&V),
    {
        self.visit_copies(|_, v| v.clone(), |v| f(&v));
    }

    /// Snapshot of every key, in traversal order.
    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        let mut keys = Vec::with_capacity(self.len());
        self.visit_copies(|k, _| k.clone(), |k| keys.push(k));
        keys
    }

    /// Snapshot of every value, in traversal order.
    pub fn values(&self) -> Vec<V>
    where
        V: Clone,
    {
        let mut values = Vec::with_capacity(self.len());
        self.visit_copies(|_, v| v.clone(), |v| values.push(v));
        values
    }

    /// A concurrent iterator over copies of the keys.
    pub fn key_iter(&self) -> KeyIter<'_, K, V, H>
    where
        K: Clone,
        V: Clone,
    {
        KeyIter::new(self)
    }

    /// A concurrent iterator over copies of the values.
    pub fn value_iter(&self) -> ValueIter<'_, K, V, H>
    where
        K: Clone,
        V: Clone,
    {
        ValueIter::new(self)
    }

    /// A concurrent iterator yielding a fresh `(K, V)` per element.
    pub fn entry_iter(&self) -> EntryIter<'_, K, V, H>
    where
        K: Clone,
        V: Clone,
    {
        EntryIter::new(self)
    }

    /// A concurrent iterator yielding one reused entry handle per thread.
    pub fn fast_entry_iter(&self) -> FastEntryIter<'_, K, V, H>
    where
        K: Clone,
        V: Clone,
    {
        FastEntryIter::new(self)
    }

    /// The number of entries. Exact when no writer is active.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Whether [`ShardedTrieMap::len`] is zero.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The hash functions of this map.
    pub fn hasher(&self) -> &H {
        &self.hasher
    }

    /// The number of pointer levels between a shard root and its values.
    pub fn depth(&self) -> usize {
        self.depth as usize
    }

    fn live_shards(&self) -> usize {
        self.shards.read().iter().filter(|s| s.is_some()).count()
    }
}

impl<K: TrieKey, V> Default for ShardedTrieMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, H> fmt::Debug for ShardedTrieMap<K, V, H>
where
    H: TrieHasher<K>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedTrieMap")
            .field("len", &self.len())
            .field("depth", &self.depth)
            .field("shards", &self.live_shards())
            .finish()
    }
}

impl<K: TrieKey, V> FromIterator<(K, V)> for ShardedTrieMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let map = ShardedTrieMap::new();
        iter.into_iter().for_each(|(k, v)| {
            map.put(k, v);
        });
        map
    }
}

impl<K, V, H> Extend<(K, V)> for ShardedTrieMap<K, V, H>
where
    H: TrieHasher<K>,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        iter.into_iter().for_each(|(k, v)| {
            self.put(k, v);
        });
    }
}

#[cfg(feature = "serde")]
impl<K, V, H> Serialize for ShardedTrieMap<K, V, H>
where
    K: Serialize + Clone,
    V: Serialize + Clone,
    H: TrieHasher<K>,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // Copied out first, so no shard lock is held while the sink runs.
        let mut entries = Vec::with_capacity(self.len());
        self.visit_copies(|k, v| (k.clone(), v.clone()), |e| entries.push(e));

        let mut state = serializer.serialize_map(Some(entries.len()))?;
        for (key, val) in entries.iter() {
            state.serialize_entry(key, val)?;
        }
        state.end()
    }
}

#[cfg(feature = "serde")]
impl<'de, K, V> Deserialize<'de> for ShardedTrieMap<K, V>
where
    K: Deserialize<'de> + TrieKey,
    V: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(MapCollector::new())
    }
}
