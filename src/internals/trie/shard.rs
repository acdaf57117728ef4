//! A shard is one of the 256 independently locked subdivisions of the map.
//!
//! It owns a trie of sectors, a lock serialising every access to that trie,
//! and a running element count. Counts are plain atomics, so the map wide
//! total is only eventually consistent while writers are active.
//!
//! The lock is a `parking_lot` mutex that is not tied to the acquiring thread.
//! Single operations take it through a guard. Iterators hold it across a
//! whole traversal of the shard through [`Shard::begin_concurrent_iterate`]
//! and [`Shard::end_concurrent_iterate`], possibly releasing it from a
//! different thread than the one that acquired it.
//!
//! While an iteration session holds the lock, a second, short lived gate
//! serialises everything that touches the trie: the iterator's own steps and
//! removals, and plain operations issued by the session's holder. The holder
//! is the thread that opened the session or stepped it last. Its operations
//! run straight on the locked trie instead of waiting for a lock that only
//! its own next `advance` would release.

use super::sector::{hash_byte, Sector, SectorArena, SectorCursor, ROOT};

use crossbeam_utils::CachePadded;
use lock_api::Mutex;
use parking_lot::RawMutex;

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Map wide element counter shared by every shard of one map.
pub(crate) type Counter = Arc<CachePadded<AtomicUsize>>;

/// Shared handle to a shard, as stored in the map table.
pub(crate) type ShardRef<K, V> = Arc<CachePadded<Shard<K, V>>>;

pub(crate) struct Shard<K, V> {
    trie: Mutex<RawMutex, SectorArena<K, V>>,
    // Only Some while an iteration session holds `trie`.
    holder: Mutex<RawMutex, Option<ThreadId>>,
    len: AtomicUsize,
    total: Counter,
    // Set once the shard has been unlinked from the map table. A retired
    // shard stays empty forever.
    retired: AtomicBool,
    depth: u8,
}

impl<K, V> Shard<K, V> {
    pub(crate) fn new(depth: u8, total: Counter) -> Self {
        Shard {
            trie: Mutex::new(SectorArena::new(depth)),
            holder: Mutex::new(None),
            len: AtomicUsize::new(0),
            total,
            retired: AtomicBool::new(false),
            depth,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    fn inc(&self) {
        self.len.fetch_add(1, Ordering::AcqRel);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    fn dec(&self) {
        self.len.fetch_sub(1, Ordering::AcqRel);
        self.total.fetch_sub(1, Ordering::Relaxed);
    }

    /// Run `f` on the trie, under the shard lock, or under the holder gate
    /// when the calling thread holds this shard's iteration session.
    fn with_trie<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut SectorArena<K, V>) -> R,
    {
        if self.trie.is_locked() {
            let holder = self.holder.lock();
            if *holder == Some(thread::current().id()) {
                // SAFETY: the session keeps `trie` locked for as long as the
                // holder is set, and we hold the gate that serialises every
                // access made under that lock.
                let trie = unsafe { &mut *self.trie.data_ptr() };
                return f(trie);
            }
        }
        let mut trie = self.trie.lock();
        f(&mut *trie)
    }

    pub(crate) fn get(&self, hash: u64) -> Option<V>
    where
        V: Clone,
    {
        self.with_trie(|trie| {
            let id = trie.locate(hash)?;
            trie.get_value(id, hash_byte(hash, 0)).cloned()
        })
    }

    pub(crate) fn get_key_value(&self, hash: u64) -> Option<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        self.with_trie(|trie| {
            let id = trie.locate(hash)?;
            let i = hash_byte(hash, 0);
            let k = trie.get_key(id, i)?.clone();
            trie.get_value(id, i).map(|v| (k, v.clone()))
        })
    }

    pub(crate) fn contains_key(&self, hash: u64) -> bool {
        self.with_trie(|trie| {
            trie.locate(hash)
                .is_some_and(|id| trie.contains_key(id, hash_byte(hash, 0)))
        })
    }

    /// Store an entry, returning the value it replaced.
    ///
    /// A retired shard refuses the write and hands the entry back, so that the
    /// caller can route it to the shard that replaced this one.
    pub(crate) fn put(&self, hash: u64, k: K, v: V) -> Result<Option<V>, (K, V)> {
        self.with_trie(|trie| {
            if self.retired.load(Ordering::Acquire) {
                return Err((k, v));
            }
            let id = trie.locate_or_create(hash);
            let prev = trie.set_entry(id, hash_byte(hash, 0), k, v);
            // Counted while the lock is held so a concurrent clear cannot miss it.
            if prev.is_none() {
                self.inc();
            }
            Ok(prev)
        })
    }

    /// Return the value stored at `hash`, or store the one `make` builds and
    /// return that. The flag is true when `make` ran. The lookup and the
    /// insert happen under one lock, so `make` must not touch this shard.
    ///
    /// Like [`Shard::put`], a retired shard hands the key and `make` back.
    pub(crate) fn get_or_insert_with<F>(
        &self,
        hash: u64,
        k: K,
        make: F,
    ) -> Result<(V, bool), (K, F)>
    where
        V: Clone,
        F: FnOnce(&K) -> V,
    {
        self.with_trie(|trie| {
            if self.retired.load(Ordering::Acquire) {
                return Err((k, make));
            }
            let i = hash_byte(hash, 0);
            if let Some(v) = trie.locate(hash).and_then(|id| trie.get_value(id, i)) {
                return Ok((v.clone(), false));
            }
            let v = make(&k);
            let id = trie.locate_or_create(hash);
            trie.set_entry(id, i, k, v.clone());
            self.inc();
            Ok((v, true))
        })
    }

    pub(crate) fn remove(&self, hash: u64) -> Option<V> {
        self.with_trie(|trie| {
            let removed = Self::remove_in(trie, hash);
            if removed.is_some() {
                self.dec();
            }
            removed.map(|(_, v)| v)
        })
    }

    /// Remove without taking the lock.
    ///
    /// # Safety
    ///
    /// The caller must hold this shard's lock through
    /// [`Shard::begin_concurrent_iterate`]. Calling this from anywhere else is
    /// a data race with every other operation on the shard.
    pub(crate) unsafe fn remove_unlocked(&self, hash: u64) -> Option<V> {
        debug_assert!(self.is_locked());
        let _gate = self.holder.lock();
        let trie = &mut *self.trie.data_ptr();
        Self::remove_in(trie, hash).map(|(_, v)| {
            self.dec();
            v
        })
    }

    fn remove_in(trie: &mut SectorArena<K, V>, hash: u64) -> Option<(K, V)> {
        let id = trie.locate(hash)?;
        trie.remove_entry(id, hash_byte(hash, 0))
    }

    /// Drop every entry, keeping the shard usable.
    pub(crate) fn clear(&self) {
        let old = self.with_trie(|trie| {
            let n = self.len.swap(0, Ordering::AcqRel);
            self.total.fetch_sub(n, Ordering::Relaxed);
            trie.clear()
        });
        // Entries are dropped outside the lock, unless a session had the
        // trie pinned and it was emptied in place.
        drop(old);
    }

    /// Mark the shard retired if it is empty and its lock is free right now.
    ///
    /// This never blocks: an iterator may be holding the lock while it waits
    /// on the map table, so waiting here could deadlock.
    pub(crate) fn try_retire(&self) -> bool {
        match self.trie.try_lock() {
            Some(_guard) if self.len() == 0 => {
                self.retired.store(true, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Append `copy(k, v)` for every entry to `out`, depth first. The lock is
    /// held for the copy only, so callers can act on the copies freely.
    pub(crate) fn copy_into<T, F>(&self, out: &mut Vec<T>, copy: &mut F)
    where
        F: FnMut(&K, &V) -> T,
    {
        self.with_trie(|trie| {
            trie.for_each_sector(ROOT, &mut |sector: &Sector<K, V>| {
                out.extend(sector.entries().map(|(k, v)| copy(k, v)));
            });
        });
    }

    /// Acquire the lock for an iteration session, with the calling thread as
    /// its holder. It stays held until [`Shard::end_concurrent_iterate`].
    pub(crate) fn begin_concurrent_iterate(&self) {
        let mut trie = self.trie.lock();
        trie.set_pinned(true);
        mem::forget(trie);
        *self.holder.lock() = Some(thread::current().id());
    }

    /// Release the lock taken by [`Shard::begin_concurrent_iterate`].
    ///
    /// # Safety
    ///
    /// Must pair with exactly one earlier `begin_concurrent_iterate`.
    pub(crate) unsafe fn end_concurrent_iterate(&self) {
        let mut holder = self.holder.lock();
        *holder = None;
        (*self.trie.data_ptr()).set_pinned(false);
        drop(holder);
        self.trie.force_unlock();
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.trie.is_locked()
    }

    /// Move `cursor` to the next entry of this shard and copy it into `next`,
    /// reusing the allocation already in `next` where the types allow it.
    /// Returns false when the shard has no more entries past the cursor.
    ///
    /// # Safety
    ///
    /// The caller must hold this shard's lock through
    /// [`Shard::begin_concurrent_iterate`].
    pub(crate) unsafe fn advance(
        &self,
        cursor: &mut SectorCursor,
        next: &mut Option<(K, V)>,
    ) -> bool
    where
        K: Clone,
        V: Clone,
    {
        debug_assert!(self.is_locked());
        let mut holder = self.holder.lock();
        *holder = Some(thread::current().id());
        let trie = &*self.trie.data_ptr();
        match trie.advance(cursor) {
            Some((k, v)) => {
                match next {
                    Some((nk, nv)) => {
                        nk.clone_from(k);
                        nv.clone_from(v);
                    }
                    None => *next = Some((k.clone(), v.clone())),
                }
                true
            }
            None => false,
        }
    }
}

impl<K, V> fmt::Debug for Shard<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shard")
            .field("len", &self.len())
            .field("depth", &self.depth)
            .field("retired", &self.is_retired())
            .field("locked", &self.is_locked())
            .field("holder", &*self.holder.lock())
            .field("sectors", &self.trie.try_lock().map(|t| t.live_sectors()))
            .finish()
    }
}
