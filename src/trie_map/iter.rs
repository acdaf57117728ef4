//! Iterators that many threads can drive at once.
//!
//! A [`ConcurrentIterator`] is shared by reference between threads. Every
//! call to [`ConcurrentIterator::advance`] hands the next element of the
//! traversal to exactly one caller, so together the threads visit each entry
//! once. Each thread also has its own notion of the *current* element: the
//! last one it advanced to, which is what [`ConcurrentIterator::get`] and
//! [`ConcurrentIterator::remove`] act on.
//!
//! The traversal holds the lock of the shard it is walking until it moves on
//! to the next shard, or until the iterator is dropped. While that lock is
//! held, other threads' operations on that shard wait. The thread that
//! created the iterator or advanced it last is the lock's holder: its own map
//! operations on the held shard go ahead without waiting, so the usual
//! `let k = iter.advance()?; map.remove(&k);` loop works on a single thread.
//! When several threads drive one iterator, only the latest of them is the
//! holder, and the others wait like any outside writer.
//!
//! The iterator remembers the current element of every thread that has
//! advanced it, until it is dropped.
//!
//! ```
//! use shardtrie::{ConcurrentIterator, ShardedTrieMap};
//!
//! let map: ShardedTrieMap<u32, u32> = (0..1000).map(|i| (i, i)).collect();
//! let iter = map.key_iter();
//! let total = std::sync::atomic::AtomicU32::new(0);
//!
//! std::thread::scope(|s| {
//!     for _ in 0..4 {
//!         s.spawn(|| {
//!             while let Ok(k) = iter.advance() {
//!                 total.fetch_add(k, std::sync::atomic::Ordering::Relaxed);
//!             }
//!         });
//!     }
//! });
//! assert_eq!(total.into_inner(), (0..1000u32).sum::<u32>());
//! ```

use super::{ShardedTrieMap, SHARD_COUNT};
use crate::error::TrieMapError;
use crate::hasher::TrieHasher;
use crate::internals::trie::sector::SectorCursor;
use crate::internals::trie::shard::ShardRef;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

#[cfg(feature = "foldhash")]
use foldhash::fast::RandomState;

#[cfg(not(feature = "foldhash"))]
use std::collections::hash_map::RandomState;

/// An iterator that can be advanced from several threads through a shared
/// reference.
pub trait ConcurrentIterator {
    /// The element handed out by [`ConcurrentIterator::advance`].
    type Item;

    /// Whether another element was available when last observed. Another
    /// thread may take it before this thread advances.
    fn has_next(&self) -> bool;

    /// Claim the next element for the calling thread, making it that
    /// thread's current element.
    ///
    /// Returns [`TrieMapError::IterationComplete`] once every element has
    /// been handed out.
    fn advance(&self) -> Result<Self::Item, TrieMapError>;

    /// The calling thread's current element.
    ///
    /// Returns [`TrieMapError::NoCurrentElement`] if this thread has never
    /// advanced.
    fn get(&self) -> Result<Self::Item, TrieMapError>;

    /// Remove the calling thread's current element from the map, returning
    /// whether an entry was removed.
    ///
    /// Returns [`TrieMapError::NoCurrentElement`] if this thread has never
    /// advanced.
    fn remove(&self) -> Result<bool, TrieMapError>;
}

/// A handle to one thread's current entry of a [`FastEntryIter`].
///
/// The iterator keeps one entry per thread and overwrites it in place each
/// time that thread advances, so a retained handle always shows the newest
/// element its thread advanced to. Copy the contents out with
/// [`SharedEntry::get`] to keep them.
pub struct SharedEntry<K, V> {
    inner: Arc<RwLock<(K, V)>>,
}

impl<K, V> SharedEntry<K, V> {
    fn new(entry: (K, V)) -> Self {
        SharedEntry {
            inner: Arc::new(RwLock::new(entry)),
        }
    }

    /// A copy of the key.
    pub fn key(&self) -> K
    where
        K: Clone,
    {
        self.inner.read().0.clone()
    }

    /// A copy of the value.
    pub fn value(&self) -> V
    where
        V: Clone,
    {
        self.inner.read().1.clone()
    }

    /// A copy of the whole entry.
    pub fn get(&self) -> (K, V)
    where
        K: Clone,
        V: Clone,
    {
        self.inner.read().clone()
    }

    /// Borrow the entry for the duration of `f`. Advancing the owning
    /// iterator from inside `f` on the same thread deadlocks.
    pub fn with<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&K, &V) -> R,
    {
        let guard = self.inner.read();
        f(&guard.0, &guard.1)
    }
}

impl<K, V> Clone for SharedEntry<K, V> {
    fn clone(&self) -> Self {
        SharedEntry {
            inner: self.inner.clone(),
        }
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for SharedEntry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.inner.read();
        f.debug_tuple("SharedEntry")
            .field(&guard.0)
            .field(&guard.1)
            .finish()
    }
}

struct ThreadSlot<K, V> {
    entry: SharedEntry<K, V>,
    // The shard the entry was read from while the traversal still holds it,
    // so `remove` can tell whether to go through the held lock. Cleared when
    // the traversal leaves that shard.
    shard: Option<ShardRef<K, V>>,
}

struct Cursor<K, V> {
    // Next table slot to look at once the held shard is exhausted.
    shard_index: usize,
    // Locked while held here.
    shard: Option<ShardRef<K, V>>,
    sector: SectorCursor,
    // The primed next element. Also the buffer the following element is
    // copied into.
    next: Option<(K, V)>,
}

/// The traversal state shared by all iterator flavours.
struct Traversal<'a, K, V, H> {
    map: &'a ShardedTrieMap<K, V, H>,
    cursor: Mutex<Cursor<K, V>>,
    has_next: AtomicBool,
    threads: Mutex<HashMap<ThreadId, ThreadSlot<K, V>, RandomState>>,
}

impl<'a, K, V, H> Traversal<'a, K, V, H>
where
    K: Clone,
    V: Clone,
    H: TrieHasher<K>,
{
    fn new(map: &'a ShardedTrieMap<K, V, H>) -> Self {
        let traversal = Traversal {
            map,
            cursor: Mutex::new(Cursor {
                shard_index: 0,
                shard: None,
                sector: SectorCursor::default(),
                next: None,
            }),
            has_next: AtomicBool::new(true),
            threads: Mutex::new(HashMap::with_hasher(RandomState::default())),
        };
        traversal.find_next(&mut traversal.cursor.lock());
        traversal
    }

    // Prime `cursor.next` with the following element, moving across shards
    // as they are exhausted.
    fn find_next(&self, cursor: &mut Cursor<K, V>) {
        loop {
            if let Some(shard) = cursor.shard.as_ref() {
                // SAFETY: the lock of a shard stored in the cursor is held.
                if unsafe { shard.advance(&mut cursor.sector, &mut cursor.next) } {
                    return;
                }
                // SAFETY: taken by `enter_next_shard`, released exactly once.
                unsafe { shard.end_concurrent_iterate() };
                self.threads
                    .lock()
                    .values_mut()
                    .filter(|slot| slot.shard.as_ref().is_some_and(|s| Arc::ptr_eq(s, shard)))
                    .for_each(|slot| slot.shard = None);
                cursor.shard = None;
            }
            if !self.enter_next_shard(cursor) {
                cursor.next = None;
                self.has_next.store(false, Ordering::Release);
                trace!("iteration complete");
                return;
            }
        }
    }

    fn enter_next_shard(&self, cursor: &mut Cursor<K, V>) -> bool {
        while cursor.shard_index < SHARD_COUNT {
            let idx = cursor.shard_index;
            cursor.shard_index += 1;
            if let Some(shard) = self.map.shard_at(idx) {
                shard.begin_concurrent_iterate();
                trace!(shard = idx, "iterator entered shard");
                cursor.sector = SectorCursor::default();
                cursor.shard = Some(shard);
                return true;
            }
        }
        false
    }

    fn has_next(&self) -> bool {
        self.has_next.load(Ordering::Acquire)
    }

    fn advance(&self) -> Result<SharedEntry<K, V>, TrieMapError> {
        let mut cursor = self.cursor.lock();
        let Some(shard) = cursor.shard.clone() else {
            return Err(TrieMapError::IterationComplete);
        };
        let Some(mut next) = cursor.next.take() else {
            return Err(TrieMapError::IterationComplete);
        };

        let entry = match self.threads.lock().entry(thread::current().id()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                // The thread's previous entry becomes the buffer for the
                // element after this one.
                mem::swap(&mut *slot.entry.inner.write(), &mut next);
                slot.shard = Some(shard);
                cursor.next = Some(next);
                slot.entry.clone()
            }
            Entry::Vacant(vacant) => {
                let entry = SharedEntry::new(next);
                vacant.insert(ThreadSlot {
                    entry: entry.clone(),
                    shard: Some(shard),
                });
                entry
            }
        };

        self.find_next(&mut cursor);
        Ok(entry)
    }

    fn current(&self) -> Result<SharedEntry<K, V>, TrieMapError> {
        self.threads
            .lock()
            .get(&thread::current().id())
            .map(|slot| slot.entry.clone())
            .ok_or(TrieMapError::NoCurrentElement)
    }

    fn remove(&self) -> Result<bool, TrieMapError> {
        let (key, shard) = {
            let threads = self.threads.lock();
            let slot = threads
                .get(&thread::current().id())
                .ok_or(TrieMapError::NoCurrentElement)?;
            (slot.entry.key(), slot.shard.clone())
        };

        let cursor = self.cursor.lock();
        let held = shard.filter(|mine| {
            cursor
                .shard
                .as_ref()
                .is_some_and(|held| Arc::ptr_eq(held, mine))
        });
        if let Some(shard) = held {
            let hash = self.map.fine_hash(&key);
            // SAFETY: the traversal holds this shard's lock, and the cursor
            // mutex keeps it from being released under us.
            return Ok(unsafe { shard.remove_unlocked(hash) }.is_some());
        }
        drop(cursor);
        Ok(self.map.remove(&key).is_some())
    }
}

impl<K, V, H> Drop for Traversal<'_, K, V, H> {
    fn drop(&mut self) {
        if let Some(shard) = self.cursor.get_mut().shard.take() {
            // SAFETY: a shard held by the cursor is locked by this traversal.
            unsafe { shard.end_concurrent_iterate() };
        }
    }
}

macro_rules! concurrent_iter {
    ($(#[$doc:meta])* $name:ident, $item:ty, $project:path) => {
        $(#[$doc])*
        pub struct $name<'a, K, V, H> {
            inner: Traversal<'a, K, V, H>,
        }

        impl<'a, K, V, H> $name<'a, K, V, H>
        where
            K: Clone,
            V: Clone,
            H: TrieHasher<K>,
        {
            pub(crate) fn new(map: &'a ShardedTrieMap<K, V, H>) -> Self {
                $name {
                    inner: Traversal::new(map),
                }
            }
        }

        impl<K, V, H> ConcurrentIterator for $name<'_, K, V, H>
        where
            K: Clone,
            V: Clone,
            H: TrieHasher<K>,
        {
            type Item = $item;

            fn has_next(&self) -> bool {
                self.inner.has_next()
            }

            fn advance(&self) -> Result<$item, TrieMapError> {
                self.inner.advance().map(|e| $project(&e))
            }

            fn get(&self) -> Result<$item, TrieMapError> {
                self.inner.current().map(|e| $project(&e))
            }

            fn remove(&self) -> Result<bool, TrieMapError> {
                self.inner.remove()
            }
        }

        impl<K, V, H> Iterator for $name<'_, K, V, H>
        where
            K: Clone,
            V: Clone,
            H: TrieHasher<K>,
        {
            type Item = $item;

            fn next(&mut self) -> Option<$item> {
                self.advance().ok()
            }
        }

        impl<K, V, H> fmt::Debug for $name<'_, K, V, H> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("has_next", &self.inner.has_next.load(Ordering::Acquire))
                    .finish_non_exhaustive()
            }
        }
    };
}

concurrent_iter!(
    /// Yields a copy of each key. Created by [`ShardedTrieMap::key_iter`].
    KeyIter,
    K,
    SharedEntry::key
);

concurrent_iter!(
    /// Yields a copy of each value. Created by [`ShardedTrieMap::value_iter`].
    ValueIter,
    V,
    SharedEntry::value
);

concurrent_iter!(
    /// Yields each entry as a newly made `(K, V)`. Created by
    /// [`ShardedTrieMap::entry_iter`].
    EntryIter,
    (K, V),
    SharedEntry::get
);

concurrent_iter!(
    /// Yields a [`SharedEntry`] that is reused for every element the same
    /// thread advances to. Created by [`ShardedTrieMap::fast_entry_iter`].
    FastEntryIter,
    SharedEntry<K, V>,
    SharedEntry::clone
);
