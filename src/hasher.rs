//! Key hashing for the sharded trie.
//!
//! The map consumes exactly two hash functions. The *coarse* hash picks one of
//! the 256 shards from its low byte. The *fine* hash is sliced byte by byte to
//! walk the trie inside that shard: bytes `1..=depth` select pointer slots and
//! byte 0 selects the terminal value slot.
//!
//! There is no key equality check anywhere in the map. Two keys that produce
//! the same shard byte and the same fine hash bytes share one slot, and the
//! later write replaces the earlier entry. For the fixed width primitive keys
//! below the default fine hash is the key's own bits and the default depth is
//! `width_in_bytes - 1`, which makes addressing collision free by
//! construction. Keys from unbounded domains (`String`, `Vec<u8>`, anything
//! routed through [`HashTrieHasher`]) are hashed to 64 bits and *can* collide.

use std::fmt;
use std::hash::{BuildHasher, Hash};

#[cfg(feature = "foldhash")]
use foldhash::fast::FixedState;

#[cfg(not(feature = "foldhash"))]
use std::hash::BuildHasherDefault;

#[cfg(not(feature = "foldhash"))]
type FixedState = BuildHasherDefault<std::collections::hash_map::DefaultHasher>;

/// A key type with default hash functions and a default trie depth.
pub trait TrieKey {
    /// The trie depth at which the default fine hash addresses every key
    /// without collisions (or, for hashed keys, the widest useful depth).
    const DEFAULT_DEPTH: u8;

    /// Hash used to select a shard. Only the low byte is consumed.
    fn coarse_hash(&self) -> u32;

    /// Hash used to walk the trie within a shard.
    fn fine_hash(&self) -> u64;
}

macro_rules! impl_trie_key_narrow {
    ($depth:expr; $($t:ty => $bits:ty),* $(,)?) => {
        $(
            impl TrieKey for $t {
                const DEFAULT_DEPTH: u8 = $depth;

                #[inline]
                fn coarse_hash(&self) -> u32 {
                    *self as $bits as u32
                }

                #[inline]
                fn fine_hash(&self) -> u64 {
                    *self as $bits as u64
                }
            }
        )*
    };
}

macro_rules! impl_trie_key_wide {
    ($($t:ty),* $(,)?) => {
        $(
            impl TrieKey for $t {
                const DEFAULT_DEPTH: u8 = 7;

                #[inline]
                fn coarse_hash(&self) -> u32 {
                    let v = *self as u64;
                    ((v >> 32) as u32) ^ (v as u32)
                }

                #[inline]
                fn fine_hash(&self) -> u64 {
                    *self as u64
                }
            }
        )*
    };
}

impl_trie_key_narrow!(0; u8 => u8, i8 => u8);
impl_trie_key_narrow!(1; u16 => u16, i16 => u16);
impl_trie_key_narrow!(3; u32 => u32, i32 => u32);
impl_trie_key_wide!(u64, i64, usize, isize);

impl TrieKey for bool {
    const DEFAULT_DEPTH: u8 = 0;

    #[inline]
    fn coarse_hash(&self) -> u32 {
        *self as u32
    }

    #[inline]
    fn fine_hash(&self) -> u64 {
        *self as u64
    }
}

impl TrieKey for char {
    const DEFAULT_DEPTH: u8 = 3;

    #[inline]
    fn coarse_hash(&self) -> u32 {
        *self as u32
    }

    #[inline]
    fn fine_hash(&self) -> u64 {
        *self as u64
    }
}

impl TrieKey for f32 {
    const DEFAULT_DEPTH: u8 = 3;

    #[inline]
    fn coarse_hash(&self) -> u32 {
        self.to_bits()
    }

    #[inline]
    fn fine_hash(&self) -> u64 {
        self.to_bits() as u64
    }
}

impl TrieKey for f64 {
    const DEFAULT_DEPTH: u8 = 7;

    #[inline]
    fn coarse_hash(&self) -> u32 {
        self.to_bits().coarse_hash()
    }

    #[inline]
    fn fine_hash(&self) -> u64 {
        self.to_bits()
    }
}

/// 64 bit content hash with a fixed seed, so a key addresses the same slot for
/// the whole life of the process and across maps.
fn content_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    FixedState::default().hash_one(value)
}

// Both halves of a content hash feed the shard byte.
#[inline]
fn fold(h: u64) -> u32 {
    ((h >> 32) as u32) ^ (h as u32)
}

macro_rules! impl_trie_key_hashed {
    ($($t:ty),* $(,)?) => {
        $(
            /// Content hashed: distinct keys may collide and overwrite each other.
            impl TrieKey for $t {
                const DEFAULT_DEPTH: u8 = 7;

                #[inline]
                fn coarse_hash(&self) -> u32 {
                    fold(content_hash(self))
                }

                #[inline]
                fn fine_hash(&self) -> u64 {
                    content_hash(self)
                }
            }
        )*
    };
}

impl_trie_key_hashed!(String, Vec<u8>);

/// The pair of hash functions a map routes its keys with.
///
/// Implementations must be pure: the same key must always produce the same
/// hashes, otherwise entries become unreachable.
pub trait TrieHasher<K> {
    /// Shard selector. Only the low byte is consumed.
    fn coarse_hash(&self, key: &K) -> u32;

    /// Trie address within the shard.
    fn fine_hash(&self, key: &K) -> u64;
}

/// Uses the [`TrieKey`] hashes of the key type.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTrieHasher;

impl<K: TrieKey> TrieHasher<K> for DefaultTrieHasher {
    #[inline]
    fn coarse_hash(&self, key: &K) -> u32 {
        key.coarse_hash()
    }

    #[inline]
    fn fine_hash(&self, key: &K) -> u64 {
        key.fine_hash()
    }
}

/// Routes any [`Hash`] key by its 64 bit content hash.
///
/// This opens the map to key types without a [`TrieKey`] impl, such as
/// structs deriving `Hash`. The map still never compares keys: two distinct
/// keys whose content hashes agree on the shard byte and on every address
/// byte share one slot, and the later write silently replaces the earlier
/// one. Shallow tries consume fewer address bytes and make that likelier; a
/// depth of 3 is a reasonable floor for keys from large domains.
///
/// ```
/// use shardtrie::{HashTrieHasher, ShardedTrieMap};
///
/// #[derive(Hash)]
/// struct Point {
///     x: i32,
///     y: i32,
/// }
///
/// let map = ShardedTrieMap::with_hasher(HashTrieHasher, 3).unwrap();
/// map.put(Point { x: 1, y: 2 }, "a");
/// assert_eq!(map.get(&Point { x: 1, y: 2 }), Some("a"));
/// assert_eq!(map.get(&Point { x: 2, y: 1 }), None);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct HashTrieHasher;

impl<K: Hash> TrieHasher<K> for HashTrieHasher {
    #[inline]
    fn coarse_hash(&self, key: &K) -> u32 {
        fold(content_hash(key))
    }

    #[inline]
    fn fine_hash(&self, key: &K) -> u64 {
        content_hash(key)
    }
}

/// A hasher built from two injected functions.
///
/// ```
/// use shardtrie::hasher::FnTrieHasher;
/// use shardtrie::ShardedTrieMapBuilder;
///
/// // Only the low 16 bits of the key are significant to this map.
/// let hasher = FnTrieHasher::new(|k: &u32| *k >> 8, |k: &u32| (*k & 0xFFFF) as u64);
/// let map = ShardedTrieMapBuilder::new()
///     .set_depth(1)
///     .set_hasher(hasher)
///     .build::<u32, u32>()
///     .unwrap();
/// map.put(0x1234, 1);
/// assert_eq!(map.get(&0x1234), Some(1));
/// ```
#[derive(Clone, Copy)]
pub struct FnTrieHasher<C, F> {
    coarse: C,
    fine: F,
}

impl<C, F> FnTrieHasher<C, F> {
    /// Combine a coarse and a fine hash function.
    pub fn new(coarse: C, fine: F) -> Self {
        FnTrieHasher { coarse, fine }
    }
}

impl<C, F> fmt::Debug for FnTrieHasher<C, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTrieHasher").finish_non_exhaustive()
    }
}

impl<K, C, F> TrieHasher<K> for FnTrieHasher<C, F>
where
    C: Fn(&K) -> u32,
    F: Fn(&K) -> u64,
{
    #[inline]
    fn coarse_hash(&self, key: &K) -> u32 {
        (self.coarse)(key)
    }

    #[inline]
    fn fine_hash(&self, key: &K) -> u64 {
        (self.fine)(key)
    }
}
