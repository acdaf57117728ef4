//! Shardtrie - A sharded, direct addressed trie map
//!
//! [`ShardedTrieMap`] is a concurrent map built for workloads with many
//! simultaneous writers. It is divided into 256 shards that are locked
//! independently, so writers that land on different shards never contend.
//! Within a shard, entries live in a fixed depth trie whose every level is a
//! 256 slot sector indexed by one byte of the key's hash.
//!
//! The map never compares keys. An entry's address is derived entirely from
//! two hash functions, [`hasher::TrieHasher::coarse_hash`] and
//! [`hasher::TrieHasher::fine_hash`], and two keys with equal addresses are
//! the same key as far as the map is concerned. For fixed width integers the
//! default hashes are exact, which makes the map a true map for those types.
//!
//! The map can be traversed with callbacks ([`ShardedTrieMap::for_each_entry`]
//! and friends) or with [`ConcurrentIterator`]s, which many threads can drive
//! at the same time to divide the entries between them.
//!
//! # Features
//!
//! * `foldhash` - hash `String` and `Vec<u8>` keys, keys routed through
//!   [`HashTrieHasher`], and the iterator's thread table, with the foldhash
//!   crate. Enabled by default.
//! * `serde` - serialise and deserialise maps as serde maps.

#![deny(warnings)]
#![warn(unused_extern_crates)]
#![warn(missing_docs)]

pub mod error;
pub mod hasher;

// This is where the scary rust lives.
mod internals;
// This is where the gud rust lives.
#[cfg(feature = "serde")]
mod utils;

pub mod trie_map;

pub use error::TrieMapError;
pub use hasher::{DefaultTrieHasher, FnTrieHasher, HashTrieHasher, TrieHasher, TrieKey};
pub use trie_map::iter::{
    ConcurrentIterator, EntryIter, FastEntryIter, KeyIter, SharedEntry, ValueIter,
};
pub use trie_map::{ShardedTrieMap, ShardedTrieMapBuilder};
