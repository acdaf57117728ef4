//! This module contains the internals of the sharded trie: the sector arena
//! that stores entries and the shards that lock it. Nothing here is part of
//! the public interface, and most of it is only sound when called with the
//! right shard lock held.
//!
//! ⚠️   ⚠️   ⚠️

pub(crate) mod trie;
