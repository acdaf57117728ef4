//! The sharded trie. Each shard owns an arena of sectors and the lock that
//! serialises access to it.

pub(crate) mod sector;
pub(crate) mod shard;
