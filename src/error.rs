//! Errors reported by the sharded trie map and its iterators.

use thiserror::Error;

/// The error type for all fallible operations of this crate.
///
/// None of these conditions corrupt shared state: each is local to the call
/// that raised it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrieMapError {
    /// The configured trie depth is outside of the supported range.
    #[error("trie depth must be in range 0-8 (given: {0})")]
    InvalidDepth(usize),

    /// Reverse lookup by value was requested. The map is direct addressed by
    /// key hash and keeps no value index.
    #[error("value lookup is not supported by a direct addressed map")]
    ValueLookupUnsupported,

    /// Bulk insertion was given key and value slices of different lengths.
    #[error("keys and values must have the same length (keys: {keys}, values: {values})")]
    LengthMismatch {
        /// Number of keys supplied
        keys: usize,
        /// Number of values supplied
        values: usize,
    },

    /// `advance` was called on an iterator that has no further elements.
    #[error("iteration already complete")]
    IterationComplete,

    /// The calling thread has not yet advanced this iterator.
    #[error("no current element for this thread")]
    NoCurrentElement,
}
