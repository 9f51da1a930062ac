//! Transactional KV store abstraction
//!
//! The serving layer treats the backing store as an opaque collaborator: a
//! snapshot-isolated transaction with optimistic-concurrency commit. The real
//! deployment wires this trait to a Raft-replicated, range-sharded engine; the
//! in-tree [`MemStore`] implements the same contract for single-node use and
//! for tests.

mod memory;

pub use memory::MemStore;

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by a store backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Optimistic-concurrency commit failure. The caller may retry the whole
    /// transaction against a fresh snapshot.
    #[error("commit conflict")]
    Conflict,

    #[error("backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A handle to the backing store. Cheap to clone via `Arc<dyn Store>`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Begin a transaction pinned to the current snapshot.
    async fn begin(&self) -> StoreResult<Box<dyn KvTransaction>>;
}

/// One snapshot-isolated transaction.
///
/// Reads observe the snapshot plus this transaction's own writes. Writes are
/// buffered locally and become visible atomically on a successful commit.
#[async_trait]
pub trait KvTransaction: Send {
    async fn get(&mut self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Point-get many keys in one round trip. Result order matches `keys`.
    async fn batch_get(&mut self, keys: &[Vec<u8>]) -> StoreResult<Vec<Option<Vec<u8>>>>;

    async fn set(&mut self, key: Vec<u8>, value: Vec<u8>) -> StoreResult<()>;

    async fn delete(&mut self, key: Vec<u8>) -> StoreResult<()>;

    /// Iterate keys in `[start, end)` in ascending byte order. `None` means
    /// unbounded on the right.
    async fn scan(&mut self, start: Vec<u8>, end: Option<Vec<u8>>) -> StoreResult<Box<dyn KvIter>>;

    async fn commit(&mut self) -> StoreResult<()>;

    /// Idempotent; safe to call after a failed commit.
    async fn rollback(&mut self) -> StoreResult<()>;
}

/// Cursor over a key range. Mirrors the seek/next shape of the backing
/// engine's client so range scans can early-exit without draining the range.
#[async_trait]
pub trait KvIter: Send {
    fn valid(&self) -> bool;
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];
    async fn next(&mut self) -> StoreResult<()>;
}

/// Smallest key strictly greater than every key with `prefix`.
/// `None` when the prefix is all `0xff` (unbounded scan).
pub fn prefix_next(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut next = prefix.to_vec();
    while let Some(last) = next.last_mut() {
        if *last < 0xff {
            *last += 1;
            return Some(next);
        }
        next.pop();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_next() {
        assert_eq!(prefix_next(b"abc"), Some(b"abd".to_vec()));
        assert_eq!(prefix_next(&[0x01, 0xff]), Some(vec![0x02]));
        assert_eq!(prefix_next(&[0xff, 0xff]), None);
    }
}
