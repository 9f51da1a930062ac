//! In-memory store backend
//!
//! A multi-version map guarded by one mutex. Every transaction reads at the
//! sequence number captured at `begin`; commit applies the write set under a
//! new sequence number after checking that no key in the transaction's read
//! or write footprint was committed past the snapshot. That is the same
//! observable contract as the production engine: snapshot isolation plus
//! optimistic-concurrency commit failure.

use super::{KvIter, KvTransaction, Store, StoreError, StoreResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Version {
    seq: u64,
    // None is a tombstone
    value: Option<Vec<u8>>,
}

#[derive(Default)]
struct Inner {
    seq: u64,
    data: BTreeMap<Vec<u8>, Vec<Version>>,
    // refcount of live snapshots per begin-seq, used to prune old versions
    snapshots: BTreeMap<u64, usize>,
}

impl Inner {
    fn visible<'a>(&'a self, key: &[u8], snapshot: u64) -> Option<&'a [u8]> {
        let versions = self.data.get(key)?;
        versions
            .iter()
            .rev()
            .find(|v| v.seq <= snapshot)
            .and_then(|v| v.value.as_deref())
    }

    fn release_snapshot(&mut self, snapshot: u64) {
        if let Some(count) = self.snapshots.get_mut(&snapshot) {
            *count -= 1;
            if *count == 0 {
                self.snapshots.remove(&snapshot);
            }
        }
    }

    fn prune(&mut self) {
        let floor = self.snapshots.keys().next().copied().unwrap_or(self.seq);
        self.data.retain(|_, versions| {
            // keep the newest version at or below the oldest live snapshot,
            // plus everything newer
            let cut = versions
                .iter()
                .rposition(|v| v.seq <= floor)
                .unwrap_or(0);
            versions.drain(..cut);
            !(versions.len() == 1 && versions[0].value.is_none() && versions[0].seq <= floor)
                && !versions.is_empty()
        });
    }
}

/// In-memory implementation of the store contract.
#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn begin(&self) -> StoreResult<Box<dyn KvTransaction>> {
        let mut inner = self.inner.lock();
        let snapshot = inner.seq;
        *inner.snapshots.entry(snapshot).or_insert(0) += 1;
        Ok(Box::new(MemTransaction {
            store: Arc::clone(&self.inner),
            snapshot,
            writes: BTreeMap::new(),
            reads: BTreeSet::new(),
            finished: false,
        }))
    }
}

struct MemTransaction {
    store: Arc<Mutex<Inner>>,
    snapshot: u64,
    // None is a pending delete
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    reads: BTreeSet<Vec<u8>>,
    finished: bool,
}

impl MemTransaction {
    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            let mut inner = self.store.lock();
            inner.release_snapshot(self.snapshot);
            inner.prune();
        }
    }
}

impl Drop for MemTransaction {
    fn drop(&mut self) {
        self.finish();
    }
}

#[async_trait]
impl KvTransaction for MemTransaction {
    async fn get(&mut self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.reads.insert(key.to_vec());
        if let Some(pending) = self.writes.get(key) {
            return Ok(pending.clone());
        }
        let inner = self.store.lock();
        Ok(inner.visible(key, self.snapshot).map(|v| v.to_vec()))
    }

    async fn batch_get(&mut self, keys: &[Vec<u8>]) -> StoreResult<Vec<Option<Vec<u8>>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            self.reads.insert(key.clone());
            if let Some(pending) = self.writes.get(key.as_slice()) {
                out.push(pending.clone());
                continue;
            }
            let inner = self.store.lock();
            out.push(inner.visible(key, self.snapshot).map(|v| v.to_vec()));
        }
        Ok(out)
    }

    async fn set(&mut self, key: Vec<u8>, value: Vec<u8>) -> StoreResult<()> {
        self.writes.insert(key, Some(value));
        Ok(())
    }

    async fn delete(&mut self, key: Vec<u8>) -> StoreResult<()> {
        self.writes.insert(key, None);
        Ok(())
    }

    async fn scan(&mut self, start: Vec<u8>, end: Option<Vec<u8>>) -> StoreResult<Box<dyn KvIter>> {
        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        {
            let inner = self.store.lock();
            let range: Box<dyn Iterator<Item = (&Vec<u8>, &Vec<Version>)>> = match &end {
                Some(end) => Box::new(inner.data.range(start.clone()..end.clone())),
                None => Box::new(inner.data.range(start.clone()..)),
            };
            for (key, _) in range {
                merged.insert(
                    key.clone(),
                    inner.visible(key, self.snapshot).map(|v| v.to_vec()),
                );
            }
        }
        let in_range = |k: &[u8]| k >= start.as_slice() && end.as_deref().map_or(true, |e| k < e);
        for (key, pending) in &self.writes {
            if in_range(key) {
                merged.insert(key.clone(), pending.clone());
            }
        }

        let entries: Vec<(Vec<u8>, Vec<u8>)> = merged
            .into_iter()
            .filter_map(|(k, v)| {
                self.reads.insert(k.clone());
                v.map(|v| (k, v))
            })
            .collect();
        Ok(Box::new(MemIter { entries, pos: 0 }))
    }

    async fn commit(&mut self) -> StoreResult<()> {
        let mut inner = self.store.lock();
        let conflicted = self
            .reads
            .iter()
            .chain(self.writes.keys())
            .any(|key| {
                inner
                    .data
                    .get(key)
                    .map(|versions| versions.iter().any(|v| v.seq > self.snapshot))
                    .unwrap_or(false)
            });
        if conflicted {
            inner.release_snapshot(self.snapshot);
            self.finished = true;
            return Err(StoreError::Conflict);
        }

        inner.seq += 1;
        let seq = inner.seq;
        for (key, value) in std::mem::take(&mut self.writes) {
            inner
                .data
                .entry(key)
                .or_default()
                .push(Version { seq, value });
        }
        inner.release_snapshot(self.snapshot);
        inner.prune();
        self.finished = true;
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        self.writes.clear();
        self.finish();
        Ok(())
    }
}

struct MemIter {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pos: usize,
}

#[async_trait]
impl KvIter for MemIter {
    fn valid(&self) -> bool {
        self.pos < self.entries.len()
    }

    fn key(&self) -> &[u8] {
        &self.entries[self.pos].0
    }

    fn value(&self) -> &[u8] {
        &self.entries[self.pos].1
    }

    async fn next(&mut self) -> StoreResult<()> {
        self.pos += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_commit() {
        let store = MemStore::new();
        let mut txn = store.begin().await.unwrap();
        txn.set(b"k".to_vec(), b"v".to_vec()).await.unwrap();
        assert_eq!(txn.get(b"k").await.unwrap(), Some(b"v".to_vec()));
        txn.commit().await.unwrap();

        let mut txn = store.begin().await.unwrap();
        assert_eq!(txn.get(b"k").await.unwrap(), Some(b"v".to_vec()));
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_isolation() {
        let store = MemStore::new();
        let mut setup = store.begin().await.unwrap();
        setup.set(b"k".to_vec(), b"old".to_vec()).await.unwrap();
        setup.commit().await.unwrap();

        let mut reader = store.begin().await.unwrap();
        let mut writer = store.begin().await.unwrap();
        writer.set(b"k".to_vec(), b"new".to_vec()).await.unwrap();
        writer.commit().await.unwrap();

        // reader still sees its snapshot
        assert_eq!(reader.get(b"k").await.unwrap(), Some(b"old".to_vec()));
        reader.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_conflict_on_read_key() {
        let store = MemStore::new();
        let mut watcher = store.begin().await.unwrap();
        watcher.get(b"k").await.unwrap();

        let mut writer = store.begin().await.unwrap();
        writer.set(b"k".to_vec(), b"v2".to_vec()).await.unwrap();
        writer.commit().await.unwrap();

        watcher.set(b"k".to_vec(), b"v1".to_vec()).await.unwrap();
        assert_eq!(watcher.commit().await, Err(StoreError::Conflict));
    }

    #[tokio::test]
    async fn test_scan_merges_pending_writes() {
        let store = MemStore::new();
        let mut setup = store.begin().await.unwrap();
        setup.set(b"a:1".to_vec(), b"1".to_vec()).await.unwrap();
        setup.set(b"a:3".to_vec(), b"3".to_vec()).await.unwrap();
        setup.set(b"b:1".to_vec(), b"x".to_vec()).await.unwrap();
        setup.commit().await.unwrap();

        let mut txn = store.begin().await.unwrap();
        txn.set(b"a:2".to_vec(), b"2".to_vec()).await.unwrap();
        txn.delete(b"a:3".to_vec()).await.unwrap();

        let mut iter = txn
            .scan(b"a:".to_vec(), Some(b"a;".to_vec()))
            .await
            .unwrap();
        let mut keys = Vec::new();
        while iter.valid() {
            keys.push(iter.key().to_vec());
            iter.next().await.unwrap();
        }
        assert_eq!(keys, vec![b"a:1".to_vec(), b"a:2".to_vec()]);
        txn.rollback().await.unwrap();
    }
}
