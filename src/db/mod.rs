//! Data layer: Redis data types over the transactional KV store
//!
//! [`DbHandle`] names one (namespace, db id) pair; [`Transaction`] wraps one
//! KV-store transaction and hands out typed object views. Object mutations go
//! straight into the transaction's write set and become visible atomically on
//! commit; an optimistic-concurrency conflict surfaces as
//! [`DbError::Retryable`].

pub mod codec;
pub mod expire;
pub mod hash;
pub mod limiter;
pub mod object;
pub mod string;
pub mod zset;

pub use codec::DbId;
pub use object::{Object, ObjectEncoding, ObjectType, now_ns};

use crate::error::DbError;
use crate::store::{KvTransaction, Store, StoreError};
use std::sync::Arc;

impl From<StoreError> for DbError {
    fn from(err: StoreError) -> DbError {
        match err {
            StoreError::Conflict => DbError::Retryable,
            StoreError::Backend(msg) => DbError::Kv(msg),
        }
    }
}

/// A handle to one logical database inside a namespace.
#[derive(Clone)]
pub struct DbHandle {
    pub namespace: String,
    pub id: DbId,
    store: Arc<dyn Store>,
}

impl DbHandle {
    pub fn new(store: Arc<dyn Store>, namespace: impl Into<String>, id: DbId) -> DbHandle {
        DbHandle {
            namespace: namespace.into(),
            id,
            store,
        }
    }

    /// The underlying store handle.
    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    /// Begin a transaction pinned to the current snapshot.
    pub async fn begin(&self) -> Result<Transaction, DbError> {
        let kv = self.store.begin().await?;
        Ok(Transaction {
            kv,
            namespace: self.namespace.clone(),
            db_id: self.id,
        })
    }
}

/// One KV-store transaction bound to a (namespace, db id).
pub struct Transaction {
    pub(crate) kv: Box<dyn KvTransaction>,
    pub namespace: String,
    pub db_id: DbId,
}

impl Transaction {
    pub fn meta_key(&self, key: &[u8]) -> Vec<u8> {
        codec::meta_key(&self.namespace, self.db_id, key)
    }

    /// Load the raw object header of a key, honoring lazy expiration.
    /// `Ok(None)` when the key is absent or already expired.
    pub async fn object(&mut self, key: &[u8]) -> Result<Option<Object>, DbError> {
        let mkey = self.meta_key(key);
        match self.kv.get(&mkey).await? {
            None => Ok(None),
            Some(encoded) => {
                let obj = Object::decode(&encoded)?;
                if obj.is_expired(now_ns()) {
                    return Ok(None);
                }
                Ok(Some(obj))
            }
        }
    }

    /// Typed accessor for a string object.
    pub async fn string(&mut self, key: &[u8]) -> Result<string::StringObj, DbError> {
        string::StringObj::load(self, key).await
    }

    /// Typed accessor for a sorted set.
    pub async fn zset(&mut self, key: &[u8]) -> Result<zset::ZSet, DbError> {
        zset::ZSet::load(self, key).await
    }

    /// Typed accessor for a hash.
    pub async fn hash(&mut self, key: &[u8]) -> Result<hash::Hash, DbError> {
        hash::Hash::load(self, key).await
    }

    /// Point-get many raw keys in one round trip; result order matches input.
    pub async fn batch_get_values(
        &mut self,
        keys: &[Vec<u8>],
    ) -> Result<Vec<Option<Vec<u8>>>, DbError> {
        Ok(self.kv.batch_get(keys).await?)
    }

    /// Delete every key under `prefix`. Returns the number of keys removed.
    pub async fn delete_prefix(&mut self, prefix: &[u8]) -> Result<u64, DbError> {
        expire::gc_prefix(self.kv.as_mut(), prefix).await
    }

    pub async fn commit(&mut self) -> Result<(), DbError> {
        Ok(self.kv.commit().await?)
    }

    pub async fn rollback(&mut self) -> Result<(), DbError> {
        Ok(self.kv.rollback().await?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::MemStore;

    /// Fresh in-memory database for data-layer tests.
    pub(crate) fn mock_db() -> DbHandle {
        DbHandle::new(Arc::new(MemStore::new()), "ns", DbId(1))
    }

    #[tokio::test]
    async fn test_object_absent() {
        let db = mock_db();
        let mut txn = db.begin().await.unwrap();
        assert!(txn.object(b"missing").await.unwrap().is_none());
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let db = mock_db();
        let mut txn = db.begin().await.unwrap();
        for i in 0..4u8 {
            txn.kv
                .set(vec![b'p', b':', i], b"x".to_vec())
                .await
                .unwrap();
        }
        txn.kv.set(b"q:0".to_vec(), b"x".to_vec()).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = db.begin().await.unwrap();
        assert_eq!(txn.delete_prefix(b"p:").await.unwrap(), 4);
        txn.commit().await.unwrap();

        let mut txn = db.begin().await.unwrap();
        assert!(txn.kv.get(b"q:0").await.unwrap().is_some());
        assert!(txn.kv.get(&[b'p', b':', 0]).await.unwrap().is_none());
        txn.rollback().await.unwrap();
    }
}
