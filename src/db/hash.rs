//! Hashes
//!
//! Field subkeys live under the object's data prefix, `NS:D:D:ID:<field>`,
//! holding the field value directly. The meta payload caches the field count
//! the same way sorted sets cache their length.

use crate::db::codec::{data_key, element_key};
use crate::db::object::{Object, ObjectEncoding, ObjectType, now_ns, OBJECT_HEADER_LEN};
use crate::db::{expire, Transaction};
use crate::error::DbError;
use crate::store::prefix_next;

/// A hash bound to a user key.
pub struct Hash {
    key: Vec<u8>,
    pub meta: Object,
    pub len: i64,
}

impl Hash {
    pub(crate) async fn load(txn: &mut Transaction, key: &[u8]) -> Result<Hash, DbError> {
        let mkey = txn.meta_key(key);
        let fresh = || Hash {
            key: key.to_vec(),
            meta: Object::new(ObjectType::Hash, ObjectEncoding::HashTable),
            len: 0,
        };

        let encoded = match txn.kv.get(&mkey).await? {
            None => return Ok(fresh()),
            Some(encoded) => encoded,
        };
        let meta = Object::decode(&encoded)?;
        if meta.object_type != ObjectType::Hash {
            return Err(DbError::TypeMismatch);
        }
        if meta.is_expired(now_ns()) {
            return Ok(fresh());
        }
        let payload = &encoded[OBJECT_HEADER_LEN..];
        if payload.len() != 8 {
            return Err(DbError::InvalidLength);
        }
        let len = i64::from_be_bytes(payload.try_into().unwrap());
        Ok(Hash {
            key: key.to_vec(),
            meta,
            len,
        })
    }

    pub fn exists(&self) -> bool {
        self.len > 0
    }

    pub fn hlen(&self) -> i64 {
        self.len
    }

    /// Set fields. Pairs must be de-duplicated by the caller. Returns the
    /// number of fields that did not previously exist.
    pub async fn set(
        &mut self,
        txn: &mut Transaction,
        fields: &[Vec<u8>],
        values: &[Vec<u8>],
    ) -> Result<i64, DbError> {
        let old = if self.len > 0 {
            self.field_values(txn, fields).await?
        } else {
            vec![None; fields.len()]
        };

        let dkey = data_key(&txn.namespace, txn.db_id, &self.meta.id);
        let mut added = 0i64;
        for (i, field) in fields.iter().enumerate() {
            if old[i].is_none() {
                added += 1;
            }
            txn.kv
                .set(element_key(&dkey, field), values[i].clone())
                .await?;
        }

        self.len += added;
        self.update_meta(txn).await?;
        Ok(added)
    }

    pub async fn get(
        &self,
        txn: &mut Transaction,
        field: &[u8],
    ) -> Result<Option<Vec<u8>>, DbError> {
        if !self.exists() {
            return Ok(None);
        }
        let dkey = data_key(&txn.namespace, txn.db_id, &self.meta.id);
        Ok(txn.kv.get(&element_key(&dkey, field)).await?)
    }

    /// Batch-get field values, one round trip, result order matching input.
    pub async fn field_values(
        &self,
        txn: &mut Transaction,
        fields: &[Vec<u8>],
    ) -> Result<Vec<Option<Vec<u8>>>, DbError> {
        let dkey = data_key(&txn.namespace, txn.db_id, &self.meta.id);
        let keys: Vec<Vec<u8>> = fields.iter().map(|f| element_key(&dkey, f)).collect();
        txn.batch_get_values(&keys).await
    }

    /// Delete fields, returning how many were present. An emptied hash drops
    /// its meta and expire-index entry in the same transaction.
    pub async fn delete(
        &mut self,
        txn: &mut Transaction,
        fields: &[Vec<u8>],
    ) -> Result<i64, DbError> {
        let old = self.field_values(txn, fields).await?;
        let dkey = data_key(&txn.namespace, txn.db_id, &self.meta.id);
        let mut deleted = 0i64;
        for (i, field) in fields.iter().enumerate() {
            if old[i].is_none() {
                continue;
            }
            txn.kv.delete(element_key(&dkey, field)).await?;
            deleted += 1;
        }
        self.len -= deleted;

        if self.len == 0 {
            let mkey = txn.meta_key(&self.key);
            txn.kv.delete(mkey.clone()).await?;
            if self.meta.expire_at > 0 {
                expire::unexpire_at(txn, &mkey, self.meta.expire_at).await?;
            }
            return Ok(deleted);
        }

        self.update_meta(txn).await?;
        Ok(deleted)
    }

    /// All (field, value) pairs in field byte order.
    pub async fn get_all(
        &self,
        txn: &mut Transaction,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbError> {
        if !self.exists() {
            return Ok(Vec::new());
        }
        let dkey = data_key(&txn.namespace, txn.db_id, &self.meta.id);
        let mut scan_prefix = dkey.clone();
        scan_prefix.push(b':');
        let end = prefix_next(&scan_prefix);
        let mut iter = txn.kv.scan(scan_prefix.clone(), end).await?;

        let mut pairs = Vec::new();
        while iter.valid() && iter.key().starts_with(&scan_prefix) {
            let field = iter.key()[scan_prefix.len()..].to_vec();
            pairs.push((field, iter.value().to_vec()));
            iter.next().await?;
        }
        Ok(pairs)
    }

    async fn update_meta(&mut self, txn: &mut Transaction) -> Result<(), DbError> {
        self.meta.updated_at = now_ns();
        let mut encoded = self.meta.encode();
        encoded.extend_from_slice(&self.len.to_be_bytes());
        let mkey = txn.meta_key(&self.key);
        txn.kv.set(mkey, encoded).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::mock_db;

    #[tokio::test]
    async fn test_set_get() {
        let db = mock_db();
        let mut txn = db.begin().await.unwrap();
        let mut hash = txn.hash(b"h").await.unwrap();
        let added = hash
            .set(
                &mut txn,
                &[b"f1".to_vec(), b"f2".to_vec()],
                &[b"v1".to_vec(), b"v2".to_vec()],
            )
            .await
            .unwrap();
        assert_eq!(added, 2);
        txn.commit().await.unwrap();

        let mut txn = db.begin().await.unwrap();
        let hash = txn.hash(b"h").await.unwrap();
        assert_eq!(hash.hlen(), 2);
        assert_eq!(
            hash.get(&mut txn, b"f1").await.unwrap(),
            Some(b"v1".to_vec())
        );
        assert_eq!(hash.get(&mut txn, b"nope").await.unwrap(), None);
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_overwrite_not_counted() {
        let db = mock_db();
        let mut txn = db.begin().await.unwrap();
        let mut hash = txn.hash(b"h").await.unwrap();
        hash.set(&mut txn, &[b"f".to_vec()], &[b"v1".to_vec()])
            .await
            .unwrap();
        let added = hash
            .set(&mut txn, &[b"f".to_vec()], &[b"v2".to_vec()])
            .await
            .unwrap();
        assert_eq!(added, 0);
        assert_eq!(hash.hlen(), 1);
        assert_eq!(hash.get(&mut txn, b"f").await.unwrap(), Some(b"v2".to_vec()));
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_to_empty_drops_meta() {
        let db = mock_db();
        let mut txn = db.begin().await.unwrap();
        let mut hash = txn.hash(b"h").await.unwrap();
        hash.set(&mut txn, &[b"f".to_vec()], &[b"v".to_vec()])
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let mut txn = db.begin().await.unwrap();
        let mut hash = txn.hash(b"h").await.unwrap();
        assert_eq!(hash.delete(&mut txn, &[b"f".to_vec()]).await.unwrap(), 1);
        txn.commit().await.unwrap();

        let mut txn = db.begin().await.unwrap();
        assert!(txn.object(b"h").await.unwrap().is_none());
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_all() {
        let db = mock_db();
        let mut txn = db.begin().await.unwrap();
        let mut hash = txn.hash(b"h").await.unwrap();
        hash.set(
            &mut txn,
            &[b"b".to_vec(), b"a".to_vec()],
            &[b"2".to_vec(), b"1".to_vec()],
        )
        .await
        .unwrap();
        let pairs = hash.get_all(&mut txn).await.unwrap();
        assert_eq!(
            pairs,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec())
            ]
        );
        txn.rollback().await.unwrap();
    }
}
