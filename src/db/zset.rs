//! Sorted sets
//!
//! Every (member, score) pair owns two subkeys written and deleted together
//! in one transaction: the member subkey `NS:D:D:ID:<member>` holding the
//! encoded score, and the score-index subkey `NS:D:S:ID:<score8>:<member>`
//! holding nothing. Rank ranges are served by scanning the score index in
//! byte order, which equals score order by construction.

use crate::db::codec::{
    self, data_key, decode_f64, element_key, encode_f64, format_score, score_key, score_prefix,
};
use crate::db::object::{Object, ObjectEncoding, ObjectType, now_ns, OBJECT_HEADER_LEN};
use crate::db::{expire, Transaction};
use crate::error::DbError;
use crate::store::prefix_next;

/// A sorted set bound to a user key. `len` caches the member count from meta.
pub struct ZSet {
    key: Vec<u8>,
    pub meta: Object,
    pub len: i64,
}

impl ZSet {
    pub(crate) async fn load(txn: &mut Transaction, key: &[u8]) -> Result<ZSet, DbError> {
        let mkey = txn.meta_key(key);
        let fresh = || ZSet {
            key: key.to_vec(),
            meta: Object::new(ObjectType::ZSet, ObjectEncoding::SkipList),
            len: 0,
        };

        let encoded = match txn.kv.get(&mkey).await? {
            None => return Ok(fresh()),
            Some(encoded) => encoded,
        };
        let meta = Object::decode(&encoded)?;
        if meta.object_type != ObjectType::ZSet {
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
        Ok(ZSet {
            key: key.to_vec(),
            meta,
            len,
        })
    }

    pub fn exists(&self) -> bool {
        self.len > 0
    }

    pub fn card(&self) -> i64 {
        self.len
    }

    /// Add members with scores. Members must already be de-duplicated by the
    /// caller. Returns the number of newly-added members; updating an
    /// existing member's score does not count, and re-adding an identical
    /// score is a no-op.
    pub async fn add(
        &mut self,
        txn: &mut Transaction,
        members: &[Vec<u8>],
        scores: &[f64],
    ) -> Result<i64, DbError> {
        let old_values = if self.len > 0 {
            self.member_scores(txn, members).await?
        } else {
            vec![None; members.len()]
        };

        let dkey = data_key(&txn.namespace, txn.db_id, &self.meta.id);
        let sprefix = score_prefix(&txn.namespace, txn.db_id, &self.meta.id);
        let mut added = 0i64;
        for (i, member) in members.iter().enumerate() {
            let encoded_score = encode_f64(scores[i]);
            if let Some(old) = &old_values[i] {
                let old_score: [u8; 8] = old
                    .get(..8)
                    .ok_or(DbError::InvalidLength)?
                    .try_into()
                    .unwrap();
                if old_score == encoded_score {
                    continue;
                }
                txn.kv
                    .delete(score_key(&sprefix, &old_score, member))
                    .await?;
            } else {
                added += 1;
            }
            txn.kv
                .set(element_key(&dkey, member), encoded_score.to_vec())
                .await?;
            txn.kv
                .set(score_key(&sprefix, &encoded_score, member), Vec::new())
                .await?;
        }

        self.len += added;
        self.update_meta(txn).await?;
        Ok(added)
    }

    /// Batch-get the encoded scores of `members`, one round trip.
    async fn member_scores(
        &self,
        txn: &mut Transaction,
        members: &[Vec<u8>],
    ) -> Result<Vec<Option<Vec<u8>>>, DbError> {
        let dkey = data_key(&txn.namespace, txn.db_id, &self.meta.id);
        let keys: Vec<Vec<u8>> = members.iter().map(|m| element_key(&dkey, m)).collect();
        txn.batch_get_values(&keys).await
    }

    /// Rank range over the score index. Negative offsets resolve against the
    /// cached length, Python style. Reverse ranges scan forward over the
    /// mirrored window and flip the result, because the backing engine only
    /// seeks ascending.
    pub async fn any_order_range(
        &self,
        txn: &mut Transaction,
        start: i64,
        stop: i64,
        with_score: bool,
        positive_order: bool,
    ) -> Result<Vec<Vec<u8>>, DbError> {
        let mut stop = stop;
        let mut start = start;
        if stop < 0 {
            stop += self.len;
            if stop < 0 {
                return Ok(Vec::new());
            }
        } else if stop >= self.len {
            stop = self.len - 1;
        }
        if start < 0 {
            start += self.len;
            if start < 0 {
                start = 0;
            }
        }
        if start > stop || start >= self.len {
            return Ok(Vec::new());
        }

        if !positive_order {
            let tmp = start;
            start = self.len - 1 - stop;
            stop = self.len - 1 - tmp;
        }

        let sprefix = score_prefix(&txn.namespace, txn.db_id, &self.meta.id);
        let mut scan_prefix = sprefix.clone();
        scan_prefix.push(b':');
        let end = prefix_next(&scan_prefix);
        let mut iter = txn.kv.scan(scan_prefix.clone(), end).await?;

        let mut items: Vec<Vec<u8>> = Vec::new();
        let mut i = 0i64;
        while i <= stop && iter.valid() && iter.key().starts_with(&scan_prefix) {
            if i >= start {
                let key = iter.key();
                if key.len() < scan_prefix.len() + 8 + 1 {
                    tracing::error!(
                        key = %String::from_utf8_lossy(&self.key),
                        "score index entry too short to decode"
                    );
                    iter.next().await?;
                    continue;
                }
                let score_and_member = &key[scan_prefix.len()..];
                let score = &score_and_member[..8];
                let member = &score_and_member[8 + 1..];
                items.push(member.to_vec());
                if with_score {
                    items.push(format_score(decode_f64(score)).into_bytes());
                    if !positive_order {
                        let n = items.len();
                        items.swap(n - 1, n - 2);
                    }
                }
            }
            i += 1;
            iter.next().await?;
        }

        if !positive_order {
            items.reverse();
        }
        Ok(items)
    }

    /// Remove members, returning how many were present. Deletes both subkeys
    /// per member; when the set becomes empty the meta and any expire-index
    /// entry go with it in the same transaction.
    pub async fn remove(
        &mut self,
        txn: &mut Transaction,
        members: &[Vec<u8>],
    ) -> Result<i64, DbError> {
        let scores = self.member_scores(txn, members).await?;

        let dkey = data_key(&txn.namespace, txn.db_id, &self.meta.id);
        let sprefix = score_prefix(&txn.namespace, txn.db_id, &self.meta.id);
        let mut deleted = 0i64;
        for (i, member) in members.iter().enumerate() {
            let Some(score) = &scores[i] else {
                continue;
            };
            let score: [u8; 8] = score
                .get(..8)
                .ok_or(DbError::InvalidLength)?
                .try_into()
                .unwrap();
            txn.kv.delete(score_key(&sprefix, &score, member)).await?;
            txn.kv.delete(element_key(&dkey, member)).await?;
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

    /// The member's score, formatted for the reply, or `None`.
    pub async fn score(
        &self,
        txn: &mut Transaction,
        member: &[u8],
    ) -> Result<Option<String>, DbError> {
        let dkey = data_key(&txn.namespace, txn.db_id, &self.meta.id);
        match txn.kv.get(&element_key(&dkey, member)).await? {
            None => Ok(None),
            Some(encoded) => {
                if encoded.len() < 8 {
                    return Err(DbError::InvalidLength);
                }
                Ok(Some(format_score(decode_f64(&encoded))))
            }
        }
    }

    async fn update_meta(&mut self, txn: &mut Transaction) -> Result<(), DbError> {
        self.meta.updated_at = now_ns();
        let mut encoded = self.meta.encode();
        encoded.extend_from_slice(&self.len.to_be_bytes());
        let mkey = codec::meta_key(&txn.namespace, txn.db_id, &self.key);
        txn.kv.set(mkey, encoded).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::mock_db;
    use crate::db::DbHandle;

    async fn zadd(db: &DbHandle, key: &[u8], pairs: &[(f64, &[u8])]) -> i64 {
        let mut txn = db.begin().await.unwrap();
        let mut zset = txn.zset(key).await.unwrap();
        let members: Vec<Vec<u8>> = pairs.iter().map(|(_, m)| m.to_vec()).collect();
        let scores: Vec<f64> = pairs.iter().map(|(s, _)| *s).collect();
        let added = zset.add(&mut txn, &members, &scores).await.unwrap();
        txn.commit().await.unwrap();
        added
    }

    #[tokio::test]
    async fn test_add_and_range_with_scores() {
        let db = mock_db();
        let added = zadd(&db, b"z", &[(1.0, b"a"), (2.0, b"b"), (3.0, b"c")]).await;
        assert_eq!(added, 3);

        let mut txn = db.begin().await.unwrap();
        let zset = txn.zset(b"z").await.unwrap();
        let items = zset
            .any_order_range(&mut txn, 0, -1, true, true)
            .await
            .unwrap();
        let items: Vec<&[u8]> = items.iter().map(|i| i.as_slice()).collect();
        assert_eq!(items, vec![b"a" as &[u8], b"1", b"b", b"2", b"c", b"3"]);
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_score_not_counted_as_add() {
        let db = mock_db();
        assert_eq!(zadd(&db, b"z", &[(1.0, b"a"), (2.0, b"b")]).await, 2);
        assert_eq!(zadd(&db, b"z", &[(5.0, b"a")]).await, 0);

        let mut txn = db.begin().await.unwrap();
        let zset = txn.zset(b"z").await.unwrap();
        assert_eq!(zset.card(), 2);
        assert_eq!(
            zset.score(&mut txn, b"a").await.unwrap(),
            Some("5".to_string())
        );
        // the old score-index entry is gone; exactly len entries remain
        let items = zset
            .any_order_range(&mut txn, 0, -1, false, true)
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_rev_range() {
        let db = mock_db();
        zadd(&db, b"z", &[(1.0, b"a"), (2.0, b"b"), (3.0, b"c")]).await;

        let mut txn = db.begin().await.unwrap();
        let zset = txn.zset(b"z").await.unwrap();
        let items = zset
            .any_order_range(&mut txn, 0, 1, false, false)
            .await
            .unwrap();
        let items: Vec<&[u8]> = items.iter().map(|i| i.as_slice()).collect();
        assert_eq!(items, vec![b"c" as &[u8], b"b"]);

        let items = zset
            .any_order_range(&mut txn, 0, -1, true, false)
            .await
            .unwrap();
        let items: Vec<&[u8]> = items.iter().map(|i| i.as_slice()).collect();
        assert_eq!(items, vec![b"c" as &[u8], b"3", b"b", b"2", b"a", b"1"]);
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_negative_scores_sort_before_positive() {
        let db = mock_db();
        zadd(
            &db,
            b"z",
            &[(0.5, b"p"), (-2.5, b"n"), (0.0, b"z0"), (-0.0, b"nz")],
        )
        .await;

        let mut txn = db.begin().await.unwrap();
        let zset = txn.zset(b"z").await.unwrap();
        let items = zset
            .any_order_range(&mut txn, 0, -1, false, true)
            .await
            .unwrap();
        assert_eq!(items[0], b"n");
        assert_eq!(items[3], b"p");
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_to_empty_deletes_meta() {
        let db = mock_db();
        zadd(&db, b"z", &[(1.0, b"a"), (2.0, b"b")]).await;

        let mut txn = db.begin().await.unwrap();
        let mut zset = txn.zset(b"z").await.unwrap();
        let deleted = zset
            .remove(&mut txn, &[b"a".to_vec(), b"b".to_vec(), b"ghost".to_vec()])
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        txn.commit().await.unwrap();

        let mut txn = db.begin().await.unwrap();
        assert!(txn.object(b"z").await.unwrap().is_none());
        let zset = txn.zset(b"z").await.unwrap();
        assert!(!zset.exists());
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_card_matches_index_entries() {
        let db = mock_db();
        zadd(&db, b"z", &[(1.0, b"a"), (2.0, b"b"), (3.0, b"c")]).await;
        let mut txn = db.begin().await.unwrap();
        let mut zset = txn.zset(b"z").await.unwrap();
        zset.remove(&mut txn, &[b"b".to_vec()]).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = db.begin().await.unwrap();
        let zset = txn.zset(b"z").await.unwrap();
        let items = zset
            .any_order_range(&mut txn, 0, -1, false, true)
            .await
            .unwrap();
        assert_eq!(zset.card(), items.len() as i64);
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_type_mismatch() {
        let db = mock_db();
        let mut txn = db.begin().await.unwrap();
        let mut s = txn.string(b"k").await.unwrap();
        s.set(&mut txn, b"v".to_vec(), None).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = db.begin().await.unwrap();
        assert!(matches!(
            txn.zset(b"k").await,
            Err(DbError::TypeMismatch)
        ));
        txn.rollback().await.unwrap();
    }
}
