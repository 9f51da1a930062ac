//! String objects
//!
//! Strings co-locate meta and value in one KV entry: the 42-byte header is
//! followed directly by the value bytes, so a point-get serves both.

use crate::db::object::{Object, ObjectEncoding, ObjectType, now_ns, OBJECT_HEADER_LEN};
use crate::db::{expire, Transaction};
use crate::error::DbError;

/// Hard cap on string values, Redis-compatible (512MB).
pub const MAX_STRING_LEN: usize = 512 * 1024 * 1024;

/// A string object bound to a user key.
///
/// `value` is `None` until the key exists. Loading an expired meta behaves as
/// if the key were absent and assigns a fresh object id, so a subsequent write
/// starts a new object lifetime.
pub struct StringObj {
    key: Vec<u8>,
    pub meta: Object,
    value: Option<Vec<u8>>,
}

impl StringObj {
    pub(crate) async fn load(txn: &mut Transaction, key: &[u8]) -> Result<StringObj, DbError> {
        let mkey = txn.meta_key(key);
        let fresh = || StringObj {
            key: key.to_vec(),
            meta: Object::new(ObjectType::String, ObjectEncoding::Raw),
            value: None,
        };

        let encoded = match txn.kv.get(&mkey).await? {
            None => return Ok(fresh()),
            Some(encoded) => encoded,
        };
        let meta = Object::decode(&encoded)?;
        if meta.object_type != ObjectType::String {
            return Err(DbError::TypeMismatch);
        }
        if meta.is_expired(now_ns()) {
            return Ok(fresh());
        }
        Ok(StringObj {
            key: key.to_vec(),
            meta,
            value: Some(encoded[OBJECT_HEADER_LEN..].to_vec()),
        })
    }

    pub fn exists(&self) -> bool {
        self.value.is_some()
    }

    pub fn get(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn len(&self) -> usize {
        self.value.as_ref().map_or(0, |v| v.len())
    }

    /// Set the value. `expire_at` is an absolute nanosecond timestamp;
    /// `None` clears any existing expiry (plain `SET` semantics).
    pub async fn set(
        &mut self,
        txn: &mut Transaction,
        value: Vec<u8>,
        expire_at: Option<i64>,
    ) -> Result<(), DbError> {
        let mkey = txn.meta_key(&self.key);
        match expire_at {
            Some(at) if at > 0 => {
                let old = self.meta.expire_at;
                self.meta.expire_at = at;
                expire::expire_at_update(txn, &mkey, &self.meta.id, old, at).await?;
            }
            _ => {
                expire::unexpire_at(txn, &mkey, self.meta.expire_at).await?;
                self.meta.expire_at = 0;
            }
        }
        self.write_value(txn, value).await
    }

    /// Rewrite the value without touching the expiry. Used by `APPEND`,
    /// `SETRANGE` and the counters, which all preserve a live TTL.
    pub async fn set_keep_ttl(
        &mut self,
        txn: &mut Transaction,
        value: Vec<u8>,
    ) -> Result<(), DbError> {
        self.write_value(txn, value).await
    }

    async fn write_value(&mut self, txn: &mut Transaction, value: Vec<u8>) -> Result<(), DbError> {
        let mkey = txn.meta_key(&self.key);
        self.meta.updated_at = now_ns();
        let mut encoded = self.meta.encode();
        encoded.extend_from_slice(&value);
        self.value = Some(value);
        txn.kv.set(mkey, encoded).await?;
        Ok(())
    }

    /// Replace the value and return the previous one.
    pub async fn get_set(
        &mut self,
        txn: &mut Transaction,
        value: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, DbError> {
        let old = self.value.clone();
        self.set(txn, value, None).await?;
        Ok(old)
    }

    /// Append, returning the new length.
    pub async fn append(&mut self, txn: &mut Transaction, suffix: &[u8]) -> Result<usize, DbError> {
        let mut value = self.value.take().unwrap_or_default();
        value.extend_from_slice(suffix);
        let len = value.len();
        self.set_keep_ttl(txn, value).await?;
        Ok(len)
    }

    /// Add `delta` to the integer value. Non-integer contents reject.
    pub async fn incr(&mut self, txn: &mut Transaction, delta: i64) -> Result<i64, DbError> {
        let current = match &self.value {
            Some(v) => parse_i64(v)?,
            None => 0,
        };
        let next = current.checked_add(delta).ok_or(DbError::BadInteger)?;
        self.set_keep_ttl(txn, next.to_string().into_bytes()).await?;
        Ok(next)
    }

    /// Add `delta` to the float value. Non-float contents reject, as does a
    /// non-finite result.
    pub async fn incr_float(&mut self, txn: &mut Transaction, delta: f64) -> Result<f64, DbError> {
        let current = match &self.value {
            Some(v) => parse_f64(v)?,
            None => 0.0,
        };
        let next = current + delta;
        if !next.is_finite() {
            return Err(DbError::BadFloat);
        }
        self.set_keep_ttl(txn, format!("{next}").into_bytes())
            .await?;
        Ok(next)
    }

    /// `GETRANGE` with Redis semantics: negative offsets count from the end,
    /// the end index is inclusive, out-of-range clamps to an empty result.
    pub fn get_range(&self, start: i64, end: i64) -> &[u8] {
        let value = match &self.value {
            Some(v) => v.as_slice(),
            None => return &[],
        };
        let len = value.len() as i64;
        let mut start = if start < 0 { len + start } else { start };
        let mut end = if end < 0 { len + end } else { end };
        if start < 0 {
            start = 0;
        }
        if end >= len {
            end = len - 1;
        }
        if len == 0 || start > end || start >= len || end < 0 {
            return &[];
        }
        &value[start as usize..=end as usize]
    }

    /// `SETRANGE` with Redis semantics: zero-pad up to `offset` when the
    /// current value is shorter, then splice. Returns the new length.
    pub async fn set_range(
        &mut self,
        txn: &mut Transaction,
        offset: usize,
        patch: &[u8],
    ) -> Result<usize, DbError> {
        if patch.is_empty() {
            return Ok(self.len());
        }
        if offset + patch.len() > MAX_STRING_LEN {
            return Err(DbError::BadInteger);
        }
        let mut value = self.value.take().unwrap_or_default();
        if value.len() < offset + patch.len() {
            value.resize(offset + patch.len(), 0);
        }
        value[offset..offset + patch.len()].copy_from_slice(patch);
        let len = value.len();
        self.set_keep_ttl(txn, value).await?;
        Ok(len)
    }
}

fn parse_i64(bytes: &[u8]) -> Result<i64, DbError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(DbError::BadInteger)
}

fn parse_f64(bytes: &[u8]) -> Result<f64, DbError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|f| !f.is_nan())
        .ok_or(DbError::BadFloat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::mock_db;

    #[tokio::test]
    async fn test_set_get() {
        let db = mock_db();
        let mut txn = db.begin().await.unwrap();
        let mut s = txn.string(b"k").await.unwrap();
        assert!(!s.exists());
        s.set(&mut txn, b"v".to_vec(), None).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = db.begin().await.unwrap();
        let s = txn.string(b"k").await.unwrap();
        assert_eq!(s.get(), Some(b"v".as_ref()));
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_incr_sequence() {
        let db = mock_db();
        let mut txn = db.begin().await.unwrap();
        let mut s = txn.string(b"n").await.unwrap();
        s.set(&mut txn, b"10".to_vec(), None).await.unwrap();
        assert_eq!(s.incr(&mut txn, 1).await.unwrap(), 11);
        assert_eq!(s.incr(&mut txn, 5).await.unwrap(), 16);
        assert_eq!(s.get(), Some(b"16".as_ref()));
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_incr_rejects_garbage() {
        let db = mock_db();
        let mut txn = db.begin().await.unwrap();
        let mut s = txn.string(b"k").await.unwrap();
        s.set(&mut txn, b"abc".to_vec(), None).await.unwrap();
        assert_eq!(s.incr(&mut txn, 1).await, Err(DbError::BadInteger));
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_lazy_expiration_on_load() {
        let db = mock_db();
        let mut txn = db.begin().await.unwrap();
        let mut s = txn.string(b"k").await.unwrap();
        s.set(&mut txn, b"v".to_vec(), Some(1)).await.unwrap();
        let old_id = s.meta.id;
        txn.commit().await.unwrap();

        // expire_at = 1ns is long past; the key reads as absent and a fresh
        // load carries a new object id
        let mut txn = db.begin().await.unwrap();
        let s = txn.string(b"k").await.unwrap();
        assert!(!s.exists());
        assert_ne!(s.meta.id, old_id);
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_range() {
        let db = mock_db();
        let mut txn = db.begin().await.unwrap();
        let mut s = txn.string(b"k").await.unwrap();
        s.set(&mut txn, b"Hello World".to_vec(), None).await.unwrap();
        assert_eq!(s.get_range(0, 4), b"Hello");
        assert_eq!(s.get_range(-5, -1), b"World");
        assert_eq!(s.get_range(0, -1), b"Hello World");
        assert_eq!(s.get_range(6, 100), b"World");
        assert_eq!(s.get_range(8, 2), b"");
        assert_eq!(s.get_range(50, 60), b"");
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_set_range_zero_pads() {
        let db = mock_db();
        let mut txn = db.begin().await.unwrap();
        let mut s = txn.string(b"k").await.unwrap();
        let len = s.set_range(&mut txn, 5, b"abc").await.unwrap();
        assert_eq!(len, 8);
        assert_eq!(s.get(), Some(&b"\0\0\0\0\0abc"[..]));

        let len = s.set_range(&mut txn, 0, b"xy").await.unwrap();
        assert_eq!(len, 8);
        assert_eq!(s.get(), Some(&b"xy\0\0\0abc"[..]));
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_append_preserves_ttl() {
        let db = mock_db();
        let far_future = now_ns() + 3_600_000_000_000;
        let mut txn = db.begin().await.unwrap();
        let mut s = txn.string(b"k").await.unwrap();
        s.set(&mut txn, b"a".to_vec(), Some(far_future)).await.unwrap();
        s.append(&mut txn, b"b").await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = db.begin().await.unwrap();
        let s = txn.string(b"k").await.unwrap();
        assert_eq!(s.get(), Some(b"ab".as_ref()));
        assert_eq!(s.meta.expire_at, far_future);
        txn.rollback().await.unwrap();
    }
}
