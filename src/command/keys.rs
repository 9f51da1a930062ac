//! Key-level command handlers: existence, deletion, expiry

use crate::db::codec::{data_key, score_prefix};
use crate::db::object::{patch_expire_at, Object, ObjectType};
use crate::db::{expire as expire_engine, now_ns, Transaction};
use crate::error::DbError;
use crate::protocol::Reply;

use super::strings::parse_i64;

pub async fn del(txn: &mut Transaction, args: &[Vec<u8>]) -> Result<Reply, DbError> {
    let mut deleted = 0i64;
    for key in args {
        if destroy_key(txn, key).await? {
            deleted += 1;
        }
    }
    Ok(Reply::Integer(deleted))
}

/// Physically remove one key: meta, expire-index entry, and element data.
/// Returns whether the key counted as existing (lazily-expired keys are
/// cleaned up but not counted).
async fn destroy_key(txn: &mut Transaction, key: &[u8]) -> Result<bool, DbError> {
    let mkey = txn.meta_key(key);
    let Some(encoded) = txn.kv.get(&mkey).await? else {
        return Ok(false);
    };
    let obj = Object::decode(&encoded)?;

    txn.kv.delete(mkey.clone()).await?;
    if obj.expire_at > 0 {
        expire_engine::unexpire_at(txn, &mkey, obj.expire_at).await?;
    }
    if obj.object_type != ObjectType::String {
        let namespace = txn.namespace.clone();
        let dkey = data_key(&namespace, txn.db_id, &obj.id);
        let skey = score_prefix(&namespace, txn.db_id, &obj.id);
        txn.delete_prefix(&dkey).await?;
        txn.delete_prefix(&skey).await?;
    }
    Ok(!obj.is_expired(now_ns()))
}

pub async fn exists(txn: &mut Transaction, args: &[Vec<u8>]) -> Result<Reply, DbError> {
    let mut count = 0i64;
    for key in args {
        if txn.object(key).await?.is_some() {
            count += 1;
        }
    }
    Ok(Reply::Integer(count))
}

pub async fn type_of(txn: &mut Transaction, args: &[Vec<u8>]) -> Result<Reply, DbError> {
    Ok(Reply::Simple(
        match txn.object(&args[0]).await? {
            Some(obj) => obj.object_type.name(),
            None => "none",
        }
        .to_string(),
    ))
}

/// EXPIRE/PEXPIRE/EXPIREAT/PEXPIREAT. `unit_ns` scales the argument;
/// `absolute` distinguishes the AT forms from relative ones.
pub async fn expire(
    txn: &mut Transaction,
    args: &[Vec<u8>],
    unit_ns: i64,
    absolute: bool,
) -> Result<Reply, DbError> {
    let key = &args[0];
    let amount = parse_i64(&args[1])?;
    let new_at = if absolute {
        amount.saturating_mul(unit_ns)
    } else {
        now_ns().saturating_add(amount.saturating_mul(unit_ns))
    };

    let mkey = txn.meta_key(key);
    let Some(mut encoded) = txn.kv.get(&mkey).await? else {
        return Ok(Reply::Integer(0));
    };
    let obj = Object::decode(&encoded)?;
    if obj.is_expired(now_ns()) {
        return Ok(Reply::Integer(0));
    }

    // an expiry in the past deletes the key outright
    if new_at <= now_ns() {
        destroy_key(txn, key).await?;
        return Ok(Reply::Integer(1));
    }

    expire_engine::expire_at_update(txn, &mkey, &obj.id, obj.expire_at, new_at).await?;
    patch_expire_at(&mut encoded, new_at)?;
    txn.kv.set(mkey, encoded).await?;
    Ok(Reply::Integer(1))
}

/// TTL/PTTL: -2 missing, -1 no expiry, else remaining time in `unit_ns`.
pub async fn ttl(txn: &mut Transaction, args: &[Vec<u8>], unit_ns: i64) -> Result<Reply, DbError> {
    Ok(Reply::Integer(match txn.object(&args[0]).await? {
        None => -2,
        Some(obj) if obj.expire_at == 0 => -1,
        Some(obj) => (obj.expire_at - now_ns()).max(0) / unit_ns,
    }))
}

pub async fn persist(txn: &mut Transaction, args: &[Vec<u8>]) -> Result<Reply, DbError> {
    let mkey = txn.meta_key(&args[0]);
    let Some(mut encoded) = txn.kv.get(&mkey).await? else {
        return Ok(Reply::Integer(0));
    };
    let obj = Object::decode(&encoded)?;
    if obj.expire_at == 0 || obj.is_expired(now_ns()) {
        return Ok(Reply::Integer(0));
    }

    expire_engine::unexpire_at(txn, &mkey, obj.expire_at).await?;
    patch_expire_at(&mut encoded, 0)?;
    txn.kv.set(mkey, encoded).await?;
    Ok(Reply::Integer(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::dispatch;
    use crate::db::tests::mock_db;
    use crate::db::DbHandle;

    async fn run(db: &DbHandle, name: &str, args: &[&[u8]]) -> Reply {
        let args: Vec<Vec<u8>> = args.iter().map(|a| a.to_vec()).collect();
        let mut txn = db.begin().await.unwrap();
        let reply = dispatch(name, &args, &mut txn).await.unwrap();
        txn.commit().await.unwrap();
        reply
    }

    #[tokio::test]
    async fn test_del_counts_existing() {
        let db = mock_db();
        run(&db, "SET", &[b"a", b"1"]).await;
        run(&db, "ZADD", &[b"z", b"1", b"m"]).await;
        assert_eq!(
            run(&db, "DEL", &[b"a", b"z", b"ghost"]).await,
            Reply::Integer(2)
        );
        assert_eq!(run(&db, "EXISTS", &[b"a", b"z"]).await, Reply::Integer(0));
    }

    #[tokio::test]
    async fn test_del_zset_clears_data() {
        let db = mock_db();
        run(&db, "ZADD", &[b"z", b"1", b"a", b"2", b"b"]).await;
        let mut txn = db.begin().await.unwrap();
        let id = txn.zset(b"z").await.unwrap().meta.id;
        txn.rollback().await.unwrap();

        run(&db, "DEL", &[b"z"]).await;

        let mut txn = db.begin().await.unwrap();
        let dkey = data_key("ns", db.id, &id);
        let mut iter = txn
            .kv
            .scan(dkey.clone(), crate::store::prefix_next(&dkey))
            .await
            .unwrap();
        assert!(!iter.valid());
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_recreate_after_del_gets_new_id() {
        let db = mock_db();
        run(&db, "SET", &[b"k", b"v"]).await;
        let mut txn = db.begin().await.unwrap();
        let id1 = txn.object(b"k").await.unwrap().unwrap().id;
        txn.rollback().await.unwrap();

        run(&db, "DEL", &[b"k"]).await;
        run(&db, "SET", &[b"k", b"v2"]).await;

        let mut txn = db.begin().await.unwrap();
        let id2 = txn.object(b"k").await.unwrap().unwrap().id;
        txn.rollback().await.unwrap();
        assert_ne!(id1, id2);
    }

    #[tokio::test]
    async fn test_expire_ttl_persist() {
        let db = mock_db();
        run(&db, "SET", &[b"k", b"v"]).await;
        assert_eq!(run(&db, "TTL", &[b"k"]).await, Reply::Integer(-1));
        assert_eq!(run(&db, "TTL", &[b"ghost"]).await, Reply::Integer(-2));

        assert_eq!(run(&db, "EXPIRE", &[b"k", b"100"]).await, Reply::Integer(1));
        let Reply::Integer(remaining) = run(&db, "TTL", &[b"k"]).await else {
            panic!("expected integer");
        };
        assert!(remaining > 90 && remaining <= 100);

        assert_eq!(run(&db, "PERSIST", &[b"k"]).await, Reply::Integer(1));
        assert_eq!(run(&db, "TTL", &[b"k"]).await, Reply::Integer(-1));
        assert_eq!(run(&db, "PERSIST", &[b"k"]).await, Reply::Integer(0));
    }

    #[tokio::test]
    async fn test_expire_in_past_deletes() {
        let db = mock_db();
        run(&db, "SET", &[b"k", b"v"]).await;
        assert_eq!(run(&db, "EXPIRE", &[b"k", b"-1"]).await, Reply::Integer(1));
        assert_eq!(run(&db, "EXISTS", &[b"k"]).await, Reply::Integer(0));
    }

    #[tokio::test]
    async fn test_expire_missing_key() {
        let db = mock_db();
        assert_eq!(
            run(&db, "EXPIRE", &[b"ghost", b"10"]).await,
            Reply::Integer(0)
        );
    }

    #[tokio::test]
    async fn test_type() {
        let db = mock_db();
        run(&db, "SET", &[b"s", b"v"]).await;
        run(&db, "ZADD", &[b"z", b"1", b"m"]).await;
        run(&db, "HSET", &[b"h", b"f", b"v"]).await;
        assert_eq!(
            run(&db, "TYPE", &[b"s"]).await,
            Reply::Simple("string".to_string())
        );
        assert_eq!(
            run(&db, "TYPE", &[b"z"]).await,
            Reply::Simple("zset".to_string())
        );
        assert_eq!(
            run(&db, "TYPE", &[b"h"]).await,
            Reply::Simple("hash".to_string())
        );
        assert_eq!(
            run(&db, "TYPE", &[b"none"]).await,
            Reply::Simple("none".to_string())
        );
    }
}
