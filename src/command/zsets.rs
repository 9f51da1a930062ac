//! Sorted-set command handlers

use crate::command::wrong_args;
use crate::db::Transaction;
use crate::error::DbError;
use crate::protocol::Reply;

use super::strings::{parse_f64, parse_i64};

/// `ZADD key score member [score member ...]`
///
/// Duplicate members keep the last occurrence, Redis style. NaN scores are
/// rejected before any write happens.
pub async fn zadd(txn: &mut Transaction, args: &[Vec<u8>]) -> Result<Reply, DbError> {
    let key = &args[0];
    let pairs = &args[1..];
    if pairs.len() % 2 != 0 {
        return Ok(wrong_args("ZADD"));
    }

    let mut members: Vec<Vec<u8>> = Vec::with_capacity(pairs.len() / 2);
    let mut scores: Vec<f64> = Vec::with_capacity(pairs.len() / 2);
    for pair in pairs.chunks(2) {
        let score = parse_f64(&pair[0])?;
        let member = &pair[1];
        if let Some(pos) = members.iter().position(|m| m == member) {
            scores[pos] = score;
        } else {
            members.push(member.clone());
            scores.push(score);
        }
    }

    let mut zset = txn.zset(key).await?;
    let added = zset.add(txn, &members, &scores).await?;
    Ok(Reply::Integer(added))
}

/// ZRANGE/ZREVRANGE, optionally WITHSCORES.
pub async fn zrange(
    txn: &mut Transaction,
    args: &[Vec<u8>],
    positive_order: bool,
) -> Result<Reply, DbError> {
    let key = &args[0];
    let start = parse_i64(&args[1])?;
    let stop = parse_i64(&args[2])?;
    let with_scores = match args.get(3) {
        None => false,
        Some(opt) if opt.eq_ignore_ascii_case(b"WITHSCORES") => true,
        Some(_) => return Ok(Reply::error("ERR syntax error")),
    };

    let zset = txn.zset(key).await?;
    if !zset.exists() {
        return Ok(Reply::bulks(Vec::new()));
    }
    let items = zset
        .any_order_range(txn, start, stop, with_scores, positive_order)
        .await?;
    Ok(Reply::bulks(items))
}

pub async fn zrem(txn: &mut Transaction, args: &[Vec<u8>]) -> Result<Reply, DbError> {
    let key = &args[0];
    let mut members: Vec<Vec<u8>> = Vec::with_capacity(args.len() - 1);
    for member in &args[1..] {
        if !members.contains(member) {
            members.push(member.clone());
        }
    }

    let mut zset = txn.zset(key).await?;
    if !zset.exists() {
        return Ok(Reply::Integer(0));
    }
    let deleted = zset.remove(txn, &members).await?;
    Ok(Reply::Integer(deleted))
}

pub async fn zcard(txn: &mut Transaction, args: &[Vec<u8>]) -> Result<Reply, DbError> {
    let zset = txn.zset(&args[0]).await?;
    Ok(Reply::Integer(zset.card()))
}

pub async fn zscore(txn: &mut Transaction, args: &[Vec<u8>]) -> Result<Reply, DbError> {
    let zset = txn.zset(&args[0]).await?;
    if !zset.exists() {
        return Ok(Reply::NullBulk);
    }
    Ok(match zset.score(txn, &args[1]).await? {
        Some(score) => Reply::Bulk(score.into_bytes()),
        None => Reply::NullBulk,
    })
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
        let reply = match dispatch(name, &args, &mut txn).await {
            Ok(reply) => reply,
            Err(err) => Reply::error(err.client_message()),
        };
        txn.commit().await.unwrap();
        reply
    }

    fn bulks(items: &[&[u8]]) -> Reply {
        Reply::bulks(items.iter().map(|i| i.to_vec()).collect())
    }

    #[tokio::test]
    async fn test_zadd_zrange_withscores() {
        let db = mock_db();
        assert_eq!(
            run(&db, "ZADD", &[b"z", b"1", b"a", b"2", b"b", b"3", b"c"]).await,
            Reply::Integer(3)
        );
        assert_eq!(
            run(&db, "ZRANGE", &[b"z", b"0", b"-1", b"WITHSCORES"]).await,
            bulks(&[b"a", b"1", b"b", b"2", b"c", b"3"])
        );
    }

    #[tokio::test]
    async fn test_zadd_update_then_zscore() {
        let db = mock_db();
        assert_eq!(
            run(&db, "ZADD", &[b"z", b"1", b"a", b"2", b"b"]).await,
            Reply::Integer(2)
        );
        assert_eq!(
            run(&db, "ZADD", &[b"z", b"5", b"a"]).await,
            Reply::Integer(0)
        );
        assert_eq!(
            run(&db, "ZSCORE", &[b"z", b"a"]).await,
            Reply::Bulk(b"5".to_vec())
        );
    }

    #[tokio::test]
    async fn test_zrevrange() {
        let db = mock_db();
        run(&db, "ZADD", &[b"z", b"1", b"a", b"2", b"b", b"3", b"c"]).await;
        assert_eq!(
            run(&db, "ZREVRANGE", &[b"z", b"0", b"1"]).await,
            bulks(&[b"c", b"b"])
        );
        assert_eq!(
            run(&db, "ZREVRANGE", &[b"z", b"0", b"-1", b"WITHSCORES"]).await,
            bulks(&[b"c", b"3", b"b", b"2", b"a", b"1"])
        );
    }

    #[tokio::test]
    async fn test_zadd_nan_rejected() {
        let db = mock_db();
        assert_eq!(
            run(&db, "ZADD", &[b"z", b"nan", b"a"]).await,
            Reply::Error("ERR value is not a valid float".to_string())
        );
        // nothing was written
        assert_eq!(run(&db, "ZCARD", &[b"z"]).await, Reply::Integer(0));
    }

    #[tokio::test]
    async fn test_zadd_duplicate_member_keeps_last() {
        let db = mock_db();
        assert_eq!(
            run(&db, "ZADD", &[b"z", b"1", b"m", b"9", b"m"]).await,
            Reply::Integer(1)
        );
        assert_eq!(
            run(&db, "ZSCORE", &[b"z", b"m"]).await,
            Reply::Bulk(b"9".to_vec())
        );
    }

    #[tokio::test]
    async fn test_zrem_and_zcard() {
        let db = mock_db();
        run(&db, "ZADD", &[b"z", b"1", b"a", b"2", b"b", b"3", b"c"]).await;
        assert_eq!(
            run(&db, "ZREM", &[b"z", b"a", b"a", b"ghost"]).await,
            Reply::Integer(1)
        );
        assert_eq!(run(&db, "ZCARD", &[b"z"]).await, Reply::Integer(2));
    }

    #[tokio::test]
    async fn test_zrange_empty_windows() {
        let db = mock_db();
        run(&db, "ZADD", &[b"z", b"1", b"a", b"2", b"b"]).await;
        assert_eq!(run(&db, "ZRANGE", &[b"z", b"5", b"9"]).await, bulks(&[]));
        assert_eq!(run(&db, "ZRANGE", &[b"z", b"1", b"0"]).await, bulks(&[]));
        assert_eq!(
            run(&db, "ZRANGE", &[b"missing", b"0", b"-1"]).await,
            bulks(&[])
        );
    }

    #[tokio::test]
    async fn test_zscore_missing() {
        let db = mock_db();
        assert_eq!(run(&db, "ZSCORE", &[b"z", b"m"]).await, Reply::NullBulk);
        run(&db, "ZADD", &[b"z", b"1", b"a"]).await;
        assert_eq!(run(&db, "ZSCORE", &[b"z", b"m"]).await, Reply::NullBulk);
    }
}
