//! Hash command handlers

use crate::command::wrong_args;
use crate::db::Transaction;
use crate::error::DbError;
use crate::protocol::Reply;

/// `HSET key field value [field value ...]` — last duplicate wins.
pub async fn hset(txn: &mut Transaction, args: &[Vec<u8>]) -> Result<Reply, DbError> {
    let key = &args[0];
    let pairs = &args[1..];
    if pairs.len() % 2 != 0 {
        return Ok(wrong_args("HSET"));
    }

    let mut fields: Vec<Vec<u8>> = Vec::with_capacity(pairs.len() / 2);
    let mut values: Vec<Vec<u8>> = Vec::with_capacity(pairs.len() / 2);
    for pair in pairs.chunks(2) {
        if let Some(pos) = fields.iter().position(|f| f == &pair[0]) {
            values[pos] = pair[1].clone();
        } else {
            fields.push(pair[0].clone());
            values.push(pair[1].clone());
        }
    }

    let mut hash = txn.hash(key).await?;
    let added = hash.set(txn, &fields, &values).await?;
    Ok(Reply::Integer(added))
}

pub async fn hget(txn: &mut Transaction, args: &[Vec<u8>]) -> Result<Reply, DbError> {
    let hash = txn.hash(&args[0]).await?;
    Ok(match hash.get(txn, &args[1]).await? {
        Some(value) => Reply::Bulk(value),
        None => Reply::NullBulk,
    })
}

pub async fn hmget(txn: &mut Transaction, args: &[Vec<u8>]) -> Result<Reply, DbError> {
    let hash = txn.hash(&args[0]).await?;
    let fields: Vec<Vec<u8>> = args[1..].to_vec();
    if !hash.exists() {
        return Ok(Reply::BulkArray(vec![None; fields.len()]));
    }
    let values = hash.field_values(txn, &fields).await?;
    Ok(Reply::BulkArray(values))
}

pub async fn hdel(txn: &mut Transaction, args: &[Vec<u8>]) -> Result<Reply, DbError> {
    let mut hash = txn.hash(&args[0]).await?;
    if !hash.exists() {
        return Ok(Reply::Integer(0));
    }
    let mut fields: Vec<Vec<u8>> = Vec::with_capacity(args.len() - 1);
    for field in &args[1..] {
        if !fields.contains(field) {
            fields.push(field.clone());
        }
    }
    let deleted = hash.delete(txn, &fields).await?;
    Ok(Reply::Integer(deleted))
}

pub async fn hlen(txn: &mut Transaction, args: &[Vec<u8>]) -> Result<Reply, DbError> {
    let hash = txn.hash(&args[0]).await?;
    Ok(Reply::Integer(hash.hlen()))
}

pub async fn hexists(txn: &mut Transaction, args: &[Vec<u8>]) -> Result<Reply, DbError> {
    let hash = txn.hash(&args[0]).await?;
    let present = hash.get(txn, &args[1]).await?.is_some();
    Ok(Reply::Integer(present as i64))
}

pub async fn hgetall(txn: &mut Transaction, args: &[Vec<u8>]) -> Result<Reply, DbError> {
    let hash = txn.hash(&args[0]).await?;
    let pairs = hash.get_all(txn).await?;
    let mut items = Vec::with_capacity(pairs.len() * 2);
    for (field, value) in pairs {
        items.push(field);
        items.push(value);
    }
    Ok(Reply::bulks(items))
}
