//! String command handlers

use crate::command::wrong_args;
use crate::db::{now_ns, Transaction};
use crate::error::DbError;
use crate::protocol::Reply;

pub async fn get(txn: &mut Transaction, args: &[Vec<u8>]) -> Result<Reply, DbError> {
    let s = txn.string(&args[0]).await?;
    Ok(match s.get() {
        Some(value) => Reply::Bulk(value.to_vec()),
        None => Reply::NullBulk,
    })
}

/// `SET key value [EX seconds | PX milliseconds] [NX | XX]`
pub async fn set(txn: &mut Transaction, args: &[Vec<u8>]) -> Result<Reply, DbError> {
    let key = &args[0];
    let value = args[1].clone();

    let mut expire_at: Option<i64> = None;
    let mut nx = false;
    let mut xx = false;
    let mut i = 2;
    while i < args.len() {
        let opt = String::from_utf8_lossy(&args[i]).to_uppercase();
        match opt.as_str() {
            "EX" | "PX" => {
                let Some(raw) = args.get(i + 1) else {
                    return Ok(Reply::error("ERR syntax error"));
                };
                let amount = parse_i64(raw)?;
                if amount <= 0 {
                    return Ok(Reply::error("ERR invalid expire time in 'set' command"));
                }
                let unit = if opt == "EX" { 1_000_000_000 } else { 1_000_000 };
                expire_at = Some(now_ns() + amount * unit);
                i += 2;
            }
            "NX" => {
                nx = true;
                i += 1;
            }
            "XX" => {
                xx = true;
                i += 1;
            }
            _ => return Ok(Reply::error("ERR syntax error")),
        }
    }
    if nx && xx {
        return Ok(Reply::error("ERR syntax error"));
    }

    let mut s = txn.string(key).await?;
    if (nx && s.exists()) || (xx && !s.exists()) {
        return Ok(Reply::NullBulk);
    }
    s.set(txn, value, expire_at).await?;
    Ok(Reply::ok())
}

pub async fn getset(txn: &mut Transaction, args: &[Vec<u8>]) -> Result<Reply, DbError> {
    let mut s = txn.string(&args[0]).await?;
    Ok(match s.get_set(txn, args[1].clone()).await? {
        Some(old) => Reply::Bulk(old),
        None => Reply::NullBulk,
    })
}

pub async fn append(txn: &mut Transaction, args: &[Vec<u8>]) -> Result<Reply, DbError> {
    let mut s = txn.string(&args[0]).await?;
    let len = s.append(txn, &args[1]).await?;
    Ok(Reply::Integer(len as i64))
}

pub async fn strlen(txn: &mut Transaction, args: &[Vec<u8>]) -> Result<Reply, DbError> {
    let s = txn.string(&args[0]).await?;
    Ok(Reply::Integer(s.len() as i64))
}

/// INCR/INCRBY/DECR/DECRBY. `sign` is ±1; `with_delta` marks the two-arg
/// forms that parse an explicit step.
pub async fn incr_by(
    txn: &mut Transaction,
    args: &[Vec<u8>],
    sign: i64,
    with_delta: bool,
) -> Result<Reply, DbError> {
    let delta = if with_delta {
        parse_i64(&args[1])?
    } else {
        1
    };
    let delta = delta.checked_mul(sign).ok_or(DbError::BadInteger)?;
    let mut s = txn.string(&args[0]).await?;
    let next = s.incr(txn, delta).await?;
    Ok(Reply::Integer(next))
}

pub async fn incr_by_float(txn: &mut Transaction, args: &[Vec<u8>]) -> Result<Reply, DbError> {
    let delta = parse_f64(&args[1])?;
    let mut s = txn.string(&args[0]).await?;
    let next = s.incr_float(txn, delta).await?;
    Ok(Reply::Bulk(format!("{next}").into_bytes()))
}

pub async fn get_range(txn: &mut Transaction, args: &[Vec<u8>]) -> Result<Reply, DbError> {
    let start = parse_i64(&args[1])?;
    let end = parse_i64(&args[2])?;
    let s = txn.string(&args[0]).await?;
    Ok(Reply::Bulk(s.get_range(start, end).to_vec()))
}

pub async fn set_range(txn: &mut Transaction, args: &[Vec<u8>]) -> Result<Reply, DbError> {
    let offset = parse_i64(&args[1])?;
    if offset < 0 {
        return Ok(Reply::error("ERR offset is out of range"));
    }
    let mut s = txn.string(&args[0]).await?;
    match s.set_range(txn, offset as usize, &args[2]).await {
        Ok(len) => Ok(Reply::Integer(len as i64)),
        Err(DbError::BadInteger) => Ok(Reply::error(
            "ERR string exceeds maximum allowed size (512MB)",
        )),
        Err(err) => Err(err),
    }
}

pub async fn mget(txn: &mut Transaction, args: &[Vec<u8>]) -> Result<Reply, DbError> {
    let mut values = Vec::with_capacity(args.len());
    for key in args {
        // wrong-type keys read as nil here, per MGET semantics
        let value = match txn.string(key).await {
            Ok(s) => s.get().map(|v| v.to_vec()),
            Err(DbError::TypeMismatch) => None,
            Err(err) => return Err(err),
        };
        values.push(value);
    }
    Ok(Reply::BulkArray(values))
}

pub async fn mset(txn: &mut Transaction, args: &[Vec<u8>]) -> Result<Reply, DbError> {
    if args.len() % 2 != 0 {
        return Ok(wrong_args("MSET"));
    }
    for pair in args.chunks(2) {
        let mut s = txn.string(&pair[0]).await?;
        s.set(txn, pair[1].clone(), None).await?;
    }
    Ok(Reply::ok())
}

pub(crate) fn parse_i64(bytes: &[u8]) -> Result<i64, DbError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(DbError::BadInteger)
}

pub(crate) fn parse_f64(bytes: &[u8]) -> Result<f64, DbError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|f| !f.is_nan())
        .ok_or(DbError::BadFloat)
}
