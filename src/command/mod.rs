//! Command dispatch
//!
//! A static table maps uppercased command names to descriptors carrying
//! arity bounds and capability flags. Data-scope commands run against a
//! transaction; connection-scope commands (AUTH, SELECT, MULTI and friends)
//! are interposed by the connection before dispatch ever sees them.

pub mod hashes;
pub mod keys;
pub mod strings;
pub mod zsets;

use crate::db::{DbHandle, Transaction};
use crate::error::DbError;
use crate::metrics;
use crate::protocol::Reply;
use tracing::debug;

/// Inline retry bound for optimistic-commit conflicts on single commands.
/// MULTI/EXEC never retries; a conflict there is the nil-array reply.
const MAX_COMMIT_ATTEMPTS: usize = 3;

/// Where a command executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Runs inside a KV transaction via [`dispatch`].
    Data,
    /// Handled by the connection state machine.
    Connection,
}

/// One entry of the command table.
pub struct CommandDesc {
    pub name: &'static str,
    /// Minimum argument count, command name excluded.
    pub min_args: usize,
    /// Maximum argument count, `usize::MAX` = unbounded.
    pub max_args: usize,
    pub write: bool,
    pub scope: Scope,
    /// May be buffered inside MULTI.
    pub queueable: bool,
}

const fn data(name: &'static str, min_args: usize, max_args: usize, write: bool) -> CommandDesc {
    CommandDesc {
        name,
        min_args,
        max_args,
        write,
        scope: Scope::Data,
        queueable: true,
    }
}

const fn conn(name: &'static str, min_args: usize, max_args: usize) -> CommandDesc {
    CommandDesc {
        name,
        min_args,
        max_args,
        write: false,
        scope: Scope::Connection,
        queueable: false,
    }
}

pub static COMMANDS: &[CommandDesc] = &[
    // strings
    data("GET", 1, 1, false),
    data("SET", 2, 7, true),
    data("GETSET", 2, 2, true),
    data("APPEND", 2, 2, true),
    data("STRLEN", 1, 1, false),
    data("INCR", 1, 1, true),
    data("INCRBY", 2, 2, true),
    data("DECR", 1, 1, true),
    data("DECRBY", 2, 2, true),
    data("INCRBYFLOAT", 2, 2, true),
    data("GETRANGE", 3, 3, false),
    data("SETRANGE", 3, 3, true),
    data("MGET", 1, usize::MAX, false),
    data("MSET", 2, usize::MAX, true),
    // keys
    data("DEL", 1, usize::MAX, true),
    data("EXISTS", 1, usize::MAX, false),
    data("TYPE", 1, 1, false),
    data("EXPIRE", 2, 2, true),
    data("PEXPIRE", 2, 2, true),
    data("EXPIREAT", 2, 2, true),
    data("PEXPIREAT", 2, 2, true),
    data("TTL", 1, 1, false),
    data("PTTL", 1, 1, false),
    data("PERSIST", 1, 1, true),
    // sorted sets
    data("ZADD", 3, usize::MAX, true),
    data("ZRANGE", 3, 4, false),
    data("ZREVRANGE", 3, 4, false),
    data("ZREM", 2, usize::MAX, true),
    data("ZCARD", 1, 1, false),
    data("ZSCORE", 2, 2, false),
    // hashes
    data("HSET", 3, usize::MAX, true),
    data("HGET", 2, 2, false),
    data("HMGET", 2, usize::MAX, false),
    data("HDEL", 2, usize::MAX, true),
    data("HLEN", 1, 1, false),
    data("HEXISTS", 2, 2, false),
    data("HGETALL", 1, 1, false),
    // no transaction state, but replayable inside EXEC
    data("PING", 0, 1, false),
    data("ECHO", 1, 1, false),
    // connection scope
    conn("AUTH", 1, 1),
    conn("SELECT", 1, 1),
    conn("QUIT", 0, 0),
    conn("MULTI", 0, 0),
    conn("EXEC", 0, 0),
    conn("DISCARD", 0, 0),
    conn("WATCH", 1, usize::MAX),
    conn("UNWATCH", 0, 0),
    conn("CLIENT", 1, usize::MAX),
];

/// Look up a command by its already-uppercased name.
pub fn lookup(name: &str) -> Option<&'static CommandDesc> {
    COMMANDS.iter().find(|desc| desc.name == name)
}

/// `ERR wrong number of arguments for '<cmd>' command`
pub fn wrong_args(name: &str) -> Reply {
    Reply::error(format!(
        "ERR wrong number of arguments for '{}' command",
        name.to_lowercase()
    ))
}

/// `ERR unknown command '<cmd>'`
pub fn unknown_command(name: &str) -> Reply {
    Reply::error(format!("ERR unknown command '{name}'"))
}

/// Run one data-scope command against a live transaction.
pub async fn dispatch(
    name: &str,
    args: &[Vec<u8>],
    txn: &mut Transaction,
) -> Result<Reply, DbError> {
    match name {
        "GET" => strings::get(txn, args).await,
        "SET" => strings::set(txn, args).await,
        "GETSET" => strings::getset(txn, args).await,
        "APPEND" => strings::append(txn, args).await,
        "STRLEN" => strings::strlen(txn, args).await,
        "INCR" => strings::incr_by(txn, args, 1, false).await,
        "INCRBY" => strings::incr_by(txn, args, 1, true).await,
        "DECR" => strings::incr_by(txn, args, -1, false).await,
        "DECRBY" => strings::incr_by(txn, args, -1, true).await,
        "INCRBYFLOAT" => strings::incr_by_float(txn, args).await,
        "GETRANGE" => strings::get_range(txn, args).await,
        "SETRANGE" => strings::set_range(txn, args).await,
        "MGET" => strings::mget(txn, args).await,
        "MSET" => strings::mset(txn, args).await,
        "DEL" => keys::del(txn, args).await,
        "EXISTS" => keys::exists(txn, args).await,
        "TYPE" => keys::type_of(txn, args).await,
        "EXPIRE" => keys::expire(txn, args, 1_000_000_000, false).await,
        "PEXPIRE" => keys::expire(txn, args, 1_000_000, false).await,
        "EXPIREAT" => keys::expire(txn, args, 1_000_000_000, true).await,
        "PEXPIREAT" => keys::expire(txn, args, 1_000_000, true).await,
        "TTL" => keys::ttl(txn, args, 1_000_000_000).await,
        "PTTL" => keys::ttl(txn, args, 1_000_000).await,
        "PERSIST" => keys::persist(txn, args).await,
        "ZADD" => zsets::zadd(txn, args).await,
        "ZRANGE" => zsets::zrange(txn, args, true).await,
        "ZREVRANGE" => zsets::zrange(txn, args, false).await,
        "ZREM" => zsets::zrem(txn, args).await,
        "ZCARD" => zsets::zcard(txn, args).await,
        "ZSCORE" => zsets::zscore(txn, args).await,
        "HSET" => hashes::hset(txn, args).await,
        "HGET" => hashes::hget(txn, args).await,
        "HMGET" => hashes::hmget(txn, args).await,
        "HDEL" => hashes::hdel(txn, args).await,
        "HLEN" => hashes::hlen(txn, args).await,
        "HEXISTS" => hashes::hexists(txn, args).await,
        "HGETALL" => hashes::hgetall(txn, args).await,
        "PING" => Ok(match args.first() {
            Some(msg) => Reply::Bulk(msg.clone()),
            None => Reply::Simple("PONG".to_string()),
        }),
        "ECHO" => Ok(Reply::Bulk(args[0].clone())),
        _ => Ok(unknown_command(name)),
    }
}

/// Execute one command in its own transaction, retrying commit conflicts on
/// a small inline bound. The reply is produced only after a successful
/// commit.
pub async fn execute_single(db: &DbHandle, desc: &CommandDesc, args: &[Vec<u8>]) -> Reply {
    for attempt in 1..=MAX_COMMIT_ATTEMPTS {
        let mut txn = match db.begin().await {
            Ok(txn) => txn,
            Err(err) => return Reply::error(err.client_message()),
        };

        let reply = match dispatch(desc.name, args, &mut txn).await {
            Ok(reply) => reply,
            Err(err) => {
                let _ = txn.rollback().await;
                if matches!(err, DbError::Kv(_)) {
                    metrics::global().kv_errors.inc();
                }
                return Reply::error(err.client_message());
            }
        };

        match txn.commit().await {
            Ok(()) => return reply,
            Err(DbError::Retryable) => {
                metrics::global().commit_conflicts.inc();
                debug!(command = desc.name, attempt, "commit conflict, retrying");
                if attempt == MAX_COMMIT_ATTEMPTS {
                    return Reply::error(DbError::Retryable.client_message());
                }
            }
            Err(err) => {
                let _ = txn.rollback().await;
                metrics::global().kv_errors.inc();
                return Reply::error(err.client_message());
            }
        }
    }
    Reply::error(DbError::Retryable.client_message())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        assert!(lookup("GET").is_some());
        assert!(lookup("ZADD").is_some());
        assert!(lookup("FLUSHDB").is_none());
        assert_eq!(lookup("MULTI").unwrap().scope, Scope::Connection);
        assert!(lookup("SET").unwrap().write);
        assert!(!lookup("ZRANGE").unwrap().write);
    }

    #[test]
    fn test_reply_helpers() {
        assert_eq!(
            wrong_args("ZADD"),
            Reply::Error("ERR wrong number of arguments for 'zadd' command".to_string())
        );
        assert_eq!(
            unknown_command("BOGUS"),
            Reply::Error("ERR unknown command 'BOGUS'".to_string())
        );
    }
}
