//! Per-connection serve loop
//!
//! One task per connection: read a command, gate it (auth, arity, rate
//! limit), execute, reply. The MULTI/EXEC/WATCH state machine and the SKIP-N
//! reply suppression both live here, as does the half-closed-peer handling:
//! a failed write marks the connection and the read loop drains out instead
//! of executing further pipelined commands.

use super::AppState;
use crate::command::{self, CommandDesc, Scope};
use crate::db::{DbHandle, DbId, Transaction};
use crate::error::DbError;
use crate::metrics;
use crate::protocol::{read_command, Reply, ReplyWriter};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

/// Connections issuing this many unknown commands are dropped.
const MAX_UNKNOWN_COMMANDS: u32 = 3;

const DEFAULT_NAMESPACE: &str = "default";

/// Outcome of one handled command.
enum Handled {
    /// Reply (or nothing), subject to SKIP-N suppression.
    Reply(Option<Reply>),
    /// Reply that bypasses SKIP-N (CLIENT REPLY ON).
    ForcedReply(Reply),
    /// Reply, then close the connection.
    Close(Option<Reply>),
}

/// Per-connection state.
struct ClientState {
    id: u64,
    namespace: String,
    db_id: DbId,
    authenticated: bool,
    /// `Some` while MULTI is open; holds the buffered commands.
    multi_queue: Option<Vec<(&'static CommandDesc, Vec<Vec<u8>>)>>,
    /// Pending snapshot created by WATCH, reused by EXEC.
    watch_txn: Option<Transaction>,
    /// Replies are discarded while non-zero; -1 means indefinitely.
    skip_n: i64,
    unknown_times: u32,
    remote_closed: bool,
}

impl ClientState {
    fn db(&self, server: &AppState) -> DbHandle {
        DbHandle::new(server.store.clone(), self.namespace.clone(), self.db_id)
    }
}

/// Serve one connection until EOF, QUIT, error, or shutdown.
pub async fn serve<S>(server: Arc<AppState>, stream: S, client_id: u64)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut client = ClientState {
        id: client_id,
        namespace: DEFAULT_NAMESPACE.to_string(),
        db_id: DbId(0),
        authenticated: false,
        multi_queue: None,
        watch_txn: None,
        skip_n: 0,
        unknown_times: 0,
        remote_closed: false,
    };
    let mut reply_buf = ReplyWriter::new(server.config.write_buffer_size);
    // all connection accounting lives here, next to the lifetime it tracks
    let m = metrics::global();
    m.total_connections.inc();
    m.active_connections.inc();

    loop {
        if client.remote_closed {
            info!(clientid = client.id, "closing half-closed connection");
            break;
        }

        let cmd = tokio::select! {
            _ = server.cancel_token.cancelled() => break,
            cmd = read_command(&mut reader) => cmd,
        };
        let cmd = match cmd {
            Ok(Some(cmd)) => cmd,
            Ok(None) => break,
            Err(err) => {
                metrics::global().protocol_errors.inc();
                debug!(clientid = client.id, error = %err, "protocol error");
                reply_buf.write(&Reply::error("ERR Protocol error"));
                let _ = writer.write_all(&reply_buf.take()).await;
                break;
            }
        };
        if cmd.is_empty() {
            continue;
        }

        let name = String::from_utf8_lossy(&cmd[0]).to_uppercase();
        let args = &cmd[1..];
        let cmd_size: usize = name.len() + args.iter().map(|a| a.len() + 1).sum::<usize>();
        metrics::global().bytes_read.inc_by(cmd_size as u64);

        let Some(desc) = command::lookup(&name) else {
            metrics::global().unknown_commands.inc();
            client.unknown_times += 1;
            reply_buf.write(&command::unknown_command(&name));
            if write_reply(&mut writer, &mut reply_buf, &mut client).await.is_err()
                || client.unknown_times >= MAX_UNKNOWN_COMMANDS
            {
                break;
            }
            continue;
        };

        // SKIP-N is decided before the command runs, one tick per command;
        // -1 suppresses until CLIENT REPLY ON resets it
        let suppress = client.skip_n != 0;
        if client.skip_n > 0 {
            client.skip_n -= 1;
        }

        if args.len() < desc.min_args || args.len() > desc.max_args {
            send(
                &mut writer,
                &mut reply_buf,
                &mut client,
                suppress,
                Some(command::wrong_args(&name)),
            )
            .await;
            continue;
        }

        // pre-auth, only AUTH and QUIT go through
        if !server.config.auth.is_empty()
            && !client.authenticated
            && name != "AUTH"
            && name != "QUIT"
        {
            send(
                &mut writer,
                &mut reply_buf,
                &mut client,
                suppress,
                Some(Reply::error("NOAUTH Authentication required.")),
            )
            .await;
            continue;
        }

        if let Some(limiters) = &server.limiters {
            limiters.check_limit(&client.namespace, &name, args).await;
        }

        metrics::global()
            .commands_total
            .with_label_values(&[name.as_str()])
            .inc();
        let start = Instant::now();
        let handled = handle_command(&server, &mut client, desc, args).await;
        metrics::global()
            .command_latency
            .observe(start.elapsed().as_secs_f64());

        match handled {
            Handled::Reply(reply) => {
                send(&mut writer, &mut reply_buf, &mut client, suppress, reply).await;
            }
            Handled::ForcedReply(reply) => {
                reply_buf.write(&reply);
                if write_reply(&mut writer, &mut reply_buf, &mut client).await.is_err() {
                    break;
                }
            }
            Handled::Close(reply) => {
                send(&mut writer, &mut reply_buf, &mut client, suppress, reply).await;
                break;
            }
        }
    }

    if let Some(mut txn) = client.watch_txn.take() {
        let _ = txn.rollback().await;
    }
    metrics::global().active_connections.dec();
}

/// Write a reply unless this command's reply is suppressed.
async fn send<W>(
    writer: &mut W,
    reply_buf: &mut ReplyWriter,
    client: &mut ClientState,
    suppress: bool,
    reply: Option<Reply>,
) where
    W: AsyncWrite + Unpin,
{
    let Some(reply) = reply else {
        return;
    };
    if suppress {
        return;
    }
    reply_buf.write(&reply);
    let _ = write_reply(writer, reply_buf, client).await;
}

async fn write_reply<W>(
    writer: &mut W,
    reply_buf: &mut ReplyWriter,
    client: &mut ClientState,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = reply_buf.take();
    metrics::global().bytes_written.inc_by(buf.len() as u64);
    match writer.write_all(&buf).await {
        Ok(()) => Ok(()),
        Err(err) => {
            // a failed write means the peer is gone; stop consuming the
            // pipeline on the read side too
            info!(clientid = client.id, error = %err, "write failed, peer closed");
            client.remote_closed = true;
            Err(err)
        }
    }
}

async fn handle_command(
    server: &AppState,
    client: &mut ClientState,
    desc: &'static CommandDesc,
    args: &[Vec<u8>],
) -> Handled {
    // inside MULTI everything except the transaction controls is buffered
    if !matches!(desc.name, "MULTI" | "EXEC" | "DISCARD" | "WATCH" | "UNWATCH") {
        if let Some(queue) = client.multi_queue.as_mut() {
            if desc.queueable {
                queue.push((desc, args.to_vec()));
                return Handled::Reply(Some(Reply::queued()));
            }
            return Handled::Reply(Some(Reply::error(format!(
                "ERR {} is not allowed in transactions",
                desc.name
            ))));
        }
    }

    match desc.scope {
        Scope::Data => {
            let db = client.db(server);
            Handled::Reply(Some(command::execute_single(&db, desc, args).await))
        }
        Scope::Connection => handle_connection_command(server, client, desc, args).await,
    }
}

async fn handle_connection_command(
    server: &AppState,
    client: &mut ClientState,
    desc: &'static CommandDesc,
    args: &[Vec<u8>],
) -> Handled {
    match desc.name {
        "AUTH" => Handled::Reply(Some(auth(server, client, &args[0]))),
        "SELECT" => {
            let reply = match std::str::from_utf8(&args[0])
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
            {
                Some(index) if index < 16 => {
                    client.db_id = DbId(index);
                    Reply::ok()
                }
                Some(_) => Reply::error("ERR DB index is out of range"),
                None => Reply::error("ERR invalid DB index"),
            };
            Handled::Reply(Some(reply))
        }
        "QUIT" => Handled::Close(Some(Reply::ok())),
        "MULTI" => {
            if client.multi_queue.is_some() {
                return Handled::Reply(Some(Reply::error("ERR MULTI calls can not be nested")));
            }
            client.multi_queue = Some(Vec::new());
            Handled::Reply(Some(Reply::ok()))
        }
        "EXEC" => {
            let Some(queue) = client.multi_queue.take() else {
                return Handled::Reply(Some(Reply::error("ERR EXEC without MULTI")));
            };
            Handled::Reply(Some(exec(server, client, queue).await))
        }
        "DISCARD" => {
            if client.multi_queue.take().is_none() {
                return Handled::Reply(Some(Reply::error("ERR DISCARD without MULTI")));
            }
            unwatch(client).await;
            Handled::Reply(Some(Reply::ok()))
        }
        "WATCH" => {
            if client.multi_queue.is_some() {
                return Handled::Reply(Some(Reply::error(
                    "ERR WATCH inside MULTI is not allowed",
                )));
            }
            Handled::Reply(Some(watch(server, client, args).await))
        }
        "UNWATCH" => {
            unwatch(client).await;
            Handled::Reply(Some(Reply::ok()))
        }
        "CLIENT" => client_command(client, args),
        _ => Handled::Reply(Some(command::unknown_command(desc.name))),
    }
}

fn auth(server: &AppState, client: &mut ClientState, token: &[u8]) -> Reply {
    if server.config.auth.is_empty() {
        return Reply::error("ERR Client sent AUTH, but no password is set");
    }
    // `namespace:secret` binds the connection to a tenant; a bare secret
    // lands in the default namespace
    let token = String::from_utf8_lossy(token);
    let (namespace, secret) = match token.split_once(':') {
        Some((namespace, secret)) => (namespace.to_string(), secret),
        None => (DEFAULT_NAMESPACE.to_string(), token.as_ref()),
    };
    if secret != server.config.auth || namespace.is_empty() {
        return Reply::error("ERR invalid password");
    }
    client.namespace = namespace;
    client.authenticated = true;
    Reply::ok()
}

/// Capture the watched keys' versions in a pending snapshot; EXEC commits
/// through it, so any intervening write fails the commit.
async fn watch(server: &AppState, client: &mut ClientState, keys: &[Vec<u8>]) -> Reply {
    if client.watch_txn.is_none() {
        match client.db(server).begin().await {
            Ok(txn) => client.watch_txn = Some(txn),
            Err(err) => return Reply::error(err.client_message()),
        }
    }
    let Some(txn) = client.watch_txn.as_mut() else {
        return Reply::error("ERR internal error");
    };
    for key in keys {
        let mkey = txn.meta_key(key);
        if let Err(err) = txn.kv.get(&mkey).await {
            return Reply::error(DbError::from(err).client_message());
        }
    }
    Reply::ok()
}

async fn unwatch(client: &mut ClientState) {
    if let Some(mut txn) = client.watch_txn.take() {
        let _ = txn.rollback().await;
    }
}

/// Replay the queued commands in one transaction. A commit conflict (a
/// watched key changed, or any optimistic clash) yields the nil array.
async fn exec(
    server: &AppState,
    client: &mut ClientState,
    queue: Vec<(&'static CommandDesc, Vec<Vec<u8>>)>,
) -> Reply {
    let mut txn = match client.watch_txn.take() {
        Some(txn) => txn,
        None => match client.db(server).begin().await {
            Ok(txn) => txn,
            Err(err) => return Reply::error(err.client_message()),
        },
    };

    let mut replies = Vec::with_capacity(queue.len());
    for (desc, args) in &queue {
        let reply = match command::dispatch(desc.name, args, &mut txn).await {
            Ok(reply) => reply,
            Err(err) => Reply::error(err.client_message()),
        };
        replies.push(reply);
    }

    match txn.commit().await {
        Ok(()) => Reply::Array(replies),
        Err(DbError::Retryable) => {
            metrics::global().commit_conflicts.inc();
            Reply::NullArray
        }
        Err(err) => {
            let _ = txn.rollback().await;
            metrics::global().kv_errors.inc();
            Reply::error(err.client_message())
        }
    }
}

/// `CLIENT REPLY ON|OFF|SKIP` — the administrative switch behind SKIP-N.
fn client_command(client: &mut ClientState, args: &[Vec<u8>]) -> Handled {
    let sub = String::from_utf8_lossy(&args[0]).to_uppercase();
    match sub.as_str() {
        "REPLY" => {
            let Some(mode) = args.get(1) else {
                return Handled::Reply(Some(command::wrong_args("CLIENT")));
            };
            let mode = String::from_utf8_lossy(mode).to_uppercase();
            match mode.as_str() {
                "ON" => {
                    client.skip_n = 0;
                    // always acknowledged, even when replies were off
                    Handled::ForcedReply(Reply::ok())
                }
                "OFF" => {
                    client.skip_n = -1;
                    Handled::Reply(None)
                }
                "SKIP" => {
                    if client.skip_n == 0 {
                        client.skip_n = 1;
                    }
                    Handled::Reply(None)
                }
                _ => Handled::Reply(Some(Reply::error("ERR syntax error"))),
            }
        }
        _ => Handled::Reply(Some(Reply::error(format!(
            "ERR Unknown CLIENT subcommand or wrong number of arguments for '{sub}'"
        )))),
    }
}
