//! Expiration engine
//!
//! Every key with an expiry owns exactly one entry in a time-ordered expire
//! index, sharded into 256 buckets by `crc32(meta key) % 256` so reaper
//! writes never concentrate on one range. A fleet of background workers (one
//! per bucket, plus one for the legacy unsharded prefix) scans its bucket
//! every tick and removes whatever has fallen due.
//!
//! All workers gate on a single process-wide leader status. A separate
//! refresher loop keeps a lease record in the KV store; whichever process
//! holds the unexpired lease runs the workers, everyone else blocks until the
//! status flips.
//!
//! Each tick resumes the bucket scan from the timestamp where the previous
//! tick stopped. Restarting from the bucket head every tick would walk the
//! tombstones of just-deleted entries, which on an LSM-backed store turns
//! into multi-second seeks.

use crate::config::ExpireConfig;
use crate::db::codec::{
    self, decode_i64, encode_i64, expire_shard_prefix, split_meta_key, EXPIRE_KEY_PREFIX,
    EXPIRE_SHARD_COUNT, SYS_EXPIRE_LEADER,
};
use crate::db::object::{now_ns, Object, ObjectType};
use crate::db::Transaction;
use crate::error::DbError;
use crate::metrics;
use crate::store::{prefix_next, KvTransaction, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

const EXPIRE_WORKER: &str = "expire";
const EXPIRE_UNHASH_WORKER: &str = "expire-unhash";

/// Process-wide leader flag. The refresher loop sets it; workers wait on it.
pub struct LeaderStatus {
    tx: watch::Sender<bool>,
}

impl LeaderStatus {
    pub fn new() -> LeaderStatus {
        let (tx, _) = watch::channel(false);
        LeaderStatus { tx }
    }

    pub fn set(&self, is_leader: bool) {
        metrics::global().is_leader.set(is_leader as i64);
        self.tx.send_replace(is_leader);
    }

    pub fn is_leader(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for LeaderStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Record or clear a key's expire-index entry when its expiry changes.
/// Old entry out, new entry in, all in the caller's transaction.
pub async fn expire_at_update(
    txn: &mut Transaction,
    mkey: &[u8],
    obj_id: &[u8; 16],
    old_at: i64,
    new_at: i64,
) -> Result<(), DbError> {
    if old_at > 0 {
        txn.kv.delete(codec::expire_key(mkey, old_at)).await?;
    }
    if new_at > 0 {
        txn.kv
            .set(codec::expire_key(mkey, new_at), obj_id.to_vec())
            .await?;
    }
    let action = match (old_at > 0, new_at > 0) {
        (true, true) => "updated",
        (true, false) => "removed",
        (false, true) => "added",
        (false, false) => return Ok(()),
    };
    metrics::global()
        .expire_keys_total
        .with_label_values(&[action])
        .inc();
    Ok(())
}

/// Drop a key's expire-index entry, if it has one.
pub async fn unexpire_at(txn: &mut Transaction, mkey: &[u8], expire_at: i64) -> Result<(), DbError> {
    if expire_at == 0 {
        return Ok(());
    }
    txn.kv.delete(codec::expire_key(mkey, expire_at)).await?;
    metrics::global()
        .expire_keys_total
        .with_label_values(&["removed"])
        .inc();
    Ok(())
}

/// Delete every key under `prefix`, returning the count.
pub async fn gc_prefix(kv: &mut dyn KvTransaction, prefix: &[u8]) -> Result<u64, DbError> {
    let end = prefix_next(prefix);
    let mut iter = kv.scan(prefix.to_vec(), end).await?;
    let mut deleted = 0u64;
    while iter.valid() {
        if !iter.key().starts_with(prefix) {
            break;
        }
        let key = iter.key().to_vec();
        iter.next().await?;
        kv.delete(key).await?;
        deleted += 1;
    }
    Ok(deleted)
}

/// Remove an object's element-level data: the data prefix and, for sorted
/// sets, the score index under the same id.
async fn gc_object_data(
    kv: &mut dyn KvTransaction,
    namespace: &str,
    db_id: codec::DbId,
    id: &[u8],
) -> Result<(), DbError> {
    gc_prefix(kv, &codec::data_key(namespace, db_id, id)).await?;
    gc_prefix(kv, &codec::score_prefix(namespace, db_id, id)).await?;
    Ok(())
}

/// The expiration engine: leader refresher plus per-bucket reaper workers.
pub struct ExpireEngine {
    store: Arc<dyn Store>,
    conf: ExpireConfig,
    leader: Arc<LeaderStatus>,
    shutdown: CancellationToken,
}

impl ExpireEngine {
    /// Spawn all background tasks. Returns the leader status so other
    /// subsystems (and the status endpoint) can observe leadership.
    pub fn start(
        store: Arc<dyn Store>,
        conf: ExpireConfig,
        shutdown: CancellationToken,
    ) -> Arc<LeaderStatus> {
        let leader = Arc::new(LeaderStatus::new());
        let engine = ExpireEngine {
            store,
            conf,
            leader: Arc::clone(&leader),
            shutdown,
        };
        engine.spawn();
        leader
    }

    fn spawn(self) {
        let engine = Arc::new(self);

        let refresher = Arc::clone(&engine);
        tokio::spawn(async move { refresher.leader_loop().await });

        for shard in 0..EXPIRE_SHARD_COUNT {
            let worker = Arc::clone(&engine);
            tokio::spawn(async move { worker.worker_loop(Some(shard)).await });
        }
        let legacy = Arc::clone(&engine);
        tokio::spawn(async move { legacy.worker_loop(None).await });
    }

    /// Acquire or renew the leader lease every tick.
    async fn leader_loop(&self) {
        let owner = *Uuid::new_v4().as_bytes();
        let interval = Duration::from_secs(self.conf.interval.max(1));
        let life = Duration::from_secs(self.conf.leader_life_time.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if self.conf.disable {
                self.leader.set(false);
                continue;
            }
            match check_leader(&self.store, &owner, life).await {
                Ok(is_leader) => self.leader.set(is_leader),
                Err(err) => {
                    error!(error = %err, "check expire leader failed");
                    self.leader.set(false);
                }
            }
        }
    }

    /// One reaper worker: tick, and when leading, process the bucket.
    async fn worker_loop(&self, shard: Option<u32>) {
        let interval = Duration::from_secs(self.conf.interval.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut leader_rx = self.leader.subscribe();
        let mut last_end_ts = 0i64;
        let batch_limit = if shard.is_some() {
            self.conf.batch_limit
        } else {
            self.conf.unhash_batch_limit
        };
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if !*leader_rx.borrow() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    changed = leader_rx.wait_for(|leading| *leading) => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
                // leadership may be fresh; resume from the bucket head
                last_end_ts = 0;
                continue;
            }

            let start = std::time::Instant::now();
            last_end_ts = run_expire(&self.store, batch_limit, shard, last_end_ts).await;
            let label = if shard.is_some() {
                EXPIRE_WORKER
            } else {
                EXPIRE_UNHASH_WORKER
            };
            metrics::global()
                .worker_round_seconds
                .with_label_values(&[label])
                .observe(start.elapsed().as_secs_f64());
        }
    }
}

/// Try to acquire or renew the lease. The lease value is the 16-byte owner
/// uuid followed by the big-endian expiry timestamp.
pub async fn check_leader(
    store: &Arc<dyn Store>,
    owner: &[u8; 16],
    life: Duration,
) -> Result<bool, DbError> {
    let mut kv = store.begin().await?;
    let now = now_ns();

    if let Some(lease) = kv.get(SYS_EXPIRE_LEADER).await? {
        if lease.len() >= 24 {
            let holder = &lease[..16];
            let expires_at = i64::from_be_bytes(lease[16..24].try_into().unwrap());
            if holder != owner && expires_at > now {
                kv.rollback().await?;
                return Ok(false);
            }
        }
    }

    let mut lease = Vec::with_capacity(24);
    lease.extend_from_slice(owner);
    lease.extend_from_slice(&(now + life.as_nanos() as i64).to_be_bytes());
    kv.set(SYS_EXPIRE_LEADER.to_vec(), lease).await?;
    match kv.commit().await {
        Ok(()) => Ok(true),
        // someone else won the race for this lease round
        Err(crate::store::StoreError::Conflict) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// One reaper tick over one bucket (`None` = legacy unsharded prefix).
///
/// Returns the timestamp to resume from next tick: the last processed entry's
/// timestamp, `now` when the bucket had nothing due, or 0 after any error so
/// the next tick restarts from the bucket head.
pub async fn run_expire(
    store: &Arc<dyn Store>,
    batch_limit: usize,
    shard: Option<u32>,
    last_end_ts: i64,
) -> i64 {
    let (prefix, label) = match shard {
        Some(shard) => (expire_shard_prefix(shard), EXPIRE_WORKER),
        None => (EXPIRE_KEY_PREFIX.to_vec(), EXPIRE_UNHASH_WORKER),
    };
    let ts_offset = prefix.len();
    let mkey_offset = ts_offset + 8 + 1;

    let mut kv = match store.begin().await {
        Ok(kv) => kv,
        Err(err) => {
            error!(error = %err, worker = label, "expire txn begin failed");
            return 0;
        }
    };

    let now = now_ns();
    // The scan window is [prefix + last_end_ts, prefix + now + 1): resuming
    // past already-processed timestamps keeps the seek off the tombstones of
    // entries deleted by earlier ticks. The encoded-timestamp floor is always
    // appended: encoded timestamps start at 0x80, so the legacy window can
    // never wander into the sharded buckets, whose ASCII shard digits sort
    // below it under the same `$sys:0:at:` prefix.
    let mut end_key = prefix.clone();
    end_key.extend_from_slice(&encode_i64(now + 1));
    let mut start_key = prefix.clone();
    start_key.extend_from_slice(&encode_i64(last_end_ts.max(0)));
    start_key.push(b':');

    let seek_start = std::time::Instant::now();
    let mut iter = match kv.scan(start_key, Some(end_key)).await {
        Ok(iter) => iter,
        Err(err) => {
            error!(error = %err, worker = label, "expire seek failed");
            let _ = kv.rollback().await;
            return 0;
        }
    };
    metrics::global()
        .worker_seek_seconds
        .with_label_values(&[label])
        .observe(seek_start.elapsed().as_secs_f64());

    let mut limit = batch_limit;
    let mut this_end_ts = 0i64;
    let mut ts = now;
    while limit > 0 && iter.valid() && iter.key().starts_with(&prefix) {
        let raw_key = iter.key().to_vec();
        if raw_key.len() < mkey_offset {
            error!(worker = label, "expire index key too short, skipping tick");
            let _ = kv.rollback().await;
            return 0;
        }
        ts = decode_i64(&raw_key[ts_offset..ts_offset + 8]);
        if ts > now {
            break;
        }
        let mkey = raw_key[mkey_offset..].to_vec();
        let index_id = iter.value().to_vec();
        if let Err(err) = do_expire(kv.as_mut(), &mkey, &index_id, ts).await {
            error!(error = %err, worker = label, "expire failed");
            let _ = kv.rollback().await;
            return 0;
        }

        // remove from the expire list
        if let Err(err) = kv.delete(raw_key).await {
            error!(error = %err, worker = label, "expire index delete failed");
            let _ = kv.rollback().await;
            return 0;
        }
        debug!(ts, mkey = %String::from_utf8_lossy(&mkey), worker = label, "expired key");

        if let Err(err) = iter.next().await {
            error!(error = %err, worker = label, "expire next failed");
            let _ = kv.rollback().await;
            return 0;
        }
        this_end_ts = ts;
        limit -= 1;
    }
    if limit == batch_limit {
        // no entries, or everything in the window is still in the future
        this_end_ts = now;
    }

    let shard_label = shard.map_or_else(|| "unhash".to_string(), |s| format!("{s:04}"));
    let lag = ((now_ns() - ts).max(0) / 1_000_000_000) as f64;
    metrics::global()
        .expire_delay_seconds
        .with_label_values(&[shard_label.as_str()])
        .set(lag);

    let commit_start = std::time::Instant::now();
    let commit_result = kv.commit().await;
    metrics::global()
        .worker_commit_seconds
        .with_label_values(&[label])
        .observe(commit_start.elapsed().as_secs_f64());
    if let Err(err) = commit_result {
        // conflicts are not retried inline; the next tick rescans the bucket
        let _ = kv.rollback().await;
        error!(error = %err, worker = label, "expire commit failed");
        return 0;
    }

    metrics::global()
        .expire_keys_total
        .with_label_values(&[if shard.is_some() {
            "expired"
        } else {
            "expired-unhash"
        }])
        .inc_by((batch_limit - limit) as u64);
    this_end_ts
}

/// Decide what one due expire-index entry means and act on it.
///
/// The entry may be stale in several ways; the (meta exists? id matches?
/// ts matches?) triage resolves the race where the key was deleted, or
/// deleted and re-created, between the index write and this tick:
/// - no meta: dirty data, GC the indexed id's element data
/// - id mismatch: the key was re-created; GC only the old id's data
/// - ts mismatch: a rewritten expiry whose old index entry lags; skip
/// - otherwise: drop the meta and, for non-strings, GC the element data
async fn do_expire(
    kv: &mut dyn KvTransaction,
    mkey: &[u8],
    index_id: &[u8],
    ts: i64,
) -> Result<(), DbError> {
    let (namespace, db_id, _key) = split_meta_key(mkey)?;
    let namespace = std::str::from_utf8(namespace).map_err(|_| DbError::InvalidLength)?;

    let obj = match kv.get(mkey).await? {
        None => {
            return gc_object_data(kv, namespace, db_id, index_id).await;
        }
        Some(encoded) => Object::decode(&encoded)?,
    };

    let index_id = if index_id.len() > obj.id.len() {
        &index_id[..obj.id.len()]
    } else {
        index_id
    };
    if obj.id.as_slice() != index_id {
        return gc_object_data(kv, namespace, db_id, index_id).await;
    }

    if obj.expire_at != ts {
        debug!(
            mkey = %String::from_utf8_lossy(mkey),
            entry_ts = ts,
            expire_at = obj.expire_at,
            "expire entry does not match the key's expiry, skipping"
        );
        return Ok(());
    }

    kv.delete(mkey.to_vec()).await?;
    if obj.object_type == ObjectType::String {
        return Ok(());
    }
    gc_object_data(kv, namespace, db_id, &obj.id).await
}
