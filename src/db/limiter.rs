//! Adaptive per-(namespace, command) rate limiting
//!
//! Limits live in the KV store itself, in a dedicated limiter namespace:
//! `qps:<ns>@<cmd>` and `rate:<ns>@<cmd>` hold `"<number>[K|M] <burst>"`, and
//! `limiter_status:<ns>@<cmd>:<node>` records carry each node's
//! `"<weight>,<qps>,<timestamp>"`. The hot path only touches an in-memory
//! registry; two background loops keep it honest:
//!
//! - the sync loop re-reads limits every `sync-set-period` and reconfigures
//!   buckets when operators change them;
//! - the balance loop reports local usage every `global-balance-period`,
//!   reads the other nodes' status records, and shifts this node's weight so
//!   observed per-node QPS converges on each node's share of the global
//!   limit. Nodes whose records go stale simply drop out of the average.

use crate::config::RateLimitConfig;
use crate::db::object::now_ns;
use crate::db::{codec, DbHandle, DbId, Transaction};
use crate::error::DbError;
use crate::metrics;
use crate::store::{prefix_next, Store};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const LIMIT_DATA_DBID: DbId = DbId(0);
const ALL_NAMESPACE: &str = "*";
const QPS_PREFIX: &str = "qps:";
const RATE_PREFIX: &str = "rate:";
const LIMITER_STATUS_PREFIX: &str = "limiter_status:";
const MAXIMUM_WEIGHT: f64 = 1.0;
const MINIMUM_WEIGHT: f64 = 0.1;

/// A token bucket with reserve semantics: callers always get their tokens,
/// plus the delay they must sleep to stay within the configured rate. The
/// token balance may go negative, which is what produces the delay.
struct RateBucket {
    limit: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl RateBucket {
    fn new(limit: f64, burst: usize) -> RateBucket {
        RateBucket {
            limit,
            burst: burst as f64,
            tokens: burst as f64,
            last: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.limit).min(self.burst);
        self.last = now;
    }

    /// Reserve `n` tokens. `None` when `n` exceeds the burst and can never
    /// be satisfied.
    fn reserve(&mut self, n: usize) -> Option<Duration> {
        if n as f64 > self.burst {
            return None;
        }
        self.refill();
        self.tokens -= n as f64;
        if self.tokens >= 0.0 {
            Some(Duration::ZERO)
        } else {
            Some(Duration::from_secs_f64(-self.tokens / self.limit))
        }
    }

    fn set_limit(&mut self, limit: f64) {
        self.refill();
        self.limit = limit;
    }

    fn burst(&self) -> usize {
        self.burst as usize
    }
}

/// One bucket plus the global limit it locally enforces a share of.
struct LimiterWrapper {
    name: String,
    global_limit: i64,
    local_percent: f64,
    bucket: Option<RateBucket>,
}

impl LimiterWrapper {
    fn new(name: String, initial_percent: f64) -> LimiterWrapper {
        LimiterWrapper {
            name,
            global_limit: 0,
            local_percent: initial_percent,
            bucket: None,
        }
    }

    /// Apply a (possibly changed) global limit. Returns whether anything
    /// changed, so the caller can invalidate this period's balance samples.
    fn update_limit(&mut self, new_limit: i64, new_burst: usize) -> bool {
        let old_burst = self.bucket.as_ref().map_or(0, |b| b.burst());
        let changed = self.global_limit != new_limit || old_burst != new_burst;
        if changed {
            info!(
                limiter = %self.name,
                global_limit = self.global_limit,
                new_global_limit = new_limit,
                burst = old_burst,
                new_burst,
                "limit changed"
            );
        }

        if new_limit > 0 && new_burst > 0 {
            let local_limit = new_limit as f64 * self.local_percent;
            match &mut self.bucket {
                Some(bucket) if bucket.burst() == new_burst => {
                    if self.global_limit != new_limit {
                        bucket.set_limit(local_limit);
                    }
                }
                _ => self.bucket = Some(RateBucket::new(local_limit, new_burst)),
            }
        } else {
            self.bucket = None;
        }
        self.global_limit = new_limit;
        changed
    }

    fn update_percent(&mut self, new_percent: f64) {
        if self.local_percent != new_percent && self.local_percent > 0.0 && new_percent > 0.0 {
            if let Some(bucket) = &mut self.bucket {
                let limit = self.global_limit as f64 * new_percent;
                info!(limiter = %self.name, limit, burst = bucket.burst(), "percent changed");
                bucket.set_limit(limit);
            }
            self.local_percent = new_percent;
        }
    }

    fn wait_time(&mut self, n: usize) -> Duration {
        let Some(bucket) = &mut self.bucket else {
            return Duration::ZERO;
        };
        match bucket.reserve(n) {
            Some(delay) => delay,
            None => {
                error!(
                    limiter = %self.name,
                    burst = bucket.burst(),
                    requested = n,
                    "requested events exceed limiter burst"
                );
                Duration::ZERO
            }
        }
    }

    fn global_limit(&self) -> i64 {
        self.global_limit
    }
}

struct BalanceState {
    weight: f64,
    skip_balance: bool,
    last_time: Instant,
    total_commands_count: i64,
    total_commands_size: i64,
}

/// Both limiters (QPS and byte-rate) of one namespace@command pair, plus the
/// balance bookkeeping for this node.
pub struct CommandLimiter {
    node_addr: String,
    name: String,
    qps: Mutex<LimiterWrapper>,
    rate: Mutex<LimiterWrapper>,
    state: Mutex<BalanceState>,
}

impl CommandLimiter {
    fn new(
        node_addr: &str,
        name: &str,
        qps_limit: (i64, usize),
        rate_limit: (i64, usize),
        initial_percent: f64,
    ) -> Option<CommandLimiter> {
        let qps_ok = qps_limit.0 > 0 && qps_limit.1 > 0;
        let rate_ok = rate_limit.0 > 0 && rate_limit.1 > 0;
        if (!qps_ok && !rate_ok) || initial_percent <= 0.0 {
            return None;
        }
        let cl = CommandLimiter {
            node_addr: node_addr.to_string(),
            name: name.to_string(),
            qps: Mutex::new(LimiterWrapper::new(format!("{name}-qps"), initial_percent)),
            rate: Mutex::new(LimiterWrapper::new(format!("{name}-rate"), initial_percent)),
            state: Mutex::new(BalanceState {
                weight: MAXIMUM_WEIGHT,
                // the first period's samples start mid-window; don't balance on them
                skip_balance: true,
                last_time: Instant::now(),
                total_commands_count: 0,
                total_commands_size: 0,
            }),
        };
        cl.qps.lock().update_limit(qps_limit.0, qps_limit.1);
        cl.rate.lock().update_limit(rate_limit.0, rate_limit.1);
        Some(cl)
    }

    /// The hot-path gate: one QPS token plus one byte-rate token per
    /// serialized byte, sleeping out whatever delay the reservations carry.
    /// Never touches the KV store.
    pub async fn check_limit(&self, cmd_name: &str, args: &[Vec<u8>]) {
        let delay = self.qps.lock().wait_time(1);
        if delay > Duration::ZERO {
            debug!(limiter = %self.name, delay_us = delay.as_micros() as u64, "qps limit hit");
            tokio::time::sleep(delay).await;
        }

        let cmd_size = cmd_name.len() + args.iter().map(|a| a.len() + 1).sum::<usize>();
        let delay = self.rate.lock().wait_time(cmd_size);
        if delay > Duration::ZERO {
            debug!(limiter = %self.name, delay_us = delay.as_micros() as u64, "rate limit hit");
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.total_commands_count += 1;
        state.total_commands_size += cmd_size as i64;
    }

    fn update_limit(&self, qps_limit: (i64, usize), rate_limit: (i64, usize)) {
        let qps_changed = self.qps.lock().update_limit(qps_limit.0, qps_limit.1);
        let rate_changed = self.rate.lock().update_limit(rate_limit.0, rate_limit.1);
        if qps_changed || rate_changed {
            // this period's samples were taken under the old limit
            self.state.lock().skip_balance = true;
        }
    }

    /// Export this period's observed usage and reset the counters.
    /// Returns the average QPS over the period.
    fn report_local_stat(&self) -> f64 {
        let mut state = self.state.lock();
        let seconds = state.last_time.elapsed().as_secs_f64();
        let (qps_local, rate_local) = if seconds > 0.0 {
            (
                state.total_commands_count as f64 / seconds,
                state.total_commands_size as f64 / 1024.0 / seconds,
            )
        } else {
            (0.0, 0.0)
        };
        state.total_commands_count = 0;
        state.total_commands_size = 0;
        state.last_time = Instant::now();
        drop(state);

        if let Some((namespace, cmd)) = self.name.split_once('@') {
            let m = metrics::global();
            m.limiter_qps
                .with_label_values(&[namespace, cmd, self.node_addr.as_str()])
                .set(qps_local);
            m.limiter_rate
                .with_label_values(&[namespace, cmd, self.node_addr.as_str()])
                .set(rate_local);
        }
        qps_local
    }

    /// One balance round: read peer status, shift our weight per the AIMD
    /// rules, publish our own record, and apply the new local share.
    async fn balance_limit(&self, average_qps: f64, db: &DbHandle, conf: &RateLimitConfig) {
        let qps_global_limit = self.qps.lock().global_limit() as f64;
        if qps_global_limit <= 0.0 {
            return;
        }
        {
            let mut state = self.state.lock();
            if state.skip_balance {
                state.skip_balance = false;
                return;
            }
        }

        let mut txn = match db.begin().await {
            Ok(txn) => txn,
            Err(err) => {
                error!(node = %self.node_addr, error = %err, "balance txn begin failed");
                return;
            }
        };

        let (weights, qpss) = match self.scan_peer_status(&mut txn, conf).await {
            Ok(peers) => peers,
            Err(err) => {
                error!(limiter = %self.name, error = %err, "scan peer status failed");
                let _ = txn.rollback().await;
                return;
            }
        };

        let new_weight;
        let new_percent;
        {
            let mut state = self.state.lock();
            let total_weight: f64 = state.weight + weights.iter().sum::<f64>();

            let self_target = qps_global_limit * (state.weight / total_weight);
            if average_qps < self_target * conf.usage_to_divide {
                let mut other_have_high = false;
                let mut other_all_low = true;
                for (weight, qps) in weights.iter().zip(qpss.iter()) {
                    let other_target = qps_global_limit * (weight / total_weight);
                    if *qps >= other_target * conf.usage_to_multiply {
                        other_have_high = true;
                        other_all_low = false;
                        break;
                    } else if *qps >= other_target * conf.usage_to_divide {
                        other_all_low = false;
                    }
                }
                if other_have_high {
                    state.weight =
                        (state.weight / conf.weight_change_factor).max(MINIMUM_WEIGHT);
                } else if other_all_low {
                    state.weight =
                        (state.weight * conf.weight_change_factor).min(MAXIMUM_WEIGHT);
                }
            } else if average_qps >= self_target * conf.usage_to_multiply {
                state.weight = (state.weight * conf.weight_change_factor).min(MAXIMUM_WEIGHT);
            }

            let total_weight: f64 = state.weight + weights.iter().sum::<f64>();
            new_weight = state.weight;
            new_percent = state.weight / total_weight;
        }

        let mut status_key = status_key_prefix(&self.name);
        status_key.extend_from_slice(self.node_addr.as_bytes());
        let value = format!("{new_weight},{average_qps},{}", now_ns());
        let mut status = match txn.string(&status_key).await {
            Ok(status) => status,
            Err(err) => {
                error!(limiter = %self.name, error = %err, "load status record failed");
                let _ = txn.rollback().await;
                return;
            }
        };
        if let Err(err) = status.set(&mut txn, value.into_bytes(), None).await {
            error!(limiter = %self.name, error = %err, "write status record failed");
            let _ = txn.rollback().await;
            return;
        }
        if let Err(err) = txn.commit().await {
            error!(node = %self.node_addr, error = %err, "balance commit failed");
            let _ = txn.rollback().await;
            return;
        }

        info!(
            limiter = %self.name,
            qps = average_qps,
            new_weight,
            new_percent,
            "balance limit"
        );
        self.qps.lock().update_percent(new_percent);
        self.rate.lock().update_percent(new_percent);
    }

    /// Collect `(weight, qps)` of every other node whose status record is
    /// fresh enough to count.
    async fn scan_peer_status(
        &self,
        txn: &mut Transaction,
        conf: &RateLimitConfig,
    ) -> Result<(Vec<f64>, Vec<f64>), DbError> {
        let user_prefix = status_key_prefix(&self.name);
        let prefix = codec::meta_key(&txn.namespace, txn.db_id, &user_prefix);
        let end = prefix_next(&prefix);
        let mut iter = txn.kv.scan(prefix.clone(), end).await?;

        let lifetime_ns = conf.status_lifetime as i64 * 1_000_000_000;
        let mut weights = Vec::new();
        let mut qpss = Vec::new();
        while iter.valid() && iter.key().starts_with(&prefix) {
            let key = iter.key().to_vec();
            let value = iter.value().to_vec();
            iter.next().await?;

            if key.len() <= prefix.len() {
                error!(key = %String::from_utf8_lossy(&key), "status record without node address");
                continue;
            }
            let node = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            let payload = match crate::db::object::Object::decode(&value) {
                Ok(_) => &value[crate::db::object::OBJECT_HEADER_LEN..],
                Err(err) => {
                    error!(key = %String::from_utf8_lossy(&key), error = %err, "bad status record");
                    continue;
                }
            };

            let Some((weight, qps, last_active)) = parse_status_value(payload) else {
                error!(key = %String::from_utf8_lossy(&key), "malformed status value");
                continue;
            };

            debug!(limiter = %self.name, node = %node, weight, qps, last_active, "peer status");
            if node != self.node_addr && now_ns() - last_active <= lifetime_ns {
                weights.push(weight);
                qpss.push(qps);
            }
        }
        Ok((weights, qpss))
    }
}

/// `limiter_status:<name>:` — user-key prefix of the status records.
fn status_key_prefix(limiter_name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(LIMITER_STATUS_PREFIX.len() + limiter_name.len() + 1);
    key.extend_from_slice(LIMITER_STATUS_PREFIX.as_bytes());
    key.extend_from_slice(limiter_name.as_bytes());
    key.push(b':');
    key
}

fn parse_status_value(payload: &[u8]) -> Option<(f64, f64, i64)> {
    let text = std::str::from_utf8(payload).ok()?;
    let mut parts = text.split(',');
    let weight = parts.next()?.parse::<f64>().ok()?;
    let qps = parts.next()?.parse::<f64>().ok()?;
    let last_active = parts.next()?.parse::<i64>().ok()?;
    Some((weight, qps, last_active))
}

/// Parse `"<number>[K|M] <burst>"`. Anything malformed reads as no limit.
fn parse_limit_value(value: &[u8]) -> (i64, usize) {
    let Ok(text) = std::str::from_utf8(value) else {
        return (0, 0);
    };
    let mut parts = text.split(' ');
    let (Some(limit_str), Some(burst_str)) = (parts.next(), parts.next()) else {
        warn!(value = text, "limit needs two parameters: <limit>[K|M] <burst>");
        return (0, 0);
    };
    if limit_str.is_empty() {
        return (0, 0);
    }

    let (number, unit) = match limit_str.as_bytes()[limit_str.len() - 1] {
        b'k' | b'K' => (&limit_str[..limit_str.len() - 1], 1024i64),
        b'm' | b'M' => (&limit_str[..limit_str.len() - 1], 1024 * 1024),
        _ => (limit_str, 1),
    };
    let Ok(number) = number.parse::<f64>() else {
        warn!(value = text, "limit number part is not a number");
        return (0, 0);
    };
    let Ok(burst) = burst_str.parse::<usize>() else {
        warn!(value = text, "burst is not an integer");
        return (0, 0);
    };
    ((number * unit as f64) as i64, burst)
}

/// `<ns>@<cmd>` → `*@<cmd>`
fn all_match_name(limiter_name: &str) -> Option<String> {
    let (_, cmd) = limiter_name.split_once('@')?;
    Some(format!("{ALL_NAMESPACE}@{cmd}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LimitData {
    limit: i64,
    burst: usize,
}

impl LimitData {
    fn usable(&self) -> bool {
        self.limit > 0 && self.burst > 0
    }
}

/// Process-wide limiter registry plus its two maintenance loops.
pub struct LimitersMgr {
    db: DbHandle,
    conf: RateLimitConfig,
    node_addr: String,
    limiters: DashMap<String, Option<Arc<CommandLimiter>>>,
    qps_all_match: DashMap<String, Option<LimitData>>,
    rate_all_match: DashMap<String, Option<LimitData>>,
    // serializes first-touch inits so concurrent new connections don't stampede
    // the KV store for the same limits
    init_lock: tokio::sync::Mutex<()>,
}

impl LimitersMgr {
    pub fn new(store: Arc<dyn Store>, conf: &RateLimitConfig) -> crate::Result<Arc<LimitersMgr>> {
        conf.validate()?;
        if conf.limiter_namespace.is_empty() {
            return Err(crate::QuarryError::Config(
                "limiter-namespace is configured empty".to_string(),
            ));
        }
        let node_addr = resolve_node_addr(conf);
        info!(node = %node_addr, "rate limiter node identity");
        Ok(Arc::new(LimitersMgr {
            db: DbHandle::new(store, conf.limiter_namespace.clone(), LIMIT_DATA_DBID),
            conf: conf.clone(),
            node_addr,
            limiters: DashMap::new(),
            qps_all_match: DashMap::new(),
            rate_all_match: DashMap::new(),
            init_lock: tokio::sync::Mutex::new(()),
        }))
    }

    /// Spawn the sync and balance loops.
    pub fn start(self: &Arc<LimitersMgr>, shutdown: CancellationToken) {
        let mgr = Arc::clone(self);
        let token = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(mgr.conf.sync_set_period.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => mgr.run_sync_new_limit().await,
                }
            }
        });

        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(mgr.conf.global_balance_period.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => mgr.run_report_and_balance().await,
                }
            }
        });
    }

    /// The per-command gate. Looks up (or lazily initializes) the limiter for
    /// `<namespace>@<cmd>` and, when one is configured, reserves and sleeps.
    pub async fn check_limit(&self, namespace: &str, cmd_name: &str, args: &[Vec<u8>]) {
        let limiter_name = format!("{namespace}@{cmd_name}");
        let limiter = match self.limiters.get(&limiter_name) {
            Some(entry) => entry.clone(),
            None => self.init(&limiter_name).await,
        };

        if let Some(limiter) = limiter {
            let start = Instant::now();
            limiter.check_limit(cmd_name, args).await;
            metrics::global()
                .limit_cost_seconds
                .with_label_values(&[namespace, cmd_name])
                .observe(start.elapsed().as_secs_f64());
        }
    }

    /// First touch of a limiter name: fetch its limits (falling back to the
    /// `*@<cmd>` wildcard) and cache the outcome, even a negative one.
    async fn init(&self, limiter_name: &str) -> Option<Arc<CommandLimiter>> {
        let _guard = self.init_lock.lock().await;
        if let Some(existing) = self.limiters.get(limiter_name) {
            return existing.clone();
        }

        let all_match = all_match_name(limiter_name)?;
        let mut qps_limit = self.get_limit(limiter_name, true).await;
        let mut rate_limit = self.get_limit(limiter_name, false).await;
        let qps_wildcard = {
            let (limit, burst) = self.get_limit(&all_match, true).await;
            LimitData { limit, burst }
        };
        let rate_wildcard = {
            let (limit, burst) = self.get_limit(&all_match, false).await;
            LimitData { limit, burst }
        };
        self.qps_all_match
            .insert(all_match.clone(), Some(qps_wildcard).filter(|d| d.usable()));
        self.rate_all_match
            .insert(all_match, Some(rate_wildcard).filter(|d| d.usable()));
        if !(qps_limit.0 > 0 && qps_limit.1 > 0) && qps_wildcard.usable() {
            qps_limit = (qps_wildcard.limit, qps_wildcard.burst);
        }
        if !(rate_limit.0 > 0 && rate_limit.1 > 0) && rate_wildcard.usable() {
            rate_limit = (rate_wildcard.limit, rate_wildcard.burst);
        }

        let limiter = CommandLimiter::new(
            &self.node_addr,
            limiter_name,
            qps_limit,
            rate_limit,
            self.conf.initial_percent,
        )
        .map(Arc::new);
        self.limiters
            .insert(limiter_name.to_string(), limiter.clone());
        limiter
    }

    /// Read one limit value from the KV store.
    async fn get_limit(&self, limiter_name: &str, is_qps: bool) -> (i64, usize) {
        let key = if is_qps {
            format!("{QPS_PREFIX}{limiter_name}")
        } else {
            format!("{RATE_PREFIX}{limiter_name}")
        };

        let mut txn = match self.db.begin().await {
            Ok(txn) => txn,
            Err(err) => {
                error!(limiter = limiter_name, error = %err, "limit txn begin failed");
                return (0, 0);
            }
        };
        let value = match txn.string(key.as_bytes()).await {
            Ok(s) => s.get().map(|v| v.to_vec()),
            Err(err) => {
                error!(key, error = %err, "get limit value failed");
                let _ = txn.rollback().await;
                return (0, 0);
            }
        };
        let _ = txn.rollback().await;

        match value {
            Some(value) => {
                let (limit, burst) = parse_limit_value(&value);
                debug!(key, limit, burst, "got limit");
                (limit, burst)
            }
            None => (0, 0),
        }
    }

    /// Re-read every active limiter's limits (and the wildcard fallbacks) and
    /// apply whatever changed.
    async fn run_sync_new_limit(&self) {
        let wildcard_names: Vec<String> = self
            .qps_all_match
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for name in &wildcard_names {
            let (limit, burst) = self.get_limit(name, true).await;
            let data = LimitData { limit, burst };
            self.qps_all_match
                .insert(name.clone(), Some(data).filter(|d| d.usable()));
            let (limit, burst) = self.get_limit(name, false).await;
            let data = LimitData { limit, burst };
            self.rate_all_match
                .insert(name.clone(), Some(data).filter(|d| d.usable()));
        }

        let names: Vec<String> = self.limiters.iter().map(|e| e.key().clone()).collect();
        for limiter_name in names {
            let all_match = all_match_name(&limiter_name);
            let mut qps_limit = self.get_limit(&limiter_name, true).await;
            if !(qps_limit.0 > 0 && qps_limit.1 > 0) {
                if let Some(all_match) = &all_match {
                    if let Some(Some(data)) =
                        self.qps_all_match.get(all_match).map(|e| *e.value())
                    {
                        qps_limit = (data.limit, data.burst);
                    }
                }
            }
            let mut rate_limit = self.get_limit(&limiter_name, false).await;
            if !(rate_limit.0 > 0 && rate_limit.1 > 0) {
                if let Some(all_match) = &all_match {
                    if let Some(Some(data)) =
                        self.rate_all_match.get(all_match).map(|e| *e.value())
                    {
                        rate_limit = (data.limit, data.burst);
                    }
                }
            }

            let usable =
                (qps_limit.0 > 0 && qps_limit.1 > 0) || (rate_limit.0 > 0 && rate_limit.1 > 0);
            let existing = self.limiters.get(&limiter_name).and_then(|e| e.clone());
            match (existing, usable) {
                (Some(limiter), true) => limiter.update_limit(qps_limit, rate_limit),
                (None, true) => {
                    let limiter = CommandLimiter::new(
                        &self.node_addr,
                        &limiter_name,
                        qps_limit,
                        rate_limit,
                        self.conf.initial_percent,
                    )
                    .map(Arc::new);
                    self.limiters.insert(limiter_name.clone(), limiter);
                }
                (Some(_), false) => {
                    debug!(limiter = %limiter_name, "limit cleared");
                    self.limiters.insert(limiter_name.clone(), None);
                }
                (None, false) => {}
            }
        }
    }

    /// Report local usage and rebalance every active limiter.
    async fn run_report_and_balance(&self) {
        let entries: Vec<(String, Option<Arc<CommandLimiter>>)> = self
            .limiters
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (limiter_name, limiter) in entries {
            match limiter {
                Some(limiter) => {
                    let average_qps = limiter.report_local_stat();
                    limiter.balance_limit(average_qps, &self.db, &self.conf).await;
                }
                None => {
                    if let Some((namespace, cmd)) = limiter_name.split_once('@') {
                        let m = metrics::global();
                        m.limiter_qps
                            .with_label_values(&[namespace, cmd, self.node_addr.as_str()])
                            .set(0.0);
                        m.limiter_rate
                            .with_label_values(&[namespace, cmd, self.node_addr.as_str()])
                            .set(0.0);
                    }
                }
            }
        }
    }
}

/// This node's identity in status records: the configured address, or the
/// source address of an outbound route when unset.
fn resolve_node_addr(conf: &RateLimitConfig) -> String {
    if !conf.node_addr.is_empty() {
        return conf.node_addr.clone();
    }
    let detected = std::net::UdpSocket::bind("0.0.0.0:0").and_then(|socket| {
        socket.connect("8.8.8.8:53")?;
        socket.local_addr()
    });
    match detected {
        Ok(addr) => addr.ip().to_string(),
        Err(err) => {
            warn!(error = %err, "could not detect node address, using loopback");
            "127.0.0.1".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn test_conf() -> RateLimitConfig {
        RateLimitConfig {
            limiter_namespace: "sys_limits".to_string(),
            node_addr: "10.0.0.1".to_string(),
            ..Default::default()
        }
    }

    async fn write_limit(db: &DbHandle, key: &str, value: &str) {
        let mut txn = db.begin().await.unwrap();
        let mut s = txn.string(key.as_bytes()).await.unwrap();
        s.set(&mut txn, value.as_bytes().to_vec(), None).await.unwrap();
        txn.commit().await.unwrap();
    }

    #[test]
    fn test_parse_limit_value() {
        assert_eq!(parse_limit_value(b"100 10"), (100, 10));
        assert_eq!(parse_limit_value(b"2K 5"), (2048, 5));
        assert_eq!(parse_limit_value(b"1.5k 5"), (1536, 5));
        assert_eq!(parse_limit_value(b"1M 32"), (1024 * 1024, 32));
        assert_eq!(parse_limit_value(b"garbage"), (0, 0));
        assert_eq!(parse_limit_value(b"10 nope"), (0, 0));
    }

    #[test]
    fn test_bucket_reserve() {
        let mut bucket = RateBucket::new(100.0, 10);
        // the initial burst is free
        for _ in 0..10 {
            assert_eq!(bucket.reserve(1).unwrap(), Duration::ZERO);
        }
        // past the burst, reservations carry a delay near deficit/limit
        let delay = bucket.reserve(5).unwrap();
        assert!(delay > Duration::from_millis(40) && delay < Duration::from_millis(70));
        // a request over the burst can never be satisfied
        assert!(bucket.reserve(11).is_none());
    }

    #[test]
    fn test_wrapper_update_limit() {
        let mut lw = LimiterWrapper::new("t-qps".to_string(), 1.0);
        assert!(lw.update_limit(100, 10));
        assert!(!lw.update_limit(100, 10));
        assert!(lw.update_limit(200, 10));
        assert!(lw.update_limit(200, 20));
        assert!(lw.update_limit(0, 0));
        assert!(lw.bucket.is_none());
    }

    #[test]
    fn test_wrapper_percent_scales_limit() {
        let mut lw = LimiterWrapper::new("t-qps".to_string(), 1.0);
        lw.update_limit(1000, 10);
        lw.update_percent(0.25);
        assert_eq!(lw.local_percent, 0.25);
        assert_eq!(lw.bucket.as_ref().unwrap().limit, 250.0);
    }

    #[tokio::test]
    async fn test_mgr_init_and_negative_cache() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let conf = test_conf();
        let mgr = LimitersMgr::new(Arc::clone(&store), &conf).unwrap();
        write_limit(&mgr.db, "qps:tenant@SET", "1000 100").await;

        // no limits configured for GET: cached as a negative entry
        mgr.check_limit("tenant", "GET", &[]).await;
        assert!(mgr.limiters.get("tenant@GET").unwrap().is_none());

        // SET has a limit; the hot path counts through it
        mgr.check_limit("tenant", "SET", &[b"k".to_vec(), b"v".to_vec()])
            .await;
        let limiter = mgr.limiters.get("tenant@SET").unwrap().clone().unwrap();
        assert_eq!(limiter.state.lock().total_commands_count, 1);
    }

    #[tokio::test]
    async fn test_mgr_wildcard_fallback() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let conf = test_conf();
        let mgr = LimitersMgr::new(Arc::clone(&store), &conf).unwrap();
        write_limit(&mgr.db, "qps:*@DEL", "500 50").await;

        mgr.check_limit("tenant", "DEL", &[b"k".to_vec()]).await;
        let limiter = mgr.limiters.get("tenant@DEL").unwrap().clone().unwrap();
        assert_eq!(limiter.qps.lock().global_limit(), 500);
    }

    #[tokio::test]
    async fn test_sync_picks_up_new_limit() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let conf = test_conf();
        let mgr = LimitersMgr::new(Arc::clone(&store), &conf).unwrap();

        mgr.check_limit("tenant", "GET", &[]).await;
        assert!(mgr.limiters.get("tenant@GET").unwrap().is_none());

        write_limit(&mgr.db, "qps:tenant@GET", "100 10").await;
        mgr.run_sync_new_limit().await;
        let limiter = mgr.limiters.get("tenant@GET").unwrap().clone().unwrap();
        assert_eq!(limiter.qps.lock().global_limit(), 100);
        // a fresh limit invalidates this period's balance samples
        assert!(limiter.state.lock().skip_balance);
    }

    #[tokio::test]
    async fn test_balance_yields_to_hot_peer() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let conf = test_conf();
        let mgr = LimitersMgr::new(Arc::clone(&store), &conf).unwrap();
        write_limit(&mgr.db, "qps:tenant@SET", "100 10").await;

        // a fresh peer record claiming most of the limit
        let peer_value = format!("1.0,90.0,{}", now_ns());
        write_limit(
            &mgr.db,
            "limiter_status:tenant@SET:10.0.0.2",
            &peer_value,
        )
        .await;

        mgr.check_limit("tenant", "SET", &[]).await;
        let limiter = mgr.limiters.get("tenant@SET").unwrap().clone().unwrap();
        limiter.state.lock().skip_balance = false;

        // self qps 5 < (100 * 0.5) * 0.5, peer at 90 >= 50 * 0.8: shrink
        limiter.balance_limit(5.0, &mgr.db, &conf).await;
        let weight = limiter.state.lock().weight;
        assert!((weight - 1.0 / conf.weight_change_factor).abs() < 1e-9);

        // our status record landed in the store
        let mut txn = mgr.db.begin().await.unwrap();
        let s = txn
            .string(b"limiter_status:tenant@SET:10.0.0.1")
            .await
            .unwrap();
        assert!(s.exists());
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_balance_ignores_stale_peer() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let conf = test_conf();
        let mgr = LimitersMgr::new(Arc::clone(&store), &conf).unwrap();
        write_limit(&mgr.db, "qps:tenant@SET", "100 10").await;

        // a stale record: far older than status-lifetime
        let stale = now_ns() - (conf.status_lifetime as i64 + 10) * 1_000_000_000;
        write_limit(
            &mgr.db,
            "limiter_status:tenant@SET:10.0.0.2",
            &format!("1.0,90.0,{stale}"),
        )
        .await;

        mgr.check_limit("tenant", "SET", &[]).await;
        let limiter = mgr.limiters.get("tenant@SET").unwrap().clone().unwrap();
        limiter.state.lock().skip_balance = false;

        // with the peer expired this node is alone; low usage alone keeps the
        // weight clamped at the maximum
        limiter.balance_limit(5.0, &mgr.db, &conf).await;
        assert_eq!(limiter.state.lock().weight, MAXIMUM_WEIGHT);
    }
}
