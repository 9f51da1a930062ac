//! Prometheus metrics for Quarry

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry,
};
use std::sync::OnceLock;

static GLOBAL: OnceLock<Metrics> = OnceLock::new();

/// Process-wide metrics handle, initialized on first use.
pub fn global() -> &'static Metrics {
    GLOBAL.get_or_init(Metrics::new)
}

/// All metrics exposed on the status endpoint.
pub struct Metrics {
    pub registry: Registry,

    // Connection metrics
    pub active_connections: IntGauge,
    pub total_connections: IntCounter,
    pub rejected_connections: IntCounter,

    // Command metrics
    pub commands_total: IntCounterVec,
    pub command_latency: Histogram,
    pub unknown_commands: IntCounter,

    // Bytes counters
    pub bytes_read: IntCounter,
    pub bytes_written: IntCounter,

    // Error counters
    pub protocol_errors: IntCounter,
    pub kv_errors: IntCounter,
    pub commit_conflicts: IntCounter,

    // Expiration engine
    pub is_leader: IntGauge,
    pub expire_keys_total: IntCounterVec,
    pub expire_delay_seconds: GaugeVec,
    pub worker_round_seconds: HistogramVec,
    pub worker_seek_seconds: HistogramVec,
    pub worker_commit_seconds: HistogramVec,

    // Rate limiter
    pub limiter_qps: GaugeVec,
    pub limiter_rate: GaugeVec,
    pub limit_cost_seconds: HistogramVec,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        let registry = Registry::new();

        let active_connections =
            IntGauge::new("quarry_active_connections", "Current active connections").unwrap();
        let total_connections =
            IntCounter::new("quarry_connections_total", "Total connections accepted").unwrap();
        let rejected_connections = IntCounter::new(
            "quarry_rejected_connections_total",
            "Total connections rejected",
        )
        .unwrap();

        let commands_total = IntCounterVec::new(
            Opts::new("quarry_commands_total", "Commands executed"),
            &["command"],
        )
        .unwrap();
        let command_latency = Histogram::with_opts(
            HistogramOpts::new("quarry_command_latency_seconds", "Command latency in seconds")
                .buckets(vec![
                    0.0001, 0.0005, 0.001, 0.002, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
                ]),
        )
        .unwrap();
        let unknown_commands =
            IntCounter::new("quarry_unknown_commands_total", "Unknown commands received").unwrap();

        let bytes_read = IntCounter::new("quarry_bytes_read_total", "Total bytes read").unwrap();
        let bytes_written =
            IntCounter::new("quarry_bytes_written_total", "Total bytes written").unwrap();

        let protocol_errors =
            IntCounter::new("quarry_protocol_errors_total", "Total protocol errors").unwrap();
        let kv_errors = IntCounter::new("quarry_kv_errors_total", "Total kv store errors").unwrap();
        let commit_conflicts = IntCounter::new(
            "quarry_commit_conflicts_total",
            "Optimistic commit conflicts",
        )
        .unwrap();

        let is_leader =
            IntGauge::new("quarry_expire_leader", "1 when this node holds the reaper lease")
                .unwrap();
        let expire_keys_total = IntCounterVec::new(
            Opts::new("quarry_expire_keys_total", "Expire index entry transitions"),
            &["action"],
        )
        .unwrap();
        let expire_delay_seconds = GaugeVec::new(
            Opts::new(
                "quarry_expire_delay_seconds",
                "Lag between now and the oldest unprocessed expire entry",
            ),
            &["shard"],
        )
        .unwrap();
        let worker_buckets = vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];
        let worker_round_seconds = HistogramVec::new(
            HistogramOpts::new("quarry_worker_round_seconds", "Reaper round duration")
                .buckets(worker_buckets.clone()),
            &["worker"],
        )
        .unwrap();
        let worker_seek_seconds = HistogramVec::new(
            HistogramOpts::new("quarry_worker_seek_seconds", "Reaper seek duration")
                .buckets(worker_buckets.clone()),
            &["worker"],
        )
        .unwrap();
        let worker_commit_seconds = HistogramVec::new(
            HistogramOpts::new("quarry_worker_commit_seconds", "Reaper commit duration")
                .buckets(worker_buckets),
            &["worker"],
        )
        .unwrap();

        let limiter_qps = GaugeVec::new(
            Opts::new("quarry_limiter_qps", "Observed per-node QPS per limiter"),
            &["namespace", "command", "node"],
        )
        .unwrap();
        let limiter_rate = GaugeVec::new(
            Opts::new(
                "quarry_limiter_rate_kbps",
                "Observed per-node byte rate per limiter",
            ),
            &["namespace", "command", "node"],
        )
        .unwrap();
        let limit_cost_seconds = HistogramVec::new(
            HistogramOpts::new(
                "quarry_limit_cost_seconds",
                "Time spent in the rate-limit gate",
            )
            .buckets(vec![0.00001, 0.0001, 0.001, 0.01, 0.1, 1.0]),
            &["namespace", "command"],
        )
        .unwrap();

        registry
            .register(Box::new(active_connections.clone()))
            .unwrap();
        registry
            .register(Box::new(total_connections.clone()))
            .unwrap();
        registry
            .register(Box::new(rejected_connections.clone()))
            .unwrap();
        registry.register(Box::new(commands_total.clone())).unwrap();
        registry
            .register(Box::new(command_latency.clone()))
            .unwrap();
        registry
            .register(Box::new(unknown_commands.clone()))
            .unwrap();
        registry.register(Box::new(bytes_read.clone())).unwrap();
        registry.register(Box::new(bytes_written.clone())).unwrap();
        registry
            .register(Box::new(protocol_errors.clone()))
            .unwrap();
        registry.register(Box::new(kv_errors.clone())).unwrap();
        registry
            .register(Box::new(commit_conflicts.clone()))
            .unwrap();
        registry.register(Box::new(is_leader.clone())).unwrap();
        registry
            .register(Box::new(expire_keys_total.clone()))
            .unwrap();
        registry
            .register(Box::new(expire_delay_seconds.clone()))
            .unwrap();
        registry
            .register(Box::new(worker_round_seconds.clone()))
            .unwrap();
        registry
            .register(Box::new(worker_seek_seconds.clone()))
            .unwrap();
        registry
            .register(Box::new(worker_commit_seconds.clone()))
            .unwrap();
        registry.register(Box::new(limiter_qps.clone())).unwrap();
        registry.register(Box::new(limiter_rate.clone())).unwrap();
        registry
            .register(Box::new(limit_cost_seconds.clone()))
            .unwrap();

        Self {
            registry,
            active_connections,
            total_connections,
            rejected_connections,
            commands_total,
            command_latency,
            unknown_commands,
            bytes_read,
            bytes_written,
            protocol_errors,
            kv_errors,
            commit_conflicts,
            is_leader,
            expire_keys_total,
            expire_delay_seconds,
            worker_round_seconds,
            worker_seek_seconds,
            worker_commit_seconds,
            limiter_qps,
            limiter_rate,
            limit_cost_seconds,
        }
    }

    /// Get Prometheus formatted metrics
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        metrics.total_connections.inc();
        metrics.commands_total.with_label_values(&["GET"]).inc();
        metrics
            .expire_keys_total
            .with_label_values(&["added"])
            .inc();

        let output = metrics.gather();
        assert!(output.contains("quarry_connections_total"));
        assert!(output.contains("quarry_commands_total"));
        assert!(output.contains("quarry_expire_keys_total"));
    }

    #[test]
    fn test_global_is_singleton() {
        let a = global() as *const Metrics;
        let b = global() as *const Metrics;
        assert_eq!(a, b);
    }
}
