//! Configuration for Quarry
//!
//! One TOML file; every field has a default so a bare `[server]` section (or
//! no file at all) yields a runnable single-node setup. Durations are plain
//! seconds.

use serde::Deserialize;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub server: ServerConfig,
    pub status: StatusConfig,
    pub kv: KvConfig,
}

/// RESP server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Address to listen on
    pub listen: String,

    /// Shared secret required by `AUTH`. Empty disables authentication.
    pub auth: String,

    /// Maximum number of concurrent connections
    pub max_connection: usize,

    /// Number of Tokio worker threads (0 = number of CPUs)
    pub worker_threads: usize,

    /// Write buffer size per connection (bytes)
    pub write_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7369".to_string(),
            auth: String::new(),
            max_connection: 10000,
            worker_threads: 0,
            write_buffer_size: 8192,
        }
    }
}

/// Status/admin HTTP configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StatusConfig {
    /// Address for the metrics/health HTTP server
    pub listen: String,

    /// Enable the status server
    pub enabled: bool,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7345".to_string(),
            enabled: true,
        }
    }
}

/// Backing KV store configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct KvConfig {
    /// Store backend. `memory` runs the in-process engine; production
    /// deployments wire the placement-driver addresses below into the
    /// distributed engine adapter.
    pub backend: String,

    /// Placement driver addresses of the distributed engine
    pub pd_addrs: Vec<String>,

    pub expire: ExpireConfig,

    pub rate_limit: RateLimitConfig,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            pd_addrs: Vec::new(),
            expire: ExpireConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Expiration engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ExpireConfig {
    /// Disable the reaper entirely (expire indexes are still written)
    pub disable: bool,

    /// Worker and leader tick interval in seconds
    pub interval: u64,

    /// Leader lease lifetime in seconds
    pub leader_life_time: u64,

    /// Max entries processed per sharded worker tick
    pub batch_limit: usize,

    /// Max entries processed per legacy (unsharded) worker tick
    pub unhash_batch_limit: usize,
}

impl Default for ExpireConfig {
    fn default() -> Self {
        Self {
            disable: false,
            interval: 1,
            leader_life_time: 15,
            batch_limit: 256,
            unhash_batch_limit: 256,
        }
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RateLimitConfig {
    /// Namespace whose db 0 holds `qps:*`/`rate:*` limits and node status
    /// records. Empty disables rate limiting.
    pub limiter_namespace: String,

    /// Node address written into status records. Empty = auto-detect the
    /// outbound IPv4 address.
    pub node_addr: String,

    /// Balance loop period in seconds
    pub global_balance_period: u64,

    /// Peer status records older than this many seconds are ignored
    pub status_lifetime: u64,

    /// Limit re-read period in seconds
    pub sync_set_period: u64,

    /// Usage fraction below which a node offers quota away
    pub usage_to_divide: f64,

    /// Usage fraction above which a node claims more quota
    pub usage_to_multiply: f64,

    /// Multiplicative weight step; must be > 1
    pub weight_change_factor: f64,

    /// Initial local share of the global limit, in (0, 1]
    pub initial_percent: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limiter_namespace: String::new(),
            node_addr: String::new(),
            global_balance_period: 15,
            status_lifetime: 45,
            sync_set_period: 3,
            usage_to_divide: 0.5,
            usage_to_multiply: 0.8,
            weight_change_factor: 1.5,
            initial_percent: 1.0,
        }
    }
}

impl RateLimitConfig {
    /// Reject parameter combinations the balance rules cannot work with.
    pub fn validate(&self) -> crate::Result<()> {
        if self.limiter_namespace.is_empty() {
            return Ok(());
        }
        if self.weight_change_factor <= 1.0 {
            return Err(crate::QuarryError::Config(
                "weight-change-factor should be > 1".to_string(),
            ));
        }
        if !(self.usage_to_divide > 0.0
            && self.usage_to_divide < self.usage_to_multiply
            && self.usage_to_multiply < 1.0)
        {
            return Err(crate::QuarryError::Config(
                "should config 0 < usage-to-divide < usage-to-multiply < 1".to_string(),
            ));
        }
        if self.initial_percent <= 0.0 || self.initial_percent > 1.0 {
            return Err(crate::QuarryError::Config(
                "initial-percent should be in (0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            crate::QuarryError::Config(format!("Failed to read config file: {e}"))
        })?;

        let config: Config = toml::from_str(&contents)
            .map_err(|e| crate::QuarryError::Config(format!("Failed to parse config: {e}")))?;
        config.kv.rate_limit.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables or use defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("QUARRY_LISTEN") {
            config.server.listen = addr;
        }
        if let Ok(auth) = std::env::var("QUARRY_AUTH") {
            config.server.auth = auth;
        }
        if let Ok(max_conn) = std::env::var("QUARRY_MAX_CONNECTION") {
            if let Ok(n) = max_conn.parse() {
                config.server.max_connection = n;
            }
        }
        if let Ok(addr) = std::env::var("QUARRY_STATUS_LISTEN") {
            config.status.listen = addr;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen, "0.0.0.0:7369");
        assert_eq!(config.status.listen, "0.0.0.0:7345");
        assert_eq!(config.kv.backend, "memory");
        assert_eq!(config.kv.expire.interval, 1);
        assert!(config.kv.rate_limit.validate().is_ok());
    }

    #[test]
    fn test_parse_kebab_case() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:6379"
            max-connection = 64

            [kv.expire]
            leader-life-time = 30
            batch-limit = 128

            [kv.rate-limit]
            limiter-namespace = "sys_limits"
            global-balance-period = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.server.max_connection, 64);
        assert_eq!(config.kv.expire.leader_life_time, 30);
        assert_eq!(config.kv.expire.batch_limit, 128);
        assert_eq!(config.kv.rate_limit.limiter_namespace, "sys_limits");
        assert_eq!(config.kv.rate_limit.global_balance_period, 10);
    }

    #[test]
    fn test_rate_limit_validation() {
        let mut rl = RateLimitConfig {
            limiter_namespace: "sys".to_string(),
            ..Default::default()
        };
        assert!(rl.validate().is_ok());

        rl.weight_change_factor = 1.0;
        assert!(rl.validate().is_err());
        rl.weight_change_factor = 2.0;

        rl.usage_to_divide = 0.9;
        assert!(rl.validate().is_err());
        rl.usage_to_divide = 0.5;

        rl.initial_percent = 0.0;
        assert!(rl.validate().is_err());
    }
}
