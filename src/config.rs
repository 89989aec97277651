//! Timberline Configuration
//!
//! Configuration structures for a single table replica of the Timberline
//! replication engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main Timberline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimberlineConfig {
    /// Replica identity and coordination-tree placement
    pub replica: ReplicaConfig,

    /// Coordination service tuning
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Queue execution tuning
    #[serde(default)]
    pub queue: QueueConfig,

    /// Merge selection tuning
    #[serde(default)]
    pub merges: MergeConfig,

    /// Quorum write tuning
    #[serde(default)]
    pub quorum: QuorumConfig,

    /// Insert deduplication window
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Cleanup task tuning
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Part exchange endpoint
    pub exchange: ExchangeConfig,

    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Replica identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Root path of the table in the coordination service, e.g. `/tables/hits`
    pub table_path: String,

    /// Unique replica name within the table
    pub replica_name: String,

    /// Upper bound on locally committed parts unknown to the coordination
    /// store before startup refuses to proceed
    #[serde(default = "default_max_suspicious_parts")]
    pub max_suspicious_local_parts: usize,
}

/// Coordination service tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Single operation timeout in milliseconds
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Backoff between reconnection attempts after session loss
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
}

/// Queue execution tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Number of concurrent queue execution workers
    #[serde(default = "default_queue_workers")]
    pub workers: usize,

    /// Log pull interval in milliseconds
    #[serde(default = "default_pull_interval_ms")]
    pub pull_interval_ms: u64,

    /// Initial postpone delay after a failed entry, in milliseconds
    #[serde(default = "default_min_postpone_ms")]
    pub min_postpone_ms: u64,

    /// Postpone ceiling: a failing entry is retried at least this often,
    /// in milliseconds
    #[serde(default = "default_max_postpone_ms")]
    pub max_postpone_ms: u64,

    /// Failed attempts after which every further failure is logged as a
    /// warning
    #[serde(default = "default_max_tries_before_warn")]
    pub max_tries_before_warn: u32,
}

/// Merge selection tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Selection interval in milliseconds (leader only)
    #[serde(default = "default_select_interval_ms")]
    pub select_interval_ms: u64,

    /// Combined size ceiling for one merge, in bytes
    #[serde(default = "default_max_bytes_to_merge")]
    pub max_bytes_to_merge: u64,

    /// Maximum number of parts combined by one merge
    #[serde(default = "default_max_parts_per_merge")]
    pub max_parts_per_merge: usize,

    /// Minimum number of parts worth merging
    #[serde(default = "default_min_parts_to_merge")]
    pub min_parts_to_merge: usize,

    /// Parts older than this are merge candidates regardless of level
    /// adjacency, in seconds (0 = disabled)
    #[serde(default)]
    pub retention_seconds: u64,
}

/// Quorum write tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumConfig {
    /// Default quorum for inserts (0 = no quorum gating)
    #[serde(default)]
    pub insert_quorum: usize,

    /// How long an insert waits for quorum before failing, in milliseconds
    #[serde(default = "default_quorum_timeout_ms")]
    pub timeout_ms: u64,

    /// Poll interval of the quorum wait loop, in milliseconds
    #[serde(default = "default_quorum_poll_ms")]
    pub poll_interval_ms: u64,
}

/// Insert deduplication window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Recent block hashes kept per partition (0 = deduplication disabled)
    #[serde(default = "default_dedup_window")]
    pub window: usize,

    /// Maximum age of a dedup record in seconds
    #[serde(default = "default_dedup_max_age_secs")]
    pub max_age_secs: u64,
}

/// Cleanup task tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Cleanup interval in milliseconds
    #[serde(default = "default_cleanup_interval_ms")]
    pub interval_ms: u64,

    /// Log entries always kept, counting from the newest
    #[serde(default = "default_log_keep")]
    pub log_keep: u64,

    /// How long an outdated part is retained before removal, in seconds
    #[serde(default = "default_outdated_part_ttl_secs")]
    pub outdated_part_ttl_secs: u64,
}

/// Part exchange endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Address to bind the part exchange server
    pub bind_address: String,

    /// Advertised address for other replicas to connect
    #[serde(default)]
    pub advertise_address: Option<String>,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Whole-fetch timeout in milliseconds
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Enable LZ4 compression of file payloads on the wire
    #[serde(default = "default_true")]
    pub compression: bool,
}

/// HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_max_suspicious_parts() -> usize {
    10
}

fn default_session_timeout_ms() -> u64 {
    30_000
}

fn default_operation_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_backoff_ms() -> u64 {
    1_000
}

fn default_queue_workers() -> usize {
    4
}

fn default_pull_interval_ms() -> u64 {
    500
}

fn default_min_postpone_ms() -> u64 {
    100
}

fn default_max_postpone_ms() -> u64 {
    60_000
}

fn default_max_tries_before_warn() -> u32 {
    10
}

fn default_select_interval_ms() -> u64 {
    1_000
}

fn default_max_bytes_to_merge() -> u64 {
    150 * 1024 * 1024 * 1024
}

fn default_max_parts_per_merge() -> usize {
    100
}

fn default_min_parts_to_merge() -> usize {
    2
}

fn default_quorum_timeout_ms() -> u64 {
    30_000
}

fn default_quorum_poll_ms() -> u64 {
    100
}

fn default_dedup_window() -> usize {
    100
}

fn default_dedup_max_age_secs() -> u64 {
    7 * 24 * 3600
}

fn default_cleanup_interval_ms() -> u64 {
    30_000
}

fn default_log_keep() -> u64 {
    1000
}

fn default_outdated_part_ttl_secs() -> u64 {
    8 * 60
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_fetch_timeout_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8123".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: default_session_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_queue_workers(),
            pull_interval_ms: default_pull_interval_ms(),
            min_postpone_ms: default_min_postpone_ms(),
            max_postpone_ms: default_max_postpone_ms(),
            max_tries_before_warn: default_max_tries_before_warn(),
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            select_interval_ms: default_select_interval_ms(),
            max_bytes_to_merge: default_max_bytes_to_merge(),
            max_parts_per_merge: default_max_parts_per_merge(),
            min_parts_to_merge: default_min_parts_to_merge(),
            retention_seconds: 0,
        }
    }
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            insert_quorum: 0,
            timeout_ms: default_quorum_timeout_ms(),
            poll_interval_ms: default_quorum_poll_ms(),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window: default_dedup_window(),
            max_age_secs: default_dedup_max_age_secs(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_cleanup_interval_ms(),
            log_keep: default_log_keep(),
            outdated_part_ttl_secs: default_outdated_part_ttl_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl TimberlineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: TimberlineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.replica.replica_name.is_empty() {
            return Err(crate::Error::Config("replica.replica_name cannot be empty".into()));
        }
        if !self.replica.table_path.starts_with('/') || self.replica.table_path.ends_with('/') {
            return Err(crate::Error::Config(
                "replica.table_path must be an absolute path without a trailing slash".into(),
            ));
        }
        if self.replica.replica_name.contains('/') {
            return Err(crate::Error::Config("replica.replica_name cannot contain '/'".into()));
        }
        if self.exchange.bind_address.is_empty() {
            return Err(crate::Error::Config("exchange.bind_address cannot be empty".into()));
        }
        if self.queue.workers == 0 {
            return Err(crate::Error::Config("queue.workers must be at least 1".into()));
        }
        if self.queue.min_postpone_ms == 0 || self.queue.min_postpone_ms > self.queue.max_postpone_ms {
            return Err(crate::Error::Config(
                "queue.min_postpone_ms must be nonzero and not above queue.max_postpone_ms".into(),
            ));
        }
        if self.merges.min_parts_to_merge < 2 {
            return Err(crate::Error::Config("merges.min_parts_to_merge must be at least 2".into()));
        }
        Ok(())
    }

    /// Get the advertised exchange address (or bind address if not set)
    pub fn exchange_address(&self) -> &str {
        self.exchange
            .advertise_address
            .as_deref()
            .unwrap_or(&self.exchange.bind_address)
    }

    pub fn pull_interval(&self) -> Duration {
        Duration::from_millis(self.queue.pull_interval_ms)
    }

    pub fn select_interval(&self) -> Duration {
        Duration::from_millis(self.merges.select_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup.interval_ms)
    }

    pub fn quorum_timeout(&self) -> Duration {
        Duration::from_millis(self.quorum.timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.coordination.reconnect_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[replica]
table_path = "/tables/hits"
replica_name = "replica-1"

[exchange]
bind_address = "0.0.0.0:9009"

[quorum]
insert_quorum = 2

[merges]
max_bytes_to_merge = 1048576
"#;

        let config = TimberlineConfig::from_str(toml).unwrap();
        assert_eq!(config.replica.replica_name, "replica-1");
        assert_eq!(config.quorum.insert_quorum, 2);
        assert_eq!(config.merges.max_bytes_to_merge, 1_048_576);
        assert_eq!(config.queue.workers, default_queue_workers());
        assert_eq!(config.exchange_address(), "0.0.0.0:9009");
    }

    #[test]
    fn test_validate_rejects_bad_table_path() {
        let toml = r#"
[replica]
table_path = "tables/hits"
replica_name = "replica-1"

[exchange]
bind_address = "0.0.0.0:9009"
"#;
        assert!(TimberlineConfig::from_str(toml).is_err());
    }
}
