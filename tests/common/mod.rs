//! Shared cluster-test fixtures

use std::sync::Arc;
use std::time::Duration;

use timberline::config::{
    ApiConfig, CleanupConfig, ExchangeConfig, QueueConfig, QuorumConfig, ReplicaConfig,
    TimberlineConfig,
};
use timberline::coordination::MemoryCoordination;
use timberline::engine::ReplicatedTable;
use timberline::storage::{LocalStore, MemoryStore};

pub const SYNC: Duration = Duration::from_secs(5);

pub fn test_config(name: &str) -> TimberlineConfig {
    TimberlineConfig {
        replica: ReplicaConfig {
            table_path: "/tables/hits".to_string(),
            replica_name: name.to_string(),
            max_suspicious_local_parts: 5,
        },
        coordination: Default::default(),
        queue: QueueConfig {
            workers: 2,
            pull_interval_ms: 50,
            min_postpone_ms: 20,
            max_postpone_ms: 200,
            max_tries_before_warn: 3,
        },
        merges: Default::default(),
        quorum: QuorumConfig {
            insert_quorum: 0,
            timeout_ms: 5_000,
            poll_interval_ms: 20,
        },
        dedup: Default::default(),
        cleanup: CleanupConfig {
            interval_ms: 100,
            log_keep: 1000,
            outdated_part_ttl_secs: 0,
        },
        exchange: ExchangeConfig {
            bind_address: "127.0.0.1:0".to_string(),
            advertise_address: None,
            connect_timeout_ms: 1_000,
            fetch_timeout_ms: 5_000,
            compression: true,
        },
        api: ApiConfig {
            enabled: false,
            ..Default::default()
        },
        logging: Default::default(),
    }
}

/// A replica without background tasks: every duty is driven manually, so
/// tests stay deterministic
pub async fn make_replica(
    coord: &MemoryCoordination,
    name: &str,
) -> (Arc<ReplicatedTable>, Arc<MemoryStore>) {
    init_tracing();
    let local = Arc::new(MemoryStore::new());
    let table = ReplicatedTable::new(test_config(name), coord.session_factory(), local.clone())
        .await
        .unwrap();
    table.startup_manual().await.unwrap();
    (table, local)
}

pub async fn part_names(local: &MemoryStore) -> Vec<String> {
    local
        .list_committed_parts()
        .await
        .unwrap()
        .iter()
        .map(|m| m.name.to_string())
        .collect()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("timberline=debug")
        .with_test_writer()
        .try_init();
}
