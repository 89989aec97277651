//! Timberline - Replicated Merge-Table Engine
//!
//! A replication engine for partitioned, merge-based tables, coordinated
//! through an external linearizable store (hierarchical paths, ephemeral and
//! sequential nodes, watches, atomic multi-op transactions) as the sole
//! ordering authority. Replicas converge on an identical part set without
//! peer-to-peer consensus.
//!
//! # Architecture
//!
//! Every change to the table's part set is published as an entry in a
//! shared, append-only log. Each replica copies new entries into its own
//! queue and executes them: fetching parts from peers, merging committed
//! parts, or dropping ranges. The replica holding the lowest-sequence
//! election node schedules merges and mutations for everyone. Inserts are
//! deduplicated by block content hash and can optionally wait for a write
//! quorum.
//!
//! # Features
//!
//! - Append-only replication log with per-replica queues and bounded
//!   out-of-order execution
//! - Automatic leader election over ephemeral sequential nodes
//! - Checksummed point-to-point part exchange with covering-part resolution
//! - Quorum-gated inserts with explicit broken-quorum detection
//! - Content-hash insert deduplication over a bounded window
//! - Session-loss recovery that rebuilds replica state from the store

pub mod api;
pub mod config;
pub mod coordination;
pub mod dedup;
pub mod election;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod log;
pub mod merge;
pub mod mutation;
pub mod part;
pub mod queue;
pub mod quorum;
pub mod storage;

pub use config::TimberlineConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::TimberlineConfig;
    pub use crate::coordination::{CoordinationStore, MemoryCoordination, TablePaths};
    pub use crate::engine::{InsertOutcome, ReplicatedTable, TableStatus};
    pub use crate::error::{Error, Result};
    pub use crate::log::{EntryKind, LogEntry};
    pub use crate::part::{Block, PartName};
    pub use crate::storage::{LocalStore, MemoryStore};
}
