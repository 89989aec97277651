//! Timberline Error Types

use thiserror::Error;

/// Result type alias for Timberline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Timberline error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Sanity check failed: {0}")]
    SanityCheck(String),

    // Coordination errors
    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("Coordination session expired")]
    SessionExpired,

    #[error("Coordination node not found: {0}")]
    NodeNotFound(String),

    #[error("Coordination node already exists: {0}")]
    NodeExists(String),

    #[error("Version mismatch on {path}: expected {expected}, actual {actual}")]
    BadVersion {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Atomic transaction failed at op {index}: {reason}")]
    TxnFailed { index: usize, reason: String },

    // Part errors
    #[error("Invalid part name: {0}")]
    InvalidPartName(String),

    #[error("Part not found: {0}")]
    PartNotFound(String),

    #[error("Part {part} from {source_replica} rejected: {reason}")]
    PartMismatch {
        part: String,
        source_replica: String,
        reason: String,
    },

    #[error("No replica has part {0} or a part covering it")]
    NoSourceReplica(String),

    #[error("Fetch of part {0} already in progress")]
    FetchInProgress(String),

    // Log / queue errors
    #[error("Log entry {entry} failed: {reason}")]
    EntryExecution { entry: String, reason: String },

    // Quorum errors
    #[error("Quorum broken for part {part}: {confirmed}/{required} confirmations and the active set can no longer reach quorum")]
    QuorumBroken {
        part: String,
        confirmed: usize,
        required: usize,
    },

    #[error("Quorum timeout for part {part}: {confirmed}/{required} confirmations after {elapsed_ms} ms")]
    QuorumTimeout {
        part: String,
        confirmed: usize,
        required: usize,
        elapsed_ms: u64,
    },

    // Read path errors
    #[error("Replica is {delay_secs}s behind and no fresh replica is available")]
    StaleReplicaReadonly { delay_secs: u64 },

    #[error("Table is in readonly mode")]
    Readonly,

    // Mutation errors
    #[error("Mutation not found: {0}")]
    MutationNotFound(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // Serialization errors
    #[error("Entry serialization error: {0}")]
    EntrySerialization(#[from] serde_json::Error),

    #[error("Wire serialization error: {0}")]
    WireSerialization(#[from] bincode::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable without operator intervention
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Coordination(_)
                | Error::BadVersion { .. }
                | Error::TxnFailed { .. }
                | Error::Network(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::PartMismatch { .. }
                | Error::NoSourceReplica(_)
                | Error::FetchInProgress(_)
                | Error::EntryExecution { .. }
        )
    }

    /// Check if this error requires the replica to discard its coordination
    /// session and rebuild state from the external store
    pub fn triggers_reinit(&self) -> bool {
        matches!(self, Error::SessionExpired)
    }
}
