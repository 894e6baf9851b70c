//! Error types for the MariaDB failover operator

use thiserror::Error;

/// Errors raised while reconciling a `MariaDbCluster`
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Operator or cluster configuration is unusable
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The cluster spec failed validation
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// HTTP request to an external control endpoint failed
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// A node did not answer within its timeout
    #[error("Node {node} unreachable: {reason}")]
    Unreachable { node: String, reason: String },

    /// The database answered but rejected the command
    #[error("SQL error on {node}: {source}")]
    Sql {
        node: String,
        #[source]
        source: sqlx::Error,
    },

    /// The promotion candidate never caught up with the old primary
    #[error("Replica {node} did not reach GTID {target} in time (last seen: {last_seen})")]
    SyncTimeout {
        node: String,
        target: String,
        last_seen: String,
    },

    /// The traffic layer rejected or failed to confirm an update
    #[error("Traffic coordinator error: {0}")]
    TrafficCoordinatorError(String),

    /// No reachable replica can be promoted
    #[error("No eligible promotion candidate")]
    NoEligibleCandidate,

    /// A conditional status write lost against a concurrent update
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    /// A polling wait ran past its deadline
    #[error("Deadline exceeded: {last_error}")]
    DeadlineExceeded { last_error: String },

    /// The surrounding operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// A switchover phase failed and aborted the attempt
    #[error("Switchover phase {phase} failed: {source}")]
    PhaseFailed {
        phase: String,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether a fresh reconciliation pass can be expected to make progress
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(_)
            | Error::HttpError(_)
            | Error::Unreachable { .. }
            | Error::SyncTimeout { .. }
            | Error::TrafficCoordinatorError(_)
            | Error::NoEligibleCandidate
            | Error::ConcurrentModification(_)
            | Error::DeadlineExceeded { .. }
            | Error::Cancelled => true,
            Error::PhaseFailed { source, .. } => source.is_retriable(),
            Error::ConfigError(_)
            | Error::ValidationError(_)
            | Error::SerializationError(_)
            | Error::Sql { .. } => false,
        }
    }

    /// Whether the error means a node could not be reached at all
    pub fn is_unreachable(&self) -> bool {
        match self {
            Error::Unreachable { .. } => true,
            Error::PhaseFailed { source, .. } => source.is_unreachable(),
            _ => false,
        }
    }

    /// Short category label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
            Error::HttpError(_) => "http",
            Error::SerializationError(_) => "serialization",
            Error::Unreachable { .. } => "unreachable",
            Error::Sql { .. } => "sql",
            Error::SyncTimeout { .. } => "sync_timeout",
            Error::TrafficCoordinatorError(_) => "traffic",
            Error::NoEligibleCandidate => "no_candidate",
            Error::ConcurrentModification(_) => "conflict",
            Error::DeadlineExceeded { .. } => "deadline",
            Error::Cancelled => "cancelled",
            Error::PhaseFailed { .. } => "phase",
        }
    }
}
