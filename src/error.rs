//! Error types shared by the admission engine and path selection.

use crate::endpoint::{NodeId, RackId};
use thiserror::Error;

/// Failures surfaced by the scheduler to its driver.
///
/// Configuration and sizing problems are fatal and reported at
/// initialization/reset. Resource exhaustion on the matching/output path means the
/// rings or pools were sized too small for the workload and is reported as-is rather
/// than skipping a timeslot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// Invalid topology or engine parameters.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// A source or destination outside the configured topology.
    #[error("{what} {value} out of range (limit {limit})")]
    OutOfRange {
        what: &'static str,
        value: usize,
        limit: usize,
    },

    /// A ring had no room at a point where the engine cannot wait.
    #[error("queue `{queue}` is full")]
    QueueFull { queue: &'static str },

    /// A pool had no free object at a point where the engine cannot wait.
    #[error("pool `{pool}` is exhausted")]
    PoolExhausted { pool: &'static str },

    /// An admitted batch already holds as many edges as it can.
    #[error("admitted batch full ({capacity} edges)")]
    BatchFull { capacity: usize },

    /// A spent report larger than the outstanding backlog for that pair.
    #[error("ledger underflow for {src}->{dst}: outstanding {outstanding}, spent {spent}")]
    LedgerUnderflow {
        src: NodeId,
        dst: NodeId,
        outstanding: u64,
        spent: u64,
    },

    /// An admitted edge names a rack the path selector does not know about.
    #[error("rack {rack} out of range ({rack_count} racks)")]
    RackOutOfRange { rack: RackId, rack_count: usize },

    /// Requests handed to the batch driver went backwards in time.
    #[error("request for timeslot {timeslot} arrived after timeslot {previous}")]
    UnorderedRequest { previous: u64, timeslot: u64 },

    /// A shard worker thread could not be started.
    #[error("failed to spawn shard worker {shard}: {message}")]
    WorkerSpawn { shard: usize, message: String },

    /// A shard worker thread is gone.
    #[error("shard worker {shard} stopped")]
    WorkerStopped { shard: usize },

    /// Configuration could not be parsed.
    #[error("serialization error: {message}")]
    Serialization { message: String },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SchedError>;

impl SchedError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        SchedError::Configuration {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for SchedError {
    fn from(err: serde_json::Error) -> Self {
        SchedError::Serialization {
            message: err.to_string(),
        }
    }
}
