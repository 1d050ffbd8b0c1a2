//! Error types for the sentinel agent.
//!
//! A single [`SentinelError`] covers all components, split along the
//! taxonomy the agent lives by:
//!
//! - **Transient**: engine queries that failed mid-restart — retried by the
//!   executor, never surfaced directly.
//! - **Fatal invariant violations**: row counts that disagree after a copy,
//!   a required status variable missing, a malformed orchestrator response,
//!   a lock already held. These terminate the process (the top-level loop
//!   decides, components only return them).
//! - **Expected negatives** are not errors at all — they are `false`/empty
//!   returns on the component APIs.

use std::io;
use thiserror::Error;

/// Main error type for sentinel operations.
#[derive(Error, Debug)]
pub enum SentinelError {
    // Engine protocol errors
    #[error("can't connect to searchd at {0}")]
    EngineUnreachable(String),

    #[error("can't process query {statement}")]
    QueryFailed { statement: String },

    #[error("can't get table {table} count: {reason}")]
    CountUnavailable { table: String, reason: String },

    #[error("count after inserting into {dst} doesn't equal count from {src}: {dst_count} != {src_count}")]
    CountMismatch {
        src: String,
        dst: String,
        src_count: u64,
        dst_count: u64,
    },

    #[error("can't get chunks count for {0}")]
    ChunksUnavailable(String),

    #[error("can't remove table {table} from cluster: {reason}")]
    ClusterDetachFailed { table: String, reason: String },

    #[error("can't drop table {table}: {reason}")]
    DropFailed { table: String, reason: String },

    // Schema errors
    #[error("wrong table type {0}")]
    WrongTableType(String),

    #[error("malformed field rule token {0:?}")]
    MalformedFieldRule(String),

    #[error("fields were not initialized for {0}")]
    FieldsNotInitialized(String),

    #[error("row shape mismatch in batch insert: row {row} doesn't match the first row's columns")]
    RowShapeMismatch { row: usize },

    // Orchestrator errors
    #[error("orchestrator API response has no pod items")]
    MalformedPodList,

    #[error("orchestrator API request failed: {0}")]
    OrchestratorRequest(String),

    #[error("no suitable peer pod to join")]
    NoJoinablePeer,

    #[error("can't get available nodes list")]
    NoAvailableNodes,

    #[error("can't resolve hostname: {0}")]
    Hostname(String),

    // Locking errors
    #[error("lock {0} is already held by another process")]
    LockHeld(String),

    #[error("optimize lock path is not configured")]
    OptimizePathMissing,

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SentinelError {
    /// Whether this error must terminate the process.
    ///
    /// Fatal errors indicate a logic/data bug or an unrecoverable race;
    /// retrying would risk corrupting cluster state. The top-level loop
    /// converts them into a non-zero exit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SentinelError::QueryFailed { .. }
                | SentinelError::EngineUnreachable(_)
                | SentinelError::CountMismatch { .. }
                | SentinelError::ChunksUnavailable(_)
                | SentinelError::MalformedPodList
                | SentinelError::NoJoinablePeer
                | SentinelError::NoAvailableNodes
                | SentinelError::LockHeld(_)
                | SentinelError::RowShapeMismatch { .. }
        )
    }

    /// Process exit status for fatal errors.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

/// Result type alias for sentinel operations.
pub type Result<T> = std::result::Result<T, SentinelError>;
