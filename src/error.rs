//! Error types for workvault.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::JobId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(PathBuf),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// The queue is at its high-water mark.
    #[error("queue busy: {queued} jobs queued (high-water mark {high_water})")]
    Busy { queued: usize, high_water: usize },

    #[error("version conflict on {entity_id}: expected {expected}, found {actual}")]
    Conflict {
        entity_id: String,
        expected: u64,
        actual: u64,
    },

    /// Local retries were exhausted against the backing files.
    #[error("storage unavailable during {operation} after {attempts} attempts: {source}")]
    StorageUnavailable {
        operation: &'static str,
        attempts: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt shard {shard_id}: {reason}")]
    CorruptShard { shard_id: u32, reason: String },

    #[error("corrupt log entry at offset {offset}: {reason}")]
    CorruptLogEntry { offset: u64, reason: String },

    #[error("entity {0} was not declared for this transaction")]
    UndeclaredEntity(String),

    #[error("unknown job kind: {0}")]
    UnknownJobKind(String),

    /// Queue files are inconsistent; the queue refuses to open.
    #[error("startup failed: {0}")]
    Startup(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
