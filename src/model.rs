//! Core data model.
//!
//! A job is a unit of work appended to the durable log. A record is a
//! versioned value owned by exactly one shard of the record store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A job as written to the queue log.
///
/// Immutable once appended, except `attempts`, which the queue overlays from
/// its control state when the job is leased.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    /// Which registered handler processes this job.
    pub kind: String,

    /// Arbitrary payload. The queue never interprets it.
    pub payload: serde_json::Value,

    pub enqueued_at: DateTime<Utc>,

    /// Retryable failures so far.
    pub attempts: u32,

    /// Attempts allowed before the job is dead-lettered.
    pub max_attempts: u32,
}

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(JobId)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Delivery state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a worker.
    Pending,
    /// Leased by a worker.
    InFlight,
    /// Failed retryably, waiting out its backoff.
    RetryPending,
    /// Handled successfully. Terminal.
    Acked,
    /// Exhausted retries or failed terminally. Terminal.
    DeadLettered,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Acked | JobState::DeadLettered)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::InFlight => "in_flight",
            JobState::RetryPending => "retry_pending",
            JobState::Acked => "acked",
            JobState::DeadLettered => "dead_lettered",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What a handler decided about a job. Always computed before the job is acked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    RetryableFailure(String),
    TerminalFailure(String),
}

impl Outcome {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Outcome::RetryableFailure(reason.into())
    }

    pub fn terminal(reason: impl Into<String>) -> Self {
        Outcome::TerminalFailure(reason.into())
    }

    /// Metric label for this outcome.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::RetryableFailure(_) => "retryable",
            Outcome::TerminalFailure(_) => "terminal",
        }
    }
}

// ---------------------------------------------------------------------------
// Dead letter
// ---------------------------------------------------------------------------

/// A job that exhausted its retries, as written to the dead-letter log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    #[serde(flatten)]
    pub job: Job,
    pub final_error: String,
    pub failed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// A versioned entity value. Callers always receive copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<T> {
    pub entity_id: String,
    /// Incremented on every successful write.
    pub version: u64,
    pub data: T,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new jobs. The producer-facing half of the queue API.
pub struct NewJob {
    pub(crate) kind: String,
    pub(crate) payload: serde_json::Value,
    pub(crate) max_attempts: Option<u32>,
}

impl NewJob {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            max_attempts: None,
        }
    }

    /// Override the queue's default attempt limit.
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n.max(1));
        self
    }
}
