//! Persisted queue control state.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::JobId;

/// Snapshot of the queue's control state, rewritten atomically after every
/// control-state mutation.
///
/// `pending_ids` holds exactly the logged jobs that are neither acked nor
/// dead-lettered, in delivery order. `inflight` is a subset of it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    /// Offset of the oldest unfinished log entry (or the log end).
    pub read_offset_bytes: u64,
    /// Log length covered by this snapshot; entries past it were appended
    /// after the snapshot was written.
    #[serde(default)]
    pub tail_offset_bytes: u64,
    /// Compaction generation of the log this snapshot describes.
    #[serde(default)]
    pub generation: u64,
    pub pending_ids: VecDeque<JobId>,
    /// Lease expiry per leased job.
    pub inflight: BTreeMap<JobId, DateTime<Utc>>,
    /// Jobs that failed retryably at least once.
    #[serde(default)]
    pub retries: BTreeMap<JobId, RetryState>,
    pub done_count: u64,
    #[serde(default)]
    pub dead_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryState {
    pub attempts: u32,
    /// Not leased again before this instant.
    pub not_before: DateTime<Utc>,
    pub last_error: String,
}

impl QueueState {
    /// Jobs accepted and not yet finished.
    pub fn queued_jobs(&self) -> usize {
        self.pending_ids.len()
    }

    /// Drop every trace of a finished job.
    pub(crate) fn finish(&mut self, id: JobId) {
        self.inflight.remove(&id);
        self.retries.remove(&id);
        self.pending_ids.retain(|p| *p != id);
        self.done_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_json_shape() {
        let id = JobId::new();
        let mut state = QueueState::default();
        state.pending_ids.push_back(id);
        state.inflight.insert(id, Utc::now());

        let json = serde_json::to_value(&state).unwrap();
        assert!(json["pending_ids"].is_array());
        assert!(json["inflight"][id.to_string()].is_string());
        assert_eq!(json["done_count"], 0);

        let back: QueueState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn older_snapshots_without_optional_fields_load() {
        let raw = r#"{"read_offset_bytes":0,"pending_ids":[],"inflight":{},"done_count":7}"#;
        let state: QueueState = serde_json::from_str(raw).unwrap();
        assert_eq!(state.done_count, 7);
        assert_eq!(state.generation, 0);
    }

    #[test]
    fn finish_removes_job_everywhere() {
        let id = JobId::new();
        let mut state = QueueState::default();
        state.pending_ids.push_back(id);
        state.inflight.insert(id, Utc::now());
        state.retries.insert(
            id,
            RetryState {
                attempts: 1,
                not_before: Utc::now(),
                last_error: "x".into(),
            },
        );

        state.finish(id);
        assert_eq!(state.queued_jobs(), 0);
        assert!(state.inflight.is_empty());
        assert!(state.retries.is_empty());
        assert_eq!(state.done_count, 1);
    }
}
