//! Startup replay: reconcile the persisted snapshot with the log.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use super::log::{CorruptLine, LogScan};
use super::state::QueueState;
use super::Slot;
use crate::error::{Error, Result};
use crate::model::JobId;

/// In-memory queue state rebuilt at startup.
pub(crate) struct Recovered {
    pub state: QueueState,
    pub index: HashMap<JobId, Slot>,
    pub live: BTreeMap<u64, JobId>,
    pub log_entries: u64,
    pub corrupt: Vec<CorruptLine>,
}

/// Rebuild queue state from `snapshot` and a full replay of the log.
///
/// * Snapshot and log in the same generation: entries past the snapshot's
///   tail were appended after it was written and become pending.
/// * Log one generation ahead: compaction rewrote the log but crashed before
///   the snapshot. Every entry in the compacted log is live; the snapshot's
///   pending order comes first, then the rest in log order.
/// * Anything else is inconsistent and the queue refuses to start.
///
/// In-flight jobs whose lease expired while the process was down become
/// eligible for redelivery.
pub(crate) fn recover(
    snapshot: QueueState,
    scan: LogScan,
    now: DateTime<Utc>,
) -> Result<Recovered> {
    let log_generation = scan.generation.unwrap_or(snapshot.generation);
    let mut state = snapshot;

    let tail = if log_generation == state.generation {
        if state.tail_offset_bytes > scan.valid_len {
            return Err(Error::Startup(format!(
                "queue state covers {} log bytes but the log has {}",
                state.tail_offset_bytes, scan.valid_len
            )));
        }
        state.tail_offset_bytes
    } else if log_generation == state.generation + 1 {
        warn!(
            generation = log_generation,
            "log compaction finished without a matching snapshot, adopting compacted log"
        );
        state.generation = log_generation;
        // A compacted log holds only live entries, including any appended
        // after the compaction, so every entry is pending.
        scan.entries.first().map_or(scan.valid_len, |e| e.offset)
    } else {
        return Err(Error::Startup(format!(
            "queue log generation {log_generation} does not match state generation {}",
            state.generation
        )));
    };

    let by_id: HashMap<JobId, (u64, u64)> = scan
        .entries
        .iter()
        .map(|e| (e.job.id, (e.offset, e.len)))
        .collect();

    let mut seen = HashSet::new();
    let mut pending = std::collections::VecDeque::new();
    for id in state.pending_ids.drain(..) {
        if !by_id.contains_key(&id) {
            error!(job_id = %id, "pending job missing from log, dropping");
            continue;
        }
        if seen.insert(id) {
            pending.push_back(id);
        }
    }
    for entry in scan.entries.iter().filter(|e| e.offset >= tail) {
        if seen.insert(entry.job.id) {
            info!(job_id = %entry.job.id, "recovered job appended after last snapshot");
            pending.push_back(entry.job.id);
        }
    }
    state.pending_ids = pending;

    state.inflight.retain(|id, expiry| {
        if !seen.contains(id) {
            return false;
        }
        if *expiry <= now {
            info!(job_id = %id, "lease expired while stopped, job will be redelivered");
            return false;
        }
        true
    });
    state.retries.retain(|id, _| seen.contains(id));

    let mut index = HashMap::with_capacity(state.pending_ids.len());
    let mut live = BTreeMap::new();
    for id in &state.pending_ids {
        if let Some((offset, len)) = by_id.get(id) {
            index.insert(*id, Slot { offset: *offset, len: *len });
            live.insert(*offset, *id);
        }
    }

    state.tail_offset_bytes = scan.valid_len;
    state.read_offset_bytes = live.keys().next().copied().unwrap_or(scan.valid_len);

    Ok(Recovered {
        state,
        index,
        live,
        log_entries: (scan.entries.len() + scan.corrupt.len()) as u64,
        corrupt: scan.corrupt,
    })
}
