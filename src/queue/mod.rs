//! Durable job queue.
//!
//! Jobs are appended to a log before anything else learns about them. The
//! delivery state (pending order, leases, retry schedule, counters) lives in
//! a snapshot file rewritten atomically after every change. Enqueue, lease and
//! ack all go through one control-state lock, so concurrent workers can never
//! interleave their updates to it.
//!
//! Delivery is at-least-once: a lease that expires without an ack makes the
//! job eligible again, and handlers must tolerate seeing a job twice.

mod log;
mod recovery;
mod state;

pub use state::{QueueState, RetryState};

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tracing::{debug, error, info, warn};

use crate::config::{Backpressure, QueueConfig};
use crate::error::{Error, Result};
use crate::model::{DeadLetter, Job, JobId, JobState, NewJob, Outcome};
use crate::retry::RetryPolicy;
use crate::storage::AtomicFileStore;
use crate::telemetry::metrics;

use self::log::{LogLine, encode_line, open_append, read_job_at, scan};

const LOG_FILE: &str = "queue.log";
const STATE_FILE: &str = "queue.state.json";
const DEAD_LETTER_FILE: &str = "dead_letter.log";
const CORRUPT_FILE: &str = "corrupt.log";

/// Location of a live job line in the log.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Slot {
    offset: u64,
    len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub inflight: usize,
    pub waiting_retry: usize,
    pub done: u64,
    pub dead: u64,
    pub log_bytes: u64,
    pub log_entries: u64,
    pub generation: u64,
}

struct Paths {
    log: PathBuf,
    state: PathBuf,
    dead: PathBuf,
    corrupt: PathBuf,
}

/// Everything guarded by the control-state lock.
struct Inner {
    state: QueueState,
    /// Append handle for the log. `None` after compaction replaced the file
    /// until the next append reopens it.
    log: Option<tokio::fs::File>,
    log_len: u64,
    /// Job lines in the current log file, live or finished.
    log_entries: u64,
    index: HashMap<JobId, Slot>,
    /// Live entries by log offset; the first key is the read offset.
    live: BTreeMap<u64, JobId>,
}

impl Inner {
    /// Read offset once `finished` is no longer live.
    fn read_offset_without(&self, finished: JobId) -> u64 {
        self.live
            .iter()
            .find(|(_, id)| **id != finished)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.log_len)
    }

    fn forget(&mut self, id: JobId) {
        if let Some(slot) = self.index.remove(&id) {
            self.live.remove(&slot.offset);
        }
    }

    fn finished_entries(&self) -> u64 {
        self.log_entries.saturating_sub(self.live.len() as u64)
    }

    async fn log_file(&mut self, path: &Path) -> Result<&mut tokio::fs::File> {
        let file = match self.log.take() {
            Some(file) => file,
            None => open_append(path).await?,
        };
        Ok(self.log.insert(file))
    }
}

pub struct DurableQueue {
    dir: PathBuf,
    paths: Paths,
    files: AtomicFileStore,
    config: QueueConfig,
    backoff: RetryPolicy,
    inner: Mutex<Inner>,
    /// Signalled when a job becomes leasable.
    ready: Notify,
    /// Signalled when queued jobs drop below the high-water mark.
    space: Notify,
}

impl DurableQueue {
    /// Open the queue in `dir`, replaying the log and reconciling it with the
    /// last snapshot. Inconsistent or unreadable queue files are fatal.
    pub async fn open(dir: impl Into<PathBuf>, config: QueueConfig) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let paths = Paths {
            log: dir.join(LOG_FILE),
            state: dir.join(STATE_FILE),
            dead: dir.join(DEAD_LETTER_FILE),
            corrupt: dir.join(CORRUPT_FILE),
        };
        let files = AtomicFileStore::new();
        files.sweep_temp_files(&dir).await?;

        let snapshot = match files.read_if_exists(&paths.state).await? {
            Some(bytes) => serde_json::from_slice::<QueueState>(&bytes).map_err(|e| {
                Error::Startup(format!("unreadable queue state {}: {e}", paths.state.display()))
            })?,
            None => QueueState::default(),
        };

        let log_bytes = match files.read_if_exists(&paths.log).await? {
            Some(bytes) if !bytes.is_empty() => bytes,
            _ => {
                if !snapshot.pending_ids.is_empty() || snapshot.tail_offset_bytes > 0 {
                    return Err(Error::Startup(format!(
                        "queue log {} is missing but state references {} jobs",
                        paths.log.display(),
                        snapshot.pending_ids.len()
                    )));
                }
                let header = encode_line(&LogLine::Header {
                    generation: snapshot.generation,
                })?;
                files.write(&paths.log, header.clone()).await?;
                header
            }
        };

        let scanned = scan(&log_bytes);
        if scanned.generation.is_none() {
            return Err(Error::Startup(format!(
                "queue log {} has no header",
                paths.log.display()
            )));
        }
        if scanned.torn_tail {
            warn!(
                valid_len = scanned.valid_len,
                file_len = log_bytes.len(),
                "truncating partial entry at end of queue log"
            );
            truncate(&paths.log, scanned.valid_len).await?;
        }
        let log_len = scanned.valid_len;

        let recovered = recovery::recover(snapshot, scanned, Utc::now())?;
        for line in &recovered.corrupt {
            error!(
                offset = line.offset,
                reason = %line.reason,
                "corrupt queue log entry quarantined"
            );
            append_line(&paths.corrupt, &line.raw).await?;
        }

        let inner = Inner {
            state: recovered.state,
            log: Some(open_append(&paths.log).await?),
            log_len,
            log_entries: recovered.log_entries,
            index: recovered.index,
            live: recovered.live,
        };

        let backoff = RetryPolicy::exponential(usize::MAX, config.retry_base_delay)
            .with_max_delay(config.retry_max_delay);
        let queue = Self {
            dir,
            paths,
            files,
            config,
            backoff,
            inner: Mutex::new(inner),
            ready: Notify::new(),
            space: Notify::new(),
        };

        {
            let inner = queue.inner.lock().await;
            queue.save_state(&inner.state).await.map_err(|e| {
                Error::Startup(format!("cannot persist recovered queue state: {e}"))
            })?;
            info!(
                dir = %queue.dir.display(),
                queued = inner.state.queued_jobs(),
                inflight = inner.state.inflight.len(),
                generation = inner.state.generation,
                "queue opened"
            );
        }
        Ok(queue)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Append a job to the log and queue it.
    ///
    /// The append is durable before any bookkeeping changes. At the high-water
    /// mark this either fails with [`Error::Busy`] or waits, per
    /// [`Backpressure`].
    pub async fn enqueue(&self, new: NewJob) -> Result<JobId> {
        if !self.config.kinds.is_empty() && !self.config.kinds.contains(&new.kind) {
            return Err(Error::UnknownJobKind(new.kind));
        }

        let mut inner = self.admit().await?;

        let job = Job {
            id: JobId::new(),
            kind: new.kind,
            payload: new.payload,
            enqueued_at: Utc::now(),
            attempts: 0,
            max_attempts: new.max_attempts.unwrap_or(self.config.default_max_attempts),
        };
        let line = encode_line(&LogLine::Job(job.clone()))?;

        let offset = inner.log_len;
        let log = inner.log_file(&self.paths.log).await?;
        if let Err(e) = append_durably(log, &line).await {
            // Cut off any partial line so later appends start clean.
            if let Err(trunc) = log.set_len(offset).await {
                error!(offset, "cannot roll back failed log append: {trunc}");
            }
            return Err(e);
        }

        let len = line.len() as u64;
        inner.log_len += len;
        inner.log_entries += 1;
        inner.index.insert(job.id, Slot { offset, len });
        inner.live.insert(offset, job.id);
        let log_len = inner.log_len;
        let read_offset = inner.live.keys().next().copied().unwrap_or(log_len);
        inner.state.pending_ids.push_back(job.id);
        inner.state.tail_offset_bytes = log_len;
        inner.state.read_offset_bytes = read_offset;

        // The log is authoritative for enqueued jobs; a stale snapshot is
        // repaired by the next save or by recovery.
        if let Err(e) = self.save_state(&inner.state).await {
            warn!(job_id = %job.id, "queue snapshot not saved after enqueue: {e}");
        }

        metrics::jobs_enqueued().add(1, &[KeyValue::new("kind", job.kind.clone())]);
        debug!(
            job_id = %job.id,
            kind = %job.kind,
            queued = inner.state.queued_jobs(),
            "job enqueued"
        );
        drop(inner);
        self.ready.notify_one();
        Ok(job.id)
    }

    /// Lease up to `n` ready jobs for `lease_duration`.
    ///
    /// A job is ready when it is not under an unexpired lease and its retry
    /// backoff (if any) has elapsed. Jobs are taken in pending order.
    pub async fn lease_batch(&self, n: usize, lease_duration: Duration) -> Result<Vec<Job>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let expiry = deadline(now, lease_duration, "lease duration")?;

        let chosen: Vec<JobId> = inner
            .state
            .pending_ids
            .iter()
            .filter(|id| inner.state.inflight.get(id).is_none_or(|expiry| *expiry <= now))
            .filter(|id| inner.state.retries.get(id).is_none_or(|r| r.not_before <= now))
            .take(n)
            .copied()
            .collect();
        if chosen.is_empty() {
            return Ok(Vec::new());
        }

        let mut reader = tokio::fs::File::open(&self.paths.log).await?;
        let mut jobs = Vec::with_capacity(chosen.len());
        for id in &chosen {
            let slot = inner.index.get(id).copied().ok_or(Error::JobNotFound(*id))?;
            let mut job = read_job_at(&mut reader, slot.offset, slot.len).await?;
            if let Some(retry) = inner.state.retries.get(id) {
                job.attempts = retry.attempts;
            }
            jobs.push(job);
        }

        let mut next = inner.state.clone();
        for id in &chosen {
            if next.inflight.insert(*id, expiry).is_some() {
                warn!(job_id = %id, "lease expired without ack, redelivering");
            }
        }
        self.commit(&mut inner, next).await?;

        metrics::jobs_leased().add(jobs.len() as u64, &[]);
        debug!(count = jobs.len(), "jobs leased");
        Ok(jobs)
    }

    /// Record the outcome of a leased job. Returns the state it moved to.
    ///
    /// * `Success` finishes the job.
    /// * `RetryableFailure` requeues it at the back behind an exponential
    ///   backoff, or dead-letters it once `max_attempts` is reached.
    /// * `TerminalFailure` dead-letters it.
    pub async fn ack(&self, id: JobId, outcome: Outcome) -> Result<JobState> {
        let mut inner = self.inner.lock().await;
        if !inner.state.inflight.contains_key(&id) {
            return if inner.index.contains_key(&id) {
                Err(Error::Other(format!("job {id} is not leased")))
            } else {
                Err(Error::JobNotFound(id))
            };
        }

        let result = match outcome {
            Outcome::Success => {
                let mut next = inner.state.clone();
                next.finish(id);
                next.read_offset_bytes = inner.read_offset_without(id);
                self.commit(&mut inner, next).await?;
                inner.forget(id);
                info!(job_id = %id, "job acked");
                JobState::Acked
            }
            Outcome::RetryableFailure(reason) => {
                let job = self.read_job(&inner, id).await?;
                let attempts = inner.state.retries.get(&id).map_or(0, |r| r.attempts) + 1;
                if attempts < job.max_attempts {
                    let delay = self.backoff.delay_for_attempt(attempts as usize);
                    let not_before = deadline(Utc::now(), delay, "retry delay")?;
                    let mut next = inner.state.clone();
                    next.inflight.remove(&id);
                    next.pending_ids.retain(|p| *p != id);
                    next.pending_ids.push_back(id);
                    next.retries.insert(
                        id,
                        RetryState {
                            attempts,
                            not_before,
                            last_error: reason.clone(),
                        },
                    );
                    self.commit(&mut inner, next).await?;
                    warn!(
                        job_id = %id,
                        attempts,
                        max_attempts = job.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "job failed, retry scheduled"
                    );
                    JobState::RetryPending
                } else {
                    let final_error =
                        format!("exhausted {attempts}/{} attempts: {reason}", job.max_attempts);
                    self.dead_letter(&mut inner, job, attempts, final_error).await?;
                    JobState::DeadLettered
                }
            }
            Outcome::TerminalFailure(reason) => {
                let job = self.read_job(&inner, id).await?;
                let attempts = inner.state.retries.get(&id).map_or(0, |r| r.attempts);
                self.dead_letter(&mut inner, job, attempts, reason).await?;
                JobState::DeadLettered
            }
        };

        if result.is_terminal() {
            self.space.notify_waiters();
            if let Err(e) = self.maybe_compact(&mut inner).await {
                error!("queue compaction failed: {e}");
            }
        }
        Ok(result)
    }

    /// Rewrite the log without finished entries. Returns `false` when there
    /// was nothing to drop.
    pub async fn compact(&self) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        self.compact_locked(&mut inner).await
    }

    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        QueueStats {
            queued: inner.state.queued_jobs(),
            inflight: inner.state.inflight.len(),
            waiting_retry: inner
                .state
                .retries
                .values()
                .filter(|r| r.not_before > now)
                .count(),
            done: inner.state.done_count,
            dead: inner.state.dead_count,
            log_bytes: inner.log_len,
            log_entries: inner.log_entries,
            generation: inner.state.generation,
        }
    }

    /// Copy of the current control state.
    pub async fn snapshot(&self) -> QueueState {
        self.inner.lock().await.state.clone()
    }

    /// The most recent `limit` dead-lettered jobs, oldest first.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let Some(bytes) = self.files.read_if_exists(&self.paths.dead).await? else {
            return Ok(Vec::new());
        };
        let mut letters = Vec::new();
        for (n, line) in bytes.split(|b| *b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<DeadLetter>(line) {
                Ok(letter) => letters.push(letter),
                Err(e) => warn!(line = n + 1, "skipping unreadable dead letter: {e}"),
            }
        }
        let skip = letters.len().saturating_sub(limit);
        Ok(letters.split_off(skip))
    }

    /// Wait until a job may be ready, or `max_wait` elapses.
    pub async fn wait_ready(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.ready.notified()).await;
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Take the control lock with room for one more job.
    async fn admit(&self) -> Result<MutexGuard<'_, Inner>> {
        loop {
            let inner = self.inner.lock().await;
            let Some(high_water) = self.config.high_water_mark else {
                return Ok(inner);
            };
            let queued = inner.state.queued_jobs();
            if queued < high_water {
                return Ok(inner);
            }
            match self.config.backpressure {
                Backpressure::Reject => {
                    metrics::queue_rejected().add(1, &[]);
                    return Err(Error::Busy { queued, high_water });
                }
                Backpressure::Block => {
                    let notified = self.space.notified();
                    drop(inner);
                    debug!(queued, high_water, "enqueue waiting for queue space");
                    notified.await;
                }
            }
        }
    }

    async fn read_job(&self, inner: &Inner, id: JobId) -> Result<Job> {
        let slot = inner.index.get(&id).copied().ok_or(Error::JobNotFound(id))?;
        let mut reader = tokio::fs::File::open(&self.paths.log).await?;
        read_job_at(&mut reader, slot.offset, slot.len).await
    }

    /// Dead-letter log first, then the control state.
    async fn dead_letter(
        &self,
        inner: &mut Inner,
        mut job: Job,
        attempts: u32,
        final_error: String,
    ) -> Result<()> {
        let id = job.id;
        job.attempts = attempts;
        let letter = DeadLetter {
            job,
            final_error,
            failed_at: Utc::now(),
        };
        let line = encode_line(&letter)?;
        let mut file = open_append(&self.paths.dead).await?;
        append_durably(&mut file, &line).await?;

        let mut next = inner.state.clone();
        next.finish(id);
        next.dead_count += 1;
        next.read_offset_bytes = inner.read_offset_without(id);
        self.commit(inner, next).await?;
        inner.forget(id);

        error!(
            job_id = %id,
            kind = %letter.job.kind,
            error = %letter.final_error,
            "job dead-lettered"
        );
        Ok(())
    }

    async fn maybe_compact(&self, inner: &mut Inner) -> Result<()> {
        let finished = inner.finished_entries();
        if finished == 0 || (finished as usize) < self.config.compact_min_entries {
            return Ok(());
        }
        if (finished as f64) / (inner.log_entries as f64) < self.config.compact_ratio {
            return Ok(());
        }
        self.compact_locked(inner).await.map(|_| ())
    }

    async fn compact_locked(&self, inner: &mut Inner) -> Result<bool> {
        let dropped = inner.finished_entries();
        if dropped == 0 {
            return Ok(false);
        }
        let start = Instant::now();
        let old = self.files.read(&self.paths.log).await?;
        let generation = inner.state.generation + 1;

        let mut out = encode_line(&LogLine::Header { generation })?;
        let mut index = HashMap::with_capacity(inner.live.len());
        let mut live = BTreeMap::new();
        for id in inner.live.values() {
            let slot = inner.index.get(id).copied().ok_or(Error::JobNotFound(*id))?;
            let (from, to) = (slot.offset as usize, (slot.offset + slot.len) as usize);
            let line = old.get(from..to).ok_or_else(|| Error::CorruptLogEntry {
                offset: slot.offset,
                reason: "entry extends past end of log".to_string(),
            })?;
            let offset = out.len() as u64;
            out.extend_from_slice(line);
            index.insert(*id, Slot { offset, len: slot.len });
            live.insert(offset, *id);
        }
        let new_len = out.len() as u64;
        if let Err(e) = self.files.write(&self.paths.log, out).await {
            // The rename can land before a later step of the write fails.
            if !self.log_has_generation(generation).await {
                return Err(e);
            }
            warn!(generation, "compacted log is in place despite write error: {e}");
        }

        // Nothing fallible from here on: the in-memory view must match the
        // file now in place. The old append handle points at the replaced
        // file; the next append opens the new one.
        inner.log = None;
        inner.log_len = new_len;
        inner.log_entries = live.len() as u64;
        inner.index = index;
        inner.live = live;

        let mut next = inner.state.clone();
        next.generation = generation;
        next.tail_offset_bytes = new_len;
        next.read_offset_bytes = inner.live.keys().next().copied().unwrap_or(new_len);
        // The rewritten log is already in place; recovery adopts it if this
        // snapshot is lost.
        if let Err(e) = self.save_state(&next).await {
            warn!(generation, "snapshot not saved after compaction: {e}");
        }
        inner.state = next;

        metrics::compactions().add(1, &[]);
        metrics::operation_duration_ms().record(
            start.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "queue.compact")],
        );
        info!(generation, dropped, log_bytes = new_len, "queue log compacted");
        Ok(true)
    }

    async fn log_has_generation(&self, generation: u64) -> bool {
        match self.files.read(&self.paths.log).await {
            Ok(bytes) => scan(&bytes).generation == Some(generation),
            Err(_) => false,
        }
    }

    /// Persist `next`, then adopt it.
    async fn commit(&self, inner: &mut Inner, next: QueueState) -> Result<()> {
        self.save_state(&next).await?;
        inner.state = next;
        Ok(())
    }

    async fn save_state(&self, state: &QueueState) -> Result<()> {
        self.files
            .write(&self.paths.state, serde_json::to_vec_pretty(state)?)
            .await
    }
}

async fn append_durably(file: &mut tokio::fs::File, line: &[u8]) -> Result<()> {
    file.write_all(line).await?;
    file.flush().await?;
    file.sync_data().await?;
    Ok(())
}

async fn append_line(path: &Path, raw: &[u8]) -> Result<()> {
    let mut line = raw.to_vec();
    line.push(b'\n');
    let mut file = open_append(path).await?;
    append_durably(&mut file, &line).await
}

async fn truncate(path: &Path, len: u64) -> Result<()> {
    let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.set_len(len).await?;
    file.sync_all().await?;
    Ok(())
}

/// `now + d`, or a config error when that is not a representable time.
fn deadline(now: DateTime<Utc>, d: Duration, what: &str) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| Error::Config(format!("{what} {d:?} is out of range")))
}

