//! Fixed-size worker pool: lease, run the handler, ack.

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, warn};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::handler::HandlerRegistry;
use crate::model::{Job, Outcome};
use crate::queue::DurableQueue;
use crate::telemetry::job::{record_state_transition, start_job_span};
use crate::telemetry::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    /// No new leases; in-flight jobs may finish.
    Draining,
    /// Grace period over; in-flight handlers are abandoned unacked.
    Stopped,
}

/// Requests a graceful shutdown of a running [`WorkerPool`].
#[derive(Clone)]
pub struct ShutdownHandle {
    phase: Arc<watch::Sender<Phase>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.phase.send_if_modified(|phase| {
            if *phase == Phase::Running {
                *phase = Phase::Draining;
                true
            } else {
                false
            }
        });
    }
}

/// Runs `W` workers against one queue. Concurrency never exceeds `W`,
/// however fast producers enqueue.
pub struct WorkerPool {
    queue: Arc<DurableQueue>,
    registry: Arc<HandlerRegistry>,
    config: PoolConfig,
    phase: Arc<watch::Sender<Phase>>,
}

impl WorkerPool {
    /// Fails with [`Error::Config`] if the queue accepts a kind that has no
    /// handler.
    pub fn new(
        queue: Arc<DurableQueue>,
        registry: Arc<HandlerRegistry>,
        config: PoolConfig,
    ) -> Result<Self> {
        if config.workers == 0 {
            return Err(Error::Config("worker pool needs at least one worker".into()));
        }
        registry.ensure_covers(&queue.config().kinds)?;
        let (phase, _) = watch::channel(Phase::Running);
        Ok(Self {
            queue,
            registry,
            config,
            phase: Arc::new(phase),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            phase: Arc::clone(&self.phase),
        }
    }

    /// Run until shutdown is requested and the workers have stopped.
    ///
    /// After shutdown, in-flight jobs get `shutdown_grace` to finish. Jobs
    /// still running after that are abandoned without an ack; their leases
    /// run out and they are delivered again.
    pub async fn run(&self) -> Result<()> {
        let mut workers = JoinSet::new();
        for n in 0..self.config.workers {
            let worker = Worker {
                queue: Arc::clone(&self.queue),
                registry: Arc::clone(&self.registry),
                config: self.config.clone(),
                phase: self.phase.subscribe(),
            };
            workers.spawn(worker.run().instrument(tracing::info_span!("worker", worker = n)));
        }
        info!(workers = self.config.workers, "worker pool started");

        let mut phase = self.phase.subscribe();
        let _ = phase.wait_for(|p| *p != Phase::Running).await;
        info!(
            grace_ms = self.config.shutdown_grace.as_millis() as u64,
            "shutdown requested, draining workers"
        );

        let drained = tokio::time::timeout(self.config.shutdown_grace, join_all(&mut workers))
            .await
            .is_ok();
        if !drained {
            warn!("shutdown grace expired, abandoning in-flight jobs");
            self.phase.send_replace(Phase::Stopped);
            join_all(&mut workers).await;
        }
        info!("worker pool stopped");
        Ok(())
    }
}

async fn join_all(workers: &mut JoinSet<()>) {
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            error!("worker task failed: {e}");
        }
    }
}

struct Worker {
    queue: Arc<DurableQueue>,
    registry: Arc<HandlerRegistry>,
    config: PoolConfig,
    phase: watch::Receiver<Phase>,
}

impl Worker {
    async fn run(mut self) {
        debug!("worker started");
        while self.is_running() {
            let job = match self.queue.lease_batch(1, self.config.lease_duration).await {
                Ok(jobs) => jobs.into_iter().next(),
                Err(e) => {
                    error!("lease failed: {e}");
                    None
                }
            };
            match job {
                Some(job) => self.process(job).await,
                None => {
                    tokio::select! {
                        _ = self.queue.wait_ready(self.config.poll_interval) => {}
                        _ = self.phase.changed() => {}
                    }
                }
            }
        }
        debug!("worker stopped");
    }

    fn is_running(&self) -> bool {
        *self.phase.borrow() == Phase::Running
    }

    async fn process(&mut self, job: Job) {
        let span = start_job_span(&job.kind, &job.id, job.attempts + 1);
        record_state_transition(&span, "pending", "in_flight");
        let id = job.id;
        let kind = job.kind.clone();
        let start = Instant::now();

        let Some(outcome) = self.execute(job).instrument(span.clone()).await else {
            // Left leased on purpose; the lease expiry redelivers it.
            span.in_scope(|| warn!(job_id = %id, "shutdown interrupted job, leaving it unacked"));
            return;
        };

        let label = outcome.label();
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        match self.queue.ack(id, outcome).instrument(span.clone()).await {
            Ok(state) => {
                record_state_transition(&span, "in_flight", &state.to_string());
                metrics::jobs_acked().add(
                    1,
                    &[KeyValue::new("kind", kind), KeyValue::new("outcome", label)],
                );
                metrics::operation_duration_ms()
                    .record(duration_ms, &[KeyValue::new("operation", "job.process")]);
            }
            Err(e) => span.in_scope(|| {
                error!(job_id = %id, "ack failed, job will be redelivered: {e}")
            }),
        }
    }

    /// Run the job's handler in its own task. `None` if shutdown stopped it.
    async fn execute(&mut self, job: Job) -> Option<Outcome> {
        let Some(handler) = self.registry.get(&job.kind) else {
            warn!(kind = %job.kind, "no handler for job kind, dead-lettering");
            return Some(Outcome::terminal(format!("no handler for job kind {}", job.kind)));
        };

        let mut task =
            tokio::spawn(async move { handler.process(&job).await }.in_current_span());
        let timeout = self.config.job_timeout;

        tokio::select! {
            result = tokio::time::timeout(timeout, &mut task) => Some(match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) if e.is_panic() => {
                    let message = panic_message(e.into_panic());
                    error!(%message, "handler panicked");
                    Outcome::retryable(format!("handler panicked: {message}"))
                }
                Ok(Err(e)) => Outcome::retryable(format!("handler task failed: {e}")),
                Err(_) => {
                    task.abort();
                    warn!(timeout_ms = timeout.as_millis() as u64, "handler timed out");
                    Outcome::retryable(format!("handler timed out after {}ms", timeout.as_millis()))
                }
            }),
            _ = wait_stopped(&mut self.phase) => {
                task.abort();
                None
            }
        }
    }
}

async fn wait_stopped(phase: &mut watch::Receiver<Phase>) {
    let _ = phase.wait_for(|p| *p == Phase::Stopped).await;
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
