//! Job handlers and the registry that routes jobs to them by kind.
//!
//! The set of kinds is closed: a worker pool refuses to start if the queue
//! accepts a kind nobody handles.

pub mod command;

pub use command::{CommandConfig, CommandHandler};

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::{Error, Result};
use crate::model::{Job, Outcome};

/// Processes one job and decides its outcome.
///
/// A job may be delivered more than once (after a lease expiry or a crash),
/// so implementations must be idempotent or dedup on something stored
/// alongside their side effects.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn process(&self, job: &Job) -> Outcome;
}

/// Adapter for plain async closures.
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Outcome> + Send,
{
    async fn process(&self, job: &Job) -> Outcome {
        (self.0)(job.clone()).await
    }
}

/// Wrap an async closure as a [`JobHandler`].
pub fn from_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handlers indexed by job kind.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: impl Into<String>, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(kind.into(), handler);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Fail unless every kind in `kinds` has a handler.
    pub fn ensure_covers(&self, kinds: &[String]) -> Result<()> {
        let mut missing: Vec<&str> = kinds
            .iter()
            .filter(|k| !self.handlers.contains_key(k.as_str()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort_unstable();
        Err(Error::Config(format!(
            "no handler registered for job kinds: {}",
            missing.join(", ")
        )))
    }

    /// Build a registry of [`CommandHandler`]s from every `.toml` file in
    /// `dir`.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::new();

        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read handler dir {}: {e}", dir.display()))
        })?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "toml") {
                continue;
            }
            let config = CommandConfig::from_file(&path)?;
            if registry.handlers.contains_key(&config.kind) {
                return Err(Error::Config(format!(
                    "duplicate handler for kind {} in {}",
                    config.kind,
                    path.display()
                )));
            }
            info!(
                kind = %config.kind,
                command = %config.command.display(),
                "loaded command handler"
            );
            let kind = config.kind.clone();
            registry.register(kind, Arc::new(CommandHandler::new(config)));
        }

        Ok(registry)
    }
}
