//! # workvault
//!
//! Crash-safe job queue and sharded record store on the local filesystem.
//!
//! Producers append jobs to a [`queue::DurableQueue`]; an
//! [`engine::WorkerPool`] leases them and routes each to the
//! [`handler::JobHandler`] registered for its kind. Handlers keep per-entity
//! state in a [`records::ShardedRecordStore`]. Every file either store writes
//! goes through [`storage::AtomicFileStore`], so a crash never leaves a
//! half-written file behind.

pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod model;
pub mod queue;
pub mod records;
pub mod retry;
pub mod storage;
pub mod telemetry;

pub use error::{Error, Result};
