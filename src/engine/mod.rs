//! Job execution: a bounded pool of workers draining the durable queue.

pub mod pool;

pub use pool::{ShutdownHandle, WorkerPool};
