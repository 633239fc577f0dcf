// # -----------------------------
// # worker/src/lib.rs
// # -----------------------------
//! Check execution worker: pulls monitoring jobs from a Gearman job server,
//! runs each check in the sandbox and posts the result back.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod reporter;
pub mod worker_loop;

pub use config::{queue_names, Mode, Overrides, WorkerConfig};
pub use error::WorkerError;
pub use lifecycle::{Backoff, LifecycleState};
pub use pool::{JobState, PoolLink};
pub use reporter::{ReportStatus, Reporter};
pub use worker_loop::{LoopExit, Shutdown, WorkerLoop};
