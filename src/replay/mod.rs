//! Replay jobs and the background scheduler.

pub mod job;
pub mod scheduler;

pub use job::{JobStatus, ReplayJob, ReplayJobId, ReplayReport};
pub use scheduler::{ReplayExecutor, ReplayQueue, ReplayScheduler};
