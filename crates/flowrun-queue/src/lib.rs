//! Job queue and dispatcher.
//!
//! Runs execute by way of jobs: a start job for a fresh run, a resume job
//! for a paused one. Delivery is at-least-once with leases; per-key
//! concurrency ceilings bound how many runs of one flow execute at a time,
//! and jobs that exhaust their delivery budget are dead-lettered, failing
//! their run.

mod dispatcher;
mod error;
mod job;
mod queue;

pub use dispatcher::{Dispatcher, StopRegistry};
pub use error::{QueueError, Result};
pub use job::{ClaimToken, ClaimedJob, ConcurrencyKey, Job, JobKind};
pub use queue::{JobQueue, QueueConfig, SweepOutcome};
