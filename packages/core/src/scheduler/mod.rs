//! Recurring background jobs.
//!
//! Jobs are registered by id with a [`Trigger`] and a callable, run on their
//! own tokio tasks, and tracked with success/failure bookkeeping. Failures
//! raise an ERROR alert through the [`AlertDispatcher`](crate::alerts::AlertDispatcher)
//! and never reach the scheduling loop.

pub mod engine;
pub mod error;
pub mod job;
pub mod trigger;

pub use engine::{JobScheduler, SchedulerHandle, MAX_IDLE_SLEEP, SHUTDOWN_GRACE};
pub use error::{JobError, JobResult};
pub use job::{job_fn, JobFn, JobFuture, JobOptions, JobSnapshot, ScheduledJob};
pub use trigger::Trigger;
