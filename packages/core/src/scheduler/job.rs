//! Job records and the callable shape the scheduler runs.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::JobResult;
use super::trigger::Trigger;

pub type JobFuture = Pin<Box<dyn Future<Output = JobResult> + Send>>;

/// A job callable. Invoked once per fire; each call returns a fresh future.
pub type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Box an async closure into a [`JobFn`].
pub fn job_fn<F, Fut>(f: F) -> JobFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// A self-describing recurring job.
#[async_trait]
pub trait ScheduledJob: Send + Sync + 'static {
    /// Unique identifier; registering a second job with the same id replaces
    /// the first.
    fn id(&self) -> &str;

    fn name(&self) -> &str {
        self.id()
    }

    fn trigger(&self) -> Trigger;

    /// Let a new fire start while the previous one is still running.
    fn allow_overlap(&self) -> bool {
        false
    }

    async fn run(&self) -> JobResult;
}

#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub name: Option<String>,
    pub allow_overlap: bool,
}

pub(crate) struct Job {
    pub id: String,
    pub name: String,
    pub trigger: Trigger,
    pub callable: JobFn,
    pub allow_overlap: bool,
    /// Bumped on every upsert; completions from an older registration are ignored.
    pub generation: u64,
    pub next_run_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub failure_count: u64,
    /// Executions currently in flight.
    pub running: usize,
}

impl Job {
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            trigger: self.trigger.describe(),
            next_run_time: self.next_run_time,
            last_success_time: self.last_success_time,
            last_failure_time: self.last_failure_time,
            run_count: self.run_count,
            failure_count: self.failure_count,
            running: self.running > 0,
            allow_overlap: self.allow_overlap,
        }
    }
}

/// Read-only view of a registered job.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobSnapshot {
    pub id: String,
    pub name: String,
    pub trigger: String,
    pub next_run_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub failure_count: u64,
    pub running: bool,
    pub allow_overlap: bool,
}
