//! The job registry and its scheduling loop.
//!
//! [`JobScheduler::run_pending`] is one tick: every due job is marked
//! running, its next fire time is advanced, and its callable is spawned as
//! an independent task. [`JobScheduler::run_until`] repeats that tick,
//! sleeping until the earliest fire time in between.
//!
//! Every execution, scheduled or manual, goes through the same wrapper:
//! the callable runs in its own task (so a panic is just a failure), the
//! outcome is recorded on the job, and failures are logged, counted and
//! alerted. Nothing a job does can stop the loop.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::error::JobError;
use super::job::{job_fn, Job, JobFn, JobOptions, JobSnapshot, ScheduledJob};
use super::trigger::Trigger;
use crate::alerts::{AlertData, AlertDispatcher, Severity};
use crate::clock::TimeProvider;
use crate::metrics::AppMetrics;

/// Longest the loop sleeps without re-checking the registry.
pub const MAX_IDLE_SLEEP: Duration = Duration::from_secs(60);

/// How long shutdown waits for in-flight executions.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct JobScheduler {
    jobs: Mutex<HashMap<String, Job>>,
    clock: Arc<dyn TimeProvider>,
    alerts: Arc<AlertDispatcher>,
    metrics: Option<Arc<AppMetrics>>,
    generation: AtomicU64,
    active: AtomicUsize,
    idle: Notify,
    wake: Notify,
    loop_running: AtomicBool,
}

impl JobScheduler {
    pub fn new(clock: Arc<dyn TimeProvider>, alerts: Arc<AlertDispatcher>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            clock,
            alerts,
            metrics: None,
            generation: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            idle: Notify::new(),
            wake: Notify::new(),
            loop_running: AtomicBool::new(false),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<AppMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn clock(&self) -> Arc<dyn TimeProvider> {
        Arc::clone(&self.clock)
    }

    /// Non-owning handle for components that run *inside* the scheduler.
    pub fn handle(self: &Arc<Self>) -> SchedulerHandle {
        SchedulerHandle {
            inner: Arc::downgrade(self),
        }
    }

    pub fn is_running(&self) -> bool {
        self.loop_running.load(Ordering::SeqCst)
    }

    pub async fn register(&self, id: impl Into<String>, trigger: Trigger, callable: JobFn) {
        self.register_with(id, trigger, callable, JobOptions::default())
            .await
    }

    /// Insert or replace a job. The first fire is computed from now.
    pub async fn register_with(
        &self,
        id: impl Into<String>,
        trigger: Trigger,
        callable: JobFn,
        options: JobOptions,
    ) {
        let id = id.into();
        let now = self.clock.now();
        let job = Job {
            name: options.name.unwrap_or_else(|| id.clone()),
            id: id.clone(),
            next_run_time: trigger.first_run(now),
            trigger,
            callable,
            allow_overlap: options.allow_overlap,
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
            last_success_time: None,
            last_failure_time: None,
            run_count: 0,
            failure_count: 0,
            running: 0,
        };

        let description = job.trigger.describe();
        let next = job.next_run_time;
        let replaced = self.jobs.lock().await.insert(id.clone(), job).is_some();

        if replaced {
            tracing::info!("Replaced job {} ({})", id, description);
        } else {
            tracing::info!("Registered job {} ({})", id, description);
        }
        self.record_next_run(&id, next);
        self.wake.notify_one();
    }

    pub async fn register_job(&self, job: Arc<dyn ScheduledJob>) {
        let options = JobOptions {
            name: Some(job.name().to_string()),
            allow_overlap: job.allow_overlap(),
        };
        let id = job.id().to_string();
        let trigger = job.trigger();
        let callable = job_fn(move || {
            let job = Arc::clone(&job);
            async move { job.run().await }
        });
        self.register_with(id, trigger, callable, options).await
    }

    /// Remove a job. An execution already in flight finishes but its
    /// outcome is not recorded.
    pub async fn unregister(&self, id: &str) -> bool {
        let removed = self.jobs.lock().await.remove(id).is_some();
        if removed {
            tracing::info!("Removed job: {}", id);
            if let Some(metrics) = &self.metrics {
                let _ = metrics.job_next_run.remove_label_values(&[id]);
            }
            self.wake.notify_one();
        }
        removed
    }

    /// Snapshot of every registered job, sorted by id.
    pub async fn introspect(&self) -> Vec<JobSnapshot> {
        let jobs = self.jobs.lock().await;
        let mut snapshots: Vec<JobSnapshot> = jobs.values().map(Job::snapshot).collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    pub async fn snapshot(&self, id: &str) -> Option<JobSnapshot> {
        self.jobs.lock().await.get(id).map(Job::snapshot)
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }

    /// Executions currently in flight from scheduled ticks.
    pub fn active_executions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// One scheduling tick. Returns the number of executions dispatched.
    pub async fn run_pending(self: &Arc<Self>) -> usize {
        let now = self.clock.now();
        let mut due = Vec::new();

        {
            let mut jobs = self.jobs.lock().await;
            for job in jobs.values_mut() {
                let Some(next) = job.next_run_time else {
                    continue;
                };
                if next > now {
                    continue;
                }

                job.next_run_time = job.trigger.next_after(next, now);
                if job.running > 0 && !job.allow_overlap {
                    tracing::warn!("Job {} still running; skipping this fire", job.id);
                    continue;
                }

                job.running += 1;
                due.push((job.id.clone(), job.generation, Arc::clone(&job.callable)));
            }
        }

        let dispatched = due.len();
        for (id, generation, callable) in due {
            self.active.fetch_add(1, Ordering::SeqCst);
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                let _ = scheduler.execute(&id, generation, callable).await;
                if scheduler.active.fetch_sub(1, Ordering::SeqCst) == 1 {
                    scheduler.idle.notify_waiters();
                }
            });
        }
        dispatched
    }

    /// Run a job immediately, outside the schedule and regardless of whether
    /// it is already running. With `propagate`, a failure is returned to the
    /// caller as well as being recorded and alerted.
    pub async fn run_now(self: &Arc<Self>, id: &str, propagate: bool) -> Result<(), JobError> {
        let (generation, callable) = {
            let mut jobs = self.jobs.lock().await;
            let job = jobs
                .get_mut(id)
                .ok_or_else(|| JobError::NotFound(id.to_string()))?;
            job.running += 1;
            (job.generation, Arc::clone(&job.callable))
        };

        tracing::info!("Manually triggering job: {}", id);
        match self.execute(id, generation, callable).await {
            Err(message) if propagate => Err(JobError::Failed {
                id: id.to_string(),
                message,
            }),
            _ => Ok(()),
        }
    }

    /// Wait until every scheduled execution has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Time until the earliest fire, capped at [`MAX_IDLE_SLEEP`].
    pub async fn time_until_next(&self) -> Duration {
        let now = self.clock.now();
        let jobs = self.jobs.lock().await;

        jobs.values()
            .filter_map(|job| job.next_run_time)
            .map(|next| (next - now).to_std().unwrap_or(Duration::ZERO))
            .fold(MAX_IDLE_SLEEP, Duration::min)
    }

    /// Drive the schedule until `shutdown` resolves, then give in-flight
    /// executions up to [`SHUTDOWN_GRACE`] to finish.
    pub async fn run_until<S>(self: &Arc<Self>, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        self.set_loop_running(true);
        tracing::info!("Job scheduler started with {} jobs", self.len().await);

        loop {
            self.run_pending().await;
            let sleep_for = self.time_until_next().await;
            tracing::debug!("Scheduler sleeping for {:?}", sleep_for);

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.wake.notified() => {
                    tracing::debug!("Job registry changed; rescheduling");
                }
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received. Stopping scheduler.");
                    break;
                }
            }
        }

        if tokio::time::timeout(SHUTDOWN_GRACE, self.wait_idle())
            .await
            .is_err()
        {
            tracing::warn!(
                "{} job executions still running after {:?}; abandoning them",
                self.active_executions(),
                SHUTDOWN_GRACE
            );
        }

        self.set_loop_running(false);
        tracing::info!("Job scheduler stopped");
    }

    /// The execution wrapper. Returns the error text on failure.
    async fn execute(&self, id: &str, generation: u64, callable: JobFn) -> Result<(), String> {
        tracing::info!("Starting job: {}", id);
        let started = Instant::now();

        let outcome = match tokio::spawn(callable()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(join_err) if join_err.is_panic() => Err(format!(
                "job panicked: {}",
                panic_message(join_err.into_panic())
            )),
            Err(_) => Err("job task was cancelled".to_string()),
        };

        let elapsed = started.elapsed();
        let now = self.clock.now();

        let next = {
            let mut jobs = self.jobs.lock().await;
            match jobs.get_mut(id) {
                Some(job) if job.generation == generation => {
                    job.running = job.running.saturating_sub(1);
                    match &outcome {
                        Ok(()) => {
                            job.last_success_time = Some(now);
                            job.run_count += 1;
                        }
                        Err(_) => {
                            job.last_failure_time = Some(now);
                            job.failure_count += 1;
                        }
                    }
                    if let Some(next) = job.next_run_time {
                        if next <= now {
                            job.next_run_time = job.trigger.next_after(next, now);
                        }
                    }
                    Some(job.next_run_time)
                }
                _ => {
                    tracing::debug!("Job {} was replaced or removed while running", id);
                    None
                }
            }
        };

        if let Some(next) = next {
            self.record_next_run(id, next);
        }

        let status = if outcome.is_ok() { "success" } else { "failure" };
        if let Some(metrics) = &self.metrics {
            metrics.job_runs_total.with_label_values(&[id, status]).inc();
            metrics
                .job_duration
                .with_label_values(&[id])
                .observe(elapsed.as_secs_f64());
        }

        match &outcome {
            Ok(()) => {
                tracing::info!("Job {} completed successfully in {:?}", id, elapsed);
            }
            Err(message) => {
                tracing::error!("Job {} failed after {:?}: {}", id, elapsed, message);

                let mut data = AlertData::new();
                data.insert("job_id".to_string(), Value::from(id));
                data.insert("error".to_string(), Value::from(message.as_str()));
                data.insert(
                    "duration_seconds".to_string(),
                    Value::from(format!("{:.2}", elapsed.as_secs_f64())),
                );
                self.alerts
                    .send(
                        &format!("Scheduled Job Failed: {}", id),
                        &format!("Job {} failed: {}", id, message),
                        Severity::Error,
                        data,
                    )
                    .await;
            }
        }

        outcome
    }

    fn record_next_run(&self, id: &str, next: Option<chrono::DateTime<chrono::Utc>>) {
        if let (Some(metrics), Some(next)) = (&self.metrics, next) {
            metrics
                .job_next_run
                .with_label_values(&[id])
                .set(next.timestamp() as f64);
        }
    }

    pub(crate) fn set_loop_running(&self, running: bool) {
        self.loop_running.store(running, Ordering::SeqCst);
        if let Some(metrics) = &self.metrics {
            metrics.scheduler_running.set(if running { 1.0 } else { 0.0 });
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Weak reference to the scheduler, for jobs that inspect the registry they
/// are registered in.
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Weak<JobScheduler>,
}

impl SchedulerHandle {
    /// `None` once the scheduler has been dropped.
    pub async fn introspect(&self) -> Option<Vec<JobSnapshot>> {
        let scheduler = self.inner.upgrade()?;
        Some(scheduler.introspect().await)
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .upgrade()
            .map(|scheduler| scheduler.is_running())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::testing::RecordingChannel;
    use crate::clock::ManualTimeProvider;
    use crate::scheduler::JobResult;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::AtomicU32;

    struct Fixture {
        clock: Arc<ManualTimeProvider>,
        chat: Arc<RecordingChannel>,
        scheduler: Arc<JobScheduler>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualTimeProvider::new(
            Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap(),
        ));
        let chat = RecordingChannel::ok("chat");
        let alerts = Arc::new(AlertDispatcher::new(Severity::Error).with_channel(chat.clone()));
        let scheduler = Arc::new(JobScheduler::new(clock.clone(), alerts));
        Fixture {
            clock,
            chat,
            scheduler,
        }
    }

    fn counting_job(counter: Arc<AtomicU32>) -> JobFn {
        job_fn(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn fail(message: &str) -> JobResult {
        Err(message.into())
    }

    fn explode() -> JobResult {
        panic!("bad row")
    }

    fn failing_job() -> JobFn {
        job_fn(|| async { fail("provider returned 503") })
    }

    async fn tick(scheduler: &Arc<JobScheduler>) -> usize {
        let dispatched = scheduler.run_pending().await;
        scheduler.wait_idle().await;
        dispatched
    }

    #[tokio::test]
    async fn register_is_upsert() {
        let f = fixture();
        let counter = Arc::new(AtomicU32::new(0));
        f.scheduler
            .register(
                "daily_update",
                Trigger::every(Duration::from_secs(60)),
                counting_job(counter.clone()),
            )
            .await;
        f.scheduler
            .register(
                "daily_update",
                Trigger::every(Duration::from_secs(120)),
                counting_job(counter),
            )
            .await;

        let jobs = f.scheduler.introspect().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].trigger, "interval[120s]");
    }

    #[tokio::test]
    async fn nothing_fires_before_due() {
        let f = fixture();
        let counter = Arc::new(AtomicU32::new(0));
        f.scheduler
            .register("j", Trigger::every(Duration::from_secs(900)), counting_job(counter.clone()))
            .await;

        f.clock.advance(chrono::Duration::seconds(899));
        assert_eq!(tick(&f.scheduler).await, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn success_updates_bookkeeping() {
        let f = fixture();
        let counter = Arc::new(AtomicU32::new(0));
        f.scheduler
            .register("j", Trigger::every(Duration::from_secs(900)), counting_job(counter.clone()))
            .await;

        f.clock.advance(chrono::Duration::seconds(900));
        assert_eq!(tick(&f.scheduler).await, 1);

        let job = f.scheduler.snapshot("j").await.unwrap();
        assert_eq!(job.run_count, 1);
        assert_eq!(job.failure_count, 0);
        assert_eq!(job.last_success_time, Some(f.clock.now()));
        assert_eq!(job.next_run_time, Some(f.clock.now() + chrono::Duration::seconds(900)));
        assert!(!job.running);
    }

    #[tokio::test]
    async fn overdue_backlog_fires_once() {
        let f = fixture();
        let counter = Arc::new(AtomicU32::new(0));
        f.scheduler
            .register("j", Trigger::every(Duration::from_secs(900)), counting_job(counter.clone()))
            .await;

        f.clock.advance(chrono::Duration::seconds(900 * 5 + 10));
        assert_eq!(tick(&f.scheduler).await, 1);
        assert_eq!(tick(&f.scheduler).await, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let next = f.scheduler.snapshot("j").await.unwrap().next_run_time.unwrap();
        assert!(next > f.clock.now());
    }

    #[tokio::test]
    async fn failure_is_contained_recorded_and_alerted() {
        let f = fixture();
        let counter = Arc::new(AtomicU32::new(0));
        f.scheduler
            .register("broken", Trigger::every(Duration::from_secs(60)), failing_job())
            .await;
        f.scheduler
            .register(
                "healthy",
                Trigger::every(Duration::from_secs(60)),
                counting_job(counter.clone()),
            )
            .await;

        for _ in 0..3 {
            f.clock.advance(chrono::Duration::seconds(60));
            assert_eq!(tick(&f.scheduler).await, 2);
        }

        let broken = f.scheduler.snapshot("broken").await.unwrap();
        assert_eq!(broken.failure_count, 3);
        assert_eq!(broken.run_count, 0);
        assert!(broken.last_failure_time.is_some());
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        let alerts = f.chat.alerts();
        assert_eq!(alerts.len(), 3);
        assert_eq!(alerts[0].title, "Scheduled Job Failed: broken");
        assert_eq!(alerts[0].data["job_id"], "broken");
        assert_eq!(alerts[0].data["error"], "provider returned 503");
        assert!(alerts[0].data.contains_key("duration_seconds"));
    }

    #[tokio::test]
    async fn panic_counts_as_failure() {
        let f = fixture();
        f.scheduler
            .register(
                "panicky",
                Trigger::every(Duration::from_secs(60)),
                job_fn(|| async { explode() }),
            )
            .await;

        f.clock.advance(chrono::Duration::seconds(60));
        tick(&f.scheduler).await;

        let job = f.scheduler.snapshot("panicky").await.unwrap();
        assert_eq!(job.failure_count, 1);
        assert!(f.chat.alerts()[0].data["error"]
            .as_str()
            .unwrap()
            .contains("bad row"));
    }

    #[tokio::test]
    async fn running_job_is_skipped_without_overlap() {
        let f = fixture();
        let gate = Arc::new(Notify::new());
        let starts = Arc::new(AtomicU32::new(0));
        let callable = {
            let gate = Arc::clone(&gate);
            let starts = Arc::clone(&starts);
            job_fn(move || {
                let gate = Arc::clone(&gate);
                let starts = Arc::clone(&starts);
                async move {
                    starts.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    Ok(())
                }
            })
        };
        f.scheduler
            .register("slow", Trigger::every(Duration::from_secs(60)), callable)
            .await;

        f.clock.advance(chrono::Duration::seconds(60));
        assert_eq!(f.scheduler.run_pending().await, 1);
        f.clock.advance(chrono::Duration::seconds(60));
        assert_eq!(f.scheduler.run_pending().await, 0);
        assert!(f.scheduler.snapshot("slow").await.unwrap().running);

        while starts.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        gate.notify_waiters();
        f.scheduler.wait_idle().await;
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn overlap_allowed_when_opted_in() {
        let f = fixture();
        let gate = Arc::new(Notify::new());
        let callable = {
            let gate = Arc::clone(&gate);
            job_fn(move || {
                let gate = Arc::clone(&gate);
                async move {
                    gate.notified().await;
                    Ok(())
                }
            })
        };
        f.scheduler
            .register_with(
                "parallel",
                Trigger::every(Duration::from_secs(60)),
                callable,
                JobOptions {
                    allow_overlap: true,
                    ..JobOptions::default()
                },
            )
            .await;

        f.clock.advance(chrono::Duration::seconds(60));
        assert_eq!(f.scheduler.run_pending().await, 1);
        f.clock.advance(chrono::Duration::seconds(60));
        assert_eq!(f.scheduler.run_pending().await, 1);
        assert_eq!(f.scheduler.active_executions(), 2);

        while f.scheduler.active_executions() > 0 {
            gate.notify_waiters();
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn run_now_swallows_or_propagates() {
        let f = fixture();
        f.scheduler
            .register("broken", Trigger::every(Duration::from_secs(3600)), failing_job())
            .await;

        assert!(f.scheduler.run_now("broken", false).await.is_ok());
        let err = f.scheduler.run_now("broken", true).await.unwrap_err();
        assert_eq!(
            err,
            JobError::Failed {
                id: "broken".to_string(),
                message: "provider returned 503".to_string()
            }
        );

        let job = f.scheduler.snapshot("broken").await.unwrap();
        assert_eq!(job.failure_count, 2);
        assert_eq!(f.chat.attempts(), 2);
        // manual runs leave the schedule alone
        assert_eq!(job.next_run_time, Some(f.clock.now() + chrono::Duration::seconds(3600)));
    }

    #[tokio::test]
    async fn run_now_unknown_job_is_not_found() {
        let f = fixture();
        assert_eq!(
            f.scheduler.run_now("ghost", false).await,
            Err(JobError::NotFound("ghost".to_string()))
        );
    }

    #[tokio::test]
    async fn unregister_stops_future_fires() {
        let f = fixture();
        let counter = Arc::new(AtomicU32::new(0));
        f.scheduler
            .register("j", Trigger::every(Duration::from_secs(60)), counting_job(counter.clone()))
            .await;

        assert!(f.scheduler.unregister("j").await);
        assert!(!f.scheduler.unregister("j").await);
        f.clock.advance(chrono::Duration::seconds(120));
        assert_eq!(tick(&f.scheduler).await, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn completion_of_replaced_job_is_discarded() {
        let f = fixture();
        let gate = Arc::new(Notify::new());
        let callable = {
            let gate = Arc::clone(&gate);
            job_fn(move || {
                let gate = Arc::clone(&gate);
                async move {
                    gate.notified().await;
                    fail("old version")
                }
            })
        };
        f.scheduler
            .register("j", Trigger::every(Duration::from_secs(60)), callable)
            .await;
        f.clock.advance(chrono::Duration::seconds(60));
        f.scheduler.run_pending().await;

        let counter = Arc::new(AtomicU32::new(0));
        f.scheduler
            .register("j", Trigger::every(Duration::from_secs(60)), counting_job(counter))
            .await;
        while f.scheduler.active_executions() > 0 {
            gate.notify_waiters();
            tokio::task::yield_now().await;
        }

        let job = f.scheduler.snapshot("j").await.unwrap();
        assert_eq!(job.failure_count, 0);
        assert!(!job.running);
    }

    #[tokio::test]
    async fn scheduled_job_trait_objects_register() {
        struct Nightly;

        #[async_trait::async_trait]
        impl ScheduledJob for Nightly {
            fn id(&self) -> &str {
                "nightly"
            }
            fn name(&self) -> &str {
                "Nightly rebuild"
            }
            fn trigger(&self) -> Trigger {
                Trigger::daily_at(1, 0).unwrap()
            }
            async fn run(&self) -> JobResult {
                Ok(())
            }
        }

        let f = fixture();
        f.scheduler.register_job(Arc::new(Nightly)).await;

        let job = f.scheduler.snapshot("nightly").await.unwrap();
        assert_eq!(job.name, "Nightly rebuild");
        assert_eq!(job.trigger, "cron[0 0 1 * * *]");
        assert_eq!(
            job.next_run_time,
            Some(Utc.with_ymd_and_hms(2024, 1, 16, 1, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn time_until_next_is_capped() {
        let f = fixture();
        assert_eq!(f.scheduler.time_until_next().await, MAX_IDLE_SLEEP);

        let counter = Arc::new(AtomicU32::new(0));
        f.scheduler
            .register("j", Trigger::every(Duration::from_secs(30)), counting_job(counter))
            .await;
        assert_eq!(f.scheduler.time_until_next().await, Duration::from_secs(30));

        f.clock.advance(chrono::Duration::seconds(45));
        assert_eq!(f.scheduler.time_until_next().await, Duration::ZERO);
    }

    #[tokio::test]
    async fn handle_does_not_keep_scheduler_alive() {
        let f = fixture();
        let handle = f.scheduler.handle();
        assert!(handle.introspect().await.is_some());

        drop(f.scheduler);
        assert!(handle.introspect().await.is_none());
    }

    #[tokio::test]
    async fn loop_fires_jobs_and_stops_on_shutdown() {
        let alerts = Arc::new(AlertDispatcher::new(Severity::Error));
        let scheduler = Arc::new(JobScheduler::new(
            Arc::new(crate::clock::SystemTimeProvider),
            alerts,
        ));
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .register(
                "fast",
                Trigger::every(Duration::from_millis(20)),
                counting_job(counter.clone()),
            )
            .await;

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let runner = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                scheduler
                    .run_until(async {
                        let _ = stop_rx.await;
                    })
                    .await;
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(scheduler.is_running());
        let _ = stop_tx.send(());
        runner.await.unwrap();

        assert!(!scheduler.is_running());
        assert!(counter.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn metrics_record_runs() {
        let clock = Arc::new(ManualTimeProvider::new(Utc::now()));
        let metrics = Arc::new(AppMetrics::new().unwrap());
        let scheduler = Arc::new(
            JobScheduler::new(clock.clone(), Arc::new(AlertDispatcher::new(Severity::Critical)))
                .with_metrics(metrics.clone()),
        );
        scheduler
            .register("broken", Trigger::every(Duration::from_secs(60)), failing_job())
            .await;
        clock.advance(chrono::Duration::seconds(60));
        tick(&scheduler).await;

        let failures = metrics
            .job_runs_total
            .with_label_values(&["broken", "failure"])
            .get();
        assert!((failures - 1.0).abs() < f64::EPSILON);
    }
}
