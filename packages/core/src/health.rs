//! Scheduler and data-freshness health checks.
//!
//! [`HealthMonitor`] runs as a job on the scheduler it inspects. Each pass
//! checks that the scheduler loop is up (ERROR otherwise), then looks for
//! jobs whose next fire time is well in the past and for data categories
//! that have not been refreshed recently (WARNING for each).
//!
//! Alerts are sent once per episode: a job stays "alerted" until its
//! `next_run_time` changes, a category until its last update changes, a
//! stopped scheduler until it runs again. An episode only counts as alerted
//! once a channel accepted the alert (or alerting is off for that
//! severity), so a channel outage is retried on the next pass. Every pass
//! still reports the full set of problems in its [`HealthReport`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::alerts::{AlertData, AlertDispatcher, Severity};
use crate::clock::TimeProvider;
use crate::freshness::DataFreshness;
use crate::scheduler::{JobResult, JobSnapshot, ScheduledJob, SchedulerHandle, Trigger};

pub const HEALTH_CHECK_JOB_ID: &str = "health_check";

#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub interval: Duration,
    pub overdue_threshold: Duration,
    pub max_data_age: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30 * 60),
            overdue_threshold: Duration::from_secs(2 * 3600),
            max_data_age: Duration::from_secs(25 * 3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OverdueJob {
    pub job_id: String,
    pub job_name: String,
    pub next_run_time: DateTime<Utc>,
    pub hours_overdue: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StaleCategory {
    pub category: String,
    pub last_update: Option<DateTime<Utc>>,
    pub hours_since_update: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub scheduler_running: bool,
    pub overdue_jobs: Vec<OverdueJob>,
    pub stale_categories: Vec<StaleCategory>,
    pub alerts_sent: usize,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.scheduler_running && self.overdue_jobs.is_empty() && self.stale_categories.is_empty()
    }
}

#[derive(Default)]
struct AlertedEpisodes {
    scheduler_down: bool,
    jobs: HashMap<String, DateTime<Utc>>,
    categories: HashMap<String, Option<DateTime<Utc>>>,
}

pub struct HealthMonitor {
    scheduler: SchedulerHandle,
    freshness: Arc<DataFreshness>,
    alerts: Arc<AlertDispatcher>,
    clock: Arc<dyn TimeProvider>,
    settings: HealthSettings,
    alerted: Mutex<AlertedEpisodes>,
}

impl HealthMonitor {
    pub fn new(
        scheduler: SchedulerHandle,
        freshness: Arc<DataFreshness>,
        alerts: Arc<AlertDispatcher>,
        clock: Arc<dyn TimeProvider>,
        settings: HealthSettings,
    ) -> Self {
        Self {
            scheduler,
            freshness,
            alerts,
            clock,
            settings,
            alerted: Mutex::new(AlertedEpisodes::default()),
        }
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    /// Run one health pass.
    pub async fn check(&self) -> HealthReport {
        tracing::info!("Running scheduler health check");
        let now = self.clock.now();
        let mut alerted = self.alerted.lock().await;
        let mut alerts_sent = 0;

        let scheduler_running = self.scheduler.is_running();
        if scheduler_running {
            alerted.scheduler_down = false;
        } else if !alerted.scheduler_down {
            let delivered = self.alert_scheduler_down().await;
            if delivered {
                alerts_sent += 1;
            }
            alerted.scheduler_down = self.settled(delivered, Severity::Error);
        }

        let overdue_jobs = match self.scheduler.introspect().await {
            Some(jobs) => self.find_overdue(&jobs, now),
            None => {
                tracing::error!("Health check could not reach the job scheduler");
                Vec::new()
            }
        };

        alerted.jobs.retain(|id, next| {
            overdue_jobs
                .iter()
                .any(|j| &j.job_id == id && j.next_run_time == *next)
        });
        for job in &overdue_jobs {
            if alerted.jobs.get(&job.job_id) == Some(&job.next_run_time) {
                continue;
            }
            let delivered = self.alert_overdue(job).await;
            if delivered {
                alerts_sent += 1;
            }
            if self.settled(delivered, Severity::Warning) {
                alerted.jobs.insert(job.job_id.clone(), job.next_run_time);
            }
        }

        let stale_categories = self.find_stale(now);
        alerted.categories.retain(|category, last| {
            stale_categories
                .iter()
                .any(|s| &s.category == category && s.last_update == *last)
        });
        for stale in &stale_categories {
            if alerted.categories.get(&stale.category) == Some(&stale.last_update) {
                continue;
            }
            let delivered = self.alert_stale(stale).await;
            if delivered {
                alerts_sent += 1;
            }
            if self.settled(delivered, Severity::Warning) {
                alerted
                    .categories
                    .insert(stale.category.clone(), stale.last_update);
            }
        }

        let report = HealthReport {
            checked_at: now,
            scheduler_running,
            overdue_jobs,
            stale_categories,
            alerts_sent,
        };

        if report.is_healthy() {
            tracing::info!("Scheduler health check completed: healthy");
        } else {
            tracing::warn!(
                "Scheduler health check completed: running={}, {} overdue, {} stale",
                report.scheduler_running,
                report.overdue_jobs.len(),
                report.stale_categories.len()
            );
        }
        report
    }

    /// An episode stops being re-sent once delivered, or when alerts of this
    /// severity are not being sent at all.
    fn settled(&self, delivered: bool, severity: Severity) -> bool {
        delivered || !self.alerts.should_alert(severity)
    }

    fn find_overdue(&self, jobs: &[JobSnapshot], now: DateTime<Utc>) -> Vec<OverdueJob> {
        let threshold = chrono_duration(self.settings.overdue_threshold);
        jobs.iter()
            .filter(|job| job.id != HEALTH_CHECK_JOB_ID)
            .filter_map(|job| {
                let next = job.next_run_time?;
                if now - next > threshold {
                    Some(OverdueJob {
                        job_id: job.id.clone(),
                        job_name: job.name.clone(),
                        next_run_time: next,
                        hours_overdue: hours(now - next),
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    fn find_stale(&self, now: DateTime<Utc>) -> Vec<StaleCategory> {
        let max_age = chrono_duration(self.settings.max_data_age);
        self.freshness
            .entries()
            .into_iter()
            .filter(|entry| now - entry.since > max_age)
            .map(|entry| StaleCategory {
                hours_since_update: hours(now - entry.since),
                category: entry.category,
                last_update: entry.last_update,
            })
            .collect()
    }

    async fn alert_scheduler_down(&self) -> bool {
        tracing::error!("Scheduler is not running");
        self.alerts
            .send(
                "Scheduler Not Running",
                "The job scheduler is not running. Scheduled jobs will not be executed.",
                Severity::Error,
                AlertData::new(),
            )
            .await
    }

    async fn alert_overdue(&self, job: &OverdueJob) -> bool {
        tracing::warn!("Job {} is {:.1} hours overdue", job.job_id, job.hours_overdue);

        let mut data = AlertData::new();
        data.insert("job_id".to_string(), Value::from(job.job_id.as_str()));
        data.insert("job_name".to_string(), Value::from(job.job_name.as_str()));
        data.insert("next_run_time".to_string(), Value::from(job.next_run_time.to_rfc3339()));
        data.insert("hours_overdue".to_string(), Value::from(format!("{:.1}", job.hours_overdue)));

        self.alerts
            .send(
                &format!("Job {} is Overdue", job.job_id),
                &format!("Scheduled job {} is {:.1} hours overdue", job.job_id, job.hours_overdue),
                Severity::Warning,
                data,
            )
            .await
    }

    async fn alert_stale(&self, stale: &StaleCategory) -> bool {
        tracing::warn!(
            "The {} data has not been updated in {:.1} hours",
            stale.category,
            stale.hours_since_update
        );

        let mut data = AlertData::new();
        data.insert("data_type".to_string(), Value::from(stale.category.as_str()));
        data.insert(
            "last_update".to_string(),
            stale
                .last_update
                .map(|t| Value::from(t.to_rfc3339()))
                .unwrap_or(Value::Null),
        );
        data.insert(
            "hours_since_update".to_string(),
            Value::from(format!("{:.1}", stale.hours_since_update)),
        );
        data.insert(
            "threshold_hours".to_string(),
            Value::from(self.settings.max_data_age.as_secs_f64() / 3600.0),
        );

        self.alerts
            .send(
                "Stale Data Detected",
                &format!(
                    "The {} data has not been updated in {:.1} hours",
                    stale.category, stale.hours_since_update
                ),
                Severity::Warning,
                data,
            )
            .await
    }
}

#[async_trait]
impl ScheduledJob for HealthMonitor {
    fn id(&self) -> &str {
        HEALTH_CHECK_JOB_ID
    }

    fn name(&self) -> &str {
        "Scheduler Health Check"
    }

    fn trigger(&self) -> Trigger {
        Trigger::every(self.settings.interval)
    }

    async fn run(&self) -> JobResult {
        self.check().await;
        Ok(())
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

fn hours(d: chrono::Duration) -> f64 {
    d.num_milliseconds() as f64 / 3_600_000.0
}
