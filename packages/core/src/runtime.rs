//! Process-wide component ownership.
//!
//! [`Runtime`] is built once by `main` and holds the only instance of each
//! component. Everything else receives an `Arc` handle from it.

use std::future::Future;
use std::sync::Arc;

use crate::alerts::{AlertDispatcher, EmailChannel, SlackWebhookChannel};
use crate::api::AppState;
use crate::cache::QueryCache;
use crate::clock::{SystemTimeProvider, TimeProvider};
use crate::config::{AlertSettings, Config};
use crate::error::AppError;
use crate::freshness::{DataFreshness, DEFAULT_CATEGORIES};
use crate::health::HealthMonitor;
use crate::hub::BroadcastHub;
use crate::jobs::{CacheSweepJob, DataRefreshJob, StatsSource};
use crate::metrics::AppMetrics;
use crate::scheduler::{JobError, JobScheduler, Trigger};

/// Cached functions that list whole collections; dropped after every refresh.
const LISTING_FUNCTIONS: [&str; 3] = ["get_games", "get_players", "get_projections"];

pub struct Runtime {
    pub config: Config,
    pub clock: Arc<dyn TimeProvider>,
    pub metrics: Arc<AppMetrics>,
    pub alerts: Arc<AlertDispatcher>,
    pub cache: Arc<QueryCache>,
    pub hub: Arc<BroadcastHub>,
    pub freshness: Arc<DataFreshness>,
    pub scheduler: Arc<JobScheduler>,
    pub health: Arc<HealthMonitor>,
}

impl Runtime {
    /// Wall-clock runtime with alert channels taken from `config`.
    pub fn from_config(config: Config) -> Result<Self, AppError> {
        let metrics = Arc::new(AppMetrics::new()?);
        let alerts = build_alert_dispatcher(&config.alerts)?;
        Self::assemble(config, Arc::new(SystemTimeProvider), metrics, alerts)
    }

    /// Wire components around an explicit clock and dispatcher.
    pub fn assemble(
        config: Config,
        clock: Arc<dyn TimeProvider>,
        metrics: Arc<AppMetrics>,
        alerts: AlertDispatcher,
    ) -> Result<Self, AppError> {
        let alerts = Arc::new(alerts.with_metrics(metrics.clone()));
        let cache = Arc::new(QueryCache::new(config.cache.clone()).with_metrics(metrics.clone()));
        let hub = Arc::new(BroadcastHub::new().with_metrics(metrics.clone()));
        let freshness = Arc::new(DataFreshness::new(clock.clone()).with_metrics(metrics.clone()));
        let scheduler = Arc::new(
            JobScheduler::new(clock.clone(), alerts.clone()).with_metrics(metrics.clone()),
        );
        let health = Arc::new(HealthMonitor::new(
            scheduler.handle(),
            freshness.clone(),
            alerts.clone(),
            clock.clone(),
            config.health.clone(),
        ));

        Ok(Self {
            config,
            clock,
            metrics,
            alerts,
            cache,
            hub,
            freshness,
            scheduler,
            health,
        })
    }

    /// Register the health check and the cache sweep.
    pub async fn register_builtin_jobs(&self) {
        self.scheduler.register_job(self.health.clone()).await;
        self.scheduler
            .register_job(Arc::new(CacheSweepJob::new(
                self.cache.clone(),
                self.config.cache_sweep_interval,
            )))
            .await;
    }

    /// Register one daily refresh job per default category, all backed by
    /// `source`.
    pub async fn register_data_source(&self, source: Arc<dyn StatsSource>) -> Result<(), JobError> {
        let (hour, minute) = self.config.daily_update_at;
        for category in DEFAULT_CATEGORIES {
            let job = DataRefreshJob::new(
                category,
                Trigger::daily_at(hour, minute)?,
                source.clone(),
                self.cache.clone(),
                self.hub.clone(),
                self.freshness.clone(),
            )
            .invalidating(LISTING_FUNCTIONS);
            self.scheduler.register_job(Arc::new(job)).await;
        }
        tracing::info!(
            "Registered {} data refresh jobs from {} at {:02}:{:02} UTC",
            DEFAULT_CATEGORIES.len(),
            source.source_name(),
            hour,
            minute
        );
        Ok(())
    }

    pub fn state(&self) -> AppState {
        AppState {
            scheduler: self.scheduler.clone(),
            health: self.health.clone(),
            cache: self.cache.clone(),
            hub: self.hub.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Run the scheduler loop until `shutdown` resolves. Returns immediately
    /// when the scheduler is disabled.
    pub async fn run_scheduler<S>(&self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        if !self.config.scheduler_enabled {
            tracing::info!("Scheduler is disabled in configuration");
            return;
        }
        for job in self.scheduler.introspect().await {
            tracing::info!("  - {}: next run at {:?}", job.id, job.next_run_time);
        }
        self.scheduler.run_until(shutdown).await;
    }
}

/// Build the dispatcher and its channels. Unconfigured channels are skipped.
pub fn build_alert_dispatcher(settings: &AlertSettings) -> Result<AlertDispatcher, AppError> {
    let mut dispatcher = AlertDispatcher::new(settings.level)
        .with_enabled(settings.enabled)
        .with_timeout(settings.delivery_timeout);

    if let Some(url) = &settings.slack_webhook_url {
        dispatcher = dispatcher.with_channel(Arc::new(SlackWebhookChannel::new(url.clone())));
    }
    if let Some(smtp) = &settings.smtp {
        let channel = EmailChannel::new(smtp).map_err(|err| AppError::Config(err.to_string()))?;
        dispatcher = dispatcher.with_channel(Arc::new(channel));
    }

    if dispatcher.channel_names().is_empty() {
        tracing::warn!("No alert channels configured; alerts will only be logged");
    } else {
        tracing::info!(
            "Alerting enabled at level {} via {}",
            settings.level,
            dispatcher.channel_names().join(", ")
        );
    }
    Ok(dispatcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::Severity;
    use crate::clock::ManualTimeProvider;
    use crate::health::HEALTH_CHECK_JOB_ID;
    use crate::jobs::{ChangedEntity, SourceError, CACHE_SWEEP_JOB_ID};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    struct EmptySource;

    #[async_trait]
    impl StatsSource for EmptySource {
        fn source_name(&self) -> &str {
            "empty"
        }

        async fn refresh(&self, _category: &str) -> Result<Vec<ChangedEntity>, SourceError> {
            Ok(Vec::new())
        }
    }

    fn start() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap()
    }

    fn runtime() -> Runtime {
        runtime_at(Arc::new(ManualTimeProvider::new(start())))
    }

    fn runtime_at(clock: Arc<ManualTimeProvider>) -> Runtime {
        let config = Config::from_lookup(|_| None).unwrap();
        Runtime::assemble(
            config,
            clock,
            Arc::new(AppMetrics::new().unwrap()),
            AlertDispatcher::new(Severity::Error),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn builtin_jobs_are_registered() {
        let runtime = runtime();
        runtime.register_builtin_jobs().await;

        let ids: Vec<String> = runtime
            .scheduler
            .introspect()
            .await
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![CACHE_SWEEP_JOB_ID, HEALTH_CHECK_JOB_ID]);
    }

    #[tokio::test]
    async fn builtin_jobs_alone_never_report_stale_data() {
        let clock = Arc::new(ManualTimeProvider::new(start()));
        let runtime = runtime_at(clock.clone());
        runtime.register_builtin_jobs().await;
        runtime.scheduler.set_loop_running(true);

        clock.advance(chrono::Duration::hours(26));
        let report = runtime.health.check().await;

        assert!(runtime.freshness.categories().is_empty());
        assert!(report.stale_categories.is_empty());
    }

    #[tokio::test]
    async fn data_source_adds_one_daily_job_per_category() {
        let runtime = runtime();
        runtime.register_data_source(Arc::new(EmptySource)).await.unwrap();

        let jobs = runtime.scheduler.introspect().await;
        assert_eq!(jobs.len(), 3);
        assert_eq!(runtime.freshness.categories(), DEFAULT_CATEGORIES);
        assert!(jobs.iter().all(|j| j.trigger == "cron[0 0 1 * * *]"));
        assert_eq!(
            jobs[0].next_run_time,
            Some(Utc.with_ymd_and_hms(2024, 1, 11, 1, 0, 0).unwrap())
        );
    }

    #[test]
    fn dispatcher_gets_configured_webhook_channel() {
        let settings = AlertSettings {
            enabled: true,
            level: Severity::Warning,
            slack_webhook_url: Some("http://hooks.example.com/T000".to_string()),
            smtp: None,
            delivery_timeout: Duration::from_secs(3),
        };
        let dispatcher = build_alert_dispatcher(&settings).unwrap();
        assert_eq!(dispatcher.threshold(), Severity::Warning);
        assert_eq!(dispatcher.timeout(), Duration::from_secs(3));
        assert_eq!(dispatcher.channel_names().len(), 1);
    }
}
