//! Prometheus metrics registry for the runtime core.
//!
//! [`AppMetrics`] owns all registered metrics and the [`Registry`] they
//! belong to. Construct it once per [`Runtime`](crate::runtime::Runtime),
//! wrap in `Arc`, and hand it to the scheduler, cache, hub and alert
//! dispatcher.
//!
//! Exposed at `GET /metrics` in Prometheus text exposition format
//! (`text/plain; version=0.0.4`).

use prometheus::{
    Counter, CounterVec, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntGauge, Opts, Registry,
};

/// All application-level Prometheus metrics.
pub struct AppMetrics {
    /// Job executions, labelled by job id and status (`success` / `failure`).
    pub job_runs_total: CounterVec,
    /// Job execution latency in seconds, labelled by job id.
    pub job_duration: HistogramVec,
    /// Unix timestamp of each job's next scheduled run.
    pub job_next_run: GaugeVec,
    /// Cache lookups served from memory.
    pub cache_hits_total: Counter,
    /// Cache lookups that had to run the wrapped computation.
    pub cache_misses_total: Counter,
    /// Entries removed by size-cap eviction (both passes).
    pub cache_evictions_total: Counter,
    /// Current number of cache entries.
    pub cache_entries: IntGauge,
    /// Wrapped computation latency in seconds, labelled by function.
    pub query_duration: HistogramVec,
    /// Wrapped computations slower than the configured threshold.
    pub slow_queries_total: Counter,
    /// Currently connected hub clients.
    pub hub_connections: IntGauge,
    /// Envelopes successfully handed to a client transport.
    pub hub_messages_sent_total: Counter,
    /// Sends that failed and caused an implicit disconnect.
    pub hub_send_failures_total: Counter,
    /// Alert channel attempts, labelled by channel and outcome.
    pub alerts_total: CounterVec,
    /// Unix timestamp of the last successful update per data category.
    pub data_last_update: GaugeVec,
    /// Whether the scheduler loop is currently running (1) or not (0).
    pub scheduler_running: Gauge,
    /// The registry that owns all of the above metrics.
    pub registry: Registry,
}

impl AppMetrics {
    /// Create and register all metrics. Returns an error if any metric
    /// name is invalid or duplicated (should not happen in practice).
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let job_runs_total = CounterVec::new(
            Opts::new("stat_runtime_job_runs_total", "Job executions by job and status"),
            &["job_id", "status"],
        )?;

        let job_duration = HistogramVec::new(
            HistogramOpts::new(
                "stat_runtime_job_duration_seconds",
                "Job execution latency in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
            &["job_id"],
        )?;

        let job_next_run = GaugeVec::new(
            Opts::new(
                "stat_runtime_job_next_run_timestamp",
                "Unix timestamp of the next scheduled run",
            ),
            &["job_id"],
        )?;

        let cache_hits_total = Counter::with_opts(Opts::new(
            "stat_runtime_cache_hits_total",
            "Query cache hits",
        ))?;

        let cache_misses_total = Counter::with_opts(Opts::new(
            "stat_runtime_cache_misses_total",
            "Query cache misses",
        ))?;

        let cache_evictions_total = Counter::with_opts(Opts::new(
            "stat_runtime_cache_evictions_total",
            "Query cache entries evicted to respect the size cap",
        ))?;

        let cache_entries = IntGauge::with_opts(Opts::new(
            "stat_runtime_cache_entries",
            "Current number of query cache entries",
        ))?;

        let query_duration = HistogramVec::new(
            HistogramOpts::new(
                "stat_runtime_query_duration_seconds",
                "Wrapped read latency on cache miss",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["function"],
        )?;

        let slow_queries_total = Counter::with_opts(Opts::new(
            "stat_runtime_slow_queries_total",
            "Wrapped reads slower than the slow-query threshold",
        ))?;

        let hub_connections = IntGauge::with_opts(Opts::new(
            "stat_runtime_hub_connections",
            "Connected broadcast clients",
        ))?;

        let hub_messages_sent_total = Counter::with_opts(Opts::new(
            "stat_runtime_hub_messages_sent_total",
            "Envelopes delivered to client transports",
        ))?;

        let hub_send_failures_total = Counter::with_opts(Opts::new(
            "stat_runtime_hub_send_failures_total",
            "Failed sends that dropped a client",
        ))?;

        let alerts_total = CounterVec::new(
            Opts::new("stat_runtime_alerts_total", "Alert channel attempts by outcome"),
            &["channel", "outcome"],
        )?;

        let data_last_update = GaugeVec::new(
            Opts::new(
                "stat_runtime_data_last_update_timestamp",
                "Unix timestamp of the last successful data update",
            ),
            &["category"],
        )?;

        let scheduler_running = Gauge::with_opts(Opts::new(
            "stat_runtime_scheduler_running",
            "1 while the scheduler loop is running",
        ))?;

        registry.register(Box::new(job_runs_total.clone()))?;
        registry.register(Box::new(job_duration.clone()))?;
        registry.register(Box::new(job_next_run.clone()))?;
        registry.register(Box::new(cache_hits_total.clone()))?;
        registry.register(Box::new(cache_misses_total.clone()))?;
        registry.register(Box::new(cache_evictions_total.clone()))?;
        registry.register(Box::new(cache_entries.clone()))?;
        registry.register(Box::new(query_duration.clone()))?;
        registry.register(Box::new(slow_queries_total.clone()))?;
        registry.register(Box::new(hub_connections.clone()))?;
        registry.register(Box::new(hub_messages_sent_total.clone()))?;
        registry.register(Box::new(hub_send_failures_total.clone()))?;
        registry.register(Box::new(alerts_total.clone()))?;
        registry.register(Box::new(data_last_update.clone()))?;
        registry.register(Box::new(scheduler_running.clone()))?;

        Ok(Self {
            job_runs_total,
            job_duration,
            job_next_run,
            cache_hits_total,
            cache_misses_total,
            cache_evictions_total,
            cache_entries,
            query_duration,
            slow_queries_total,
            hub_connections,
            hub_messages_sent_total,
            hub_send_failures_total,
            alerts_total,
            data_last_update,
            scheduler_running,
            registry,
        })
    }

    /// Render all metrics as Prometheus text format (for the `/metrics` endpoint).
    pub fn render(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&metric_families, &mut buf)?;
        Ok(String::from_utf8(buf).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_metrics_register_without_error() {
        let metrics = AppMetrics::new();
        assert!(metrics.is_ok(), "AppMetrics::new() failed: {:?}", metrics.err());
    }

    #[test]
    fn render_includes_labelled_job_counter_after_increment() {
        let metrics = AppMetrics::new().unwrap();
        metrics
            .job_runs_total
            .with_label_values(&["daily_update", "success"])
            .inc();
        let output = metrics.render().unwrap();
        assert!(output.contains("stat_runtime_job_runs_total"));
        assert!(output.contains("daily_update"));
    }

    #[test]
    fn cache_counters_increment_correctly() {
        let metrics = AppMetrics::new().unwrap();
        metrics.cache_hits_total.inc_by(3.0);
        metrics.cache_misses_total.inc();
        assert!((metrics.cache_hits_total.get() - 3.0).abs() < f64::EPSILON);
        assert!((metrics.cache_misses_total.get() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn separate_instances_do_not_share_registries() {
        let a = AppMetrics::new().unwrap();
        let b = AppMetrics::new().unwrap();
        a.hub_connections.set(4);
        assert_eq!(b.hub_connections.get(), 0);
    }
}
