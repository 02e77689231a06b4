//! Latency bookkeeping for wrapped reads.
//!
//! The cache reports every miss here. Calls slower than the threshold are
//! counted as slow and kept in a small ring buffer (oldest dropped first) so
//! the admin surface can show the most recent offenders.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::metrics::AppMetrics;

/// Number of slow calls retained for inspection.
pub const SLOW_LOG_CAPACITY: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct SlowQuery {
    pub function: String,
    pub duration_seconds: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryStats {
    pub query_count: u64,
    pub slow_query_count: u64,
    pub total_time_seconds: f64,
    pub avg_time_seconds: f64,
    pub slow_queries: Vec<SlowQuery>,
}

#[derive(Debug, Default)]
struct MonitorState {
    query_count: u64,
    slow_query_count: u64,
    total_time: Duration,
    slow_queries: VecDeque<SlowQuery>,
}

pub struct QueryMonitor {
    slow_threshold: Duration,
    state: Mutex<MonitorState>,
    metrics: Option<Arc<AppMetrics>>,
}

impl QueryMonitor {
    pub fn new(slow_threshold: Duration) -> Self {
        Self {
            slow_threshold,
            state: Mutex::new(MonitorState::default()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<AppMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn slow_threshold(&self) -> Duration {
        self.slow_threshold
    }

    /// Record one call. Returns `true` when it was classified as slow.
    pub fn record(&self, function: &str, elapsed: Duration) -> bool {
        let is_slow = elapsed > self.slow_threshold;

        {
            let mut state = self.lock();
            state.query_count += 1;
            state.total_time += elapsed;

            if is_slow {
                state.slow_query_count += 1;
                if state.slow_queries.len() >= SLOW_LOG_CAPACITY {
                    state.slow_queries.pop_front();
                }
                state.slow_queries.push_back(SlowQuery {
                    function: function.to_string(),
                    duration_seconds: elapsed.as_secs_f64(),
                    recorded_at: Utc::now(),
                });
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics
                .query_duration
                .with_label_values(&[function])
                .observe(elapsed.as_secs_f64());
            if is_slow {
                metrics.slow_queries_total.inc();
            }
        }

        if is_slow {
            tracing::warn!(
                "Slow query detected ({:.2}s): {}",
                elapsed.as_secs_f64(),
                function
            );
        }

        is_slow
    }

    pub fn stats(&self) -> QueryStats {
        let state = self.lock();
        let total = state.total_time.as_secs_f64();
        QueryStats {
            query_count: state.query_count,
            slow_query_count: state.slow_query_count,
            total_time_seconds: total,
            avg_time_seconds: if state.query_count > 0 {
                total / state.query_count as f64
            } else {
                0.0
            },
            slow_queries: state.slow_queries.iter().cloned().collect(),
        }
    }

    pub fn reset(&self) {
        *self.lock() = MonitorState::default();
        tracing::info!("Performance statistics reset");
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
