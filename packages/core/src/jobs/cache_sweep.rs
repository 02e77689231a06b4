use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::QueryCache;
use crate::scheduler::{JobResult, ScheduledJob, Trigger};

pub const CACHE_SWEEP_JOB_ID: &str = "cache_sweep";

/// Periodically drops expired cache entries so memory does not wait for
/// size-cap pressure.
pub struct CacheSweepJob {
    cache: Arc<QueryCache>,
    interval: Duration,
}

impl CacheSweepJob {
    pub fn new(cache: Arc<QueryCache>, interval: Duration) -> Self {
        Self { cache, interval }
    }
}

#[async_trait]
impl ScheduledJob for CacheSweepJob {
    fn id(&self) -> &str {
        CACHE_SWEEP_JOB_ID
    }

    fn name(&self) -> &str {
        "Query Cache Sweep"
    }

    fn trigger(&self) -> Trigger {
        Trigger::every(self.interval)
    }

    async fn run(&self) -> JobResult {
        let removed = self.cache.purge_expired().await;
        if removed > 0 {
            tracing::info!("Cache sweep removed {} expired entries", removed);
        }
        Ok(())
    }
}
