//! Last-successful-update times per data category.
//!
//! Refresh jobs record here; the health monitor reads it. A category is
//! tracked once something registers a refresh for it or records an update.
//! A tracked category that has never been updated is measured from the
//! moment tracking started.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::TimeProvider;
use crate::metrics::AppMetrics;

/// Categories the built-in refresh jobs cover.
pub const DEFAULT_CATEGORIES: [&str; 3] = ["games", "players", "projections"];

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FreshnessEntry {
    pub category: String,
    pub last_update: Option<DateTime<Utc>>,
    /// `last_update`, or the tracking start when never updated.
    pub since: DateTime<Utc>,
}

#[derive(Default)]
struct Tracked {
    /// Category and tracking start, in the order tracking started.
    started: Vec<(String, DateTime<Utc>)>,
    updates: HashMap<String, DateTime<Utc>>,
}

impl Tracked {
    fn track(&mut self, category: &str, at: DateTime<Utc>) -> bool {
        if self.started.iter().any(|(name, _)| name == category) {
            return false;
        }
        self.started.push((category.to_string(), at));
        true
    }
}

pub struct DataFreshness {
    clock: Arc<dyn TimeProvider>,
    tracked: Mutex<Tracked>,
    metrics: Option<Arc<AppMetrics>>,
}

impl DataFreshness {
    /// Tracks nothing until a category is registered or updated.
    pub fn new(clock: Arc<dyn TimeProvider>) -> Self {
        Self {
            clock,
            tracked: Mutex::new(Tracked::default()),
            metrics: None,
        }
    }

    pub fn with_categories<I, S>(clock: Arc<dyn TimeProvider>, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let freshness = Self::new(clock);
        for category in categories {
            freshness.track(category.as_ref());
        }
        freshness
    }

    pub fn with_metrics(mut self, metrics: Arc<AppMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Start expecting updates for `category`. No-op when already tracked.
    pub fn track(&self, category: &str) {
        let now = self.clock.now();
        if self.lock().track(category, now) {
            tracing::debug!("Tracking freshness of {} from {}", category, now);
        }
    }

    pub fn categories(&self) -> Vec<String> {
        self.lock()
            .started
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Mark `category` as updated now. Unknown categories start being tracked.
    pub fn record_update(&self, category: &str) {
        let now = self.clock.now();
        self.record_update_at(category, now);
    }

    pub fn record_update_at(&self, category: &str, at: DateTime<Utc>) {
        {
            let mut tracked = self.lock();
            tracked.track(category, at);
            tracked.updates.insert(category.to_string(), at);
        }
        if let Some(metrics) = &self.metrics {
            metrics
                .data_last_update
                .with_label_values(&[category])
                .set(at.timestamp() as f64);
        }
        tracing::debug!("Recorded {} update at {}", category, at);
    }

    pub fn last_update(&self, category: &str) -> Option<DateTime<Utc>> {
        self.lock().updates.get(category).copied()
    }

    /// Every tracked category, in the order tracking started.
    pub fn entries(&self) -> Vec<FreshnessEntry> {
        let tracked = self.lock();
        tracked
            .started
            .iter()
            .map(|(category, started)| {
                let last_update = tracked.updates.get(category).copied();
                FreshnessEntry {
                    category: category.clone(),
                    last_update,
                    since: last_update.unwrap_or(*started),
                }
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Tracked> {
        self.tracked.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTimeProvider;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap()
    }

    #[test]
    fn nothing_is_tracked_by_default() {
        let clock = Arc::new(ManualTimeProvider::new(start()));
        let freshness = DataFreshness::new(clock);

        assert!(freshness.entries().is_empty());
    }

    #[test]
    fn never_updated_categories_use_tracking_start() {
        let clock = Arc::new(ManualTimeProvider::new(start()));
        let freshness = DataFreshness::with_categories(clock.clone(), DEFAULT_CATEGORIES);
        clock.advance(chrono::Duration::hours(2));
        freshness.track("games");

        let entries = freshness.entries();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.last_update.is_none() && e.since == start()));
    }

    #[test]
    fn record_update_uses_clock() {
        let clock = Arc::new(ManualTimeProvider::new(start()));
        let freshness = DataFreshness::with_categories(clock.clone(), DEFAULT_CATEGORIES);

        clock.advance(chrono::Duration::hours(3));
        freshness.record_update("games");

        assert_eq!(freshness.last_update("games"), Some(clock.now()));
        assert_eq!(freshness.last_update("players"), None);
    }

    #[test]
    fn updated_categories_are_tracked_in_arrival_order() {
        let clock = Arc::new(ManualTimeProvider::new(start()));
        let freshness = DataFreshness::with_categories(clock, ["games", "players"]);
        freshness.record_update_at("injuries", start());
        freshness.track("players");

        assert_eq!(freshness.categories(), vec!["games", "players", "injuries"]);
    }

    #[test]
    fn updates_are_mirrored_to_metrics() {
        let metrics = Arc::new(AppMetrics::new().unwrap());
        let clock = Arc::new(ManualTimeProvider::new(start()));
        let freshness = DataFreshness::new(clock).with_metrics(metrics.clone());

        freshness.record_update("projections");

        let value = metrics.data_last_update.with_label_values(&["projections"]).get();
        assert!((value - start().timestamp() as f64).abs() < f64::EPSILON);
    }
}
