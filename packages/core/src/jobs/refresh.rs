//! Data refresh: pull one category from the stats provider, then make the
//! rest of the runtime consistent with it.
//!
//! On success the job records freshness, invalidates every cache entry that
//! mentions a changed entity id (plus any configured listing functions),
//! and publishes one change event per entity. On failure nothing is
//! invalidated; the error goes back to the scheduler, which records it and
//! alerts.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::cache::QueryCache;
use crate::freshness::DataFreshness;
use crate::hub::{notify, BroadcastHub};
use crate::scheduler::{JobResult, ScheduledJob, Trigger};

pub type SourceError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Game,
    Player,
    Projection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangedEntity {
    pub kind: EntityKind,
    pub id: String,
    pub data: Value,
}

impl ChangedEntity {
    pub fn new(kind: EntityKind, id: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            id: id.into(),
            data,
        }
    }
}

/// External statistics provider. Implementations fetch upstream data,
/// persist it, and report which entities changed.
#[async_trait]
pub trait StatsSource: Send + Sync {
    fn source_name(&self) -> &str;

    async fn refresh(&self, category: &str) -> Result<Vec<ChangedEntity>, SourceError>;
}

pub struct DataRefreshJob {
    id: String,
    category: String,
    trigger: Trigger,
    source: Arc<dyn StatsSource>,
    cache: Arc<QueryCache>,
    hub: Arc<BroadcastHub>,
    freshness: Arc<DataFreshness>,
    listing_functions: Vec<String>,
}

impl DataRefreshJob {
    pub fn new(
        category: impl Into<String>,
        trigger: Trigger,
        source: Arc<dyn StatsSource>,
        cache: Arc<QueryCache>,
        hub: Arc<BroadcastHub>,
        freshness: Arc<DataFreshness>,
    ) -> Self {
        let category = category.into();
        freshness.track(&category);
        Self {
            id: format!("refresh_{}", category),
            category,
            trigger,
            source,
            cache,
            hub,
            freshness,
            listing_functions: Vec::new(),
        }
    }

    /// Cached functions to drop wholesale after every successful refresh
    /// (collection reads like `get_games` that no single id pattern covers).
    pub fn invalidating(mut self, functions: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.listing_functions = functions.into_iter().map(Into::into).collect();
        self
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    async fn apply(&self, changed: &[ChangedEntity]) -> usize {
        for function in &self.listing_functions {
            self.cache.invalidate_function(function).await;
        }

        let mut delivered = 0;
        for entity in changed {
            // match the id as a whole JSON string so "g4" spares "g42"
            let rendered = Value::from(entity.id.as_str()).to_string();
            self.cache.invalidate(Some(&rendered)).await;
            delivered += match entity.kind {
                EntityKind::Game => notify::game_updated(&self.hub, &entity.id, &entity.data).await,
                EntityKind::Player => {
                    notify::player_updated(&self.hub, &entity.id, &entity.data).await
                }
                EntityKind::Projection => {
                    notify::projection_updated(&self.hub, &entity.id, &entity.data).await
                }
            };
        }
        delivered
    }
}

#[async_trait]
impl ScheduledJob for DataRefreshJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn trigger(&self) -> Trigger {
        self.trigger.clone()
    }

    async fn run(&self) -> JobResult {
        tracing::info!(
            "Refreshing {} data from {}",
            self.category,
            self.source.source_name()
        );

        let changed = match self.source.refresh(&self.category).await {
            Ok(changed) => changed,
            Err(err) => {
                notify::system_notification(
                    &self.hub,
                    &format!("{} update failed", self.category),
                    "error",
                    None,
                )
                .await;
                return Err(err);
            }
        };

        self.freshness.record_update(&self.category);
        let delivered = self.apply(&changed).await;
        notify::system_notification(
            &self.hub,
            &format!("{} update completed: {} changes", self.category, changed.len()),
            "info",
            None,
        )
        .await;

        tracing::info!(
            "{} refresh applied {} changes ({} notifications delivered)",
            self.category,
            changed.len(),
            delivered
        );
        Ok(())
    }
}
