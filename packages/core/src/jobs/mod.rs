//! Built-in jobs registered at startup.

pub mod cache_sweep;
pub mod refresh;

pub use cache_sweep::{CacheSweepJob, CACHE_SWEEP_JOB_ID};
pub use refresh::{ChangedEntity, DataRefreshJob, EntityKind, SourceError, StatsSource};
