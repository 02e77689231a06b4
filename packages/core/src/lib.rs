// Library root: exposes the runtime components to the binary and to the
// integration tests in `tests/`.

pub mod alerts;
pub mod api;
pub mod cache;
pub mod clock;
pub mod error;
pub mod freshness;
pub mod health;
pub mod hub;
pub mod jobs;
pub mod metrics;
pub mod runtime;
pub mod scheduler;

pub mod cli;
pub mod config;
pub mod logging;
