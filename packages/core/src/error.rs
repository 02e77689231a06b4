use thiserror::Error;

/// Unified application error.
///
/// Startup and the outer service layers (config, metrics registry, HTTP
/// listener) fail through this type; the runtime components carry their own
/// module-level errors.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Server error: {0}")]
    Server(#[from] std::io::Error),
}
