use thiserror::Error;

/// Outcome type every job callable returns.
pub type JobResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },

    #[error("Job {id} failed: {message}")]
    Failed { id: String, message: String },
}
