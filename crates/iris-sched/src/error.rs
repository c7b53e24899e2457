use thiserror::Error;

/// Errors raised while building or starting scheduler components.
#[derive(Debug, Error)]
pub enum SchedError {
    /// Interval or offset out of range; a configuration defect.
    #[error("Invalid period: {0}")]
    InvalidPeriod(String),

    /// The OS refused to start the scheduler thread.
    #[error("Failed to spawn thread {name}: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// A job action that did not finish cleanly.
#[derive(Debug, Error)]
pub enum JobError {
    /// The action returned an error.
    #[error("Job {job} failed: {error:#}")]
    Failed { job: String, error: anyhow::Error },

    /// The action panicked; the payload message is preserved when it is a string.
    #[error("Job {job} panicked: {message}")]
    Panicked { job: String, message: String },
}

impl JobError {
    /// Name of the job that failed.
    pub fn job(&self) -> &str {
        match self {
            JobError::Failed { job, .. } | JobError::Panicked { job, .. } => job,
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedError>;
