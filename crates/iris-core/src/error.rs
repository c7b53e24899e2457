use thiserror::Error;

#[derive(Debug, Error)]
pub enum IrisError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging setup failed: {0}")]
    Telemetry(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IrisError {
    /// Short error code string for log correlation.
    pub fn code(&self) -> &'static str {
        match self {
            IrisError::Config(_) => "CONFIG_ERROR",
            IrisError::Telemetry(_) => "TELEMETRY_ERROR",
            IrisError::Serialization(_) => "SERIALIZATION_ERROR",
            IrisError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, IrisError>;
