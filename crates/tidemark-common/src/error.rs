//! Error types shared across tidemark binaries

use thiserror::Error;

/// Result type alias for shared tidemark operations
pub type Result<T> = std::result::Result<T, TidemarkError>;

/// Errors raised outside the pipeline engine itself: configuration files,
/// environment variables and the filesystem.
#[derive(Error, Debug)]
pub enum TidemarkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}. Check the environment and the pipelines file.")]
    Config(String),

    #[error("Invalid value '{value}' for {name}: {reason}")]
    InvalidSetting {
        name: String,
        value: String,
        reason: String,
    },
}

impl TidemarkError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an error for an environment variable or setting that failed to parse
    pub fn invalid_setting(
        name: impl Into<String>,
        value: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidSetting {
            name: name.into(),
            value: value.into(),
            reason: reason.to_string(),
        }
    }
}
