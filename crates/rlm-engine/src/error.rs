// crates/rlm-engine/src/error.rs
// Standardized error types for the RLM engine

use std::time::Duration;
use thiserror::Error;

/// Main error type for the RLM library
#[derive(Error, Debug)]
pub enum RlmError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("provider call timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("provider call cancelled")]
    Cancelled,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("stream normalization error: {0}")]
    Normalize(String),

    #[error("unsafe pattern rejected: {0}")]
    UnsafePattern(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no provider available for {provider}/{model}")]
    NoProvider { provider: String, model: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using RlmError
pub type Result<T> = std::result::Result<T, RlmError>;

impl From<regex::Error> for RlmError {
    fn from(err: regex::Error) -> Self {
        RlmError::UnsafePattern(err.to_string())
    }
}
