use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("invalid strain slug: {0}")]
    InvalidSlug(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration value: {0}")]
    InvalidConfig(String),

    #[error("request failed: {0}")]
    Http(String),

    #[error("{url} returned status {status}: {message}")]
    Status {
        url: String,
        status: u16,
        message: String,
    },

    #[error(
        "rate limited at {url} (status {status}, Retry-After: {}) after {attempts} attempts",
        retry_after.as_deref().unwrap_or("<missing>")
    )]
    RateLimited {
        url: String,
        status: u16,
        retry_after: Option<String>,
        attempts: u32,
    },

    #[error("malformed response from {context}: {message}")]
    MalformedResponse { context: String, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("artifact {path} is unreadable: {message}")]
    ArtifactCorrupt { path: String, message: String },

    #[error("identity pool error: {0}")]
    Identity(String),

    #[error("aborted")]
    Aborted,
}

impl HarvestError {
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            HarvestError::Http(_)
                | HarvestError::Status { .. }
                | HarvestError::RateLimited { .. }
                | HarvestError::MalformedResponse { .. }
        )
    }
}
