use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum KegError {
    #[error("I/O Error: {0}")]
    Io(#[from] Arc<std::io::Error>),

    #[error("HTTP Request Error: {0}")]
    Http(#[from] Arc<reqwest::Error>),

    #[error("JSON Parsing Error: {0}")]
    Json(#[from] Arc<serde_json::Error>),

    #[error("TOML Parsing Error: {0}")]
    Toml(#[from] Arc<toml::de::Error>),

    #[error("Semantic Versioning Error: {0}")]
    SemVer(#[from] Arc<semver::Error>),

    /// Unresolvable variant, dependency, template variable or requirement.
    #[error("Configuration Error: {0}")]
    Configuration(String),

    /// Digest of a fetched artifact does not match the declared one.
    #[error("Integrity Error: {0}")]
    Integrity(String),

    #[error("Build step {index} failed: `{command}` ({status})\n{stderr_tail}")]
    BuildStep {
        index: usize,
        command: String,
        status: String,
        stderr_tail: String,
    },

    #[error("Test failure in `{step}`: {reason}\n{output}")]
    TestFailure {
        step: String,
        reason: String,
        output: String,
    },

    #[error("Test timeout: `{step}` not ready after {}", humantime::format_duration(*.waited))]
    TestTimeout { step: String, waited: Duration },

    #[error("DownloadError: Failed to download '{0}' from '{1}': {2}")]
    Download(String, String, String),

    #[error("Parsing Error in {0}: {1}")]
    Parse(&'static str, String),

    #[error("Validation Error: {0}")]
    Validation(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Failed to execute command: {0}")]
    CommandExec(String),

    #[error("Generic Error: {0}")]
    Generic(String),
}

impl KegError {
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity(_))
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

impl From<std::io::Error> for KegError {
    fn from(err: std::io::Error) -> Self {
        KegError::Io(Arc::new(err))
    }
}

impl From<reqwest::Error> for KegError {
    fn from(err: reqwest::Error) -> Self {
        KegError::Http(Arc::new(err))
    }
}

impl From<serde_json::Error> for KegError {
    fn from(err: serde_json::Error) -> Self {
        KegError::Json(Arc::new(err))
    }
}

impl From<toml::de::Error> for KegError {
    fn from(err: toml::de::Error) -> Self {
        KegError::Toml(Arc::new(err))
    }
}

impl From<semver::Error> for KegError {
    fn from(err: semver::Error) -> Self {
        KegError::SemVer(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, KegError>;
