//! Error types for the update system.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during update operations.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Upstream returned a non-success HTTP status
    #[error("request to {url} failed with status {status}")]
    Network { url: String, status: u16 },

    /// Transport-level HTTP failure (connect, timeout, body read)
    #[error("HTTP error: {0}")]
    Http(String),

    /// Local file, directory or version record does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Content hash does not match the expected value
    #[error("hash mismatch for {}: expected {expected}, got {actual}", .path.display())]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Data could not be parsed
    #[error("parse error: {0}")]
    Parse(String),

    /// Waiting on a lock or queue was abandoned by the caller
    #[error("timed out waiting for {0}")]
    ConcurrencyTimeout(String),

    /// A step of the install pipeline failed
    #[error("update pipeline failed during {step}: {source}")]
    Pipeline {
        step: PipelineStep,
        #[source]
        source: Box<UpdateError>,
    },

    /// A download task reached its terminal failed state
    #[error("download of {url} failed: {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Package extraction failed
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// Operation was cancelled cooperatively
    #[error("operation cancelled")]
    Cancelled,

    /// Another update pipeline already holds the update lock
    #[error("an update is already in progress")]
    UpdateInProgress,

    /// Channel name not recognised
    #[error("invalid channel: {0}")]
    InvalidChannel(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Local config service reported a failure
    #[error("config service error: {0}")]
    ConfigService(String),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Blocking worker panicked or was aborted
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl UpdateError {
    /// Wrap an error as a failure of the given pipeline step.
    pub fn at_step(self, step: PipelineStep) -> Self {
        match self {
            already @ UpdateError::Pipeline { .. } => already,
            other => UpdateError::Pipeline {
                step,
                source: Box::new(other),
            },
        }
    }

    /// Whether this error is an integrity failure.
    pub fn is_integrity(&self) -> bool {
        match self {
            UpdateError::HashMismatch { .. } => true,
            UpdateError::Pipeline { source, .. } => source.is_integrity(),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        match (err.status(), err.url()) {
            (Some(status), Some(url)) => UpdateError::Network {
                url: url.to_string(),
                status: status.as_u16(),
            },
            _ => UpdateError::Http(err.to_string()),
        }
    }
}

impl From<zip::result::ZipError> for UpdateError {
    fn from(err: zip::result::ZipError) -> Self {
        UpdateError::Extraction(err.to_string())
    }
}

impl From<tokio::task::JoinError> for UpdateError {
    fn from(err: tokio::task::JoinError) -> Self {
        UpdateError::TaskJoin(err.to_string())
    }
}

/// Steps of the install pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Preparing,
    Downloading,
    Verifying,
    Installing,
    Finalizing,
}

impl PipelineStep {
    /// 1-based position of the step in the pipeline.
    pub fn index(self) -> u8 {
        match self {
            PipelineStep::Preparing => 1,
            PipelineStep::Downloading => 2,
            PipelineStep::Verifying => 3,
            PipelineStep::Installing => 4,
            PipelineStep::Finalizing => 5,
        }
    }

    /// Number of steps in a full pipeline run.
    pub const COUNT: u8 = 5;
}

impl std::fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineStep::Preparing => "preparing",
            PipelineStep::Downloading => "downloading",
            PipelineStep::Verifying => "verifying",
            PipelineStep::Installing => "installing",
            PipelineStep::Finalizing => "finalizing",
        };
        f.write_str(name)
    }
}
