//! Error types for the acquisition and qualification pipeline
//!
//! Parse and probe errors are per-candidate and never abort a run; fetch and
//! store errors are run-level and are surfaced to the caller.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A raw share link could not be turned into a [`Descriptor`](crate::proxy::Descriptor)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unsupported scheme in `{0}`")]
    UnsupportedScheme(String),
    #[error("malformed link: {0}")]
    Malformed(String),
}

impl ParseError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        ParseError::Malformed(reason.into())
    }
}

/// Retrieval of an endpoint list failed
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("all fetch strategies failed for {url}")]
    AllStrategiesFailed { url: String },
    #[error("invalid source url `{0}`")]
    InvalidUrl(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure of a single probe; always collapsed into an unreachable outcome
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("failed to write engine config: {0}")]
    ConfigWrite(#[source] std::io::Error),
    #[error("failed to spawn proxy engine: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("proxy engine exited early with {0}")]
    EngineExited(std::process::ExitStatus),
    #[error("proxy engine did not listen within {0:?}")]
    EngineNotReady(Duration),
    #[error("probe request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("probe request timed out after {0:?}")]
    Timeout(Duration),
    #[error("probe returned HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("probe cancelled")]
    Cancelled,
}

/// I/O failure on the persisted result file
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read result store {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write result store {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
