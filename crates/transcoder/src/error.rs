//! Error taxonomy and recoverability classification.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Message fragments that point at transport trouble worth another attempt.
const RECOVERABLE_PATTERNS: &[&str] = &[
    "connection",
    "network",
    "timeout",
    "unreachable",
    "refused",
    "reset",
    "broken pipe",
    "i/o timeout",
    "no route to host",
    "temporary failure",
    "server misbehaving",
    "http2: server sent goaway",
    "eof",
];

/// Message fragments that point at a structural problem with the input or
/// the invocation; retrying cannot fix these.
const NON_RECOVERABLE_PATTERNS: &[&str] = &[
    "file not found",
    "no such file",
    "permission denied",
    "invalid argument",
    "malformed",
    "unsupported",
    "codec not found",
    "invalid data",
];

/// Failure of a single manifest probe.
#[derive(Error, Debug)]
pub enum HealthCheckError {
    #[error("invalid stream URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("stream unreachable: {source}")]
    Unreachable {
        #[source]
        source: reqwest::Error,
    },

    #[error("stream returned HTTP {status}")]
    BadStatus { status: StatusCode },

    #[error("invalid HLS playlist format: missing #EXTM3U header")]
    BadFormat,
}

impl HealthCheckError {
    /// Every probe failure is worth retrying except a URL that can never parse.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::InvalidUrl { .. })
    }
}

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid transcode request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("health check failed: {0}")]
    HealthCheck(#[from] HealthCheckError),

    #[error("engine stalled: no progress for {stalled_for:?} (stall timeout {threshold:?})")]
    Timeout {
        stalled_for: Duration,
        threshold: Duration,
    },

    #[error("engine connection to {source_url} failed: {reason}")]
    ConnectionFailed { source_url: String, reason: String },

    #[error("stream disconnected while reading {source_url}: {line}")]
    StreamDisconnected { source_url: String, line: String },

    #[error("engine exited with {status}{}", .detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    ExecutionFailed {
        status: String,
        detail: Option<String>,
    },

    #[error("failed to start engine `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while {op} `{}`: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("segmentation error: {0}")]
    Segmentation(String),

    #[error("segment concatenation exited with {status}: {output}")]
    Concat { status: String, output: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{operation} failed after {attempts} attempts, last error: {last_error}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        last_error: Box<Error>,
    },

    #[error("{operation} stopped after {attempts} attempts on a non-recoverable error: {last_error}")]
    Aborted {
        operation: &'static str,
        attempts: u32,
        #[source]
        last_error: Box<Error>,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether another full attempt has a reasonable chance of succeeding.
    ///
    /// Typed failures are decided by kind; anything carrying free-form engine
    /// or OS text falls back to [`message_is_recoverable`].
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Cancelled
            | Self::InvalidRequest(_)
            | Self::Configuration(_)
            | Self::RetriesExhausted { .. }
            | Self::Aborted { .. } => false,
            Self::HealthCheck(e) => e.is_recoverable(),
            Self::Timeout { .. } | Self::ConnectionFailed { .. } | Self::StreamDisconnected { .. } => {
                true
            }
            Self::Spawn { source, .. }
                if matches!(
                    source.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
                ) =>
            {
                false
            }
            Self::ExecutionFailed { .. }
            | Self::Spawn { .. }
            | Self::Io { .. }
            | Self::Segmentation(_)
            | Self::Concat { .. }
            | Self::Other(_) => message_is_recoverable(&self.to_string()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Classify an optional failure. No failure means there is nothing to retry.
pub fn is_recoverable(error: Option<&Error>) -> bool {
    error.is_some_and(Error::is_recoverable)
}

/// Pattern-based recoverability of a failure description.
///
/// Transport patterns win over structural ones; text matching neither list
/// is optimistically treated as recoverable.
pub fn message_is_recoverable(message: &str) -> bool {
    let message = message.to_lowercase();

    if RECOVERABLE_PATTERNS.iter().any(|p| message.contains(p)) {
        return true;
    }

    !NON_RECOVERABLE_PATTERNS
        .iter()
        .any(|p| message.contains(p))
}
