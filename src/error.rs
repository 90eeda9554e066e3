//! Error types for the extension host.
//!
//! Every error that can cross the host/worker boundary carries a stable
//! `name` and optional `code` so extensions can catch by name (e.g.
//! `PermissionError`) on the far side. The enum is `Clone` because
//! activation outcomes are fanned out to every concurrent requester
//! through a shared future.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Error code attached to request timeouts.
pub const CODE_TIMEOUT: &str = "EXTENSION_TIMEOUT";
/// Error code attached to requests rejected by worker termination.
pub const CODE_WORKER_TERMINATED: &str = "EXTENSION_WORKER_TERMINATED";

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Manifest invalid. Fatal at load, never retried.
    #[error("{message}")]
    Manifest { message: String },

    /// Declared-check failure or user denial.
    #[error("{message}")]
    Permission { message: String },

    /// A request to a worker exceeded its deadline. The worker is terminated.
    #[error("{message}")]
    Timeout { message: String },

    /// The worker terminated while the request was in flight.
    #[error("{message}")]
    WorkerTerminated { message: String },

    /// A range or selection exceeds the cell-count cap.
    #[error("range {range} is too large ({cells} cells, limit {limit})")]
    RangeTooLarge {
        range: String,
        cells: u64,
        limit: u64,
    },

    /// Argument-shape or state validation failure. Never terminates the worker.
    #[error("{message}")]
    Validation { message: String },

    /// Sandbox policy violation inside the worker. Fatal per-call, never prompts.
    #[error("{message}")]
    Sandbox { message: String },

    /// An error thrown by extension code, surfaced verbatim with its
    /// original `name`/`code` preserved across the boundary.
    #[error("{message}")]
    Extension {
        message: String,
        name: Option<String>,
        code: Option<String>,
        stack: Option<String>,
    },

    #[error("{message}")]
    Io { message: String },

    #[error("{message}")]
    Json { message: String },

    #[error("{message}")]
    Http { message: String },
}

impl Error {
    pub fn manifest(message: impl Into<String>) -> Self {
        Self::Manifest {
            message: message.into(),
        }
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::Permission {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::Sandbox {
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    pub fn http(message: impl Into<String>) -> Self {
        Self::Http {
            message: message.into(),
        }
    }

    /// Timeout for a named operation against a named extension.
    pub fn timeout(operation: impl fmt::Display, extension_id: &str, millis: u64) -> Self {
        Self::Timeout {
            message: format!("{operation} timed out after {millis} ms ({extension_id})"),
        }
    }

    pub fn worker_terminated(extension_id: &str) -> Self {
        Self::WorkerTerminated {
            message: format!("extension worker terminated ({extension_id})"),
        }
    }

    /// The stable error name surfaced across the worker boundary.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Manifest { .. } => "ManifestError",
            Self::Permission { .. } => "PermissionError",
            Self::Timeout { .. } => "ExtensionTimeoutError",
            Self::WorkerTerminated { .. } => "ExtensionWorkerTerminatedError",
            Self::RangeTooLarge { .. } => "RangeTooLargeError",
            Self::Validation { .. } => "ValidationError",
            Self::Sandbox { .. } => "SandboxError",
            Self::Extension { name, .. } => name.as_deref().unwrap_or("Error"),
            Self::Io { .. } => "IoError",
            Self::Json { .. } => "JsonError",
            Self::Http { .. } => "HttpError",
        }
    }

    /// The stable error code, if this kind carries one.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Timeout { .. } => Some(CODE_TIMEOUT),
            Self::WorkerTerminated { .. } => Some(CODE_WORKER_TERMINATED),
            Self::Extension { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Http {
            message: err.to_string(),
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::Validation {
            message: format!("invalid URL: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_carries_code_and_name() {
        let err = Error::timeout("command t.x.a", "t.x", 100);
        assert_eq!(err.name(), "ExtensionTimeoutError");
        assert_eq!(err.code(), Some(CODE_TIMEOUT));
        assert!(err.to_string().contains("100 ms"));
    }

    #[test]
    fn extension_error_preserves_original_name() {
        let err = Error::Extension {
            message: "boom".to_string(),
            name: Some("CustomError".to_string()),
            code: Some("E_CUSTOM".to_string()),
            stack: None,
        };
        assert_eq!(err.name(), "CustomError");
        assert_eq!(err.code(), Some("E_CUSTOM"));
    }
}
