//! Error taxonomy shared by every kman crate.

use serde::{Deserialize, Serialize};

/// HTTP status details carried over from the API server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiStatus {
    pub code: u16,
    /// Machine-readable reason, e.g. `NotFound`, `AlreadyExists`, `Conflict`.
    pub reason: String,
    pub message: String,
}

impl ApiStatus {
    pub fn new(code: u16, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code, reason: reason.into(), message: message.into() }
    }
}

impl std::fmt::Display for ApiStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.code, self.reason, self.message)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Malformed manifest or identity string. Never retried.
    #[error("parse: {0}")]
    Parse(String),
    /// Object absent on the server.
    #[error("not_found: {target}")]
    NotFound { target: String, status: Option<ApiStatus> },
    /// No REST mapping for a group/version/kind, after bounded rediscovery.
    #[error("mapping not found for {gvk} after {attempts} discovery attempt(s)")]
    MappingNotFound { gvk: String, attempts: u32 },
    #[error("already_exists: {target}")]
    AlreadyExists { target: String, status: Option<ApiStatus> },
    /// Optimistic-concurrency collision on update.
    #[error("conflict: {target}")]
    Conflict { target: String, status: Option<ApiStatus> },
    /// Network, TLS, auth or any other server failure.
    #[error("transport: {message}")]
    Transport { message: String, status: Option<ApiStatus> },
    #[error("cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// Caller misuse, e.g. a namespaced kind with no namespace to use.
    #[error("invalid: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn parse(msg: impl Into<String>) -> Self { Error::Parse(msg.into()) }

    pub fn transport(msg: impl Into<String>) -> Self { Error::Transport { message: msg.into(), status: None } }

    pub fn is_not_found(&self) -> bool { matches!(self, Error::NotFound { .. }) }

    pub fn is_conflict(&self) -> bool { matches!(self, Error::Conflict { .. }) }

    pub fn is_already_exists(&self) -> bool { matches!(self, Error::AlreadyExists { .. }) }

    /// Whether the caller may retry the same call unchanged (after backoff or a re-read).
    pub fn is_retryable(&self) -> bool { matches!(self, Error::Conflict { .. } | Error::Transport { .. }) }

    /// API status, when the error came back from the server.
    pub fn status(&self) -> Option<&ApiStatus> {
        match self {
            Error::NotFound { status, .. }
            | Error::AlreadyExists { status, .. }
            | Error::Conflict { status, .. }
            | Error::Transport { status, .. } => status.as_ref(),
            _ => None,
        }
    }

    /// Classify an API server status for `target` into the taxonomy.
    pub fn from_status(target: impl Into<String>, status: ApiStatus) -> Self {
        let target = target.into();
        match status.code {
            404 => Error::NotFound { target, status: Some(status) },
            409 if status.reason == "AlreadyExists" => Error::AlreadyExists { target, status: Some(status) },
            409 => Error::Conflict { target, status: Some(status) },
            _ => Error::Transport { message: format!("{}: {}", target, status), status: Some(status) },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self { Error::Parse(e.to_string()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        let nf = Error::from_status("v1/ConfigMap default/a", ApiStatus::new(404, "NotFound", "gone"));
        assert!(nf.is_not_found());
        assert_eq!(nf.status().map(|s| s.code), Some(404));

        let ae = Error::from_status("x", ApiStatus::new(409, "AlreadyExists", "dup"));
        assert!(ae.is_already_exists());
        assert!(!ae.is_retryable());

        let c = Error::from_status("x", ApiStatus::new(409, "Conflict", "stale"));
        assert!(c.is_conflict());
        assert!(c.is_retryable());

        let t = Error::from_status("x", ApiStatus::new(503, "ServiceUnavailable", "down"));
        assert!(matches!(t, Error::Transport { status: Some(ref s), .. } if s.code == 503));
    }

    #[test]
    fn cancellation_is_distinct_from_not_found() {
        assert!(!Error::Cancelled.is_not_found());
        assert!(!Error::DeadlineExceeded.is_retryable());
    }
}
