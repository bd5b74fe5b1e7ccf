use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Typed error taxonomy for all core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input, user-correctable.
    #[error("{0}")]
    Validation(String),

    /// Referenced session/group/worktree is absent.
    #[error("{0}")]
    NotFound(String),

    /// Duplicate name or id collision.
    #[error("{0}")]
    Conflict(String),

    /// A required external tool is not installed.
    #[error("required external tool not found: {0}")]
    DependencyMissing(String),

    /// The multiplexer host is unreachable or refused the command.
    #[error("multiplexer host unavailable: {0}")]
    AdapterUnavailable(String),

    /// An external resource refused an operation.
    #[error("{0}")]
    Resource(String),

    /// No free port within the configured range.
    #[error("no free port in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },

    /// The target path is not inside a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(String),

    /// The requested branch name already exists.
    #[error("branch '{0}' already exists")]
    BranchExists(String),

    /// The session's multiplexed terminal no longer exists on the host.
    #[error("session '{0}' is not running")]
    SessionNotRunning(String),

    /// A bounded external command did not finish in time. Transient.
    #[error("{operation} timed out after {timeout_secs}s")]
    Timeout {
        operation: String,
        timeout_secs: u64,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Persistence layer failure.
    #[error("store error: {0}")]
    Store(String),
}

impl Error {
    /// Stable machine-readable code, used in API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Conflict(_) => "CONFLICT",
            Error::DependencyMissing(_) => "DEPENDENCY_MISSING",
            Error::AdapterUnavailable(_) => "ADAPTER_UNAVAILABLE",
            Error::Resource(_) => "RESOURCE_ERROR",
            Error::Exhausted { .. } => "PORTS_EXHAUSTED",
            Error::NotAGitRepo(_) => "NOT_A_GIT_REPO",
            Error::BranchExists(_) => "BRANCH_EXISTS",
            Error::SessionNotRunning(_) => "SESSION_NOT_RUNNING",
            Error::Timeout { .. } => "TIMEOUT",
            Error::Io(_) => "IO_ERROR",
            Error::Store(_) => "STORE_ERROR",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) | Error::BranchExists(_) => StatusCode::CONFLICT,
            Error::SessionNotRunning(_) | Error::NotAGitRepo(_) => StatusCode::CONFLICT,
            Error::Exhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::AdapterUnavailable(_) | Error::DependencyMissing(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for failures worth retrying exactly once on idempotent reads.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::Validation("x".into()).code(), "VALIDATION_ERROR");
        assert_eq!(
            Error::SessionNotRunning("s".into()).code(),
            "SESSION_NOT_RUNNING"
        );
        assert_eq!(
            Error::Exhausted {
                start: 4000,
                end: 4999
            }
            .code(),
            "PORTS_EXHAUSTED"
        );
    }

    #[test]
    fn only_timeouts_are_transient() {
        assert!(Error::Timeout {
            operation: "capture".into(),
            timeout_secs: 5
        }
        .is_transient());
        assert!(!Error::NotFound("x".into()).is_transient());
    }
}
