use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Failure taxonomy shared by every component. Recorded verbatim in the
/// checkpoint and the audit journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigError,
    ValidationError,
    AuthError,
    PermissionError,
    NotFound,
    Conflict,
    RateLimited,
    TransientServerError,
    NetworkError,
    RetryExhausted,
    DependencyMissing,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConfigError => "config_error",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::PermissionError => "permission_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::TransientServerError => "transient_server_error",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::RetryExhausted => "retry_exhausted",
            ErrorKind::DependencyMissing => "dependency_missing",
            ErrorKind::InternalError => "internal_error",
        }
    }

    /// Kinds the tracker client retries with backoff.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkError | ErrorKind::RateLimited | ErrorKind::TransientServerError
        )
    }

    /// Kinds that abort the whole run instead of failing a single operation.
    /// Catalog validation never reaches execution, so a `validation_error`
    /// seen by the engine is a per-operation rejection from the tracker.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::ConfigError | ErrorKind::AuthError | ErrorKind::InternalError
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ValidationIssue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub external_id: String,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.external_id, self.message)
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

// ---------------------------------------------------------------------------
// TreError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TreError {
    #[error("config error: {0}")]
    Config(String),

    #[error("catalog validation failed ({} issue(s)): {}", .0.len(), join_issues(.0))]
    Validation(Vec<ValidationIssue>),

    /// The tracker refused a payload (HTTP 400 or a GraphQL error).
    #[error("tracker rejected request: {0}")]
    Rejected(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited by tracker")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("tracker server error {status}: {message}")]
    TransientServer { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("gave up after {attempts} attempt(s): {last}")]
    RetryExhausted { attempts: u32, last: Box<TreError> },

    #[error("missing dependency: {0}")]
    DependencyMissing(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl TreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TreError::Config(_) | TreError::Yaml(_) => ErrorKind::ConfigError,
            TreError::Validation(_) | TreError::Rejected(_) => ErrorKind::ValidationError,
            TreError::Auth(_) => ErrorKind::AuthError,
            TreError::Permission(_) => ErrorKind::PermissionError,
            TreError::NotFound(_) => ErrorKind::NotFound,
            TreError::Conflict(_) => ErrorKind::Conflict,
            TreError::RateLimited { .. } => ErrorKind::RateLimited,
            TreError::TransientServer { .. } => ErrorKind::TransientServerError,
            TreError::Network(_) => ErrorKind::NetworkError,
            TreError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            TreError::DependencyMissing(_) => ErrorKind::DependencyMissing,
            TreError::Internal(_) | TreError::Io(_) | TreError::Json(_) => {
                ErrorKind::InternalError
            }
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }

    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }

    /// A detached copy with the same kind and message, used when one failure
    /// has to be reported against several operations.
    pub fn replicate(&self) -> TreError {
        match self {
            TreError::Config(m) => TreError::Config(m.clone()),
            TreError::Validation(v) => TreError::Validation(v.clone()),
            TreError::Rejected(m) => TreError::Rejected(m.clone()),
            TreError::Auth(m) => TreError::Auth(m.clone()),
            TreError::Permission(m) => TreError::Permission(m.clone()),
            TreError::NotFound(m) => TreError::NotFound(m.clone()),
            TreError::Conflict(m) => TreError::Conflict(m.clone()),
            TreError::RateLimited { retry_after_secs } => TreError::RateLimited {
                retry_after_secs: *retry_after_secs,
            },
            TreError::TransientServer { status, message } => TreError::TransientServer {
                status: *status,
                message: message.clone(),
            },
            TreError::Network(m) => TreError::Network(m.clone()),
            TreError::RetryExhausted { attempts, last } => TreError::RetryExhausted {
                attempts: *attempts,
                last: Box::new(last.replicate()),
            },
            TreError::DependencyMissing(m) => TreError::DependencyMissing(m.clone()),
            TreError::Internal(m) => TreError::Internal(m.clone()),
            TreError::Io(e) => TreError::Internal(e.to_string()),
            TreError::Json(e) => TreError::Internal(e.to_string()),
            TreError::Yaml(e) => TreError::Config(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TreError>;
