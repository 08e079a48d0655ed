//! Error Types
//!
//! Every failure the gateway can report is classified by an [`ErrorKind`].
//! Authentication failures carry their own [`AuthError`] so the session
//! manager can report them precisely; the gateway flattens both into the
//! client-visible [`ToolError`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable failure classification
///
/// Serialized in snake_case, e.g. `"validation_error"`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected before execution; the caller may retry with corrected input
    ValidationError,

    /// Authentication did not complete within the auth timeout
    AuthTimeout,

    /// Interactive login failed
    AuthLoginFailed,

    /// Service credentials were rejected by the CLI
    AuthCredentialRejected,

    /// The CLI binary could not be spawned
    ExecutionSetupError,

    /// The command exceeded its timeout and was killed
    Timeout,

    /// The CLI ran and reported failure
    CommandError,
}

impl ErrorKind {
    /// Stable string form, identical to the serialized value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::AuthTimeout => "auth_timeout",
            Self::AuthLoginFailed => "auth_login_failed",
            Self::AuthCredentialRejected => "auth_credential_rejected",
            Self::ExecutionSetupError => "execution_setup_error",
            Self::Timeout => "timeout",
            Self::CommandError => "command_error",
        }
    }

    /// Whether retrying the same request may reasonably succeed
    ///
    /// `CommandError` is never retryable: the operation may have partially
    /// applied.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ValidationError | Self::AuthTimeout | Self::AuthLoginFailed | Self::Timeout
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentication failures reported by the session manager
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication timed out after {0}s")]
    Timeout(u64),

    #[error("login failed: {0}")]
    LoginFailed(String),

    #[error("service credential rejected: {0}")]
    CredentialRejected(String),

    #[error("failed to start the CLI for authentication: {0}")]
    Setup(String),
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::AuthTimeout,
            Self::LoginFailed(_) => ErrorKind::AuthLoginFailed,
            Self::CredentialRejected(_) => ErrorKind::AuthCredentialRejected,
            Self::Setup(_) => ErrorKind::ExecutionSetupError,
        }
    }
}

/// Client-visible structured error
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }
}

impl From<AuthError> for ToolError {
    fn from(err: AuthError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::error::Error for ToolError {}
