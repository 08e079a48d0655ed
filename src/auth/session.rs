//! Authentication session state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the process-wide session currently stands
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Expired,
}

impl AuthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Expired => "expired",
        }
    }

    /// Numeric form used by the `auth_status` gauge
    pub fn as_gauge(&self) -> i64 {
        match self {
            Self::Unauthenticated => 0,
            Self::Authenticating => 1,
            Self::Authenticated => 2,
            Self::Expired => 3,
        }
    }
}

impl fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single authentication context shared by every command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthSession {
    pub status: AuthStatus,

    /// Token expiry, when the CLI reported one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Subscription or tenant the CLI is logged into
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_identifier: Option<String>,
}

impl Default for AuthSession {
    fn default() -> Self {
        Self::unauthenticated()
    }
}

impl AuthSession {
    pub fn unauthenticated() -> Self {
        Self {
            status: AuthStatus::Unauthenticated,
            expires_at: None,
            account_identifier: None,
        }
    }

    pub fn authenticated(
        expires_at: Option<DateTime<Utc>>,
        account_identifier: Option<String>,
    ) -> Self {
        Self {
            status: AuthStatus::Authenticated,
            expires_at,
            account_identifier,
        }
    }

    /// Whether `expires_at` lies in the past relative to `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Authenticated and not past expiry
    pub fn is_usable(&self) -> bool {
        self.status == AuthStatus::Authenticated && !self.is_expired_at(Utc::now())
    }
}

/// Device-code instructions relayed to the user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceCodeChallenge {
    pub verification_uri: String,
    pub user_code: String,

    /// The CLI's own instruction line
    pub message: String,
}

impl DeviceCodeChallenge {
    pub fn new(
        verification_uri: impl Into<String>,
        user_code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            verification_uri: verification_uri.into(),
            user_code: user_code.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_default_is_unauthenticated() {
        let session = AuthSession::default();
        assert_eq!(session.status, AuthStatus::Unauthenticated);
        assert!(!session.is_usable());
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let past = AuthSession::authenticated(Some(now - Duration::minutes(1)), None);
        assert!(past.is_expired_at(now));
        assert!(!past.is_usable());

        let future = AuthSession::authenticated(Some(now + Duration::hours(1)), None);
        assert!(future.is_usable());

        let unknown = AuthSession::authenticated(None, Some("sub".into()));
        assert!(unknown.is_usable());
    }

    #[test]
    fn test_serialization() {
        let session = AuthSession::authenticated(None, Some("sub-1".into()));
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["status"], "authenticated");
        assert_eq!(json["account_identifier"], "sub-1");
        assert!(json.get("expires_at").is_none());
    }
}
