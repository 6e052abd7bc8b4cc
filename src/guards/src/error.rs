//! Error types for the guard engine

use serde::Serialize;
use thiserror::Error;

/// Why a credential was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailure {
    /// No credential-bearing header on the request
    MissingCredential,
    /// Header present but empty or without the configured prefix
    MalformedCredential,
    /// The token verifier rejected the credential
    InvalidCredential,
    /// The principal's expiry has passed
    ExpiredCredential,
    /// The credential has been revoked
    BlockedCredential,
    /// The permission source has no record of the principal
    UnknownUser,
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::MissingCredential => "credential missing",
            Self::MalformedCredential => "credential malformed",
            Self::InvalidCredential => "credential invalid",
            Self::ExpiredCredential => "credential expired",
            Self::BlockedCredential => "credential blocked",
            Self::UnknownUser => "unknown user",
        };
        f.write_str(msg)
    }
}

/// Guard engine errors
///
/// Every variant is terminal for the request that produced it: the guard
/// fails closed. `Clone` lets one single-flight load hand its outcome to
/// every waiter.
#[derive(Debug, Clone, Error)]
pub enum GuardError {
    /// Credential missing, invalid, expired or blocked
    #[error("Authentication failed: {0}")]
    Authentication(AuthFailure),

    /// Authenticated, but the permission requirement is not satisfied
    #[error("Insufficient permissions for user {user_id}: requires {required}")]
    Security { user_id: String, required: String },

    /// Malformed permission specification
    #[error("Invalid permission specification: {0}")]
    Validation(String),

    /// Pipeline aborted by cancellation or deadline
    #[error("Guard pipeline timed out")]
    Timeout,

    /// The permission source or token verifier failed
    #[error("Upstream source error: {0}")]
    Source(String),

    /// Invalid guard profile
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Public, detail-free classification of a denial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    Unauthenticated,
    Forbidden,
    InvalidRequest,
    Timeout,
    Unavailable,
}

impl GuardError {
    /// Convenience constructor for authentication failures
    pub fn auth(failure: AuthFailure) -> Self {
        Self::Authentication(failure)
    }

    /// Maps the error to the reason a caller is allowed to see
    pub fn denial(&self) -> DenialReason {
        match self {
            Self::Authentication(_) => DenialReason::Unauthenticated,
            Self::Security { .. } => DenialReason::Forbidden,
            Self::Validation(_) => DenialReason::InvalidRequest,
            Self::Timeout => DenialReason::Timeout,
            Self::Source(_) | Self::Configuration(_) => DenialReason::Unavailable,
        }
    }

    /// The error with upstream and configuration detail removed.
    ///
    /// Guards hand this form to callers; the full error only reaches logs
    /// and the audit sink.
    pub fn redacted(&self) -> Self {
        match self {
            Self::Source(_) => Self::Source("permission backend unavailable".to_string()),
            Self::Configuration(_) => Self::Configuration("guard misconfigured".to_string()),
            other => other.clone(),
        }
    }

    /// True for failures of the system rather than of the caller
    pub fn is_system_failure(&self) -> bool {
        matches!(self, Self::Source(_) | Self::Timeout | Self::Configuration(_))
    }
}

/// A cache tier could not serve a request.
///
/// Never surfaced to guard callers: the layered cache logs it and falls back
/// to the first tier or the source.
#[derive(Debug, Clone, Error)]
pub enum CacheDegradedError {
    #[error("Cache tier unavailable: {0}")]
    Unavailable(String),

    #[error("Cache entry could not be decoded: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for CacheDegradedError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Result type for guard operations
pub type Result<T> = std::result::Result<T, GuardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denial_hides_detail() {
        let err = GuardError::Source("connection refused to 10.0.0.7:5432".to_string());
        assert_eq!(err.denial(), DenialReason::Unavailable);
        assert!(err.is_system_failure());

        let err = GuardError::Security {
            user_id: "alice".to_string(),
            required: "admin.users".to_string(),
        };
        assert_eq!(err.denial(), DenialReason::Forbidden);
        assert!(!err.is_system_failure());
    }

    #[test]
    fn test_auth_failure_display() {
        let err = GuardError::auth(AuthFailure::BlockedCredential);
        assert_eq!(err.to_string(), "Authentication failed: credential blocked");
        assert_eq!(err.denial(), DenialReason::Unauthenticated);
    }

    #[test]
    fn test_redacted_drops_upstream_detail() {
        let err = GuardError::Source("connection refused to 10.0.0.7:5432".to_string());
        let public = err.redacted();
        assert!(matches!(public, GuardError::Source(_)));
        assert!(!public.to_string().contains("10.0.0.7"));
        assert_eq!(public.denial(), err.denial());

        let err = GuardError::Configuration("DATABASE_URL=postgres://admin:pw@db".to_string());
        assert!(!err.redacted().to_string().contains("postgres://"));

        let err = GuardError::auth(AuthFailure::ExpiredCredential);
        assert_eq!(err.redacted().to_string(), err.to_string());
    }
}
