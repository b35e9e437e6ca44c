//! Error types for token exchange

use serde::{Deserialize, Serialize};

/// Result type for token exchange operations
pub type Result<T> = std::result::Result<T, ExchangeError>;

/// Token exchange errors
///
/// Every variant is terminal for the exchange call that produced it. The
/// detail string is meant for logs; callers on the wire only see the
/// [`ErrorKind`] via [`ExchangeError::to_response`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    /// Signature could not be verified against the issuer's keys
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Token is past its expiry
    #[error("Token expired: {0}")]
    Expired(String),

    /// Token is not valid yet (`iat`/`nbf` in the future)
    #[error("Token not yet valid: {0}")]
    NotYetValid(String),

    /// Required claims are missing or mistyped
    #[error("Malformed claims: {0}")]
    MalformedClaims(String),

    /// Policy does not allow this delegation hop
    #[error("Delegation not permitted: {0}")]
    DelegationNotPermitted(String),

    /// Requested scope is wider than what the subject token authorizes
    #[error("Requested scope is not a subset: {0}")]
    ScopeNotSubset(String),

    /// Token audience does not match the calling or requested party
    #[error("Audience mismatch: {0}")]
    AudienceMismatch(String),

    /// Verification keys could not be obtained
    #[error("Signing keys unavailable: {0}")]
    KeyUnavailable(String),

    /// Exchange request parameters are invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration or key material error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Error kind, stable across detail messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`ExchangeError::InvalidSignature`]
    InvalidSignature,
    /// See [`ExchangeError::Expired`]
    Expired,
    /// See [`ExchangeError::NotYetValid`]
    NotYetValid,
    /// See [`ExchangeError::MalformedClaims`]
    MalformedClaims,
    /// See [`ExchangeError::DelegationNotPermitted`]
    DelegationNotPermitted,
    /// See [`ExchangeError::ScopeNotSubset`]
    ScopeNotSubset,
    /// See [`ExchangeError::AudienceMismatch`]
    AudienceMismatch,
    /// See [`ExchangeError::KeyUnavailable`]
    KeyUnavailable,
    /// See [`ExchangeError::InvalidRequest`]
    InvalidRequest,
    /// See [`ExchangeError::Config`]
    Config,
}

impl ErrorKind {
    /// Snake-case name used in logs and audit events
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidSignature => "invalid_signature",
            ErrorKind::Expired => "expired",
            ErrorKind::NotYetValid => "not_yet_valid",
            ErrorKind::MalformedClaims => "malformed_claims",
            ErrorKind::DelegationNotPermitted => "delegation_not_permitted",
            ErrorKind::ScopeNotSubset => "scope_not_subset",
            ErrorKind::AudienceMismatch => "audience_mismatch",
            ErrorKind::KeyUnavailable => "key_unavailable",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Config => "config",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ExchangeError {
    /// Kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExchangeError::InvalidSignature(_) => ErrorKind::InvalidSignature,
            ExchangeError::Expired(_) => ErrorKind::Expired,
            ExchangeError::NotYetValid(_) => ErrorKind::NotYetValid,
            ExchangeError::MalformedClaims(_) => ErrorKind::MalformedClaims,
            ExchangeError::DelegationNotPermitted(_) => ErrorKind::DelegationNotPermitted,
            ExchangeError::ScopeNotSubset(_) => ErrorKind::ScopeNotSubset,
            ExchangeError::AudienceMismatch(_) => ErrorKind::AudienceMismatch,
            ExchangeError::KeyUnavailable(_) => ErrorKind::KeyUnavailable,
            ExchangeError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ExchangeError::Config(_) => ErrorKind::Config,
        }
    }

    /// Check if error is retryable
    ///
    /// Only key fetch failures are transient; everything else is a caller or
    /// policy defect and must be corrected before trying again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::KeyUnavailable(_))
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            ExchangeError::InvalidSignature(_) => 401,
            ExchangeError::Expired(_) => 401,
            ExchangeError::NotYetValid(_) => 401,
            ExchangeError::MalformedClaims(_) => 400,
            ExchangeError::DelegationNotPermitted(_) => 403,
            ExchangeError::ScopeNotSubset(_) => 400,
            ExchangeError::AudienceMismatch(_) => 400,
            ExchangeError::KeyUnavailable(_) => 503,
            ExchangeError::InvalidRequest(_) => 400,
            ExchangeError::Config(_) => 500,
        }
    }

    /// OAuth 2.0 error code (RFC 6749 §5.2, RFC 8693 §2.2.2)
    pub fn oauth_error(&self) -> &'static str {
        match self {
            ExchangeError::InvalidSignature(_)
            | ExchangeError::Expired(_)
            | ExchangeError::NotYetValid(_)
            | ExchangeError::MalformedClaims(_) => "invalid_grant",
            ExchangeError::DelegationNotPermitted(_) => "unauthorized_client",
            ExchangeError::ScopeNotSubset(_) => "invalid_scope",
            ExchangeError::AudienceMismatch(_) => "invalid_target",
            ExchangeError::KeyUnavailable(_) => "temporarily_unavailable",
            ExchangeError::InvalidRequest(_) => "invalid_request",
            ExchangeError::Config(_) => "server_error",
        }
    }

    /// Wire-safe error response without the detail message
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.oauth_error().to_string(),
            error_description: Some(self.kind().as_str().to_string()),
        }
    }
}

/// OAuth error response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// OAuth error code
    pub error: String,

    /// Generic description (error kind, never the root cause)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

// Conversions from common error types
impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::MalformedClaims(format!("JSON error: {}", err))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        ExchangeError::KeyUnavailable(err.to_string())
    }
}

impl From<toml::de::Error> for ExchangeError {
    fn from(err: toml::de::Error) -> Self {
        ExchangeError::Config(format!("Failed to parse config: {}", err))
    }
}
