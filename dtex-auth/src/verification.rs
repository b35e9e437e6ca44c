//! Token Verification
//!
//! Downstream side of a hop: the receiving agent or resource checks that a
//! presented token is addressed to it and carries the scope it requires.

use crate::{
    codec::TokenCodec,
    error::{ExchangeError, Result},
    scope::ScopeSet,
    token::Token,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Verification Result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Original principal
    pub subject: String,

    /// Agent that obtained the token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Granted scope
    pub scope: ScopeSet,

    /// Number of delegates between the subject and this resource
    pub delegation_depth: usize,

    /// Delegation chain audit trail
    pub delegation_chain: Vec<String>,

    /// Timestamp of verification
    pub verified_at: DateTime<Utc>,
}

impl VerificationResult {
    fn from_token(token: &Token, verified_at: DateTime<Utc>) -> Self {
        Self {
            subject: token.subject.clone(),
            client_id: token.client_id.clone(),
            scope: token.scope.clone(),
            delegation_depth: token.delegation_depth(),
            delegation_chain: token.audit_trail(),
            verified_at,
        }
    }
}

/// Token Verifier
///
/// Held by one receiving party; rejects tokens minted for anyone else.
#[derive(Clone)]
pub struct TokenVerifier {
    codec: TokenCodec,
    issuer: String,
    audience: String,
}

impl TokenVerifier {
    /// Create a verifier for tokens from `issuer` addressed to `audience`
    pub fn new(codec: TokenCodec, issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            codec,
            issuer: issuer.into(),
            audience: audience.into(),
        }
    }

    /// Audience this verifier accepts
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Verify a presented token
    pub async fn verify(&self, raw: &str, required_scope: &ScopeSet) -> Result<VerificationResult> {
        let token = self.codec.decode(raw, &self.issuer).await?;
        self.check(&token, required_scope)?;

        debug!(
            subject = %token.subject,
            audience = %self.audience,
            depth = token.delegation_depth(),
            "Presented token accepted"
        );

        Ok(VerificationResult::from_token(&token, self.codec.clock().now()))
    }

    /// Check audience and scope of an already decoded token
    pub fn check(&self, token: &Token, required_scope: &ScopeSet) -> Result<()> {
        if token.audience != self.audience {
            return Err(ExchangeError::AudienceMismatch(format!(
                "Token addressed to {}, not {}",
                token.audience, self.audience
            )));
        }

        if !required_scope.is_subset_of(&token.scope) {
            return Err(ExchangeError::ScopeNotSubset(format!(
                "Missing required scope {:?}",
                required_scope.missing_from(&token.scope)
            )));
        }

        Ok(())
    }
}
