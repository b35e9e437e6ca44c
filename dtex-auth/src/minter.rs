//! Token Minter
//!
//! Builds and signs the narrowed token for one delegation hop.

use crate::{
    actor::ActorChain,
    clock::Clock,
    codec::TokenCodec,
    error::{ExchangeError, Result},
    keys::SigningKey,
    policy::Authorization,
    token::{DelegationGrant, Token},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Token Minter
#[derive(Clone)]
pub struct TokenMinter {
    issuer: String,
    signing_key: SigningKey,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
}

impl TokenMinter {
    /// Create a minter signing as `issuer`
    pub fn new(
        issuer: impl Into<String>,
        signing_key: SigningKey,
        clock: Arc<dyn Clock>,
        default_ttl: Duration,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            signing_key,
            clock,
            default_ttl,
        }
    }

    /// Issuer of minted tokens
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Lifetime used when the request does not ask for one
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Mint a token derived from `subject`
    ///
    /// The lifetime is `ttl` (or the default) cut down to what is left of
    /// the subject token, so a minted token never outlives its source.
    pub fn mint(
        &self,
        subject: &Token,
        authorization: &Authorization,
        chain: ActorChain,
        ttl: Option<Duration>,
        grant: Option<DelegationGrant>,
    ) -> Result<(Token, String)> {
        let now = self.clock.now().timestamp();
        let remaining = subject.expires_at.saturating_sub(now);
        if remaining <= 0 {
            return Err(ExchangeError::Expired(format!(
                "Subject token has no validity left (exp {}, now {})",
                subject.expires_at, now
            )));
        }

        let requested = i64::try_from(ttl.unwrap_or(self.default_ttl).as_secs()).unwrap_or(i64::MAX);
        let lifetime = requested.min(remaining);
        if lifetime <= 0 {
            return Err(ExchangeError::InvalidRequest(
                "Requested lifetime must be positive".into(),
            ));
        }

        let token = Token {
            issuer: self.issuer.clone(),
            subject: subject.subject.clone(),
            audience: authorization.audience.clone(),
            issued_at: now,
            expires_at: now + lifetime,
            not_before: None,
            token_id: Some(Uuid::new_v4().to_string()),
            scope: authorization.scope.clone(),
            client_id: Some(authorization.caller.clone()),
            actor: Some(chain),
            delegation_grant: grant,
        };

        let raw = TokenCodec::encode(&token, &self.signing_key)?;

        debug!(
            subject = %token.subject,
            audience = %token.audience,
            lifetime,
            clamped = lifetime < requested,
            "Token minted"
        );

        Ok((token, raw))
    }
}
