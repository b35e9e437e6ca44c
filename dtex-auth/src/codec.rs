//! Token Codec
//!
//! Parses, verifies and signs tokens in compact JWS form.

use crate::{
    clock::Clock,
    error::{ExchangeError, Result},
    keys::{KeyProvider, SigningKey, VerificationKey},
    token::Token,
};
use jsonwebtoken::{decode, decode_header, encode, Header, Validation};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Default tolerance for clock differences between issuer and verifier
pub const DEFAULT_CLOCK_SKEW_SECONDS: i64 = 30;

/// Token Codec
///
/// Verification has no side effects beyond asking the key provider for a
/// refresh when a token names a key it does not know.
#[derive(Clone)]
pub struct TokenCodec {
    keys: Arc<dyn KeyProvider>,
    clock: Arc<dyn Clock>,
    clock_skew: i64,
}

impl TokenCodec {
    /// Create a codec
    pub fn new(keys: Arc<dyn KeyProvider>, clock: Arc<dyn Clock>) -> Self {
        Self {
            keys,
            clock,
            clock_skew: DEFAULT_CLOCK_SKEW_SECONDS,
        }
    }

    /// Set the clock skew tolerance in seconds
    pub fn with_clock_skew(mut self, seconds: i64) -> Self {
        self.clock_skew = seconds.max(0);
        self
    }

    /// Clock used for time checks
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Decode and verify a raw token issued by `expected_issuer`
    pub async fn decode(&self, raw: &str, expected_issuer: &str) -> Result<Token> {
        let key = self.verification_key(raw, expected_issuer).await?;

        let mut validation = Validation::new(key.algorithm());
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        // Everything up to and including the signature check is a signature
        // failure; only the claims of an authentic token can be malformed.
        let data = decode::<serde_json::Value>(raw, key.decoding_key(), &validation)
            .map_err(|e| ExchangeError::InvalidSignature(format!("Verification failed: {}", e)))?;

        let token: Token = serde_json::from_value(data.claims)
            .map_err(|e| ExchangeError::MalformedClaims(format!("Invalid claims: {}", e)))?;

        if token.issuer != expected_issuer {
            return Err(ExchangeError::InvalidSignature(format!(
                "Issuer mismatch: {} != {}",
                token.issuer, expected_issuer
            )));
        }

        check_structure(&token)?;
        self.check_validity_window(&token)?;

        debug!(
            subject = %token.subject,
            audience = %token.audience,
            depth = token.delegation_depth(),
            "Token verified"
        );

        Ok(token)
    }

    /// Sign a token
    ///
    /// Deterministic for a given token and key.
    pub fn encode(token: &Token, signing_key: &SigningKey) -> Result<String> {
        check_structure(token)?;

        let mut header = Header::new(signing_key.algorithm());
        header.kid = signing_key.kid().map(str::to_string);

        encode(&header, token, signing_key.encoding_key())
            .map_err(|e| ExchangeError::Config(format!("Failed to sign token: {}", e)))
    }

    async fn verification_key(&self, raw: &str, issuer: &str) -> Result<VerificationKey> {
        let header = decode_header(raw)
            .map_err(|e| ExchangeError::InvalidSignature(format!("Unreadable header: {}", e)))?;
        let kid = header.kid.as_deref();

        let keys = self.keys.key_set(issuer).await?;
        if let Some(key) = keys.select(kid, header.alg) {
            return Ok(key.clone());
        }

        debug!(issuer = %issuer, kid = ?kid, alg = ?header.alg, "Unknown key, refreshing key set");
        let keys = self.keys.refresh(issuer).await?;
        keys.select(kid, header.alg).cloned().ok_or_else(|| {
            ExchangeError::InvalidSignature(format!(
                "No {:?} key with kid {:?} for issuer {}",
                header.alg, kid, issuer
            ))
        })
    }

    fn check_validity_window(&self, token: &Token) -> Result<()> {
        let now = self.clock.now().timestamp();

        if now >= token.expires_at.saturating_add(self.clock_skew) {
            return Err(ExchangeError::Expired(format!(
                "exp {} <= now {} (skew {}s)",
                token.expires_at, now, self.clock_skew
            )));
        }

        let starts_at = token.not_before.unwrap_or(token.issued_at).max(token.issued_at);
        if now.saturating_add(self.clock_skew) < starts_at {
            return Err(ExchangeError::NotYetValid(format!(
                "valid from {} > now {} (skew {}s)",
                starts_at, now, self.clock_skew
            )));
        }

        Ok(())
    }
}

fn check_structure(token: &Token) -> Result<()> {
    if token.issuer.is_empty() {
        return Err(ExchangeError::MalformedClaims("Missing issuer".into()));
    }
    if token.subject.is_empty() {
        return Err(ExchangeError::MalformedClaims("Missing subject".into()));
    }
    if token.audience.is_empty() {
        return Err(ExchangeError::MalformedClaims("Missing audience".into()));
    }
    if token.issued_at >= token.expires_at {
        return Err(ExchangeError::MalformedClaims(format!(
            "iat {} must precede exp {}",
            token.issued_at, token.expires_at
        )));
    }
    Ok(())
}
