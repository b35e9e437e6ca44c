//! Token Claims
//!
//! The signed assertion exchanged at every hop of a delegation chain.

use crate::{actor::ActorChain, scope::ScopeSet};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// RFC 8693 token type for access tokens
pub const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

/// RFC 8693 token type for generic JWTs
pub const JWT_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:jwt";

/// Token
///
/// Immutable once minted; a hop never edits a token, it only consumes one to
/// produce the next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Issuer (signing authority)
    #[serde(rename = "iss")]
    pub issuer: String,

    /// Subject (original principal, unchanged across hops)
    #[serde(rename = "sub")]
    pub subject: String,

    /// Audience (exactly one agent/service)
    #[serde(rename = "aud", deserialize_with = "single_audience")]
    pub audience: String,

    /// Issued at (seconds since epoch)
    #[serde(rename = "iat")]
    pub issued_at: i64,

    /// Expiration time (seconds since epoch)
    #[serde(rename = "exp")]
    pub expires_at: i64,

    /// Not before (seconds since epoch)
    #[serde(rename = "nbf", default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<i64>,

    /// JWT ID
    #[serde(rename = "jti", default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,

    /// Granted scope
    #[serde(default)]
    pub scope: ScopeSet,

    /// Client that requested this token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Delegates that produced this token
    #[serde(rename = "act", default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<ActorChain>,

    /// Pre-authorized next hop
    #[serde(rename = "may_act", default, skip_serializing_if = "Option::is_none")]
    pub delegation_grant: Option<DelegationGrant>,
}

impl Token {
    /// Delegation depth (0 for a root token)
    pub fn delegation_depth(&self) -> usize {
        self.actor.as_ref().map(ActorChain::depth).unwrap_or(0)
    }

    /// Whether this is a root (user-issued) token
    pub fn is_root(&self) -> bool {
        self.actor.is_none()
    }

    /// Seconds of validity left at `now`
    pub fn remaining_lifetime(&self, now: DateTime<Utc>) -> i64 {
        self.expires_at.saturating_sub(now.timestamp())
    }

    /// Expiration as a timestamp
    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.expires_at, 0).single()
    }

    /// Whether an identity is this token's audience, subject or a prior delegate
    pub fn involves(&self, identity: &str) -> bool {
        self.audience == identity
            || self.subject == identity
            || self
                .actor
                .as_ref()
                .map(|chain| chain.contains(identity))
                .unwrap_or(false)
    }

    /// Audit trail from the subject to this token's audience
    pub fn audit_trail(&self) -> Vec<String> {
        match &self.actor {
            Some(chain) => chain.audit_trail(&self.subject, &self.audience),
            None => vec![format!("{} → {}", self.subject, self.audience)],
        }
    }
}

/// Delegation Grant
///
/// Embedded by the issuing hop to pre-authorize exactly one next audience
/// and the scopes it may receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationGrant {
    /// Next audience this token may be exchanged into
    #[serde(rename = "aud")]
    pub audience: String,

    /// Scopes the next audience may receive
    pub scope: ScopeSet,
}

impl DelegationGrant {
    /// Create a delegation grant
    pub fn new(audience: impl Into<String>, scope: ScopeSet) -> Self {
        Self {
            audience: audience.into(),
            scope,
        }
    }
}

/// Accept `"aud": "x"` or `"aud": ["x"]`; anything else is malformed
fn single_audience<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Audience {
        One(String),
        Many(Vec<String>),
    }

    match Audience::deserialize(deserializer)? {
        Audience::One(aud) => Ok(aud),
        Audience::Many(mut auds) if auds.len() == 1 => Ok(auds.remove(0)),
        Audience::Many(auds) => Err(serde::de::Error::custom(format!(
            "expected exactly one audience, got {}",
            auds.len()
        ))),
    }
}
