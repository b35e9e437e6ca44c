//! Token Exchange
//!
//! Per-hop entry point: decode subject (and actor) token, authorize the hop,
//! extend the actor chain, mint. Every agent in a chain goes through the
//! same [`ExchangeEngine::exchange`] call.

use crate::{
    actor::{ActorChain, ActorEntry},
    audit::{AuditSink, ExchangeEvent, Outcome, TracingAuditSink},
    clock::{Clock, SystemClock},
    codec::{TokenCodec, DEFAULT_CLOCK_SKEW_SECONDS},
    error::{ExchangeError, Result},
    keys::{KeyProvider, SigningKey},
    minter::TokenMinter,
    policy::DelegationPolicy,
    scope::ScopeSet,
    token::{DelegationGrant, Token, ACCESS_TOKEN_TYPE, JWT_TOKEN_TYPE},
    DEFAULT_TOKEN_TTL,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use validator::Validate;

/// RFC 8693 grant type
pub const TOKEN_EXCHANGE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";

/// State of one exchange call
///
/// ```text
/// Received → Validating → Authorizing → Minting → Issued
///                 │            │           │
///                 └────────────┴───────────┴────→ Rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeState {
    /// Request accepted for processing
    Received,
    /// Decoding subject and actor tokens
    Validating,
    /// Evaluating delegation policy
    Authorizing,
    /// Building and signing the new token
    Minting,
    /// Token issued
    Issued,
    /// Exchange failed
    Rejected,
}

impl ExchangeState {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExchangeState::Issued | ExchangeState::Rejected)
    }

    /// Whether `next` directly follows this state
    pub fn can_transition_to(&self, next: ExchangeState) -> bool {
        use ExchangeState::*;
        matches!(
            (self, next),
            (Received, Validating)
                | (Validating, Authorizing)
                | (Authorizing, Minting)
                | (Minting, Issued)
                | (Validating, Rejected)
                | (Authorizing, Rejected)
                | (Minting, Rejected)
        )
    }
}

/// Delegation Request
///
/// Transient input of one exchange call.
#[derive(Debug, Clone)]
pub struct DelegationRequest {
    /// Token being exchanged
    pub subject_token: String,

    /// Identity token of the calling agent
    pub actor_token: Option<String>,

    /// Audience of the token to mint
    pub audience: String,

    /// Scope of the token to mint (empty = everything authorized)
    pub scope: ScopeSet,

    /// Identity of the calling agent
    pub client_id: Option<String>,

    /// Next hop to pre-authorize in the minted token
    pub delegation_grant: Option<DelegationGrant>,

    /// Requested lifetime
    pub ttl: Option<Duration>,
}

impl DelegationRequest {
    /// Create a request
    pub fn new(subject_token: impl Into<String>, audience: impl Into<String>, scope: ScopeSet) -> Self {
        Self {
            subject_token: subject_token.into(),
            actor_token: None,
            audience: audience.into(),
            scope,
            client_id: None,
            delegation_grant: None,
            ttl: None,
        }
    }

    /// Present an actor token
    pub fn with_actor_token(mut self, actor_token: impl Into<String>) -> Self {
        self.actor_token = Some(actor_token.into());
        self
    }

    /// Identify the calling agent
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Pre-authorize the next hop
    pub fn with_grant(mut self, grant: DelegationGrant) -> Self {
        self.delegation_grant = Some(grant);
        self
    }

    /// Ask for a lifetime
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Result of a successful exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    /// Decoded claims of the minted token
    pub token: Token,

    /// Signed compact form
    pub raw: String,

    /// Lifetime in seconds
    pub expires_in: i64,
}

impl IssuedToken {
    /// RFC 8693 response for this token
    pub fn to_response(&self) -> TokenExchangeResponse {
        TokenExchangeResponse {
            access_token: self.raw.clone(),
            issued_token_type: ACCESS_TOKEN_TYPE.to_string(),
            token_type: "Bearer".to_string(),
            expires_in: self.expires_in,
            scope: self.token.scope.to_string(),
        }
    }
}

/// Token Exchange Request
///
/// OAuth 2.0 Token Exchange request (RFC 8693 §2.1)
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TokenExchangeRequest {
    /// Grant type (must be "urn:ietf:params:oauth:grant-type:token-exchange")
    pub grant_type: String,

    /// Subject token
    #[validate(length(min = 1))]
    pub subject_token: String,

    /// Subject token type (must be "urn:ietf:params:oauth:token-type:access_token")
    pub subject_token_type: String,

    /// Actor token (identity token of the calling agent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1))]
    pub actor_token: Option<String>,

    /// Actor token type (required iff `actor_token` is present)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_token_type: Option<String>,

    /// Target audience
    #[serde(alias = "audience")]
    #[validate(length(min = 1))]
    pub requested_audience: String,

    /// Space-delimited scope
    #[serde(alias = "scope", default, skip_serializing_if = "Option::is_none")]
    pub requested_scope: Option<String>,

    /// Requested token type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_token_type: Option<String>,

    /// Calling agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1))]
    pub client_id: Option<String>,

    /// Next hop to pre-authorize in the issued token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation_grant: Option<DelegationGrant>,
}

impl TokenExchangeRequest {
    /// Create a request for an access-token subject
    pub fn new(subject_token: impl Into<String>, audience: impl Into<String>, scope: Option<String>) -> Self {
        Self {
            grant_type: TOKEN_EXCHANGE_GRANT_TYPE.to_string(),
            subject_token: subject_token.into(),
            subject_token_type: ACCESS_TOKEN_TYPE.to_string(),
            actor_token: None,
            actor_token_type: None,
            requested_audience: audience.into(),
            requested_scope: scope,
            requested_token_type: None,
            client_id: None,
            delegation_grant: None,
        }
    }

    /// Present an actor token of type access_token
    pub fn with_actor_token(mut self, actor_token: impl Into<String>) -> Self {
        self.actor_token = Some(actor_token.into());
        self.actor_token_type = Some(ACCESS_TOKEN_TYPE.to_string());
        self
    }

    /// Validate parameters and convert into a [`DelegationRequest`]
    pub fn validate_request(&self) -> Result<DelegationRequest> {
        self.validate().map_err(|e| {
            ExchangeError::InvalidRequest(format!("Invalid token exchange request: {}", e))
        })?;

        if self.grant_type != TOKEN_EXCHANGE_GRANT_TYPE {
            return Err(ExchangeError::InvalidRequest(format!(
                "Unsupported grant type: {}",
                self.grant_type
            )));
        }

        if self.subject_token_type != ACCESS_TOKEN_TYPE {
            return Err(ExchangeError::InvalidRequest(format!(
                "Unsupported subject token type: {}",
                self.subject_token_type
            )));
        }

        match (&self.actor_token, &self.actor_token_type) {
            (Some(_), Some(kind)) if kind == ACCESS_TOKEN_TYPE || kind == JWT_TOKEN_TYPE => {}
            (Some(_), Some(kind)) => {
                return Err(ExchangeError::InvalidRequest(format!(
                    "Unsupported actor token type: {}",
                    kind
                )))
            }
            (Some(_), None) => {
                return Err(ExchangeError::InvalidRequest(
                    "actor_token_type is required with actor_token".into(),
                ))
            }
            (None, Some(_)) => {
                return Err(ExchangeError::InvalidRequest(
                    "actor_token_type given without actor_token".into(),
                ))
            }
            (None, None) => {}
        }

        if let Some(kind) = &self.requested_token_type {
            if kind != ACCESS_TOKEN_TYPE {
                return Err(ExchangeError::InvalidRequest(format!(
                    "Unsupported requested token type: {}",
                    kind
                )));
            }
        }

        let scope = match &self.requested_scope {
            Some(raw) => ScopeSet::parse(raw)
                .map_err(|e| ExchangeError::InvalidRequest(format!("Invalid scope: {}", e)))?,
            None => ScopeSet::new(),
        };

        Ok(DelegationRequest {
            subject_token: self.subject_token.clone(),
            actor_token: self.actor_token.clone(),
            audience: self.requested_audience.clone(),
            scope,
            client_id: self.client_id.clone(),
            delegation_grant: self.delegation_grant.clone(),
            ttl: None,
        })
    }
}

/// Token Exchange Response
///
/// RFC 8693 §2.2.1
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenExchangeResponse {
    /// Issued token
    pub access_token: String,

    /// Issued token type
    pub issued_token_type: String,

    /// Token type ("Bearer")
    pub token_type: String,

    /// Expires in seconds
    pub expires_in: i64,

    /// Granted scope
    pub scope: String,
}

/// Exchange Engine
///
/// Stateless across calls and shared through `Arc`; collaborators are
/// injected through [`ExchangeEngine::builder`].
pub struct ExchangeEngine {
    issuer: String,
    codec: TokenCodec,
    policy: DelegationPolicy,
    minter: TokenMinter,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
}

impl ExchangeEngine {
    /// Start building an engine that mints tokens as `issuer`
    pub fn builder(issuer: impl Into<String>) -> ExchangeEngineBuilder {
        ExchangeEngineBuilder::new(issuer)
    }

    /// Issuer of minted tokens
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Token codec
    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    /// Delegation policy
    pub fn policy(&self) -> &DelegationPolicy {
        &self.policy
    }

    /// Decode and verify a token issued by this engine's issuer
    pub async fn decode(&self, raw: &str) -> Result<Token> {
        self.codec.decode(raw, &self.issuer).await
    }

    /// Exchange a subject token for a narrower one
    ///
    /// Either returns one fully formed token or fails with one terminal
    /// error. Exactly one audit event is emitted either way.
    pub async fn exchange(&self, request: DelegationRequest) -> Result<IssuedToken> {
        let mut trace = ExchangeTrace::new(&request);
        let result = self.run(&request, &mut trace).await;
        self.audit.record(&trace.finish(&result, self.clock.as_ref()));
        result
    }

    /// Handle an RFC 8693 request
    pub async fn handle(&self, request: TokenExchangeRequest) -> Result<TokenExchangeResponse> {
        match request.validate_request() {
            Ok(delegation) => self
                .exchange(delegation)
                .await
                .map(|issued| issued.to_response()),
            Err(e) => {
                let mut trace = ExchangeTrace {
                    state: ExchangeState::Received,
                    subject: None,
                    caller: request.client_id.clone(),
                    audience: request.requested_audience.clone(),
                    scope: request.requested_scope.clone().unwrap_or_default(),
                };
                trace.enter(ExchangeState::Validating);
                let result: Result<IssuedToken> = Err(e);
                self.audit.record(&trace.finish(&result, self.clock.as_ref()));
                result.map(|issued| issued.to_response())
            }
        }
    }

    async fn run(&self, request: &DelegationRequest, trace: &mut ExchangeTrace) -> Result<IssuedToken> {
        trace.enter(ExchangeState::Validating);
        let subject = self.codec.decode(&request.subject_token, &self.issuer).await?;
        trace.subject = Some(subject.subject.clone());

        let actor = match &request.actor_token {
            Some(raw) => Some(self.codec.decode(raw, &self.issuer).await?),
            None => None,
        };

        trace.enter(ExchangeState::Authorizing);
        let authorization = self.policy.authorize(
            &subject,
            actor.as_ref(),
            &request.audience,
            &request.scope,
            request.client_id.as_deref(),
        )?;
        trace.caller = Some(authorization.caller.clone());

        if let Some(grant) = &request.delegation_grant {
            self.policy.check_grant(&authorization, grant)?;
        }

        let mut entry = ActorEntry::new(authorization.actor_identity.clone());
        if authorization.actor_identity != authorization.caller {
            entry = entry.with_client_id(authorization.caller.clone());
        }
        let chain = ActorChain::extend(subject.actor.as_ref(), entry);

        trace.enter(ExchangeState::Minting);
        let (token, raw) = self.minter.mint(
            &subject,
            &authorization,
            chain,
            request.ttl,
            request.delegation_grant.clone(),
        )?;

        trace.enter(ExchangeState::Issued);
        Ok(IssuedToken {
            expires_in: token.expires_at - token.issued_at,
            token,
            raw,
        })
    }
}

/// Progress of one call, for the audit event
struct ExchangeTrace {
    state: ExchangeState,
    subject: Option<String>,
    caller: Option<String>,
    audience: String,
    scope: String,
}

impl ExchangeTrace {
    fn new(request: &DelegationRequest) -> Self {
        Self {
            state: ExchangeState::Received,
            subject: None,
            caller: request.client_id.clone(),
            audience: request.audience.clone(),
            scope: request.scope.to_string(),
        }
    }

    fn enter(&mut self, next: ExchangeState) {
        if self.state.can_transition_to(next) {
            debug!(from = ?self.state, to = ?next, audience = %self.audience, "Exchange state");
            self.state = next;
        }
    }

    fn finish(self, result: &Result<IssuedToken>, clock: &dyn Clock) -> ExchangeEvent {
        match result {
            Ok(issued) => ExchangeEvent {
                outcome: Outcome::Issued,
                state: ExchangeState::Issued,
                rejected_at: None,
                subject: self.subject,
                caller: self.caller,
                audience: self.audience,
                scope: issued.token.scope.to_string(),
                depth: Some(issued.token.delegation_depth()),
                token_id: issued.token.token_id.clone(),
                error: None,
                detail: None,
                trail: issued.token.audit_trail(),
                at: clock.now(),
            },
            Err(e) => ExchangeEvent {
                outcome: Outcome::Rejected,
                state: ExchangeState::Rejected,
                rejected_at: Some(self.state),
                subject: self.subject,
                caller: self.caller,
                audience: self.audience,
                scope: self.scope,
                depth: None,
                token_id: None,
                error: Some(e.kind()),
                detail: Some(e.to_string()),
                trail: Vec::new(),
                at: clock.now(),
            },
        }
    }
}

/// Builder for [`ExchangeEngine`]
pub struct ExchangeEngineBuilder {
    issuer: String,
    signing_key: Option<SigningKey>,
    key_provider: Option<Arc<dyn KeyProvider>>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    policy: Option<DelegationPolicy>,
    clock_skew: i64,
    default_ttl: Duration,
}

impl ExchangeEngineBuilder {
    fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            signing_key: None,
            key_provider: None,
            clock: Arc::new(SystemClock),
            audit: Arc::new(TracingAuditSink),
            policy: None,
            clock_skew: DEFAULT_CLOCK_SKEW_SECONDS,
            default_ttl: DEFAULT_TOKEN_TTL,
        }
    }

    /// Key used to sign minted tokens
    pub fn signing_key(mut self, key: SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    /// Source of verification keys
    pub fn key_provider(mut self, provider: Arc<dyn KeyProvider>) -> Self {
        self.key_provider = Some(provider);
        self
    }

    /// Time source
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Audit sink
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    /// Delegation policy
    pub fn policy(mut self, policy: DelegationPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Clock skew tolerance in seconds
    pub fn clock_skew(mut self, seconds: i64) -> Self {
        self.clock_skew = seconds;
        self
    }

    /// Lifetime of minted tokens when the request asks for none
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Build the engine
    pub fn build(self) -> Result<ExchangeEngine> {
        if self.issuer.is_empty() {
            return Err(ExchangeError::Config("Issuer must not be empty".into()));
        }
        let signing_key = self
            .signing_key
            .ok_or_else(|| ExchangeError::Config("No signing key configured".into()))?;
        let key_provider = self
            .key_provider
            .ok_or_else(|| ExchangeError::Config("No key provider configured".into()))?;

        let codec = TokenCodec::new(key_provider, Arc::clone(&self.clock))
            .with_clock_skew(self.clock_skew);
        let minter = TokenMinter::new(
            self.issuer.clone(),
            signing_key,
            Arc::clone(&self.clock),
            self.default_ttl,
        );
        let policy = self
            .policy
            .unwrap_or_else(|| DelegationPolicy::new(self.issuer.clone()));

        Ok(ExchangeEngine {
            issuer: self.issuer,
            codec,
            policy,
            minter,
            clock: self.clock,
            audit: self.audit,
        })
    }
}
