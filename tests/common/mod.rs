//! Common test utilities shared across integration and E2E tests

use dtex_auth::{
    codec::TokenCodec, ExchangeEngine, FixedClock, KeySet, MemoryAuditSink, ScopeSet, SigningKey,
    StaticKeyProvider, Token, VerificationKey,
};
use jsonwebtoken::Algorithm;
use std::sync::Arc;

/// Issuer shared by the identity provider and the exchange engine
pub const ISSUER: &str = "https://auth.example";

/// Fixed start time of every test clock
pub const START: i64 = 1_700_000_000;

/// Setup logging for tests
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

/// Signing authority plus an engine wired to it
///
/// Plays the external identity provider (root tokens) and the exchange
/// engine (delegated tokens) with one shared HMAC key.
pub struct TestAuthority {
    pub clock: Arc<FixedClock>,
    pub audit: Arc<MemoryAuditSink>,
    pub signing_key: SigningKey,
    pub engine: Arc<ExchangeEngine>,
}

impl TestAuthority {
    /// Authority with the default delegation policy
    pub fn new() -> Self {
        Self::with_policy(|builder| builder)
    }

    /// Authority whose engine builder is adjusted by `configure`
    pub fn with_policy<F>(configure: F) -> Self
    where
        F: FnOnce(dtex_auth::exchange::ExchangeEngineBuilder) -> dtex_auth::exchange::ExchangeEngineBuilder,
    {
        let secret = b"integration-test-secret";
        let signing_key = SigningKey::hmac(Some("test-1".into()), Algorithm::HS256, secret)
            .expect("valid signing key");
        let keys = KeySet::new(vec![VerificationKey::hmac(
            Some("test-1".into()),
            Algorithm::HS256,
            secret,
        )
        .expect("valid verification key")]);

        let clock = Arc::new(FixedClock::at(START));
        let audit = Arc::new(MemoryAuditSink::new());

        let builder = ExchangeEngine::builder(ISSUER)
            .signing_key(signing_key.clone())
            .key_provider(Arc::new(StaticKeyProvider::new().with_issuer(ISSUER, keys)))
            .clock(clock.clone())
            .audit_sink(audit.clone());
        let engine = configure(builder).build().expect("engine builds");

        Self {
            clock,
            audit,
            signing_key,
            engine: Arc::new(engine),
        }
    }

    /// Root token as the identity provider would issue it
    pub fn root_token(&self, subject: &str, audience: &str, scope: &str, ttl_secs: i64) -> String {
        let token = root_claims(subject, audience, scope, ttl_secs);
        TokenCodec::encode(&token, &self.signing_key).expect("root token encodes")
    }
}

impl Default for TestAuthority {
    fn default() -> Self {
        Self::new()
    }
}

/// Claims of a root token issued at [`START`]
pub fn root_claims(subject: &str, audience: &str, scope: &str, ttl_secs: i64) -> Token {
    Token {
        issuer: ISSUER.into(),
        subject: subject.into(),
        audience: audience.into(),
        issued_at: START,
        expires_at: START + ttl_secs,
        not_before: None,
        token_id: Some(format!("root-{}", subject)),
        scope: scopes(scope),
        client_id: None,
        actor: None,
        delegation_grant: None,
    }
}

/// Parse a scope string
pub fn scopes(raw: &str) -> ScopeSet {
    ScopeSet::parse(raw).expect("valid scope")
}
