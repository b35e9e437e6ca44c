//! Exchange against keys served from a JWKS endpoint

use assert_matches::assert_matches;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dtex_auth::{
    codec::TokenCodec, DelegationGrant, DelegationRequest, EngineConfig, ErrorKind,
    ExchangeEngine, ExchangeError, ExchangeState, FixedClock, JwksKeyProvider, KeySet,
    LayeredKeyProvider, MemoryAuditSink, SigningKey, StaticKeyProvider, VerificationKey,
};
use dtex_tests::common::{root_claims, scopes, setup_test_logging, ISSUER, START};
use jsonwebtoken::Algorithm;
use std::sync::Arc;
use std::time::Duration;

const ENGINE_SECRET: &[u8] = b"engine-signing-secret-0001";
const IDP_SECRET_V1: &[u8] = b"identity-provider-secret-v1";
const IDP_SECRET_V2: &[u8] = b"identity-provider-secret-v2";

fn oct(kid: &str, secret: &[u8]) -> serde_json::Value {
    serde_json::json!({
        "kty": "oct",
        "kid": kid,
        "alg": "HS256",
        "use": "sig",
        "k": URL_SAFE_NO_PAD.encode(secret),
    })
}

fn jwks(keys: Vec<serde_json::Value>) -> String {
    serde_json::json!({ "keys": keys }).to_string()
}

fn signing_key(kid: &str, secret: &[u8]) -> SigningKey {
    SigningKey::hmac(Some(kid.into()), Algorithm::HS256, secret).unwrap()
}

/// Engine verifying its own tokens locally and identity provider tokens via JWKS
fn engine_for(url: String, audit: Arc<MemoryAuditSink>, timeout: Duration) -> ExchangeEngine {
    let remote = JwksKeyProvider::with_timeouts(timeout, Duration::ZERO).with_endpoint(ISSUER, url);
    let local = StaticKeyProvider::new().with_issuer(
        ISSUER,
        KeySet::new(vec![VerificationKey::hmac(
            Some("engine".into()),
            Algorithm::HS256,
            ENGINE_SECRET,
        )
        .unwrap()]),
    );

    ExchangeEngine::builder(ISSUER)
        .signing_key(signing_key("engine", ENGINE_SECRET))
        .key_provider(Arc::new(LayeredKeyProvider::new(local, Arc::new(remote))))
        .clock(Arc::new(FixedClock::at(START)))
        .audit_sink(audit)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_rotated_key_is_picked_up_on_unknown_kid() {
    setup_test_logging();
    let mut server = mockito::Server::new_async().await;
    let before = server
        .mock("GET", "/jwks")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(jwks(vec![oct("idp-1", IDP_SECRET_V1)]))
        .expect(1)
        .create_async()
        .await;

    let audit = Arc::new(MemoryAuditSink::new());
    let engine = engine_for(format!("{}/jwks", server.url()), audit.clone(), Duration::from_secs(5));

    let claims = root_claims("user123", "planner", "financial:read tax:process", 3600);
    let first_root = TokenCodec::encode(&claims, &signing_key("idp-1", IDP_SECRET_V1)).unwrap();
    engine
        .exchange(DelegationRequest::new(first_root, "tax-optimizer", scopes("tax:process")))
        .await
        .unwrap();
    before.assert_async().await;
    before.remove_async().await;

    // Identity provider rotates to a new key
    let after = server
        .mock("GET", "/jwks")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(jwks(vec![oct("idp-2", IDP_SECRET_V2)]))
        .expect(1)
        .create_async()
        .await;

    let second_root = TokenCodec::encode(&claims, &signing_key("idp-2", IDP_SECRET_V2)).unwrap();
    let issued = engine
        .exchange(DelegationRequest::new(second_root, "tax-optimizer", scopes("tax:process")))
        .await
        .unwrap();
    after.assert_async().await;

    // The engine's own key is never published; its tokens verify locally
    let decoded = engine.decode(&issued.raw).await.unwrap();
    assert_eq!(decoded.delegation_depth(), 1);

    let hop_two = engine
        .exchange(DelegationRequest::new(issued.raw, "reporter", scopes("tax:process")))
        .await
        .unwrap();
    assert_eq!(hop_two.token.delegation_depth(), 2);
    assert_eq!(audit.events().len(), 3);
}

#[tokio::test]
async fn test_key_absent_after_refresh_is_invalid_signature() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/jwks")
        .with_status(200)
        .with_body(jwks(vec![oct("idp-1", IDP_SECRET_V1)]))
        .create_async()
        .await;

    let audit = Arc::new(MemoryAuditSink::new());
    let engine = engine_for(format!("{}/jwks", server.url()), audit, Duration::from_secs(5));

    let claims = root_claims("user123", "planner", "tax:process", 3600);
    let root = TokenCodec::encode(&claims, &signing_key("idp-9", IDP_SECRET_V1)).unwrap();

    let result = engine
        .exchange(DelegationRequest::new(root, "tax-optimizer", scopes("tax:process")))
        .await;
    assert_matches!(result, Err(ExchangeError::InvalidSignature(_)));
}

#[tokio::test]
async fn test_unreachable_jwks_is_retryable_and_audited() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/jwks")
        .with_status(503)
        .create_async()
        .await;

    let audit = Arc::new(MemoryAuditSink::new());
    let engine = engine_for(format!("{}/jwks", server.url()), audit.clone(), Duration::from_secs(5));

    let claims = root_claims("user123", "planner", "tax:process", 3600);
    let root = TokenCodec::encode(&claims, &signing_key("idp-1", IDP_SECRET_V1)).unwrap();

    let err = engine
        .exchange(DelegationRequest::new(root, "tax-optimizer", scopes("tax:process")))
        .await
        .unwrap_err();
    assert_matches!(err, ExchangeError::KeyUnavailable(_));
    assert!(err.is_retryable());
    assert_eq!(err.to_response().error, "temporarily_unavailable");

    let events = audit.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].rejected_at, Some(ExchangeState::Validating));
    assert_eq!(events[0].error, Some(ErrorKind::KeyUnavailable));
}

#[tokio::test]
async fn test_connection_refused_is_key_unavailable() {
    // Port 9 (discard) on loopback is not served in the test environment
    let audit = Arc::new(MemoryAuditSink::new());
    let engine = engine_for(
        "http://127.0.0.1:9/jwks".to_string(),
        audit,
        Duration::from_millis(500),
    );

    let claims = root_claims("user123", "planner", "tax:process", 3600);
    let root = TokenCodec::encode(&claims, &signing_key("idp-1", IDP_SECRET_V1)).unwrap();

    let result = engine
        .exchange(DelegationRequest::new(root, "tax-optimizer", scopes("tax:process")))
        .await;
    assert_matches!(result, Err(ExchangeError::KeyUnavailable(_)));
}

const RSA_PRIVATE: &[u8] = include_bytes!("../../dtex-auth/testdata/rsa_private.pem");
const RSA_JWKS: &str = include_str!("../../dtex-auth/testdata/rsa_jwks.json");

#[tokio::test]
async fn test_configured_jwks_engine_chains_rs256_root_tokens() {
    setup_test_logging();
    let mut server = mockito::Server::new_async().await;
    let _jwks = server
        .mock("GET", "/realms/agents/certs")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(RSA_JWKS)
        .create_async()
        .await;

    let config = EngineConfig::from_toml_str(&format!(
        r#"
issuer = "{issuer}"

[signing]
kid = "dtex-1"
algorithm = "HS256"
secret = "{secret}"

[keys]
jwks_url = "{url}/realms/agents/certs"
fetch_timeout = "2s"
"#,
        issuer = ISSUER,
        secret = hex::encode(ENGINE_SECRET),
        url = server.url(),
    ))
    .unwrap();

    let audit = Arc::new(MemoryAuditSink::new());
    let engine = config
        .engine_builder()
        .unwrap()
        .clock(Arc::new(FixedClock::at(START)))
        .audit_sink(audit.clone())
        .build()
        .unwrap();

    let idp_key = SigningKey::from_pem(Some("rsa-1".into()), Algorithm::RS256, RSA_PRIVATE).unwrap();
    let root = TokenCodec::encode(
        &root_claims("user123", "planner", "financial:read tax:process", 3600),
        &idp_key,
    )
    .unwrap();

    let first = engine
        .exchange(
            DelegationRequest::new(root, "tax-optimizer", scopes("tax:process"))
                .with_grant(DelegationGrant::new("calculator", scopes("tax:calculate"))),
        )
        .await
        .unwrap();

    // Hop two presents an engine-minted HS256 token the JWKS never lists
    let second = engine
        .exchange(DelegationRequest::new(first.raw, "calculator", scopes("tax:calculate")))
        .await
        .unwrap();

    assert_eq!(second.token.delegation_depth(), 2);
    assert_eq!(second.token.subject, "user123");
    assert_eq!(audit.events().len(), 2);
}

