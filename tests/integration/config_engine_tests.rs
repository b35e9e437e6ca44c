//! Engines built from configuration files

use assert_matches::assert_matches;
use dtex_auth::{
    codec::TokenCodec, DelegationGrant, DelegationRequest, EngineConfig, ExchangeError,
    FixedClock, MemoryAuditSink, SigningKey,
};
use dtex_tests::common::{root_claims, scopes, setup_test_logging, ISSUER, START};
use jsonwebtoken::Algorithm;
use std::io::Write;
use std::sync::Arc;

const IDP_SECRET: &[u8] = b"identity-provider-secret";

fn config_file() -> tempfile::NamedTempFile {
    let toml = format!(
        r#"
issuer = "{issuer}"
clock_skew = "10s"
default_token_ttl = "2m"
max_delegation_depth = 3

[signing]
kid = "dtex-1"
algorithm = "HS256"
secret = "{engine_secret}"

[[keys.static]]
kid = "idp-1"
algorithm = "HS256"
secret = "{idp_secret}"

[agents.planner]
allowed_audiences = ["tax-optimizer"]
grantable_scopes = "tax:calculate"
"#,
        issuer = ISSUER,
        engine_secret = hex::encode(b"engine-signing-secret"),
        idp_secret = hex::encode(IDP_SECRET),
    );

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(toml.as_bytes()).unwrap();
    file
}

struct Fixture {
    engine: dtex_auth::ExchangeEngine,
    audit: Arc<MemoryAuditSink>,
    _file: tempfile::NamedTempFile,
}

fn engine_from_file() -> Fixture {
    let file = config_file();
    let config = EngineConfig::from_file(file.path()).unwrap();
    let audit = Arc::new(MemoryAuditSink::new());

    let engine = config
        .engine_builder()
        .unwrap()
        .clock(Arc::new(FixedClock::at(START)))
        .audit_sink(audit.clone())
        .build()
        .unwrap();

    Fixture {
        engine,
        audit,
        _file: file,
    }
}

fn root_token(audience: &str, scope: &str) -> String {
    let key = SigningKey::hmac(Some("idp-1".into()), Algorithm::HS256, IDP_SECRET).unwrap();
    TokenCodec::encode(&root_claims("user123", audience, scope, 3600), &key).unwrap()
}

#[tokio::test]
async fn test_configured_engine_issues_with_configured_ttl() {
    setup_test_logging();
    let fixture = engine_from_file();
    assert_eq!(fixture.engine.policy().max_depth(), 3);

    let issued = fixture
        .engine
        .exchange(DelegationRequest::new(
            root_token("planner", "financial:read tax:process"),
            "tax-optimizer",
            scopes("tax:process"),
        ))
        .await
        .unwrap();

    assert_eq!(issued.expires_in, 120);
    assert_eq!(issued.token.client_id.as_deref(), Some("planner"));
    assert_eq!(fixture.audit.events().len(), 1);

    // The engine verifies what it minted with its own key
    let decoded = fixture.engine.decode(&issued.raw).await.unwrap();
    assert_eq!(decoded.audience, "tax-optimizer");
}

#[tokio::test]
async fn test_agent_audience_allow_list() {
    let fixture = engine_from_file();

    let result = fixture
        .engine
        .exchange(DelegationRequest::new(
            root_token("planner", "financial:read tax:process"),
            "reporter",
            scopes("tax:process"),
        ))
        .await;
    assert_matches!(result, Err(ExchangeError::DelegationNotPermitted(_)));
}

#[tokio::test]
async fn test_agent_grantable_scopes() {
    let fixture = engine_from_file();

    let allowed = fixture
        .engine
        .exchange(
            DelegationRequest::new(
                root_token("planner", "financial:read tax:process"),
                "tax-optimizer",
                scopes("tax:process"),
            )
            .with_grant(DelegationGrant::new("calculator", scopes("tax:calculate"))),
        )
        .await;
    assert!(allowed.is_ok());

    let refused = fixture
        .engine
        .exchange(
            DelegationRequest::new(
                root_token("planner", "financial:read tax:process"),
                "tax-optimizer",
                scopes("tax:process"),
            )
            .with_grant(DelegationGrant::new("calculator", scopes("financial:write"))),
        )
        .await;
    assert_matches!(refused, Err(ExchangeError::DelegationNotPermitted(_)));
}

#[tokio::test]
async fn test_unknown_signer_is_rejected() {
    let fixture = engine_from_file();
    let stranger = SigningKey::hmac(Some("idp-1".into()), Algorithm::HS256, b"other-secret").unwrap();
    let root = TokenCodec::encode(&root_claims("user123", "planner", "tax:process", 3600), &stranger)
        .unwrap();

    let result = fixture
        .engine
        .exchange(DelegationRequest::new(root, "tax-optimizer", scopes("tax:process")))
        .await;
    assert_matches!(result, Err(ExchangeError::InvalidSignature(_)));
}

#[test]
fn test_invalid_config_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "issuer = \"{}\"\n[signing]\nalgorithm = \"HS256\"", ISSUER).unwrap();

    assert_matches!(
        EngineConfig::from_file(file.path()),
        Err(ExchangeError::Config(_))
    );
}
