//! End-to-end delegation chains through the exchange engine

use assert_matches::assert_matches;
use dtex_auth::{
    DelegationGrant, DelegationRequest, ErrorKind, ExchangeError, ExchangeState, Outcome,
    TokenExchangeRequest, TokenVerifier,
};
use dtex_tests::common::{scopes, setup_test_logging, TestAuthority, ISSUER, START};
use std::collections::HashSet;
use std::sync::Arc;

#[tokio::test]
async fn test_tax_chain_without_grant_stops_at_calculator() {
    setup_test_logging();
    let authority = TestAuthority::new();
    let root = authority.root_token("user123", "planner", "financial:read tax:process", 3600);

    let first = authority
        .engine
        .exchange(DelegationRequest::new(root, "tax-optimizer", scopes("tax:process")))
        .await
        .unwrap();
    assert_eq!(first.token.delegation_depth(), 1);
    assert_eq!(first.token.scope, scopes("tax:process"));

    let second = authority
        .engine
        .exchange(DelegationRequest::new(
            first.raw.clone(),
            "calculator",
            scopes("tax:calculate"),
        ))
        .await;
    assert_matches!(second, Err(ExchangeError::ScopeNotSubset(_)));
}

#[tokio::test]
async fn test_tax_chain_with_grant_reaches_calculator() {
    setup_test_logging();
    let authority = TestAuthority::new();
    let root = authority.root_token("user123", "planner", "financial:read tax:process", 3600);

    let first = authority
        .engine
        .exchange(
            DelegationRequest::new(root, "tax-optimizer", scopes("tax:process")).with_grant(
                DelegationGrant::new("calculator", scopes("tax:calculate")),
            ),
        )
        .await
        .unwrap();
    assert_eq!(
        first.token.delegation_grant,
        Some(DelegationGrant::new("calculator", scopes("tax:calculate")))
    );

    let second = authority
        .engine
        .exchange(DelegationRequest::new(
            first.raw.clone(),
            "calculator",
            scopes("tax:calculate"),
        ))
        .await
        .unwrap();

    let chain = second.token.actor.as_ref().unwrap();
    assert_eq!(chain.depth(), 2);
    assert_eq!(chain.origin().subject, "planner");
    assert_eq!(chain.current().subject, "tax-optimizer");
    assert_eq!(second.token.subject, "user123");
    assert!(second.token.expires_at <= first.token.expires_at);
    assert_eq!(
        second.token.audit_trail(),
        vec![
            "user123 → planner",
            "planner → tax-optimizer",
            "tax-optimizer → calculator"
        ]
    );

    // The calculator accepts it for the scope it needs
    let verifier = TokenVerifier::new(authority.engine.codec().clone(), ISSUER, "calculator");
    let result = verifier
        .verify(&second.raw, &scopes("tax:calculate"))
        .await
        .unwrap();
    assert_eq!(result.subject, "user123");
    assert_eq!(result.delegation_depth, 2);
}

#[tokio::test]
async fn test_grant_binds_next_audience() {
    let authority = TestAuthority::new();
    let root = authority.root_token("user123", "planner", "financial:read tax:process", 3600);

    let first = authority
        .engine
        .exchange(
            DelegationRequest::new(root, "tax-optimizer", scopes("tax:process")).with_grant(
                DelegationGrant::new("calculator", scopes("tax:calculate")),
            ),
        )
        .await
        .unwrap();

    let elsewhere = authority
        .engine
        .exchange(DelegationRequest::new(first.raw, "reporter", scopes("tax:process")))
        .await;
    assert_matches!(elsewhere, Err(ExchangeError::DelegationNotPermitted(_)));
}

#[tokio::test]
async fn test_chain_invariants_over_many_hops() {
    let authority = TestAuthority::new();
    let all = ["a", "b", "c", "d", "e", "f"];
    let mut raw = authority.root_token("user123", "agent-0", &all.join(" "), 3600);
    let mut previous = dtex_tests::common::root_claims("user123", "agent-0", &all.join(" "), 3600);

    for hop in 1..=5 {
        authority.clock.advance(chrono::Duration::seconds(30));
        let requested = scopes(&all[hop..].join(" "));

        let issued = authority
            .engine
            .exchange(DelegationRequest::new(raw, format!("agent-{}", hop), requested))
            .await
            .unwrap();
        let token = &issued.token;

        assert_eq!(token.subject, "user123");
        assert_eq!(token.delegation_depth(), hop);
        assert!(token.scope.is_subset_of(&previous.scope));
        assert!(token.expires_at <= previous.expires_at);
        assert_eq!(token.issued_at, START + 30 * hop as i64);

        // Append-only: earlier delegates keep their position
        let entries = token.actor.as_ref().unwrap().entries();
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.subject, format!("agent-{}", i));
        }

        raw = issued.raw.clone();
        previous = issued.token;
    }

    // Depth limit reached
    let too_deep = authority
        .engine
        .exchange(DelegationRequest::new(raw, "agent-6", scopes("f")))
        .await;
    assert_matches!(too_deep, Err(ExchangeError::DelegationNotPermitted(_)));
}

#[tokio::test]
async fn test_expired_subject_fails_even_if_otherwise_valid() {
    let authority = TestAuthority::new();
    let root = authority.root_token("user123", "planner", "financial:read tax:process", 120);

    authority.clock.advance(chrono::Duration::seconds(600));

    let result = authority
        .engine
        .exchange(DelegationRequest::new(root, "tax-optimizer", scopes("tax:process")))
        .await;
    assert_matches!(result, Err(ExchangeError::Expired(_)));
}

#[tokio::test]
async fn test_minted_lifetime_never_exceeds_subject() {
    let authority = TestAuthority::new();
    let root = authority.root_token("user123", "planner", "tax:process", 60);

    let issued = authority
        .engine
        .exchange(
            DelegationRequest::new(root, "tax-optimizer", scopes("tax:process"))
                .with_ttl(std::time::Duration::from_secs(3600)),
        )
        .await
        .unwrap();
    assert_eq!(issued.token.expires_at, START + 60);
    assert_eq!(issued.expires_in, 60);
}

#[tokio::test]
async fn test_wider_scope_is_rejected_not_clipped() {
    let authority = TestAuthority::new();
    let root = authority.root_token("user123", "planner", "financial:read tax:process", 3600);

    let result = authority
        .engine
        .exchange(DelegationRequest::new(
            root,
            "tax-optimizer",
            scopes("tax:process financial:write"),
        ))
        .await;
    assert_matches!(result, Err(ExchangeError::ScopeNotSubset(_)));

    let events = authority.audit.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, Outcome::Rejected);
    assert_eq!(events[0].rejected_at, Some(ExchangeState::Authorizing));
    assert_eq!(events[0].error, Some(ErrorKind::ScopeNotSubset));
}

#[tokio::test]
async fn test_tampered_token_fails_signature() {
    let authority = TestAuthority::new();
    let root = authority.root_token("user123", "planner", "financial:read tax:process", 3600);

    let issued = authority
        .engine
        .exchange(DelegationRequest::new(root, "tax-optimizer", scopes("tax:process")))
        .await
        .unwrap();

    // Flip one character in the payload
    let mut parts: Vec<String> = issued.raw.split('.').map(str::to_string).collect();
    let payload = &mut parts[1];
    let last = payload.pop().unwrap();
    payload.push(if last == 'A' { 'B' } else { 'A' });
    let tampered = parts.join(".");

    let result = authority
        .engine
        .exchange(DelegationRequest::new(tampered, "calculator", scopes("tax:process")))
        .await;
    assert_matches!(result, Err(ExchangeError::InvalidSignature(_)));
}

#[tokio::test]
async fn test_only_the_audience_may_exchange() {
    let authority = TestAuthority::new();
    let root = authority.root_token("user123", "planner", "financial:read tax:process", 3600);

    let result = authority
        .engine
        .exchange(
            DelegationRequest::new(root, "tax-optimizer", scopes("tax:process"))
                .with_client_id("calculator"),
        )
        .await;
    assert_matches!(result, Err(ExchangeError::AudienceMismatch(_)));
}

#[tokio::test]
async fn test_protocol_surface_round_trip() {
    let authority = TestAuthority::new();
    let root = authority.root_token("user123", "planner", "financial:read tax:process", 3600);

    let request: TokenExchangeRequest = serde_json::from_value(serde_json::json!({
        "grant_type": "urn:ietf:params:oauth:grant-type:token-exchange",
        "subject_token": root,
        "subject_token_type": "urn:ietf:params:oauth:token-type:access_token",
        "audience": "tax-optimizer",
        "scope": "tax:process",
        "delegation_grant": { "aud": "calculator", "scope": "tax:calculate" }
    }))
    .unwrap();

    let response = authority.engine.handle(request).await.unwrap();
    assert_eq!(response.scope, "tax:process");
    assert_eq!(response.token_type, "Bearer");

    let next = TokenExchangeRequest::new(
        response.access_token,
        "calculator",
        Some("tax:calculate".into()),
    );
    let response = authority.engine.handle(next).await.unwrap();
    let minted = authority.engine.decode(&response.access_token).await.unwrap();
    assert_eq!(minted.delegation_depth(), 2);

    let error = authority
        .engine
        .handle(TokenExchangeRequest::new("garbage", "calculator", None))
        .await
        .unwrap_err();
    assert_eq!(error.to_response().error, "invalid_grant");
}

#[tokio::test]
async fn test_parallel_exchanges_are_independent() {
    let authority = TestAuthority::new();
    let root = authority.root_token("user123", "planner", "financial:read tax:process", 3600);

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = Arc::clone(&authority.engine);
        let root = root.clone();
        handles.push(tokio::spawn(async move {
            engine
                .exchange(DelegationRequest::new(
                    root,
                    format!("worker-{}", i),
                    scopes("tax:process"),
                ))
                .await
        }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        let issued = handle.await.unwrap().unwrap();
        ids.insert(issued.token.token_id.unwrap());
    }
    assert_eq!(ids.len(), 16);
    assert_eq!(authority.audit.events().len(), 16);
}
