//! CLI command implementations
//!
//! Each command loads the engine configuration, runs one operation and
//! returns the JSON document to print.

use crate::ExchangeArgs;
use anyhow::{anyhow, Context, Result};
use dtex_auth::{
    DelegationGrant, DelegationRequest, EngineConfig, ExchangeEngine, ExchangeError, ScopeSet,
    TokenVerifier,
};
use serde_json::{json, Value};
use std::path::Path;
use tracing::{debug, info};

/// Execute an exchange and return the RFC 8693 response
pub async fn execute_exchange(config: Option<&Path>, args: ExchangeArgs) -> Result<Value> {
    let engine = load_engine(config)?;

    let scope = match &args.scope {
        Some(raw) => ScopeSet::parse(raw).map_err(report)?,
        None => ScopeSet::new(),
    };

    let mut request = DelegationRequest::new(read_token(&args.subject_token)?, args.audience, scope);
    if let Some(actor) = &args.actor_token {
        request = request.with_actor_token(read_token(actor)?);
    }
    if let Some(client_id) = args.client_id {
        request = request.with_client_id(client_id);
    }
    if let (Some(audience), Some(scope)) = (args.grant_audience, &args.grant_scope) {
        request = request.with_grant(DelegationGrant::new(
            audience,
            ScopeSet::parse(scope).map_err(report)?,
        ));
    }
    if let Some(ttl) = args.ttl {
        request = request.with_ttl(ttl);
    }

    let issued = engine.exchange(request).await.map_err(report)?;
    info!(
        audience = %issued.token.audience,
        depth = issued.token.delegation_depth(),
        "Token issued"
    );

    Ok(serde_json::to_value(issued.to_response())?)
}

/// Verify a token and return its claims with the delegation trail
pub async fn execute_inspect(config: Option<&Path>, token: &str) -> Result<Value> {
    let engine = load_engine(config)?;
    let token = engine.decode(&read_token(token)?).await.map_err(report)?;

    Ok(json!({
        "claims": token,
        "delegation_depth": token.delegation_depth(),
        "delegation_chain": token.audit_trail(),
        "expires_at": token.expires_at_utc(),
    }))
}

/// Check audience and scope of a token as its receiver would
pub async fn execute_verify(
    config: Option<&Path>,
    token: &str,
    audience: &str,
    scope: &str,
) -> Result<Value> {
    let engine = load_engine(config)?;
    let required = ScopeSet::parse(scope).map_err(report)?;

    let verifier = TokenVerifier::new(engine.codec().clone(), engine.issuer(), audience);
    let result = verifier
        .verify(&read_token(token)?, &required)
        .await
        .map_err(report)?;

    Ok(serde_json::to_value(result)?)
}

fn load_engine(config: Option<&Path>) -> Result<ExchangeEngine> {
    let config = EngineConfig::load(config).context("Failed to load engine configuration")?;
    debug!(issuer = %config.issuer, agents = config.agents.len(), "Configuration loaded");

    Ok(config.engine_builder()?.build()?)
}

/// Read a token argument; `@path` reads from a file
fn read_token(arg: &str) -> Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => Ok(std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read token from {}", path))?
            .trim()
            .to_string()),
        None => Ok(arg.trim().to_string()),
    }
}

/// Print the wire-safe error body and keep the detail for the error chain
fn report(err: ExchangeError) -> anyhow::Error {
    let response = err.to_response();
    eprintln!(
        "{}",
        serde_json::to_string(&response).unwrap_or_else(|_| response.error.clone())
    );
    anyhow!(err)
}
