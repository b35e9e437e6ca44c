//! Delegation Policy
//!
//! Decides whether a subject token may be exchanged for a requested
//! audience and scope. One evaluator serves every agent role; per-agent
//! differences live in [`AgentPolicy`] configuration.

use crate::{
    error::{ExchangeError, Result},
    scope::ScopeSet,
    token::{DelegationGrant, Token},
    DEFAULT_MAX_DELEGATION_DEPTH,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Per-agent delegation policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPolicy {
    /// Audiences this agent may exchange its tokens into (empty = any)
    #[serde(default)]
    pub allowed_audiences: Vec<String>,

    /// Scopes this agent may pre-authorize for a next hop beyond the scope
    /// it delegates (`None` = unrestricted)
    #[serde(default)]
    pub grantable_scopes: Option<ScopeSet>,
}

impl AgentPolicy {
    /// Restrict target audiences
    pub fn allow_audiences<I, S>(mut self, audiences: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_audiences = audiences.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict grantable scopes
    pub fn grantable(mut self, scopes: ScopeSet) -> Self {
        self.grantable_scopes = Some(scopes);
        self
    }

    fn permits_audience(&self, audience: &str) -> bool {
        self.allowed_audiences.is_empty() || self.allowed_audiences.iter().any(|a| a == audience)
    }
}

/// Outcome of a successful policy check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    /// Audience of the token to mint
    pub audience: String,

    /// Scope of the token to mint
    pub scope: ScopeSet,

    /// Identity recorded as the new actor chain entry
    pub actor_identity: String,

    /// Agent that requested the exchange
    pub caller: String,
}

/// Delegation Policy Evaluator
#[derive(Debug, Clone)]
pub struct DelegationPolicy {
    issuer: String,
    max_depth: usize,
    agents: HashMap<String, AgentPolicy>,
}

impl DelegationPolicy {
    /// Create a policy for tokens minted by `issuer`
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            max_depth: DEFAULT_MAX_DELEGATION_DEPTH,
            agents: HashMap::new(),
        }
    }

    /// Set the maximum actor chain length
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Register the policy of one agent
    pub fn with_agent(mut self, agent_id: impl Into<String>, policy: AgentPolicy) -> Self {
        self.agents.insert(agent_id.into(), policy);
        self
    }

    /// Maximum actor chain length
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Policy of an agent, if configured
    pub fn agent(&self, agent_id: &str) -> Option<&AgentPolicy> {
        self.agents.get(agent_id)
    }

    /// Authorize one delegation hop
    ///
    /// Rules are evaluated in order and the first failure is returned. An
    /// empty `requested_scope` asks for everything the subject authorizes.
    pub fn authorize(
        &self,
        subject: &Token,
        actor: Option<&Token>,
        requested_audience: &str,
        requested_scope: &ScopeSet,
        client_id: Option<&str>,
    ) -> Result<Authorization> {
        if requested_audience.trim().is_empty() {
            return Err(ExchangeError::InvalidRequest(
                "Requested audience must not be empty".into(),
            ));
        }

        let depth = subject.delegation_depth();
        if depth >= self.max_depth {
            return Err(ExchangeError::DelegationNotPermitted(format!(
                "Delegation depth {} reached maximum {}",
                depth, self.max_depth
            )));
        }

        let caller = client_id.unwrap_or(subject.audience.as_str());

        // Grant embedded by the previous hop
        let grant = match &subject.delegation_grant {
            Some(grant) => {
                if grant.audience != requested_audience {
                    return Err(ExchangeError::DelegationNotPermitted(format!(
                        "Token may only be exchanged for {}, not {}",
                        grant.audience, requested_audience
                    )));
                }
                if !requested_scope.is_subset_of(&grant.scope) {
                    return Err(ExchangeError::ScopeNotSubset(format!(
                        "{:?} not granted for {}",
                        requested_scope.missing_from(&grant.scope),
                        grant.audience
                    )));
                }
                Some(grant)
            }
            None => None,
        };

        if let Some(policy) = self.agents.get(caller) {
            if !policy.permits_audience(requested_audience) {
                return Err(ExchangeError::DelegationNotPermitted(format!(
                    "{} may not delegate to {}",
                    caller, requested_audience
                )));
            }
        }

        let authorized = match grant {
            Some(grant) => subject.scope.union(&grant.scope),
            None => subject.scope.clone(),
        };

        // Never clipped: a wider request fails as a whole
        if !requested_scope.is_subset_of(&authorized) {
            return Err(ExchangeError::ScopeNotSubset(format!(
                "{:?} not in {}",
                requested_scope.missing_from(&authorized),
                authorized
            )));
        }

        let scope = if requested_scope.is_empty() {
            grant.map(|g| g.scope.clone()).unwrap_or(authorized)
        } else {
            requested_scope.clone()
        };

        if subject.audience != caller {
            return Err(ExchangeError::AudienceMismatch(format!(
                "Token addressed to {} presented by {}",
                subject.audience, caller
            )));
        }

        if let Some(actor) = actor {
            if actor.audience != caller {
                return Err(ExchangeError::AudienceMismatch(format!(
                    "Actor token addressed to {}, caller is {}",
                    actor.audience, caller
                )));
            }
            if actor.issuer != self.issuer {
                return Err(ExchangeError::AudienceMismatch(format!(
                    "Actor token issued by {}, expected {}",
                    actor.issuer, self.issuer
                )));
            }
        }

        if subject.involves(requested_audience) {
            return Err(ExchangeError::AudienceMismatch(format!(
                "{} already participates in this delegation",
                requested_audience
            )));
        }

        let actor_identity = actor
            .map(|a| a.subject.clone())
            .unwrap_or_else(|| caller.to_string());

        debug!(
            caller = %caller,
            actor = %actor_identity,
            audience = %requested_audience,
            scope = %scope,
            depth = depth + 1,
            "Delegation authorized"
        );

        Ok(Authorization {
            audience: requested_audience.to_string(),
            scope,
            actor_identity,
            caller: caller.to_string(),
        })
    }

    /// Check a grant the caller wants embedded in the minted token
    pub fn check_grant(&self, authorization: &Authorization, grant: &DelegationGrant) -> Result<()> {
        if grant.audience.is_empty() {
            return Err(ExchangeError::InvalidRequest(
                "Delegation grant needs an audience".into(),
            ));
        }

        if grant.audience == authorization.audience {
            return Err(ExchangeError::DelegationNotPermitted(format!(
                "{} cannot be granted a further hop to itself",
                grant.audience
            )));
        }

        let Some(policy) = self.agents.get(&authorization.caller) else {
            return Ok(());
        };

        if let Some(grantable) = &policy.grantable_scopes {
            let allowed = authorization.scope.union(grantable);
            if !grant.scope.is_subset_of(&allowed) {
                return Err(ExchangeError::DelegationNotPermitted(format!(
                    "{} may not grant {:?}",
                    authorization.caller,
                    grant.scope.missing_from(&allowed)
                )));
            }
        }

        Ok(())
    }
}
