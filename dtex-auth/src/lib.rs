//! # dtex-auth: Delegated Token Exchange
//!
//! Scope-narrowing token exchange in the style of RFC 8693 for chains of
//! autonomous agents acting on behalf of one user.
//!
//! ## Features
//!
//! - **Token Exchange**: subject token → narrower token for the next agent
//! - **Actor Chains**: nested `act` claim recording every delegate, oldest first
//! - **Monotonic Narrowing**: scope and audience can only shrink across hops
//! - **Delegation Grants**: `may_act` pre-authorization of one specific next hop
//! - **Key Rotation**: static or JWKS key sets swapped atomically on refresh
//! - **Audit**: one structured event per exchange outcome
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │           USER (user123)                                │
//! │  Root token: aud=planner, scope=financial:read ...      │
//! └─────────────────────────────────────────────────────────┘
//!                       ↓
//!         ┌─────────────────────────────┐
//!         │   EXCHANGE ENGINE           │
//!         │   decode → authorize →      │
//!         │   extend chain → mint       │
//!         └─────────────────────────────┘
//!                       ↓
//!         ┌─────────────────────────────┐
//!         │   AGENT (tax-optimizer)     │
//!         │   act: { sub: planner }     │
//!         └─────────────────────────────┘
//!                       ↓
//!         ┌─────────────────────────────┐
//!         │   EXCHANGE ENGINE           │
//!         │   (same call, next hop)     │
//!         └─────────────────────────────┘
//!                       ↓
//!         ┌─────────────────────────────┐
//!         │   AGENT (calculator)        │
//!         │   Verifies audience, scope  │
//!         └─────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod actor;
pub mod audit;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod exchange;
pub mod keys;
pub mod minter;
pub mod policy;
pub mod scope;
pub mod token;
pub mod verification;

// Re-exports for convenience
pub use actor::{ActorChain, ActorEntry};
pub use audit::{AuditSink, ExchangeEvent, MemoryAuditSink, Outcome, TracingAuditSink};
pub use clock::{Clock, FixedClock, SystemClock};
pub use codec::TokenCodec;
pub use config::EngineConfig;
pub use error::{ErrorKind, ErrorResponse, ExchangeError, Result};
pub use exchange::{
    DelegationRequest, ExchangeEngine, ExchangeState, IssuedToken, TokenExchangeRequest,
    TokenExchangeResponse,
};
pub use keys::{
    JwksKeyProvider, KeyProvider, KeySet, LayeredKeyProvider, SigningKey, StaticKeyProvider,
    VerificationKey,
};
pub use minter::TokenMinter;
pub use policy::{AgentPolicy, Authorization, DelegationPolicy};
pub use scope::ScopeSet;
pub use token::{DelegationGrant, Token};
pub use verification::{TokenVerifier, VerificationResult};

/// Maximum delegation depth to prevent infinite chains
pub const DEFAULT_MAX_DELEGATION_DEPTH: usize = 5;

/// Default lifetime of minted tokens (5 minutes)
pub const DEFAULT_TOKEN_TTL: std::time::Duration = std::time::Duration::from_secs(300);
