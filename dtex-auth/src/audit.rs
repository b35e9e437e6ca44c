//! Exchange Audit
//!
//! One structured event per exchange outcome, issued or rejected.

use crate::{error::ErrorKind, exchange::ExchangeState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{info, warn};

/// Tracing target for audit events
pub const AUDIT_TARGET: &str = "dtex::audit";

/// Exchange outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Token issued
    Issued,
    /// Exchange rejected
    Rejected,
}

/// Audit event for one exchange call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeEvent {
    /// Outcome
    pub outcome: Outcome,

    /// Terminal state
    pub state: ExchangeState,

    /// Stage that rejected the exchange
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<ExchangeState>,

    /// Original principal, once the subject token was decoded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    /// Agent that requested the exchange
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,

    /// Requested audience
    pub audience: String,

    /// Requested scope on rejection, granted scope on issue
    pub scope: String,

    /// Actor chain length of the minted token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<usize>,

    /// `jti` of the minted token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,

    /// Error kind on rejection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,

    /// Root cause, for logs only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// Delegation audit trail of the minted token
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trail: Vec<String>,

    /// Event time
    pub at: DateTime<Utc>,
}

/// Receives exchange audit events
pub trait AuditSink: Send + Sync {
    /// Record one event
    fn record(&self, event: &ExchangeEvent);
}

/// Writes audit events as structured `tracing` events
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &ExchangeEvent) {
        match event.outcome {
            Outcome::Issued => info!(
                target: AUDIT_TARGET,
                subject = event.subject.as_deref().unwrap_or_default(),
                caller = event.caller.as_deref().unwrap_or_default(),
                audience = %event.audience,
                scope = %event.scope,
                depth = event.depth.unwrap_or_default(),
                jti = event.token_id.as_deref().unwrap_or_default(),
                trail = ?event.trail,
                "Token exchange issued"
            ),
            Outcome::Rejected => warn!(
                target: AUDIT_TARGET,
                subject = event.subject.as_deref().unwrap_or_default(),
                caller = event.caller.as_deref().unwrap_or_default(),
                audience = %event.audience,
                scope = %event.scope,
                stage = ?event.rejected_at,
                error = event.error.map(|k| k.as_str()).unwrap_or_default(),
                detail = event.detail.as_deref().unwrap_or_default(),
                "Token exchange rejected"
            ),
        }
    }
}

/// Keeps audit events in memory
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<ExchangeEvent>>,
}

impl MemoryAuditSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded events, oldest first
    pub fn events(&self) -> Vec<ExchangeEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &ExchangeEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}
