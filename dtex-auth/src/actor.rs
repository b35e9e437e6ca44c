//! Actor Chain
//!
//! Provenance of a multi-hop delegation: who acted on behalf of the subject,
//! in order.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One delegate in an actor chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorEntry {
    /// Delegate identity (`sub` of the `act` claim)
    #[serde(rename = "sub")]
    pub subject: String,

    /// Client/service id of the delegate, if it differs from or adds to `sub`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl ActorEntry {
    /// Create an actor entry
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            client_id: None,
        }
    }

    /// Attach a client id
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

/// Actor Chain
///
/// Ordered oldest first. Never empty: a token without delegates carries no
/// chain at all. On the wire this is the RFC 8693 nested `act` claim, with
/// the most recent delegate outermost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorChain {
    entries: Vec<ActorEntry>,
}

impl ActorChain {
    /// Start a chain with its first delegate
    pub fn root(actor: ActorEntry) -> Self {
        Self {
            entries: vec![actor],
        }
    }

    /// Append a delegate, producing a new chain
    ///
    /// The prior chain is left untouched; entries are never removed or
    /// reordered.
    pub fn extend(prior: Option<&ActorChain>, actor: ActorEntry) -> Self {
        match prior {
            Some(chain) => {
                let mut entries = Vec::with_capacity(chain.entries.len() + 1);
                entries.extend(chain.entries.iter().cloned());
                entries.push(actor);
                Self { entries }
            }
            None => Self::root(actor),
        }
    }

    /// Delegation depth
    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    /// Entries, oldest first
    pub fn entries(&self) -> &[ActorEntry] {
        &self.entries
    }

    /// Most recent delegate
    pub fn current(&self) -> &ActorEntry {
        // Non-empty by construction
        &self.entries[self.entries.len() - 1]
    }

    /// First delegate after the subject
    pub fn origin(&self) -> &ActorEntry {
        &self.entries[0]
    }

    /// Whether an identity already acted in this chain
    pub fn contains(&self, identity: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.subject == identity || e.client_id.as_deref() == Some(identity))
    }

    /// Get full audit trail (oldest → newest)
    ///
    /// Each line names the delegate and the next hop it handed off to; the
    /// last delegate handed off to `audience`.
    pub fn audit_trail(&self, subject: &str, audience: &str) -> Vec<String> {
        let mut trail = Vec::with_capacity(self.entries.len());
        let mut from = subject;
        for entry in &self.entries {
            trail.push(format!("{} → {}", from, entry.subject));
            from = &entry.subject;
        }
        trail.push(format!("{} → {}", from, audience));
        trail
    }
}

/// Wire form of one `act` level
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActClaim {
    sub: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    act: Option<Box<ActClaim>>,
}

impl Serialize for ActorChain {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let nested = self.entries.iter().fold(None, |inner, entry| {
            Some(ActClaim {
                sub: entry.subject.clone(),
                client_id: entry.client_id.clone(),
                act: inner.map(Box::new),
            })
        });
        nested.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ActorChain {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut level = Some(ActClaim::deserialize(deserializer)?);
        let mut entries = Vec::new();
        while let Some(claim) = level {
            if claim.sub.is_empty() {
                return Err(serde::de::Error::custom("act.sub must not be empty"));
            }
            entries.push(ActorEntry {
                subject: claim.sub,
                client_id: claim.client_id,
            });
            level = claim.act.map(|inner| *inner);
        }
        // Outermost is the most recent delegate
        entries.reverse();
        Ok(Self { entries })
    }
}
