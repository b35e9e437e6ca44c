//! Key Material
//!
//! Signing key for minting, verification key sets per issuer, and the
//! providers that supply them. Key sets are immutable snapshots behind an
//! `Arc`; a refresh builds a new set and swaps the pointer, so verifications
//! in flight keep using the snapshot they started with.

use crate::error::{ExchangeError, Result};
use async_trait::async_trait;
use jsonwebtoken::jwk::{
    AlgorithmParameters, EllipticCurve, Jwk, JwkSet, KeyAlgorithm, PublicKeyUse,
};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default timeout for fetching a remote key set
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Default minimum interval between two remote fetches for one issuer
pub const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Key used to sign minted tokens
#[derive(Clone)]
pub struct SigningKey {
    kid: Option<String>,
    algorithm: Algorithm,
    key: EncodingKey,
}

impl SigningKey {
    /// HMAC signing key from a shared secret
    pub fn hmac(kid: Option<String>, algorithm: Algorithm, secret: &[u8]) -> Result<Self> {
        if !is_hmac(algorithm) {
            return Err(ExchangeError::Config(format!(
                "{:?} is not an HMAC algorithm",
                algorithm
            )));
        }
        if secret.is_empty() {
            return Err(ExchangeError::Config("HMAC secret must not be empty".into()));
        }

        Ok(Self {
            kid,
            algorithm,
            key: EncodingKey::from_secret(secret),
        })
    }

    /// Asymmetric signing key from a PEM-encoded private key
    pub fn from_pem(kid: Option<String>, algorithm: Algorithm, pem: &[u8]) -> Result<Self> {
        let key = match algorithm {
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => EncodingKey::from_rsa_pem(pem),
            Algorithm::ES256 | Algorithm::ES384 => EncodingKey::from_ec_pem(pem),
            Algorithm::EdDSA => EncodingKey::from_ed_pem(pem),
            _ => {
                return Err(ExchangeError::Config(format!(
                    "{:?} keys are not PEM-encoded",
                    algorithm
                )))
            }
        }
        .map_err(|e| ExchangeError::Config(format!("Invalid signing key: {}", e)))?;

        Ok(Self {
            kid,
            algorithm,
            key,
        })
    }

    /// Key id placed in the token header
    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    /// Signature algorithm
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub(crate) fn encoding_key(&self) -> &EncodingKey {
        &self.key
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Key used to verify token signatures
#[derive(Clone)]
pub struct VerificationKey {
    kid: Option<String>,
    algorithm: Algorithm,
    key: DecodingKey,
}

impl VerificationKey {
    /// HMAC verification key from a shared secret
    pub fn hmac(kid: Option<String>, algorithm: Algorithm, secret: &[u8]) -> Result<Self> {
        if !is_hmac(algorithm) {
            return Err(ExchangeError::Config(format!(
                "{:?} is not an HMAC algorithm",
                algorithm
            )));
        }

        Ok(Self {
            kid,
            algorithm,
            key: DecodingKey::from_secret(secret),
        })
    }

    /// Asymmetric verification key from a PEM-encoded public key
    pub fn from_pem(kid: Option<String>, algorithm: Algorithm, pem: &[u8]) -> Result<Self> {
        let key = match algorithm {
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => DecodingKey::from_rsa_pem(pem),
            Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem),
            Algorithm::EdDSA => DecodingKey::from_ed_pem(pem),
            _ => {
                return Err(ExchangeError::Config(format!(
                    "{:?} keys are not PEM-encoded",
                    algorithm
                )))
            }
        }
        .map_err(|e| ExchangeError::Config(format!("Invalid verification key: {}", e)))?;

        Ok(Self {
            kid,
            algorithm,
            key,
        })
    }

    /// Verification key from a published JWK
    ///
    /// Returns `None` for keys that are not usable for signature
    /// verification (encryption keys, unknown algorithms).
    pub fn from_jwk(jwk: &Jwk) -> Option<Result<Self>> {
        if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
            return None;
        }

        let algorithm = match &jwk.common.key_algorithm {
            Some(alg) => signature_algorithm(alg)?,
            None => default_algorithm(&jwk.algorithm)?,
        };

        Some(
            DecodingKey::from_jwk(jwk)
                .map(|key| Self {
                    kid: jwk.common.key_id.clone(),
                    algorithm,
                    key,
                })
                .map_err(|e| ExchangeError::KeyUnavailable(format!("Invalid JWK: {}", e))),
        )
    }

    /// Key id
    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    /// Signature algorithm
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

fn is_hmac(algorithm: Algorithm) -> bool {
    matches!(
        algorithm,
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
    )
}

fn signature_algorithm(alg: &KeyAlgorithm) -> Option<Algorithm> {
    Some(match alg {
        KeyAlgorithm::HS256 => Algorithm::HS256,
        KeyAlgorithm::HS384 => Algorithm::HS384,
        KeyAlgorithm::HS512 => Algorithm::HS512,
        KeyAlgorithm::ES256 => Algorithm::ES256,
        KeyAlgorithm::ES384 => Algorithm::ES384,
        KeyAlgorithm::RS256 => Algorithm::RS256,
        KeyAlgorithm::RS384 => Algorithm::RS384,
        KeyAlgorithm::RS512 => Algorithm::RS512,
        KeyAlgorithm::PS256 => Algorithm::PS256,
        KeyAlgorithm::PS384 => Algorithm::PS384,
        KeyAlgorithm::PS512 => Algorithm::PS512,
        KeyAlgorithm::EdDSA => Algorithm::EdDSA,
        _ => return None,
    })
}

fn default_algorithm(params: &AlgorithmParameters) -> Option<Algorithm> {
    match params {
        AlgorithmParameters::RSA(_) => Some(Algorithm::RS256),
        AlgorithmParameters::EllipticCurve(ec) => match ec.curve {
            EllipticCurve::P256 => Some(Algorithm::ES256),
            EllipticCurve::P384 => Some(Algorithm::ES384),
            _ => None,
        },
        AlgorithmParameters::OctetKeyPair(_) => Some(Algorithm::EdDSA),
        AlgorithmParameters::OctetKey(_) => Some(Algorithm::HS256),
        _ => None,
    }
}

/// Verification keys published by one issuer
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    keys: Vec<VerificationKey>,
}

impl KeySet {
    /// Create a key set
    pub fn new(keys: Vec<VerificationKey>) -> Self {
        Self { keys }
    }

    /// Build from a JWKS document, skipping unusable keys
    pub fn from_jwks(jwks: &JwkSet) -> Self {
        let mut keys = Vec::with_capacity(jwks.keys.len());
        for jwk in &jwks.keys {
            match VerificationKey::from_jwk(jwk) {
                Some(Ok(key)) => keys.push(key),
                Some(Err(e)) => {
                    warn!(kid = ?jwk.common.key_id, error = %e, "Skipping malformed JWK")
                }
                None => debug!(kid = ?jwk.common.key_id, "Skipping non-signature JWK"),
            }
        }
        Self { keys }
    }

    /// This set's keys followed by those of `other`
    pub fn merged(&self, other: &KeySet) -> KeySet {
        Self {
            keys: self.keys.iter().chain(other.keys.iter()).cloned().collect(),
        }
    }

    /// Find the key for a token header
    ///
    /// With a `kid`, the key must carry that id; without one, the first key
    /// for the algorithm is used.
    pub fn select(&self, kid: Option<&str>, algorithm: Algorithm) -> Option<&VerificationKey> {
        self.keys.iter().find(|key| {
            key.algorithm == algorithm
                && match kid {
                    Some(kid) => key.kid.as_deref() == Some(kid),
                    None => true,
                }
        })
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Supplies verification keys by issuer
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Current key set for an issuer
    async fn key_set(&self, issuer: &str) -> Result<Arc<KeySet>>;

    /// Reload the key set for an issuer (e.g. after an unknown `kid`)
    ///
    /// Providers without a remote source return their current set.
    async fn refresh(&self, issuer: &str) -> Result<Arc<KeySet>> {
        self.key_set(issuer).await
    }
}

/// Fixed key sets loaded at process start
#[derive(Debug, Default)]
pub struct StaticKeyProvider {
    sets: HashMap<String, Arc<KeySet>>,
}

impl StaticKeyProvider {
    /// Create an empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the key set of an issuer
    pub fn with_issuer(mut self, issuer: impl Into<String>, keys: KeySet) -> Self {
        self.sets.insert(issuer.into(), Arc::new(keys));
        self
    }
}

#[async_trait]
impl KeyProvider for StaticKeyProvider {
    async fn key_set(&self, issuer: &str) -> Result<Arc<KeySet>> {
        self.sets.get(issuer).cloned().ok_or_else(|| {
            ExchangeError::KeyUnavailable(format!("No keys configured for issuer {}", issuer))
        })
    }
}

/// Local keys consulted ahead of a remote provider
///
/// Keeps the engine's own key and statically configured keys usable next to
/// a JWKS endpoint that publishes only the authorization server's keys. When
/// the remote source is down, lookups fall back to the local keys; a refresh
/// still reports the remote failure.
pub struct LayeredKeyProvider {
    local: StaticKeyProvider,
    remote: Arc<dyn KeyProvider>,
}

impl LayeredKeyProvider {
    /// Layer `local` in front of `remote`
    pub fn new(local: StaticKeyProvider, remote: Arc<dyn KeyProvider>) -> Self {
        Self { local, remote }
    }

    fn combine(&self, issuer: &str, remote: Result<Arc<KeySet>>) -> Result<Arc<KeySet>> {
        let local = self.local.sets.get(issuer);
        match (local, remote) {
            (Some(local), Ok(remote)) => Ok(Arc::new(local.merged(&remote))),
            (None, Ok(remote)) => Ok(remote),
            (Some(local), Err(e)) if !local.is_empty() => {
                warn!(issuer = %issuer, error = %e, "Remote keys unavailable, using local keys");
                Ok(Arc::clone(local))
            }
            (_, Err(e)) => Err(e),
        }
    }
}

#[async_trait]
impl KeyProvider for LayeredKeyProvider {
    async fn key_set(&self, issuer: &str) -> Result<Arc<KeySet>> {
        let remote = self.remote.key_set(issuer).await;
        self.combine(issuer, remote)
    }

    async fn refresh(&self, issuer: &str) -> Result<Arc<KeySet>> {
        let remote = self.remote.refresh(issuer).await?;
        self.combine(issuer, Ok(remote))
    }
}

struct CachedKeys {
    keys: Arc<KeySet>,
    fetched_at: Instant,
}

/// Key sets fetched from the authorization server's JWKS endpoints
pub struct JwksKeyProvider {
    endpoints: HashMap<String, String>,
    client: reqwest::Client,
    fetch_timeout: Duration,
    min_refresh_interval: Duration,
    cache: RwLock<HashMap<String, CachedKeys>>,
}

impl JwksKeyProvider {
    /// Create a provider with default timeouts
    pub fn new() -> Self {
        Self::with_timeouts(DEFAULT_FETCH_TIMEOUT, DEFAULT_MIN_REFRESH_INTERVAL)
    }

    /// Create a provider with explicit fetch timeout and refresh interval
    pub fn with_timeouts(fetch_timeout: Duration, min_refresh_interval: Duration) -> Self {
        Self {
            endpoints: HashMap::new(),
            client: reqwest::Client::new(),
            fetch_timeout,
            min_refresh_interval,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Register the JWKS endpoint of an issuer
    pub fn with_endpoint(mut self, issuer: impl Into<String>, jwks_url: impl Into<String>) -> Self {
        self.endpoints.insert(issuer.into(), jwks_url.into());
        self
    }

    /// Issuers with a registered endpoint
    pub fn issuers(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }

    /// Refresh every issuer on a fixed period until the provider is dropped
    pub fn spawn_periodic_refresh(
        self: &Arc<Self>,
        every: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let provider = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(provider) = provider.upgrade() else {
                    break;
                };
                let issuers: Vec<String> = provider.issuers().map(str::to_string).collect();
                for issuer in issuers {
                    if let Err(e) = provider.fetch_and_swap(&issuer).await {
                        warn!(issuer = %issuer, error = %e, "Periodic key refresh failed");
                    }
                }
            }
        })
    }

    fn cached(&self, issuer: &str) -> Option<(Arc<KeySet>, Instant)> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache
            .get(issuer)
            .map(|entry| (Arc::clone(&entry.keys), entry.fetched_at))
    }

    async fn fetch_and_swap(&self, issuer: &str) -> Result<Arc<KeySet>> {
        let url = self.endpoints.get(issuer).ok_or_else(|| {
            ExchangeError::KeyUnavailable(format!("No JWKS endpoint for issuer {}", issuer))
        })?;

        debug!(issuer = %issuer, url = %url, "Fetching JWKS");

        let keys = tokio::time::timeout(self.fetch_timeout, self.fetch(url))
            .await
            .map_err(|_| {
                ExchangeError::KeyUnavailable(format!(
                    "JWKS fetch from {} timed out after {:?}",
                    url, self.fetch_timeout
                ))
            })??;
        let keys = Arc::new(keys);

        // Fetch happened outside the lock; only the swap is exclusive
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            issuer.to_string(),
            CachedKeys {
                keys: Arc::clone(&keys),
                fetched_at: Instant::now(),
            },
        );

        info!(issuer = %issuer, keys = keys.len(), "Key set refreshed");
        Ok(keys)
    }

    async fn fetch(&self, url: &str) -> Result<KeySet> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(ExchangeError::KeyUnavailable(format!(
                "JWKS request failed: {}",
                response.status()
            )));
        }

        let jwks = response.json::<JwkSet>().await?;
        Ok(KeySet::from_jwks(&jwks))
    }
}

impl Default for JwksKeyProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyProvider for JwksKeyProvider {
    async fn key_set(&self, issuer: &str) -> Result<Arc<KeySet>> {
        match self.cached(issuer) {
            Some((keys, _)) => Ok(keys),
            None => self.fetch_and_swap(issuer).await,
        }
    }

    async fn refresh(&self, issuer: &str) -> Result<Arc<KeySet>> {
        if let Some((keys, fetched_at)) = self.cached(issuer) {
            if fetched_at.elapsed() < self.min_refresh_interval {
                debug!(issuer = %issuer, "Skipping refresh, key set is fresh");
                return Ok(keys);
            }
        }
        self.fetch_and_swap(issuer).await
    }
}
