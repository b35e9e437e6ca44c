//! Engine Configuration
//!
//! TOML file with `DTEX_*` environment overrides (a `.env` file is honored).
//!
//! ```toml
//! issuer = "https://auth.example"
//! clock_skew = "30s"
//! default_token_ttl = "5m"
//! max_delegation_depth = 5
//!
//! [signing]
//! kid = "dtex-1"
//! algorithm = "HS256"
//! secret = "0123abcd..."          # hex
//!
//! [keys]
//! jwks_url = "https://auth.example/certs"
//! fetch_timeout = "5s"
//! refresh_interval = "10m"
//!
//! [agents.planner]
//! allowed_audiences = ["tax-optimizer"]
//! grantable_scopes = "tax:calculate"
//! ```

use crate::{
    codec::DEFAULT_CLOCK_SKEW_SECONDS,
    error::{ExchangeError, Result},
    exchange::ExchangeEngineBuilder,
    keys::{
        JwksKeyProvider, KeyProvider, KeySet, LayeredKeyProvider, SigningKey, StaticKeyProvider,
        VerificationKey, DEFAULT_FETCH_TIMEOUT, DEFAULT_MIN_REFRESH_INTERVAL,
    },
    policy::{AgentPolicy, DelegationPolicy},
    ExchangeEngine, DEFAULT_MAX_DELEGATION_DEPTH, DEFAULT_TOKEN_TTL,
};
use humantime_serde::re::humantime;
use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "DTEX_";

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Issuer of minted tokens, and the issuer subject tokens must carry
    pub issuer: String,

    /// Tolerance for clock differences
    #[serde(default = "default_clock_skew", with = "humantime_serde")]
    pub clock_skew: Duration,

    /// Lifetime of minted tokens unless the subject expires sooner
    #[serde(default = "default_token_ttl", with = "humantime_serde")]
    pub default_token_ttl: Duration,

    /// Maximum actor chain length
    #[serde(default = "default_max_depth")]
    pub max_delegation_depth: usize,

    /// Signing key
    pub signing: SigningConfig,

    /// Verification keys
    #[serde(default)]
    pub keys: KeysConfig,

    /// Per-agent delegation policy
    #[serde(default)]
    pub agents: HashMap<String, AgentPolicy>,
}

fn default_clock_skew() -> Duration {
    Duration::from_secs(DEFAULT_CLOCK_SKEW_SECONDS as u64)
}

fn default_token_ttl() -> Duration {
    DEFAULT_TOKEN_TTL
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DELEGATION_DEPTH
}

fn default_algorithm() -> Algorithm {
    Algorithm::HS256
}

/// Signing key configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Key id placed in token headers
    #[serde(default)]
    pub kid: Option<String>,

    /// Signature algorithm
    #[serde(default = "default_algorithm")]
    pub algorithm: Algorithm,

    /// Hex-encoded shared secret (HMAC algorithms)
    #[serde(default)]
    pub secret: Option<String>,

    /// PEM private key (asymmetric algorithms)
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,

    /// PEM public key matching `private_key_path`, used to verify our own tokens
    #[serde(default)]
    pub public_key_path: Option<PathBuf>,
}

impl fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningConfig")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("private_key_path", &self.private_key_path)
            .field("public_key_path", &self.public_key_path)
            .finish()
    }
}

/// Verification key configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysConfig {
    /// JWKS endpoint of the issuer; static keys are used when unset
    #[serde(default)]
    pub jwks_url: Option<String>,

    /// JWKS fetch timeout
    #[serde(default = "default_fetch_timeout", with = "humantime_serde")]
    pub fetch_timeout: Duration,

    /// Minimum interval between refreshes triggered by unknown key ids
    #[serde(default = "default_min_refresh_interval", with = "humantime_serde")]
    pub min_refresh_interval: Duration,

    /// Background JWKS refresh period (off when unset)
    #[serde(default, with = "humantime_serde")]
    pub refresh_interval: Option<Duration>,

    /// Additional verification keys for the issuer, consulted before the JWKS
    #[serde(default, rename = "static")]
    pub static_keys: Vec<StaticKeyConfig>,
}

fn default_fetch_timeout() -> Duration {
    DEFAULT_FETCH_TIMEOUT
}

fn default_min_refresh_interval() -> Duration {
    DEFAULT_MIN_REFRESH_INTERVAL
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            jwks_url: None,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
            refresh_interval: None,
            static_keys: Vec::new(),
        }
    }
}

/// One statically configured verification key
#[derive(Clone, Serialize, Deserialize)]
pub struct StaticKeyConfig {
    /// Key id
    #[serde(default)]
    pub kid: Option<String>,

    /// Signature algorithm
    #[serde(default = "default_algorithm")]
    pub algorithm: Algorithm,

    /// Hex-encoded shared secret (HMAC algorithms)
    #[serde(default)]
    pub secret: Option<String>,

    /// PEM public key (asymmetric algorithms)
    #[serde(default)]
    pub public_key_path: Option<PathBuf>,
}

impl fmt::Debug for StaticKeyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeyConfig")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .field("public_key_path", &self.public_key_path)
            .finish_non_exhaustive()
    }
}

impl StaticKeyConfig {
    fn verification_key(&self) -> Result<VerificationKey> {
        match (&self.secret, &self.public_key_path) {
            (Some(secret), _) => {
                VerificationKey::hmac(self.kid.clone(), self.algorithm, &decode_secret(secret)?)
            }
            (None, Some(path)) => {
                VerificationKey::from_pem(self.kid.clone(), self.algorithm, &read_pem(path)?)
            }
            (None, None) => Err(ExchangeError::Config(format!(
                "Static key {:?} needs a secret or public_key_path",
                self.kid
            ))),
        }
    }
}

impl EngineConfig {
    /// Configuration with an HMAC signing secret and defaults elsewhere
    pub fn new(issuer: impl Into<String>, algorithm: Algorithm, secret: &[u8]) -> Self {
        Self {
            issuer: issuer.into(),
            clock_skew: default_clock_skew(),
            default_token_ttl: DEFAULT_TOKEN_TTL,
            max_delegation_depth: DEFAULT_MAX_DELEGATION_DEPTH,
            signing: SigningConfig {
                kid: None,
                algorithm,
                secret: Some(hex::encode(secret)),
                private_key_path: None,
                public_key_path: None,
            },
            keys: KeysConfig::default(),
            agents: HashMap::new(),
        }
    }

    /// Load from an optional file, then apply `.env` and `DTEX_*` overrides
    ///
    /// Without a file, `DTEX_ISSUER` and `DTEX_SIGNING_SECRET` must be set.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(path) => Self::parse_file(path)?,
            None => {
                let issuer = env_var("ISSUER").ok_or_else(|| {
                    ExchangeError::Config(format!("{}ISSUER must be set", ENV_PREFIX))
                })?;
                let mut config = Self::new(issuer, Algorithm::HS256, &[]);
                config.signing.secret = None;
                config
            }
        };

        config.apply_overrides(env_var)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file without environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let config = Self::parse_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ExchangeError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(toml::from_str(&content)?)
    }

    /// Apply overrides from a variable lookup (names without the `DTEX_` prefix)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(issuer) = lookup("ISSUER") {
            self.issuer = issuer;
        }
        if let Some(skew) = lookup("CLOCK_SKEW") {
            self.clock_skew = parse_duration("CLOCK_SKEW", &skew)?;
        }
        if let Some(ttl) = lookup("DEFAULT_TOKEN_TTL") {
            self.default_token_ttl = parse_duration("DEFAULT_TOKEN_TTL", &ttl)?;
        }
        if let Some(depth) = lookup("MAX_DELEGATION_DEPTH") {
            self.max_delegation_depth = depth.parse().map_err(|e| {
                ExchangeError::Config(format!("Invalid {}MAX_DELEGATION_DEPTH: {}", ENV_PREFIX, e))
            })?;
        }
        if let Some(kid) = lookup("SIGNING_KID") {
            self.signing.kid = Some(kid);
        }
        if let Some(algorithm) = lookup("SIGNING_ALGORITHM") {
            self.signing.algorithm = Algorithm::from_str(&algorithm).map_err(|e| {
                ExchangeError::Config(format!("Invalid {}SIGNING_ALGORITHM: {}", ENV_PREFIX, e))
            })?;
        }
        if let Some(secret) = lookup("SIGNING_SECRET") {
            self.signing.secret = Some(secret);
        }
        if let Some(path) = lookup("SIGNING_PRIVATE_KEY_PATH") {
            self.signing.private_key_path = Some(PathBuf::from(path));
        }
        if let Some(url) = lookup("JWKS_URL") {
            self.keys.jwks_url = Some(url);
        }
        if let Some(every) = lookup("JWKS_REFRESH_INTERVAL") {
            self.keys.refresh_interval = Some(parse_duration("JWKS_REFRESH_INTERVAL", &every)?);
        }
        Ok(())
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.issuer.is_empty() {
            return Err(ExchangeError::Config("issuer must not be empty".into()));
        }
        if self.max_delegation_depth == 0 {
            return Err(ExchangeError::Config(
                "max_delegation_depth must be at least 1".into(),
            ));
        }
        if self.default_token_ttl.is_zero() {
            return Err(ExchangeError::Config(
                "default_token_ttl must be positive".into(),
            ));
        }
        if self.keys.refresh_interval.is_some_and(|every| every.is_zero()) {
            return Err(ExchangeError::Config(
                "keys.refresh_interval must be positive".into(),
            ));
        }
        if self.signing.secret.is_none() && self.signing.private_key_path.is_none() {
            return Err(ExchangeError::Config(
                "signing needs a secret or private_key_path".into(),
            ));
        }
        Ok(())
    }

    /// Build the signing key
    pub fn signing_key(&self) -> Result<SigningKey> {
        let signing = &self.signing;
        match (&signing.secret, &signing.private_key_path) {
            (Some(secret), _) => {
                SigningKey::hmac(signing.kid.clone(), signing.algorithm, &decode_secret(secret)?)
            }
            (None, Some(path)) => {
                SigningKey::from_pem(signing.kid.clone(), signing.algorithm, &read_pem(path)?)
            }
            (None, None) => Err(ExchangeError::Config("No signing key configured".into())),
        }
    }

    /// Build the key provider
    ///
    /// The verification half of the signing key and the configured static
    /// keys always form the local set. With `keys.jwks_url` the local set is
    /// layered in front of the remote one; with `keys.refresh_interval` the
    /// remote set is also reloaded in the background, which needs a running
    /// Tokio runtime.
    pub fn key_provider(&self) -> Result<Arc<dyn KeyProvider>> {
        let mut keys = Vec::with_capacity(self.keys.static_keys.len() + 1);
        if let Some(own) = self.own_verification_key()? {
            keys.push(own);
        }
        for key in &self.keys.static_keys {
            keys.push(key.verification_key()?);
        }

        let Some(url) = &self.keys.jwks_url else {
            if keys.is_empty() {
                return Err(ExchangeError::Config(
                    "No verification keys configured".into(),
                ));
            }
            debug!(issuer = %self.issuer, keys = keys.len(), "Using static key set");
            return Ok(Arc::new(
                StaticKeyProvider::new().with_issuer(self.issuer.clone(), KeySet::new(keys)),
            ));
        };

        info!(issuer = %self.issuer, url = %url, local_keys = keys.len(), "Using remote key set");
        let remote = Arc::new(
            JwksKeyProvider::with_timeouts(self.keys.fetch_timeout, self.keys.min_refresh_interval)
                .with_endpoint(self.issuer.clone(), url.clone()),
        );

        if let Some(every) = self.keys.refresh_interval {
            if tokio::runtime::Handle::try_current().is_err() {
                return Err(ExchangeError::Config(
                    "keys.refresh_interval needs a Tokio runtime".into(),
                ));
            }
            // Detached; the task ends once the provider is dropped
            let _ = remote.spawn_periodic_refresh(every);
        }

        if keys.is_empty() {
            return Ok(remote);
        }
        Ok(Arc::new(LayeredKeyProvider::new(
            StaticKeyProvider::new().with_issuer(self.issuer.clone(), KeySet::new(keys)),
            remote,
        )))
    }

    fn own_verification_key(&self) -> Result<Option<VerificationKey>> {
        let signing = &self.signing;
        if let Some(secret) = &signing.secret {
            return VerificationKey::hmac(signing.kid.clone(), signing.algorithm, &decode_secret(secret)?)
                .map(Some);
        }
        match &signing.public_key_path {
            Some(path) => {
                VerificationKey::from_pem(signing.kid.clone(), signing.algorithm, &read_pem(path)?)
                    .map(Some)
            }
            None => Ok(None),
        }
    }

    /// Build the delegation policy
    pub fn policy(&self) -> DelegationPolicy {
        self.agents.iter().fold(
            DelegationPolicy::new(self.issuer.clone()).with_max_depth(self.max_delegation_depth),
            |policy, (agent, rules)| policy.with_agent(agent.clone(), rules.clone()),
        )
    }

    /// Engine builder with every configured collaborator set
    pub fn engine_builder(&self) -> Result<ExchangeEngineBuilder> {
        Ok(ExchangeEngine::builder(self.issuer.clone())
            .signing_key(self.signing_key()?)
            .key_provider(self.key_provider()?)
            .policy(self.policy())
            .clock_skew(i64::try_from(self.clock_skew.as_secs()).unwrap_or(i64::MAX))
            .default_ttl(self.default_token_ttl))
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name)).ok()
}

fn parse_duration(name: &str, raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw)
        .map_err(|e| ExchangeError::Config(format!("Invalid {}{}: {}", ENV_PREFIX, name, e)))
}

fn decode_secret(secret: &str) -> Result<Vec<u8>> {
    hex::decode(secret.trim())
        .map_err(|e| ExchangeError::Config(format!("Invalid hex secret: {}", e)))
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        ExchangeError::Config(format!("Failed to read key {}: {}", path.display(), e))
    })
}
