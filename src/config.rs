//! Configuration management for Turnstile.

use std::path::Path;
use std::time::Duration;

use http::HeaderName;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{KeyDeriver, TierRollback, TimeWindow, WindowPolicy};

/// Prefix for environment overrides, e.g. `TURNSTILE__STORE__BACKEND=redis`.
const ENV_PREFIX: &str = "TURNSTILE";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for the Turnstile engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Shared counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Window policies and limiter topology
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Key derivation configuration
    #[serde(default)]
    pub keys: KeysConfig,

    /// HTTP middleware behaviour
    #[serde(default)]
    pub middleware: MiddlewareConfig,
}

/// Which counter store backs the limiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; limits are per replica
    #[default]
    Memory,
    /// Redis shared by every replica
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix for every counter key written to the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// How long to wait for the initial store connection
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Upper bound on a single admission check
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            connect_timeout_ms: default_connect_timeout(),
            call_timeout_ms: default_call_timeout(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "turnstile".to_string()
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_call_timeout() -> u64 {
    250
}

/// How configured tiers are assembled into a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// A single fixed-window limiter
    Fixed,
    /// A single sliding-window limiter
    Sliding,
    /// Every tier must admit
    #[default]
    Hierarchical,
}

/// Counting algorithm for each tier of a hierarchical topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierAlgorithm {
    #[default]
    Fixed,
    Sliding,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default)]
    pub topology: Topology,

    /// Algorithm used by each tier of a hierarchical topology
    #[serde(default)]
    pub tier_algorithm: TierAlgorithm,

    /// Whether earlier tiers are refunded when a later tier denies
    #[serde(default)]
    pub rollback: TierRollback,

    /// Tiers in evaluation order
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierConfig>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            topology: Topology::default(),
            tier_algorithm: TierAlgorithm::default(),
            rollback: TierRollback::default(),
            tiers: default_tiers(),
        }
    }
}

fn default_tiers() -> Vec<TierConfig> {
    vec![
        TierConfig::named(TimeWindow::Second, 10),
        TierConfig::named(TimeWindow::Minute, 300),
        TierConfig::named(TimeWindow::Hour, 5000),
    ]
}

/// One window policy as written in configuration.
///
/// Exactly one of `window` and `window_ms` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Tier name; defaults to the window name when `window` is used
    #[serde(default)]
    pub name: Option<String>,
    /// Requests allowed per window
    pub limit: u64,
    /// Named window size
    #[serde(default)]
    pub window: Option<TimeWindow>,
    /// Explicit window size in milliseconds
    #[serde(default)]
    pub window_ms: Option<u64>,
}

impl TierConfig {
    fn named(window: TimeWindow, limit: u64) -> Self {
        Self {
            name: None,
            limit,
            window: Some(window),
            window_ms: None,
        }
    }

    /// Validate this tier into a policy.
    pub fn to_policy(&self) -> Result<WindowPolicy> {
        let (default_name, window) = match (self.window, self.window_ms) {
            (Some(named), None) => (Some(named.name()), named.duration()),
            (None, Some(ms)) => (None, Duration::from_millis(ms)),
            (Some(_), Some(_)) => {
                return Err(TurnstileError::Config(
                    "tier sets both `window` and `window_ms`".to_string(),
                ))
            }
            (None, None) => {
                return Err(TurnstileError::Config(
                    "tier needs either `window` or `window_ms`".to_string(),
                ))
            }
        };

        let name = match (&self.name, default_name) {
            (Some(name), _) => name.clone(),
            (None, Some(name)) => name.to_string(),
            (None, None) => {
                return Err(TurnstileError::Config(
                    "tier with `window_ms` needs a `name`".to_string(),
                ))
            }
        };

        Ok(WindowPolicy::new(name, self.limit, window)?)
    }
}

/// Header names used for key derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysConfig {
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,

    #[serde(default = "default_forwarded_for_header")]
    pub forwarded_for_header: String,

    #[serde(default = "default_real_ip_header")]
    pub real_ip_header: String,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            api_key_header: default_api_key_header(),
            forwarded_for_header: default_forwarded_for_header(),
            real_ip_header: default_real_ip_header(),
        }
    }
}

fn default_api_key_header() -> String {
    "x-api-key".to_string()
}

fn default_forwarded_for_header() -> String {
    "x-forwarded-for".to_string()
}

fn default_real_ip_header() -> String {
    "x-real-ip".to_string()
}

impl KeysConfig {
    /// Build a key deriver, rejecting invalid header names.
    pub fn to_deriver(&self) -> Result<KeyDeriver> {
        Ok(KeyDeriver::new(
            parse_header(&self.api_key_header)?,
            parse_header(&self.forwarded_for_header)?,
            parse_header(&self.real_ip_header)?,
        ))
    }
}

fn parse_header(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.trim().to_ascii_lowercase().as_bytes())
        .map_err(|e| TurnstileError::Config(format!("invalid header name '{}': {}", name, e)))
}

/// What the middleware does when the counter store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Let the request through
    #[default]
    Open,
    /// Reject the request with 503
    Closed,
}

/// HTTP middleware configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    #[serde(default)]
    pub fail_mode: FailMode,
}

impl TurnstileConfig {
    /// Load configuration from a YAML file, applying environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string, applying environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::load(yaml, config::Environment::with_prefix(ENV_PREFIX))
    }

    /// Load from defaults and environment overrides only.
    pub fn from_env() -> Result<Self> {
        Self::from_yaml("{}")
    }

    fn load(yaml: &str, env: config::Environment) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .add_source(
                env.prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| TurnstileError::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Validate every configured tier. Any failure is fatal at startup.
    pub fn build_policies(&self) -> Result<Vec<WindowPolicy>> {
        if self.limits.tiers.is_empty() {
            return Err(TurnstileError::Config("at least one tier is required".to_string()));
        }

        match self.limits.topology {
            Topology::Fixed | Topology::Sliding if self.limits.tiers.len() != 1 => {
                return Err(TurnstileError::Config(format!(
                    "{:?} topology takes exactly one tier, found {}",
                    self.limits.topology,
                    self.limits.tiers.len()
                )));
            }
            _ => {}
        }

        let policies = self
            .limits
            .tiers
            .iter()
            .map(TierConfig::to_policy)
            .collect::<Result<Vec<_>>>()?;

        for (i, policy) in policies.iter().enumerate() {
            if policies[..i].iter().any(|p| p.name() == policy.name()) {
                return Err(TurnstileError::Config(format!(
                    "duplicate tier name '{}'",
                    policy.name()
                )));
            }
        }

        Ok(policies)
    }

    /// Timeout applied to each admission check.
    pub fn call_timeout(&self) -> Option<Duration> {
        match self.store.call_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}
