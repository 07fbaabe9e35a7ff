//! Configuration management for Bouncer.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `BOUNCER__`-prefixed environment variables (`__` separates nesting,
//! e.g. `BOUNCER__SERVER__HTTP_ADDR=0.0.0.0:8080`).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{BouncerError, Result};
use crate::ratelimit::{FailureMode, LockoutPolicy, RateLimitRules};

/// Main configuration for the Bouncer service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BouncerConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Upstream authentication provider
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// HTTP middleware pipeline
    #[serde(default)]
    pub http: HttpConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Take the client IP from the first `X-Forwarded-For` hop.
    /// Only enable behind a proxy that overwrites the header.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            trust_forwarded_for: false,
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which record store backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// In-process map; single instance only
    #[default]
    Memory,
    /// Shared Redis instance
    Redis,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Behaviour when the store is unreachable
    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Whether attempts while blocked extend the block
    #[serde(default)]
    pub lockout_policy: LockoutPolicy,

    /// Record store backend
    #[serde(default)]
    pub store: StoreKind,

    /// Redis connection URL, required when `store` is `redis`
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for keys written to a shared store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Seconds between background sweeps; 0 disables the sweeper
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Thresholds per action and identifier kind
    #[serde(default)]
    pub limits: RateLimitRules,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            failure_mode: FailureMode::default(),
            lockout_policy: LockoutPolicy::default(),
            store: StoreKind::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            sweep_interval_secs: default_sweep_interval(),
            limits: RateLimitRules::default(),
        }
    }
}

fn default_key_prefix() -> String {
    "bouncer:ratelimit".to_string()
}

fn default_sweep_interval() -> u64 {
    300
}

/// Upstream authentication provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the GoTrue-style auth API (e.g. `https://x.supabase.co/auth/v1`)
    #[serde(default = "default_upstream_url")]
    pub base_url: String,

    /// API key sent as `apikey` and bearer token
    #[serde(default)]
    pub api_key: String,

    /// Request timeout in seconds
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_url(),
            api_key: String::new(),
            timeout_secs: default_upstream_timeout(),
        }
    }
}

fn default_upstream_url() -> String {
    "http://127.0.0.1:9999/auth/v1".to_string()
}

fn default_upstream_timeout() -> u64 {
    10
}

/// HTTP middleware pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Origins allowed to make cross-origin requests
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,

    /// Accepted request body content types
    #[serde(default = "default_content_types")]
    pub allowed_content_types: Vec<String>,

    /// Emit `Strict-Transport-Security` with this max-age when set
    #[serde(default)]
    pub hsts_max_age: Option<u64>,

    /// Paths excluded from request logging
    #[serde(default = "default_log_excluded_paths")]
    pub log_excluded_paths: Vec<String>,

    /// Apply the generic per-IP limit to every request
    #[serde(default = "default_true")]
    pub api_rate_limit: bool,

    /// Paths the generic per-IP limit never counts
    #[serde(default = "default_rate_limit_excluded_paths")]
    pub rate_limit_excluded_paths: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_allowed_origins(),
            allowed_content_types: default_content_types(),
            hsts_max_age: None,
            log_excluded_paths: default_log_excluded_paths(),
            api_rate_limit: true,
            rate_limit_excluded_paths: default_rate_limit_excluded_paths(),
        }
    }
}

fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:8000".to_string()]
}

fn default_content_types() -> Vec<String> {
    vec!["application/json".to_string()]
}

fn default_log_excluded_paths() -> Vec<String> {
    vec!["/health".to_string(), "/status".to_string()]
}

fn default_rate_limit_excluded_paths() -> Vec<String> {
    vec!["/health".to_string()]
}

fn default_true() -> bool {
    true
}

impl BouncerConfig {
    /// Load configuration from an optional YAML file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        let config: BouncerConfig = builder
            .add_source(
                config::Environment::with_prefix("BOUNCER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| BouncerError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: BouncerConfig =
            serde_yaml::from_str(yaml).map_err(|e| BouncerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.rate_limiting.limits.validate()?;

        if self.rate_limiting.store == StoreKind::Redis && self.rate_limiting.redis_url.is_none() {
            return Err(BouncerError::Config(
                "rate_limiting.redis_url is required when store is redis".to_string(),
            ));
        }

        if self.upstream.timeout_secs == 0 {
            return Err(BouncerError::Config(
                "upstream.timeout_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
