//! Rate limit rules configuration.
//!
//! Each rule pairs a threshold with a window length. The authentication flow
//! uses one rule per (action, identifier kind): logins are limited both per
//! client IP and, more strictly, per account email.

use serde::{Deserialize, Serialize};

use super::record::MAX_WINDOW_SECS;
use crate::error::{BouncerError, Result};

/// A threshold and the window it applies over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    /// Attempts allowed within the window before blocking
    pub max_attempts: u32,
    /// Window length in seconds
    pub window_secs: u64,
}

impl LimitRule {
    /// Create a new rule.
    pub const fn new(max_attempts: u32, window_secs: u64) -> Self {
        Self {
            max_attempts,
            window_secs,
        }
    }

    /// Reject rules the limiter would refuse at call time.
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(BouncerError::Config(format!(
                "{name}: max_attempts must be greater than zero"
            )));
        }
        if self.window_secs == 0 || self.window_secs > MAX_WINDOW_SECS {
            return Err(BouncerError::Config(format!(
                "{name}: window_secs must be between 1 and {MAX_WINDOW_SECS}"
            )));
        }
        Ok(())
    }
}

/// The full set of limits applied by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRules {
    /// Login attempts per client IP
    #[serde(default = "default_login_ip")]
    pub login_ip: LimitRule,

    /// Login attempts per account email, across all IPs
    #[serde(default = "default_login_email")]
    pub login_email: LimitRule,

    /// Registration attempts per client IP
    #[serde(default = "default_register_ip")]
    pub register_ip: LimitRule,

    /// Generic API requests per client IP
    #[serde(default = "default_api_ip")]
    pub api_ip: LimitRule,
}

impl Default for RateLimitRules {
    fn default() -> Self {
        Self {
            login_ip: default_login_ip(),
            login_email: default_login_email(),
            register_ip: default_register_ip(),
            api_ip: default_api_ip(),
        }
    }
}

fn default_login_ip() -> LimitRule {
    LimitRule::new(10, 3600)
}

fn default_login_email() -> LimitRule {
    LimitRule::new(5, 3600)
}

fn default_register_ip() -> LimitRule {
    LimitRule::new(5, 3600)
}

fn default_api_ip() -> LimitRule {
    LimitRule::new(100, 3600)
}

impl RateLimitRules {
    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: RateLimitRules = serde_yaml::from_str(yaml)
            .map_err(|e| BouncerError::Config(format!("Failed to parse rate limit rules: {}", e)))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Validate every rule.
    pub fn validate(&self) -> Result<()> {
        self.login_ip.validate("login_ip")?;
        self.login_email.validate("login_email")?;
        self.register_ip.validate("register_ip")?;
        self.api_ip.validate("api_ip")
    }
}
