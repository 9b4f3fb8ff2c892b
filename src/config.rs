//! Configuration: session setting names and pool sizing.
//!
//! Loaded from TOML, then overridden from `TENANCY__`-prefixed environment
//! variables (`TENANCY__POOL__SIZE=16` sets `pool.size`), then validated.
//!
//! ```toml
//! [session]
//! tenant_var = "app.tenant_id"
//! role_var = "app.role"
//!
//! [pool]
//! size = 8
//! acquire_timeout_ms = 5000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::is_identifier;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "TENANCY__";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// The TOML could not be parsed
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// An override or value is invalid
    #[error("invalid value for '{key}': {reason}")]
    Invalid {
        /// Dotted config key
        key: String,
        /// Why the value was rejected
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Names of the connection settings row policies read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionVars {
    /// Setting holding the bound tenant id
    pub tenant_var: String,
    /// Setting holding the bound role
    pub role_var: String,
}

impl Default for SessionVars {
    fn default() -> Self {
        Self {
            tenant_var: "app.tenant_id".to_string(),
            role_var: "app.role".to_string(),
        }
    }
}

impl SessionVars {
    /// Checks both names are `namespace.name` identifiers and distinct.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_setting_name("session.tenant_var", &self.tenant_var)?;
        validate_setting_name("session.role_var", &self.role_var)?;
        if self.tenant_var == self.role_var {
            return Err(ConfigError::invalid(
                "session.role_var",
                "must differ from session.tenant_var",
            ));
        }
        Ok(())
    }
}

/// Connection pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of physical connections
    pub size: usize,
    /// How long `acquire` waits for a free connection
    pub acquire_timeout_ms: u64,
}

impl PoolConfig {
    /// Returns the acquire timeout as a `Duration`.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 8,
            acquire_timeout_ms: 5_000,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenancyConfig {
    /// Session setting names
    pub session: SessionVars,
    /// Pool sizing
    pub pool: PoolConfig,
}

impl TenancyConfig {
    /// Parses configuration from a TOML string and validates it.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the TOML is malformed or a value is invalid.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: TenancyConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file, applies environment overrides
    /// and validates the result.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, or the
    /// final configuration is invalid.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: TenancyConfig = toml::from_str(&content)?;
        config.apply_env_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `TENANCY__SECTION__KEY=value` overrides.
    ///
    /// Unknown keys are ignored so unrelated variables sharing the prefix do
    /// not break startup.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if a recognized key has an unparsable
    /// value.
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(stripped) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let normalized = stripped.to_lowercase().replace("__", ".");
            match normalized.as_str() {
                "session.tenant_var" => self.session.tenant_var = value,
                "session.role_var" => self.session.role_var = value,
                "pool.size" => {
                    self.pool.size = value
                        .parse()
                        .map_err(|_| ConfigError::invalid("pool.size", "not an integer"))?;
                }
                "pool.acquire_timeout_ms" => {
                    self.pool.acquire_timeout_ms = value.parse().map_err(|_| {
                        ConfigError::invalid("pool.acquire_timeout_ms", "not an integer")
                    })?;
                }
                other => tracing::debug!(key = other, "ignoring unknown config override"),
            }
        }
        Ok(())
    }

    /// Validates configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session.validate()?;
        if self.pool.size == 0 {
            return Err(ConfigError::invalid("pool.size", "must be at least 1"));
        }
        if self.pool.acquire_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "pool.acquire_timeout_ms",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

// Custom settings must be `namespace.name`; these names are also rendered into
// policy DDL, so only identifier characters are accepted.
fn validate_setting_name(key: &str, name: &str) -> Result<(), ConfigError> {
    match name.split_once('.') {
        Some((ns, rest)) if is_identifier(ns) && is_identifier(rest) => Ok(()),
        _ => Err(ConfigError::invalid(
            key,
            format!("'{name}' is not a namespace.name identifier"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TenancyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.session.tenant_var, "app.tenant_id");
        assert_eq!(config.pool.acquire_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn parses_partial_toml() {
        let config = TenancyConfig::from_toml_str(
            r#"
            [pool]
            size = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.pool.size, 2);
        assert_eq!(config.session, SessionVars::default());
    }

    #[test]
    fn rejects_injected_setting_names() {
        let err = TenancyConfig::from_toml_str(
            r#"
            [session]
            tenant_var = "app.tenant'); DROP TABLE x; --"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn rejects_unqualified_setting_names() {
        let mut config = TenancyConfig::default();
        config.session.role_var = "role".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn session_vars_validate_on_their_own() {
        assert!(SessionVars::default().validate().is_ok());
        let quoted = SessionVars {
            tenant_var: "app.tenant_id', true) OR true --".to_string(),
            ..SessionVars::default()
        };
        assert!(matches!(quoted.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn rejects_identical_setting_names() {
        let mut config = TenancyConfig::default();
        config.session.role_var = config.session.tenant_var.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_pool() {
        let err = TenancyConfig::from_toml_str("[pool]\nsize = 0\n").unwrap_err();
        assert!(err.to_string().contains("pool.size"));
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = TenancyConfig::default();
        config
            .apply_env_overrides(vec![
                ("TENANCY__POOL__SIZE".to_string(), "16".to_string()),
                ("TENANCY__SESSION__TENANT_VAR".to_string(), "ils.tenant".to_string()),
                ("TENANCY__UNKNOWN".to_string(), "x".to_string()),
                ("PATH".to_string(), "/bin".to_string()),
            ])
            .unwrap();
        assert_eq!(config.pool.size, 16);
        assert_eq!(config.session.tenant_var, "ils.tenant");
    }

    #[test]
    fn env_override_with_bad_integer_fails() {
        let mut config = TenancyConfig::default();
        let err = config
            .apply_env_overrides(vec![(
                "TENANCY__POOL__ACQUIRE_TIMEOUT_MS".to_string(),
                "soon".to_string(),
            )])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
