//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FolioError, FolioResult};

/// Configuration for the folio engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Remaining-folio count at or below which replenishment is triggered.
    #[serde(default = "default_low_water_threshold")]
    pub low_water_threshold: u64,

    /// Folios requested per replenishment.
    #[serde(default = "default_request_quantity")]
    pub request_quantity: u64,

    /// Largest range accepted by registration and requests.
    #[serde(default = "default_max_range_size")]
    pub max_range_size: u64,

    #[serde(default = "default_near_expiry_days")]
    pub near_expiry_days: i64,

    /// Validity of a new authorization, counted from its authorization date.
    #[serde(default = "default_validity_months")]
    pub validity_months: u32,

    #[serde(default = "default_request_lock_ttl")]
    pub request_lock_ttl_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Give up on a PENDING request this long after it was submitted.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,

    #[serde(default = "default_watcher_interval")]
    pub watcher_interval_secs: u64,

    #[serde(default)]
    pub authority: AuthorityConfig,

    /// PEM public keys trusted to sign authorization artifacts.
    #[serde(default)]
    pub trusted_keys: Vec<PathBuf>,
}

/// Connection settings for the numbering authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityConfig {
    #[serde(default = "default_authority_url")]
    pub url: String,

    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("folio.db")
}

fn default_low_water_threshold() -> u64 {
    100
}

fn default_request_quantity() -> u64 {
    1000
}

fn default_max_range_size() -> u64 {
    10_000
}

fn default_near_expiry_days() -> i64 {
    15
}

fn default_validity_months() -> u32 {
    6
}

fn default_request_lock_ttl() -> u64 {
    900
}

fn default_poll_interval() -> u64 {
    300
}

fn default_poll_timeout() -> u64 {
    24 * 60 * 60
}

fn default_watcher_interval() -> u64 {
    60 * 60
}

fn default_authority_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            low_water_threshold: default_low_water_threshold(),
            request_quantity: default_request_quantity(),
            max_range_size: default_max_range_size(),
            near_expiry_days: default_near_expiry_days(),
            validity_months: default_validity_months(),
            request_lock_ttl_secs: default_request_lock_ttl(),
            poll_interval_secs: default_poll_interval(),
            poll_timeout_secs: default_poll_timeout(),
            watcher_interval_secs: default_watcher_interval(),
            authority: AuthorityConfig::default(),
            trusted_keys: Vec::new(),
        }
    }
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            url: default_authority_url(),
            token: None,
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl EngineConfig {
    /// Load from a YAML file. Missing fields take their defaults.
    pub fn from_yaml_file(path: &Path) -> FolioResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| FolioError::Config {
            message: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> FolioResult<Self> {
        serde_yaml::from_str(text).map_err(|e| FolioError::Config {
            message: format!("invalid config: {e}"),
        })
    }

    /// Defaults overridden by environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply environment overrides on top of `self`.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `FOLIO_DATABASE` | `database_path` |
    /// | `FOLIO_LOW_WATER_THRESHOLD` | `low_water_threshold` |
    /// | `FOLIO_REQUEST_QUANTITY` | `request_quantity` |
    /// | `FOLIO_NEAR_EXPIRY_DAYS` | `near_expiry_days` |
    /// | `FOLIO_POLL_INTERVAL_SECS` | `poll_interval_secs` |
    /// | `FOLIO_AUTHORITY_URL` | `authority.url` |
    /// | `FOLIO_AUTHORITY_TOKEN` | `authority.token` |
    /// | `FOLIO_AUTHORITY_TIMEOUT` | `authority.timeout_secs` |
    /// | `FOLIO_AUTHORITY_MAX_RETRIES` | `authority.max_retries` |
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(path) = std::env::var("FOLIO_DATABASE") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(v) = env_parse("FOLIO_LOW_WATER_THRESHOLD") {
            self.low_water_threshold = v;
        }
        if let Some(v) = env_parse("FOLIO_REQUEST_QUANTITY") {
            self.request_quantity = v;
        }
        if let Some(v) = env_parse("FOLIO_NEAR_EXPIRY_DAYS") {
            self.near_expiry_days = v;
        }
        if let Some(v) = env_parse("FOLIO_POLL_INTERVAL_SECS") {
            self.poll_interval_secs = v;
        }
        if let Ok(url) = std::env::var("FOLIO_AUTHORITY_URL") {
            self.authority.url = url;
        }
        if let Ok(token) = std::env::var("FOLIO_AUTHORITY_TOKEN") {
            self.authority.token = Some(token);
        }
        if let Some(v) = env_parse("FOLIO_AUTHORITY_TIMEOUT") {
            self.authority.timeout_secs = v;
        }
        if let Some(v) = env_parse("FOLIO_AUTHORITY_MAX_RETRIES") {
            self.authority.max_retries = v;
        }
        self
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    pub fn with_low_water_threshold(mut self, threshold: u64) -> Self {
        self.low_water_threshold = threshold;
        self
    }

    pub fn with_request_quantity(mut self, quantity: u64) -> Self {
        self.request_quantity = quantity;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_secs = interval.as_secs();
        self
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> FolioResult<()> {
        let err = |message: String| Err(FolioError::Config { message });

        if self.request_quantity == 0 {
            return err("request_quantity must be at least 1".into());
        }
        if self.max_range_size == 0 {
            return err("max_range_size must be at least 1".into());
        }
        if self.request_quantity > self.max_range_size {
            return err(format!(
                "request_quantity {} exceeds max_range_size {}",
                self.request_quantity, self.max_range_size
            ));
        }
        if self.near_expiry_days < 0 {
            return err("near_expiry_days must not be negative".into());
        }
        if self.validity_months == 0 {
            return err("validity_months must be at least 1".into());
        }
        if self.poll_interval_secs == 0 || self.watcher_interval_secs == 0 {
            return err("poll and watcher intervals must be positive".into());
        }
        // The poller renews its lease once per tick.
        if self.poll_interval_secs >= self.request_lock_ttl_secs {
            return err(format!(
                "poll_interval_secs {} must be shorter than request_lock_ttl_secs {}",
                self.poll_interval_secs, self.request_lock_ttl_secs
            ));
        }
        if self.poll_timeout_secs < self.poll_interval_secs {
            return err("poll_timeout_secs must be at least one poll interval".into());
        }
        Ok(())
    }

    pub fn request_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.request_lock_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn watcher_interval(&self) -> Duration {
        Duration::from_secs(self.watcher_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.low_water_threshold, 100);
        assert_eq!(config.request_quantity, 1000);
        assert_eq!(config.max_range_size, 10_000);
        assert_eq!(config.near_expiry_days, 15);
        assert_eq!(config.validity_months, 6);
        config.validate().unwrap();
    }

    #[test]
    fn test_yaml_partial_uses_defaults() {
        let config = EngineConfig::from_yaml_str(
            r#"
database_path: /var/lib/folio/folio.db
low_water_threshold: 50
authority:
  url: https://authority.example
"#,
        )
        .unwrap();
        assert_eq!(config.database_path, PathBuf::from("/var/lib/folio/folio.db"));
        assert_eq!(config.low_water_threshold, 50);
        assert_eq!(config.request_quantity, 1000);
        assert_eq!(config.authority.url, "https://authority.example");
        assert_eq!(config.authority.max_retries, 3);
    }

    #[test]
    fn test_yaml_type_error_is_config_error() {
        let result = EngineConfig::from_yaml_str("low_water_threshold: lots");
        assert!(matches!(result, Err(FolioError::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_quantity_above_max() {
        let config = EngineConfig {
            request_quantity: 20_000,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(FolioError::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_poll_interval_not_below_lock_ttl() {
        let config = EngineConfig {
            poll_interval_secs: 900,
            request_lock_ttl_secs: 900,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("FOLIO_DATABASE", "/tmp/env.db");
        std::env::set_var("FOLIO_LOW_WATER_THRESHOLD", "7");
        std::env::set_var("FOLIO_AUTHORITY_TOKEN", "secret");
        std::env::set_var("FOLIO_AUTHORITY_MAX_RETRIES", "not-a-number");

        let config = EngineConfig::from_env();

        std::env::remove_var("FOLIO_DATABASE");
        std::env::remove_var("FOLIO_LOW_WATER_THRESHOLD");
        std::env::remove_var("FOLIO_AUTHORITY_TOKEN");
        std::env::remove_var("FOLIO_AUTHORITY_MAX_RETRIES");

        assert_eq!(config.database_path, PathBuf::from("/tmp/env.db"));
        assert_eq!(config.low_water_threshold, 7);
        assert_eq!(config.authority.token.as_deref(), Some("secret"));
        // Unparseable values keep the default.
        assert_eq!(config.authority.max_retries, 3);
    }
}
