use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::machine::DEFAULT_ADMIN_USERNAME;

/// Top-level deployment configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    pub driver: DriverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite connection string, e.g. "sqlite:vdm.db".
    pub url: String,
}

/// Pool-sizing and boot-wait policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Machines created per growth pass when the pool is empty.
    pub pool_burst: u32,
    /// Allocation passes before giving up (each empty-pool pass grows the
    /// pool by `pool_burst` and retries).
    pub max_attempts: u32,
    /// Total wall-clock budget for one machine to reach `Up`.
    pub boot_timeout_secs: u64,
    /// Status poll cadence during the boot wait.
    pub poll_interval_ms: u64,
    /// Prefix for generated machine names.
    pub machine_name_prefix: String,
    /// Administrator account requested on created machines.
    pub admin_username: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            pool_burst: 3,
            max_attempts: 5,
            boot_timeout_secs: 600,
            poll_interval_ms: 500,
            machine_name_prefix: "desktop".to_string(),
            admin_username: DEFAULT_ADMIN_USERNAME.to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Backend selection. Exactly one driver is active per deployment; it is
/// instantiated from this at startup and never replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DriverConfig {
    /// Public-cloud compute API.
    Compute(ComputeConfig),
    /// Private-cloud API.
    Stack(StackConfig),
    /// Statically pre-registered machines, no backend.
    Registry,
    /// In-process scripted fleet. Tests only.
    Mock,
}

impl DriverConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            DriverConfig::Compute(_) => "compute",
            DriverConfig::Stack(_) => "stack",
            DriverConfig::Registry => "registry",
            DriverConfig::Mock => "mock",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeConfig {
    /// Control-plane base URL.
    pub endpoint: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    /// Default machine image id.
    pub image: String,
    /// Default instance class.
    pub flavor: String,
    /// Registered SSH keypair name.
    #[serde(default = "default_key_name")]
    pub key_name: String,
    /// Where key material is persisted when the keypair is first created.
    pub key_path: String,
}

fn default_key_name() -> String {
    "vdm-key".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    /// API host, e.g. "stack.internal.example".
    pub endpoint: String,
    pub tenant: String,
    pub username: String,
    pub password: String,
    /// Base image reference used for every created machine.
    pub image: String,
}

impl Config {
    /// Load and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Config = toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.url.is_empty() {
            return Err(ConfigError::Invalid("store.url must not be empty"));
        }
        if self.broker.pool_burst == 0 {
            return Err(ConfigError::Invalid("broker.pool_burst must be at least 1"));
        }
        if self.broker.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "broker.max_attempts must be at least 1",
            ));
        }
        if self.broker.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "broker.poll_interval_ms must be at least 1",
            ));
        }
        match &self.driver {
            DriverConfig::Compute(c) => {
                if c.endpoint.is_empty() || c.access_key.is_empty() || c.secret_key.is_empty() {
                    return Err(ConfigError::Invalid(
                        "compute driver requires endpoint, access_key, and secret_key",
                    ));
                }
                if c.image.is_empty() || c.flavor.is_empty() {
                    return Err(ConfigError::Invalid(
                        "compute driver requires a default image and flavor",
                    ));
                }
            }
            DriverConfig::Stack(c) => {
                if c.endpoint.is_empty() || c.tenant.is_empty() || c.username.is_empty() {
                    return Err(ConfigError::Invalid(
                        "stack driver requires endpoint, tenant, and username",
                    ));
                }
                if c.image.is_empty() {
                    return Err(ConfigError::Invalid(
                        "stack driver requires a base image reference",
                    ));
                }
            }
            DriverConfig::Registry | DriverConfig::Mock => {}
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [store]
        url = "sqlite::memory:"

        [broker]
        pool_burst = 2
        boot_timeout_secs = 120

        [driver]
        kind = "stack"
        endpoint = "stack.internal.example"
        tenant = "desktops"
        username = "svc-vdm"
        password = "hunter2"
        image = "win2019-desktop"
    "#;

    #[test]
    fn test_parse_stack_config() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.broker.pool_burst, 2);
        // Unset broker fields keep their defaults
        assert_eq!(config.broker.poll_interval_ms, 500);
        assert_eq!(config.driver.kind(), "stack");
    }

    #[test]
    fn test_parse_compute_config() {
        let raw = r#"
            [store]
            url = "sqlite:vdm.db"

            [driver]
            kind = "compute"
            endpoint = "https://compute.example.com"
            region = "eu-west-1"
            access_key = "AK"
            secret_key = "SK"
            image = "img-3acf2f55"
            flavor = "std.large"
            key_path = "/var/lib/vdm/vdm-key.pem"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        config.validate().unwrap();
        match config.driver {
            DriverConfig::Compute(c) => {
                assert_eq!(c.key_name, "vdm-key");
                assert_eq!(c.region, "eu-west-1");
            }
            other => panic!("expected compute driver, got {}", other.kind()),
        }
    }

    #[test]
    fn test_registry_needs_no_options() {
        let raw = r#"
            [store]
            url = "sqlite:vdm.db"

            [driver]
            kind = "registry"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.driver.kind(), "registry");
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let raw = r#"
            [store]
            url = "sqlite:vdm.db"

            [driver]
            kind = "bare-metal"
        "#;
        assert!(toml::from_str::<Config>(raw).is_err());
    }

    #[test]
    fn test_zero_burst_rejected() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.broker.pool_burst = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(SAMPLE.as_bytes()).unwrap();
        let config = Config::load(f.path()).unwrap();
        assert_eq!(config.store.url, "sqlite::memory:");
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/vdm.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
