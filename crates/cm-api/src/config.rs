use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use cm_fleet::{RetryPolicy, Settings};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub control_plane_api_key: String,
    pub fleet_config_path: PathBuf,
    pub registry_api_url: String,
    pub registry_api_token: Option<String>,
    pub reconcile_interval_secs: u64,
    pub retry_tick_millis: u64,
    pub retry_max_attempts: u32,
    pub lookup_timeout_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name: &'static str| var(name).ok_or(ConfigError::Missing(name));

        Ok(Self {
            listen_addr: parse_or(&var, "LISTEN_ADDR", "0.0.0.0:8080".parse().ok())?,
            control_plane_api_key: required("CONTROL_PLANE_API_KEY")?,
            fleet_config_path: var("FLEET_CONFIG_PATH")
                .unwrap_or_else(|| "fleet.json".into())
                .into(),
            registry_api_url: required("REGISTRY_API_URL")?,
            registry_api_token: var("REGISTRY_API_TOKEN").filter(|t| !t.is_empty()),
            reconcile_interval_secs: parse_or(&var, "RECONCILE_INTERVAL_SECS", Some(10))?,
            retry_tick_millis: parse_or(&var, "RETRY_TICK_MILLIS", Some(1000))?,
            retry_max_attempts: parse_or(&var, "RETRY_MAX_ATTEMPTS", Some(60))?,
            lookup_timeout_secs: parse_or(&var, "LOOKUP_TIMEOUT_SECS", Some(10))?,
        })
    }

    pub fn settings(&self) -> Settings {
        Settings {
            reconcile_interval: Duration::from_secs(self.reconcile_interval_secs),
            lookup_timeout: Duration::from_secs(self.lookup_timeout_secs),
            ..Settings::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            tick: Duration::from_millis(self.retry_tick_millis),
            max_attempts: self.retry_max_attempts,
        }
    }
}

fn parse_or<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: Option<T>,
) -> Result<T, ConfigError> {
    match var(name) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => default.ok_or(ConfigError::Missing(name)),
    }
}
