//! Configuration system using Figment
//!
//! Settings are layered, lowest precedence first:
//! 1. Built-in defaults
//! 2. `labwire.toml` (or an explicit file passed to [`LabSettings::load_from`])
//! 3. Environment variables prefixed with `LABWIRE_`, nested with `__`
//! 4. `BROKER_URI`, which selects the remote broker for roots configured in remote mode
//!
//! ```text
//! LABWIRE_BROKER__PORT=9000
//! LABWIRE_BROKER__OFFLINE=true
//! LABWIRE_TIMING__QUERY_DELAY_MS=50
//! BROKER_URI=http://10.7.0.2:8765
//! ```

use crate::broker::BrokerOptions;
use crate::error::{AppResult, LabError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable naming the remote broker.
pub const BROKER_URI_ENV: &str = "BROKER_URI";

/// Default configuration file looked up by [`LabSettings::load`].
pub const DEFAULT_CONFIG_FILE: &str = "labwire.toml";

/// Top-level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabSettings {
    /// Broker server and client settings
    #[serde(default)]
    pub broker: BrokerSettings,
    /// Instrument protocol timing
    #[serde(default)]
    pub timing: TimingSettings,
}

/// Broker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Interface the broker server binds to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// Port the broker server listens on
    #[serde(default = "default_port")]
    pub port: u16,
    /// URI of a remote broker (`http://host:port`)
    #[serde(default)]
    pub uri: Option<String>,
    /// Substitute simulated backends for every descriptor
    #[serde(default)]
    pub offline: bool,
    /// Replace backends whose native transport is missing with simulated ones
    #[serde(default)]
    pub dummy_fallback: bool,
}

/// Timing used by command/response instrument protocols
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingSettings {
    /// Delay between writing a query and reading its reply on a shared bus
    #[serde(default = "default_query_delay_ms")]
    pub query_delay_ms: u64,
    /// Settling time between repeated measurements
    #[serde(default = "default_settling_ms")]
    pub settling_ms: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            port: default_port(),
            uri: None,
            offline: false,
            dummy_fallback: false,
        }
    }
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            query_delay_ms: default_query_delay_ms(),
            settling_ms: default_settling_ms(),
        }
    }
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_query_delay_ms() -> u64 {
    100
}

fn default_settling_ms() -> u64 {
    100
}

impl LabSettings {
    /// Load from `labwire.toml` (if present) and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from a specific TOML file and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let figment = Figment::from(Serialized::defaults(LabSettings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LABWIRE_").split("__"));
        Self::extract(figment)
    }

    /// Defaults plus environment only.
    pub fn from_env() -> AppResult<Self> {
        let figment = Figment::from(Serialized::defaults(LabSettings::default()))
            .merge(Env::prefixed("LABWIRE_").split("__"));
        Self::extract(figment)
    }

    fn extract(figment: Figment) -> AppResult<Self> {
        let mut settings: LabSettings = figment.extract()?;
        if let Some(uri) = broker_uri_from_env() {
            settings.broker.uri = Some(uri);
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Validate semantic constraints after loading.
    pub fn validate(&self) -> AppResult<()> {
        if self.broker.bind_host.trim().is_empty() {
            return Err(LabError::Config("broker.bind_host cannot be empty".into()));
        }
        if let Some(uri) = &self.broker.uri {
            validate_broker_uri(uri)?;
        }
        Ok(())
    }
}

impl BrokerSettings {
    /// `host:port` the server binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }

    /// Backend construction policy for a broker built from these settings.
    pub fn broker_options(&self) -> BrokerOptions {
        BrokerOptions {
            offline: self.offline,
            dummy_fallback: self.dummy_fallback,
        }
    }
}

impl TimingSettings {
    /// Query delay as a `Duration`.
    pub fn query_delay(&self) -> Duration {
        Duration::from_millis(self.query_delay_ms)
    }

    /// Settling time as a `Duration`.
    pub fn settling(&self) -> Duration {
        Duration::from_millis(self.settling_ms)
    }
}

/// Non-empty value of `BROKER_URI`, if set.
pub fn broker_uri_from_env() -> Option<String> {
    std::env::var(BROKER_URI_ENV)
        .ok()
        .map(|uri| uri.trim().to_string())
        .filter(|uri| !uri.is_empty())
}

/// Broker URIs must be plain `http://` or `https://` base URLs.
pub fn validate_broker_uri(uri: &str) -> AppResult<()> {
    let rest = uri
        .strip_prefix("http://")
        .or_else(|| uri.strip_prefix("https://"))
        .ok_or_else(|| {
            LabError::Config(format!(
                "Invalid broker URI '{uri}'. Must start with http:// or https://"
            ))
        })?;
    if rest.trim_end_matches('/').is_empty() {
        return Err(LabError::Config(format!("Broker URI '{uri}' has no host")));
    }
    Ok(())
}
