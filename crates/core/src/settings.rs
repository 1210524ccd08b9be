//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::errors::{ConfigError, ConfigResult};
use crate::types::{BrokerConnectionConfig, OracleId, SignatureType};

/// Environment variable prefix, e.g. `PUBLISHER_AGENT__ORACLE_ID`
pub const ENV_PREFIX: &str = "PUBLISHER_AGENT";

pub const DEFAULT_REGISTRY_BASE_URL: &str = "https://rest.jp.stork-oracle.network";

/// Complete agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub signature_types: Vec<SignatureType>,
    pub oracle_id: OracleId,
    /// Heartbeat re-sign period, 0 disables the clock trigger
    pub clock_period_ms: u64,
    pub delta_check_period_ms: u64,
    /// 1.0 means 1%
    pub change_threshold_percent: f64,
    pub sign_every_update: bool,

    pub auth_token: String,
    pub registry_base_url: String,
    pub registry_refresh_interval_ms: u64,
    pub broker_reconnect_delay_ms: u64,
    pub broker_write_timeout_ms: u64,
    pub seeded_brokers: Vec<BrokerConnectionConfig>,

    /// 0 disables the push-based ingest server
    pub incoming_ws_port: u16,
    pub incoming_ws_path: String,
    pub pull_based_ws_url: Option<String>,
    pub pull_based_auth: Option<String>,
    pub pull_based_subscription_request: Option<String>,
    pub pull_based_reconnect_delay_ms: u64,
    pub pull_based_read_timeout_ms: u64,

    pub channel_capacity: usize,
    /// Period of the counters log line, 0 disables it
    pub metrics_report_interval_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            signature_types: vec![],
            oracle_id: OracleId::default(),
            clock_period_ms: 500,
            delta_check_period_ms: 10,
            change_threshold_percent: 0.1,
            sign_every_update: false,
            auth_token: String::new(),
            registry_base_url: DEFAULT_REGISTRY_BASE_URL.to_string(),
            registry_refresh_interval_ms: 10 * 60 * 1000,
            broker_reconnect_delay_ms: 5_000,
            broker_write_timeout_ms: 10_000,
            seeded_brokers: vec![],
            incoming_ws_port: 0,
            incoming_ws_path: "/publish".to_string(),
            pull_based_ws_url: None,
            pull_based_auth: None,
            pull_based_subscription_request: None,
            pull_based_reconnect_delay_ms: 5_000,
            pull_based_read_timeout_ms: 10_000,
            channel_capacity: 4096,
            metrics_report_interval_ms: 10_000,
        }
    }
}

impl AgentConfig {
    /// Load from an optional config file, then `PUBLISHER_AGENT__*` env vars.
    /// A `.env` file in the working directory is read first if present.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            debug!("Loading config file {}", path.display());
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("signature_types")
                .try_parsing(true),
        );

        let config: AgentConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from config text in the given format, without env overrides
    pub fn from_text(contents: &str, format: config::FileFormat) -> ConfigResult<Self> {
        let config: AgentConfig = config::Config::builder()
            .add_source(config::File::from_str(contents, format))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.signature_types.is_empty() {
            return Err(ConfigError::NoSignatureTypes);
        }
        if self.oracle_id.as_str().chars().count() != 5 {
            return Err(ConfigError::InvalidOracleId(self.oracle_id.to_string()));
        }
        if self.delta_check_period_ms == 0 {
            return Err(ConfigError::NotPositive("delta check period"));
        }
        if self.registry_refresh_interval_ms == 0 {
            return Err(ConfigError::NotPositive("registry refresh interval"));
        }
        if self.broker_reconnect_delay_ms == 0 {
            return Err(ConfigError::NotPositive("broker reconnect delay"));
        }
        if self.change_threshold_percent.is_nan() || self.change_threshold_percent <= 0.0 {
            return Err(ConfigError::NotPositive("change threshold percent"));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::NotPositive("channel capacity"));
        }
        let has_pull_source = self
            .pull_based_ws_url
            .as_deref()
            .map_or(false, |url| !url.is_empty());
        if self.incoming_ws_port == 0 && !has_pull_source {
            return Err(ConfigError::NoIngestSource);
        }
        Ok(())
    }

    pub fn clock_period(&self) -> Duration {
        Duration::from_millis(self.clock_period_ms)
    }

    pub fn delta_check_period(&self) -> Duration {
        Duration::from_millis(self.delta_check_period_ms)
    }

    pub fn registry_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.registry_refresh_interval_ms)
    }

    pub fn broker_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.broker_reconnect_delay_ms)
    }

    pub fn broker_write_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_write_timeout_ms)
    }

    pub fn pull_based_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.pull_based_reconnect_delay_ms)
    }

    pub fn pull_based_read_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_based_read_timeout_ms)
    }

    pub fn metrics_report_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_report_interval_ms)
    }
}
