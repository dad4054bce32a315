// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent configuration.
//!
//! [`Config::new`] fills every optional setting with its default; [`Config::from_env`] reads
//! the `BEACON_*` environment variables on top of that.
//!
//! Sending strategies use a small string grammar: `interval,<ms>`, `immediate` and
//! `leftovers`, separated by `;`. Parsing never fails. Anything it cannot understand falls
//! back to the default `interval,60000;immediate`.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tracing::debug;

use crate::constants::{DEFAULT_REQUEST_TIMEOUT, DEFAULT_SEND_INTERVAL};
use crate::errors::ConfigError;
use crate::state_machine::RetryPolicy;

const ENV_ENDPOINT: &str = "BEACON_ENDPOINT";
const ENV_APPLICATION_ID: &str = "BEACON_APPLICATION_ID";
const ENV_APPLICATION_NAME: &str = "BEACON_APPLICATION_NAME";
const ENV_APPLICATION_VERSION: &str = "BEACON_APPLICATION_VERSION";
const ENV_DEVICE_ID: &str = "BEACON_DEVICE_ID";
const ENV_OPERATING_SYSTEM: &str = "BEACON_OPERATING_SYSTEM";
const ENV_MANUFACTURER: &str = "BEACON_MANUFACTURER";
const ENV_MODEL_ID: &str = "BEACON_MODEL_ID";
const ENV_DATA_COLLECTION_LEVEL: &str = "BEACON_DATA_COLLECTION_LEVEL";
const ENV_CRASH_REPORTING_LEVEL: &str = "BEACON_CRASH_REPORTING_LEVEL";
const ENV_SENDING_STRATEGIES: &str = "BEACON_SENDING_STRATEGIES";
const ENV_REQUEST_TIMEOUT_MS: &str = "BEACON_REQUEST_TIMEOUT_MS";
const ENV_PROXY_HTTPS: &str = "BEACON_PROXY_HTTPS";

const DEFAULT_DEVICE_ID: i64 = 1;
const DEFAULT_MANUFACTURER: &str = "unknown";

/// How much user-level data may be captured.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DataCollectionLevel {
    Off,
    Performance,
    #[default]
    UserBehavior,
}

impl DataCollectionLevel {
    /// Value sent as `dl` in the beacon prefix.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            DataCollectionLevel::Off => 0,
            DataCollectionLevel::Performance => 1,
            DataCollectionLevel::UserBehavior => 2,
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" => Some(DataCollectionLevel::Off),
            "performance" => Some(DataCollectionLevel::Performance),
            "user_behavior" => Some(DataCollectionLevel::UserBehavior),
            _ => None,
        }
    }
}

/// Whether crashes may be reported.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CrashReportingLevel {
    Off,
    OptOutCrashes,
    #[default]
    OptInCrashes,
}

impl CrashReportingLevel {
    /// Value sent as `cl` in the beacon prefix.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            CrashReportingLevel::Off => 0,
            CrashReportingLevel::OptOutCrashes => 1,
            CrashReportingLevel::OptInCrashes => 2,
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" => Some(CrashReportingLevel::Off),
            "opt_out" => Some(CrashReportingLevel::OptOutCrashes),
            "opt_in" => Some(CrashReportingLevel::OptInCrashes),
            _ => None,
        }
    }
}

/// One configured sending strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyConfig {
    /// Flush on a fixed period.
    Interval(Duration),
    /// Flush as soon as a critical event is queued.
    Immediate,
    /// Only flush what is left at shutdown.
    FlushLeftovers,
}

/// Ordered list of active sending strategies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendingStrategies(pub Vec<StrategyConfig>);

impl Default for SendingStrategies {
    fn default() -> Self {
        SendingStrategies(vec![
            StrategyConfig::Interval(DEFAULT_SEND_INTERVAL),
            StrategyConfig::Immediate,
        ])
    }
}

impl SendingStrategies {
    /// Parses the strategy grammar. Never fails.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let mut strategies = Vec::new();
        for item in value.split(';').map(str::trim).filter(|item| !item.is_empty()) {
            let mut parts = item.split(',').map(str::trim);
            let name = parts.next();
            let interval: Option<u64> = parts.next().and_then(|v| v.parse().ok());

            let strategy = match (name, interval) {
                (Some("interval"), Some(ms)) if ms > 0 => {
                    StrategyConfig::Interval(Duration::from_millis(ms))
                }
                (Some("immediate"), None) => StrategyConfig::Immediate,
                (Some("leftovers"), None) => StrategyConfig::FlushLeftovers,
                _ => {
                    debug!("Invalid sending strategy: {value}, using default");
                    return SendingStrategies::default();
                }
            };
            strategies.push(strategy);
        }

        if strategies.is_empty() {
            debug!("No sending strategy configured, using default");
            return SendingStrategies::default();
        }
        SendingStrategies(strategies)
    }
}

impl<'de> Deserialize<'de> for SendingStrategies {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(SendingStrategies::parse(&value))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Collector URL, without query string.
    pub endpoint: String,
    pub application_id: String,
    pub application_name: Option<String>,
    pub application_version: Option<String>,
    pub device_id: i64,
    pub operating_system: String,
    pub manufacturer: String,
    pub model_id: Option<String>,
    pub data_collection_level: DataCollectionLevel,
    pub crash_reporting_level: CrashReportingLevel,
    pub sending_strategies: SendingStrategies,
    pub request_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub proxy_https: Option<String>,
}

impl Config {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, application_id: impl Into<String>, device_id: i64) -> Self {
        Config {
            endpoint: endpoint.into(),
            application_id: application_id.into(),
            application_name: None,
            application_version: None,
            device_id,
            operating_system: env::consts::OS.to_string(),
            manufacturer: DEFAULT_MANUFACTURER.to_string(),
            model_id: None,
            data_collection_level: DataCollectionLevel::default(),
            crash_reporting_level: CrashReportingLevel::default(),
            sending_strategies: SendingStrategies::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry_policy: RetryPolicy::default(),
            proxy_https: None,
        }
    }

    pub fn from_env() -> Result<Config, ConfigError> {
        let endpoint = required(ENV_ENDPOINT)?;
        let application_id = required(ENV_APPLICATION_ID)?;

        let device_id = match optional(ENV_DEVICE_ID) {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                name: ENV_DEVICE_ID,
                value,
            })?,
            None => DEFAULT_DEVICE_ID,
        };

        let mut config = Config::new(endpoint, application_id, device_id);
        config.application_name = optional(ENV_APPLICATION_NAME);
        config.application_version = optional(ENV_APPLICATION_VERSION);
        config.model_id = optional(ENV_MODEL_ID);
        if let Some(os) = optional(ENV_OPERATING_SYSTEM) {
            config.operating_system = os;
        }
        if let Some(manufacturer) = optional(ENV_MANUFACTURER) {
            config.manufacturer = manufacturer;
        }

        if let Some(value) = optional(ENV_DATA_COLLECTION_LEVEL) {
            config.data_collection_level =
                DataCollectionLevel::parse(&value).ok_or(ConfigError::Invalid {
                    name: ENV_DATA_COLLECTION_LEVEL,
                    value,
                })?;
        }
        if let Some(value) = optional(ENV_CRASH_REPORTING_LEVEL) {
            config.crash_reporting_level =
                CrashReportingLevel::parse(&value).ok_or(ConfigError::Invalid {
                    name: ENV_CRASH_REPORTING_LEVEL,
                    value,
                })?;
        }
        if let Some(value) = optional(ENV_SENDING_STRATEGIES) {
            config.sending_strategies = SendingStrategies::parse(&value);
        }
        if let Some(value) = optional(ENV_REQUEST_TIMEOUT_MS) {
            let ms: u64 = value.parse().map_err(|_| ConfigError::Invalid {
                name: ENV_REQUEST_TIMEOUT_MS,
                value,
            })?;
            config.request_timeout = Duration::from_millis(ms);
        }
        config.proxy_https = optional(ENV_PROXY_HTTPS).or_else(|| optional("HTTPS_PROXY"));

        Ok(config)
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::Missing(name))
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}
