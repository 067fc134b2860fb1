// SPDX-FileCopyrightText: © 2025 Greenhouse Broker Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Layered configuration for `greenhouse-broker` (`SPEC_FULL.md` §6.3).
//!
//! Loaded, in increasing precedence, from: built-in defaults, an optional
//! `broker.toml` file, then `BROKER_`-prefixed environment variables.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

const fn default_heartbeat_period_secs() -> u64 {
    30
}

fn default_listen_addr() -> String {
    "0.0.0.0:23048".to_string()
}

/// Log level for filtering messages.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Log file format options.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration for console and file output (`SPEC_FULL.md` §9).
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct LogConfig {
    #[serde(default = "default_true")]
    pub console_enable: bool,
    #[serde(default)]
    pub file_enable: bool,
    #[serde(default)]
    pub console_level: LogLevel,
    #[serde(default)]
    pub file_level: LogLevel,
    #[serde(default = "default_log_file_path")]
    pub file_path: String,
    #[serde(default)]
    pub file_format: LogFormat,
}

const fn default_true() -> bool {
    true
}

fn default_log_file_path() -> String {
    "./greenhouse-broker.log".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enable: true,
            file_enable: false,
            console_level: LogLevel::default(),
            file_level: LogLevel::Info,
            file_path: default_log_file_path(),
            file_format: LogFormat::default(),
        }
    }
}

/// Root configuration for the broker process (`SPEC_FULL.md` §6.3).
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct BrokerConfig {
    /// `host:port` to listen on. The port must be `0` (OS-assigned) or fall
    /// within the IANA user-port range `1024..=49151` (§4.6).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Idle-read deadline used by the heartbeat mechanism is `2 ×` this
    /// value (§4.7).
    #[serde(default = "default_heartbeat_period_secs")]
    pub heartbeat_period_secs: u64,

    #[serde(default)]
    pub log: LogConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            heartbeat_period_secs: default_heartbeat_period_secs(),
            log: LogConfig::default(),
        }
    }
}

/// The result of loading configuration: the resolved config plus whether
/// the file at `config_path` was present.
#[derive(Debug)]
pub struct ConfigLoadResult {
    pub config: BrokerConfig,
    pub file_missing: Option<String>,
}

/// Loads configuration from defaults, an optional TOML file, then
/// `BROKER_`-prefixed environment variables (§6.3).
///
/// # Errors
///
/// Returns an error if the file contains invalid TOML, an environment
/// variable holds a value that doesn't deserialize into its field, or the
/// merged configuration is otherwise malformed.
pub fn load(config_path: &str) -> Result<ConfigLoadResult, Box<figment::Error>> {
    let mut figment =
        Figment::new().merge(figment::providers::Serialized::defaults(BrokerConfig::default()));

    let mut file_missing = None;
    if std::path::Path::new(config_path).exists() {
        figment = figment.merge(Toml::file(config_path));
    } else {
        file_missing = Some(config_path.to_string());
    }

    let config: BrokerConfig =
        figment.merge(Env::prefixed("BROKER_").split("__")).extract().map_err(Box::new)?;

    Ok(ConfigLoadResult { config, file_missing })
}

/// Renders the default configuration as pretty-printed TOML, for `config default`.
///
/// # Errors
///
/// Returns an error if the default configuration cannot be serialized; this
/// would indicate a programming error in this module.
pub fn generate_default() -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(&BrokerConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = BrokerConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:23048");
        assert_eq!(config.heartbeat_period_secs, 30);
    }

    #[test]
    fn generate_default_round_trips_through_toml() {
        let rendered = generate_default().unwrap();
        let parsed: BrokerConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.listen_addr, BrokerConfig::default().listen_addr);
    }

    #[test]
    fn load_without_a_config_file_reports_it_missing_and_falls_back_to_defaults() {
        let result = load("/nonexistent/broker.toml").unwrap();
        assert_eq!(result.file_missing.as_deref(), Some("/nonexistent/broker.toml"));
        assert_eq!(result.config.listen_addr, BrokerConfig::default().listen_addr);
    }
}
