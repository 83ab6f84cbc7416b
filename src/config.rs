//! Configuration file handling for mailhook.

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, one INI section per struct field.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub smtp: SmtpConfig,
    pub forward: ForwardConfig,
}

/// `[smtp]` section: the listener and the recipient policy.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "SmtpConfig::default_host")]
    pub host: String,
    #[serde(default = "SmtpConfig::default_port")]
    pub port: u16,
    #[serde(default = "SmtpConfig::default_accepted_domain")]
    pub accepted_domain: String,
    #[serde(default = "SmtpConfig::default_max_message_size")]
    pub max_message_size: usize,
}

/// `[forward]` section: the downstream HTTP endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardConfig {
    pub url: String,
    #[serde(default = "ForwardConfig::default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub auth_header_name: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub include_raw: bool,
}

impl Config {
    /// Load configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, crate::error::Error> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serini::from_str(&content)?;
        Ok(config)
    }
}

impl SmtpConfig {
    // Following are needed since serde does not support default literals.

    fn default_host() -> String {
        "0.0.0.0".to_string()
    }
    const fn default_port() -> u16 {
        2525
    }
    fn default_accepted_domain() -> String {
        "tikrai.com".to_string()
    }
    const fn default_max_message_size() -> usize {
        10485760
    }
}

impl ForwardConfig {
    const fn default_timeout_ms() -> u64 {
        10000
    }
}
