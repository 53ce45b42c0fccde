use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
    /// `None` follows the environment, `Some("")` forces a direct connection.
    #[serde(default)]
    pub proxy: Option<String>,
}

fn default_http_timeout() -> u64 {
    120
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
            proxy: None,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowConfig {
    #[serde(default = "default_element_timeout")]
    pub element_timeout_ms: u64,
    #[serde(default = "default_element_poll")]
    pub element_poll_ms: u64,
    /// Pause after each page step so a triggered navigation can start.
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
}

fn default_element_timeout() -> u64 {
    5000
}

fn default_element_poll() -> u64 {
    100
}

fn default_settle_delay() -> u64 {
    500
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            element_timeout_ms: default_element_timeout(),
            element_poll_ms: default_element_poll(),
            settle_delay_ms: default_settle_delay(),
        }
    }
}

impl FlowConfig {
    pub fn element_timeout(&self) -> Duration {
        Duration::from_millis(self.element_timeout_ms)
    }

    pub fn element_poll(&self) -> Duration {
        Duration::from_millis(self.element_poll_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSettings {
    /// Tokens expiring within this window are refreshed before use.
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_secs: i64,
}

fn default_refresh_threshold() -> i64 {
    60
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            refresh_threshold_secs: default_refresh_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderRulesConfig {
    #[serde(default = "default_rule_priority")]
    pub priority: u32,
}

fn default_rule_priority() -> u32 {
    1
}

impl Default for HeaderRulesConfig {
    fn default() -> Self {
        Self {
            priority: default_rule_priority(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_locales")]
    pub locales: Vec<String>,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub header_rules: HeaderRulesConfig,
    /// Requests whose initiator starts with one of these prefixes are ignored.
    #[serde(default = "default_ignored_initiators")]
    pub ignored_initiators: Vec<String>,
    /// Agent base URLs loaded into the catalog by the CLI.
    #[serde(default)]
    pub agents: Vec<String>,
}

fn default_locales() -> Vec<String> {
    vec!["en".to_string()]
}

fn default_ignored_initiators() -> Vec<String> {
    vec![
        "chrome-extension://".to_string(),
        "moz-extension://".to_string(),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            locales: default_locales(),
            http: HttpConfig::default(),
            flow: FlowConfig::default(),
            auth: AuthSettings::default(),
            header_rules: HeaderRulesConfig::default(),
            ignored_initiators: default_ignored_initiators(),
            agents: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn is_ignored_initiator(&self, initiator: Option<&str>) -> bool {
        match initiator {
            Some(i) => self.ignored_initiators.iter().any(|p| i.starts_with(p.as_str())),
            None => false,
        }
    }
}
