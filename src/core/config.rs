use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::core::models::pricing::{AgentPricing, ChargePolicy};

const LEDGER_KEY_ENV: &str = "CREDMETER_LEDGER_KEY";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_format")]
    pub default_format: String,
    #[serde(default = "default_color")]
    pub color: String,
}

fn default_format() -> String {
    "text".to_string()
}
fn default_color() -> String {
    "auto".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_format: default_format(),
            color: default_color(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerBackend {
    /// JSON file under the data directory
    #[default]
    Local,
    /// PostgREST-style HTTP ledger
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub backend: LedgerBackend,
    pub url: Option<String>,
    pub api_key: Option<String>,
    /// Overrides the default local ledger location
    pub path: Option<PathBuf>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_timeout_ms() -> u64 {
    10_000
}
fn default_max_retries() -> u32 {
    2
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::default(),
            url: None,
            api_key: None,
            path: None,
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl LedgerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// API key from the environment, falling back to the config file.
    pub fn resolved_api_key(&self) -> Option<String> {
        std::env::var(LEDGER_KEY_ENV)
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| self.api_key.clone().filter(|k| !k.is_empty()))
    }

    /// Longest a remote call can take with every retry used: each attempt
    /// may run to `timeout_ms`, plus the linear backoff between attempts.
    pub fn worst_case_round_trip_ms(&self) -> u64 {
        let attempts = u64::from(self.max_retries) + 1;
        let backoff_ms = crate::core::ledger::remote::RETRY_BACKOFF.as_millis() as u64;
        let backoff_steps = u64::from(self.max_retries) * attempts / 2;
        self.timeout_ms
            .saturating_mul(attempts)
            .saturating_add(backoff_ms.saturating_mul(backoff_steps))
    }

    pub fn local_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| AppConfig::data_dir().join("ledger.json"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditsConfig {
    /// Credits granted to a user with no ledger record
    #[serde(default = "default_trial_grant")]
    pub trial_grant: i64,
    #[serde(default = "default_low_balance_threshold")]
    pub low_balance_threshold: i64,
    #[serde(default)]
    pub charge_policy: ChargePolicy,
    /// Upper bound on one deduction round trip, retries included
    #[serde(default = "default_deduct_timeout_ms")]
    pub deduct_timeout_ms: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_trial_grant() -> i64 {
    5
}
fn default_low_balance_threshold() -> i64 {
    20
}
fn default_deduct_timeout_ms() -> u64 {
    35_000
}
fn default_history_limit() -> usize {
    50
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            trial_grant: default_trial_grant(),
            low_balance_threshold: default_low_balance_threshold(),
            charge_policy: ChargePolicy::default(),
            deduct_timeout_ms: default_deduct_timeout_ms(),
            history_limit: default_history_limit(),
        }
    }
}

impl CreditsConfig {
    pub fn deduct_timeout(&self) -> Duration {
        Duration::from_millis(self.deduct_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Agent response endpoint; responses are echoed locally when unset
    pub endpoint: Option<String>,
    pub model: Option<String>,
    #[serde(default = "default_generator_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_generator_timeout_ms() -> u64 {
    60_000
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: None,
            timeout_ms: default_generator_timeout_ms(),
        }
    }
}

impl GeneratorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Activity/error collector; events only go to the log when unset
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub credits: CreditsConfig,
    #[serde(default)]
    pub pricing: Vec<AgentPricing>,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Get the config file path, respecting XDG_CONFIG_HOME
    pub fn config_path() -> PathBuf {
        let config_dir = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("~"))
                    .join(".config")
            });
        config_dir.join("credmeter").join("config.toml")
    }

    /// Directory for the local ledger and chat sessions, respecting XDG_DATA_HOME
    pub fn data_dir() -> PathBuf {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("~"))
                    .join(".local")
                    .join("share")
            });
        data_dir.join("credmeter")
    }

    /// Load config from the default path, falling back to defaults if not found
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Serialize and write this config to the config file path.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Starter config with a couple of example price entries.
    pub fn starter() -> Self {
        Self {
            pricing: vec![
                AgentPricing {
                    agent_id: "research-assistant".into(),
                    credit_weight: 2.0,
                    description: Some("Long-form research with citations".into()),
                    cost_basis: Some("per_message".into()),
                },
                AgentPricing {
                    agent_id: "quick-helper".into(),
                    credit_weight: 0.5,
                    description: Some("Short answers".into()),
                    cost_basis: Some("per_message".into()),
                },
            ],
            ..Self::default()
        }
    }

    /// Validate the config
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if !["text", "json"].contains(&self.settings.default_format.as_str()) {
            issues.push(format!(
                "Invalid default_format: '{}' (must be 'text' or 'json')",
                self.settings.default_format
            ));
        }
        if !["auto", "always", "never"].contains(&self.settings.color.as_str()) {
            issues.push(format!(
                "Invalid color: '{}' (must be 'auto', 'always', or 'never')",
                self.settings.color
            ));
        }
        if self.ledger.backend == LedgerBackend::Remote {
            match self.ledger.url.as_deref() {
                None => issues.push("ledger.url is required when backend = \"remote\"".into()),
                Some(url) => {
                    if let Err(e) = crate::core::ledger::remote::validate_endpoint(url) {
                        issues.push(format!("ledger.url: {}", e));
                    }
                }
            }
            if self.ledger.resolved_api_key().is_none() {
                issues.push(format!(
                    "ledger.api_key (or {}) is required when backend = \"remote\"",
                    LEDGER_KEY_ENV
                ));
            }
        }
        if self.ledger.timeout_ms == 0 {
            issues.push("ledger.timeout_ms must be greater than 0".into());
        }
        if self.ledger.backend == LedgerBackend::Remote {
            let needed = self.ledger.worst_case_round_trip_ms();
            if self.credits.deduct_timeout_ms < needed {
                issues.push(format!(
                    "credits.deduct_timeout_ms ({}) is shorter than the ledger's retry budget \
                     ({} ms for {} attempts of {} ms plus backoff); the last retry would be cut off",
                    self.credits.deduct_timeout_ms,
                    needed,
                    self.ledger.max_retries + 1,
                    self.ledger.timeout_ms
                ));
            }
        }
        if self.credits.trial_grant < 0 {
            issues.push(format!(
                "credits.trial_grant must not be negative, got {}",
                self.credits.trial_grant
            ));
        }
        if self.credits.deduct_timeout_ms == 0 {
            issues.push("credits.deduct_timeout_ms must be greater than 0".into());
        }
        let mut seen = std::collections::HashSet::new();
        for p in &self.pricing {
            if p.agent_id.trim().is_empty() {
                issues.push("Pricing entry with empty agent_id".into());
            }
            if !p.is_usable() {
                issues.push(format!(
                    "Pricing '{}': credit_weight must be a non-negative number, got {}",
                    p.agent_id, p.credit_weight
                ));
            }
            if !seen.insert(p.agent_id.trim().to_lowercase()) {
                issues.push(format!("Duplicate pricing entry for '{}'", p.agent_id));
            }
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let config = AppConfig::default();
        let issues = config.validate();
        assert!(issues.is_empty(), "Default config should be valid, got: {:?}", issues);
    }

    #[test]
    fn starter_config_is_valid() {
        let issues = AppConfig::starter().validate();
        assert!(issues.is_empty(), "Starter config should be valid, got: {:?}", issues);
    }

    #[test]
    fn default_credit_settings() {
        let credits = CreditsConfig::default();
        assert_eq!(credits.trial_grant, 5);
        assert_eq!(credits.low_balance_threshold, 20);
        assert_eq!(credits.charge_policy, ChargePolicy::RoundUp);
    }

    #[test]
    fn default_ledger_is_local() {
        assert_eq!(AppConfig::default().ledger.backend, LedgerBackend::Local);
    }

    #[test]
    fn validate_catches_invalid_format() {
        let mut config = AppConfig::default();
        config.settings.default_format = "xml".to_string();
        let issues = config.validate();
        assert!(issues.iter().any(|i| i.contains("default_format")));
    }

    #[test]
    fn validate_catches_invalid_color() {
        let mut config = AppConfig::default();
        config.settings.color = "blue".to_string();
        let issues = config.validate();
        assert!(issues.iter().any(|i| i.contains("color")));
    }

    #[test]
    fn validate_requires_url_for_remote_ledger() {
        let mut config = AppConfig::default();
        config.ledger.backend = LedgerBackend::Remote;
        config.ledger.api_key = Some("key".into());
        let issues = config.validate();
        assert!(issues.iter().any(|i| i.contains("ledger.url is required")));
    }

    #[test]
    fn validate_rejects_plain_http_ledger() {
        let mut config = AppConfig::default();
        config.ledger.backend = LedgerBackend::Remote;
        config.ledger.url = Some("http://ledger.example.com".into());
        config.ledger.api_key = Some("key".into());
        let issues = config.validate();
        assert!(issues.iter().any(|i| i.contains("HTTPS")));
    }

    #[test]
    fn retry_budget_counts_every_attempt_and_backoff() {
        let ledger = LedgerConfig::default();
        assert_eq!(ledger.worst_case_round_trip_ms(), 3 * 10_000 + 250 + 500);
        let no_retries = LedgerConfig {
            max_retries: 0,
            ..LedgerConfig::default()
        };
        assert_eq!(no_retries.worst_case_round_trip_ms(), 10_000);
    }

    #[test]
    fn validate_flags_deduct_timeout_below_retry_budget() {
        let mut config = AppConfig::default();
        config.ledger.backend = LedgerBackend::Remote;
        config.ledger.url = Some("https://project.supabase.co".into());
        config.ledger.api_key = Some("key".into());
        assert!(config.validate().is_empty(), "{:?}", config.validate());

        config.credits.deduct_timeout_ms = 30_000;
        let issues = config.validate();
        assert!(issues.iter().any(|i| i.contains("retry budget")));
    }

    #[test]
    fn validate_catches_bad_pricing() {
        let mut config = AppConfig::default();
        config.pricing.push(AgentPricing {
            agent_id: "agent-x".into(),
            credit_weight: -2.0,
            description: None,
            cost_basis: None,
        });
        config.pricing.push(AgentPricing {
            agent_id: "Agent-X".into(),
            credit_weight: 1.0,
            description: None,
            cost_basis: None,
        });
        let issues = config.validate();
        assert!(issues.iter().any(|i| i.contains("credit_weight")));
        assert!(issues.iter().any(|i| i.contains("Duplicate pricing")));
    }

    #[test]
    fn parse_minimal_toml() {
        let toml = r#"
[settings]
default_format = "json"
color = "always"
"#;
        let config: AppConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.settings.default_format, "json");
        assert_eq!(config.settings.color, "always");
        assert!(config.pricing.is_empty());
        assert_eq!(config.credits.trial_grant, 5);
    }

    #[test]
    fn parse_full_toml() {
        let toml = r#"
[ledger]
backend = "remote"
url = "https://project.supabase.co"
api_key = "service-key"
max_retries = 4

[credits]
charge_policy = "raw_weight"
low_balance_threshold = 10

[[pricing]]
agent_id = "research-assistant"
credit_weight = 1.5
"#;
        let config: AppConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.ledger.backend, LedgerBackend::Remote);
        assert_eq!(config.ledger.max_retries, 4);
        assert_eq!(config.ledger.timeout_ms, 10_000);
        assert_eq!(config.credits.charge_policy, ChargePolicy::RawWeight);
        assert_eq!(config.credits.low_balance_threshold, 10);
        assert_eq!(config.pricing.len(), 1);
        assert!((config.pricing[0].credit_weight - 1.5).abs() < 1e-12);
    }

    #[test]
    fn parse_empty_toml_gives_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.settings.default_format, "text");
        assert_eq!(config.settings.color, "auto");
        assert_eq!(config.ledger.max_retries, 2);
    }

    #[test]
    fn starter_config_survives_toml_round_trip() {
        let text = toml::to_string_pretty(&AppConfig::starter()).unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.pricing.len(), 2);
        assert_eq!(parsed.pricing[1].agent_id, "quick-helper");
    }

    #[test]
    fn config_path_uses_xdg_when_set() {
        std::env::set_var("XDG_CONFIG_HOME", "/tmp/test_xdg_config");
        let path = AppConfig::config_path();
        std::env::remove_var("XDG_CONFIG_HOME");
        assert_eq!(path, PathBuf::from("/tmp/test_xdg_config/credmeter/config.toml"));
    }

    #[test]
    fn explicit_ledger_path_wins() {
        let ledger = LedgerConfig {
            path: Some(PathBuf::from("/tmp/ledger-test.json")),
            ..LedgerConfig::default()
        };
        assert_eq!(ledger.local_path(), PathBuf::from("/tmp/ledger-test.json"));
    }
}
