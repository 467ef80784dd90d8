//! Configuration management for the transaction coordinator
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub nonce: NonceConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub gas: GasStrategyConfig,
    #[serde(default)]
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Distributed lock policy for nonce sessions
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NonceConfig {
    /// Age after which a lock metadata row is presumed to belong to a crashed holder
    pub lock_timeout_ms: u64,
    pub lock_retry_delay_ms: u64,
    pub max_lock_retries: u32,
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 300_000,
            lock_retry_delay_ms: 500,
            max_lock_retries: 120,
        }
    }
}

impl NonceConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }
}

/// Stuck transaction escalation policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total submissions (original plus replacements) before giving up
    pub max_attempts: u32,
    /// Fee multiplier applied on every replacement, must exceed 1.0
    pub escalation_factor: f64,
    pub check_interval_ms: u64,
    pub stuck_threshold_ms: u64,
    /// Upper bound on a single broadcast call
    pub send_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            escalation_factor: 1.2,
            check_interval_ms: 5_000,
            stuck_threshold_ms: 60_000,
            send_timeout_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_millis(self.stuck_threshold_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Tunables for the conservative fee path
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GasStrategyConfig {
    pub conservative_buffer_percent: u64,
    /// Share of a legacy gas price treated as the priority fee
    pub legacy_priority_fee_percent: u64,
}

impl Default for GasStrategyConfig {
    fn default() -> Self {
        Self {
            conservative_buffer_percent: 20,
            legacy_priority_fee_percent: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WalletConfig {
    pub private_key_env: Option<String>,
}

impl Settings {
    /// Load settings from the file named by `TX_COORDINATOR_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("TX_COORDINATOR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse settings from TOML text
    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.escalation_factor <= 1.0 {
            anyhow::bail!(
                "retry.escalation_factor must exceed 1.0, got {}",
                self.retry.escalation_factor
            );
        }
        if self.retry.send_timeout_ms == 0 {
            anyhow::bail!("retry.send_timeout_ms must be positive");
        }
        if self.retry.check_interval_ms > self.retry.stuck_threshold_ms {
            anyhow::bail!("retry.check_interval_ms must not exceed retry.stuck_threshold_ms");
        }
        if self.nonce.max_lock_retries == 0 {
            anyhow::bail!("nonce.max_lock_retries must be at least 1");
        }

        for (name, chain) in &self.chains {
            if chain.enabled && chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by chain ID
    pub fn get_chain_by_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.chain_id == chain_id)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static pattern");
    }

    ENV_VAR
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
        [database]
        url = "postgres://localhost/coordinator"
        max_connections = 5
        min_connections = 1
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TX_COORDINATOR_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TX_COORDINATOR_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_defaults_apply_to_missing_sections() {
        let settings = Settings::parse(MINIMAL).unwrap();
        assert_eq!(settings.nonce.max_lock_retries, 120);
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.gas.conservative_buffer_percent, 20);
        assert!(settings.chains.is_empty());
    }

    #[test]
    fn test_rejects_non_escalating_factor() {
        let input = format!("{}\n[retry]\nescalation_factor = 1.0\n", MINIMAL);
        assert!(Settings::parse(&input).is_err());
    }

    #[test]
    fn test_send_timeout_defaults_and_must_be_positive() {
        let settings = Settings::parse(MINIMAL).unwrap();
        assert_eq!(settings.retry.send_timeout(), Duration::from_secs(30));

        let input = format!("{}\n[retry]\nsend_timeout_ms = 0\n", MINIMAL);
        assert!(Settings::parse(&input).is_err());
    }

    #[test]
    fn test_rejects_enabled_chain_without_rpc() {
        let input = format!(
            "{}\n[chains.base]\nchain_id = 8453\nname = \"base\"\nrpc_urls = []\nenabled = true\n",
            MINIMAL
        );
        assert!(Settings::parse(&input).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "{}\n[chains.sepolia]\nchain_id = 11155111\nname = \"sepolia\"\nrpc_urls = [\"http://localhost:8545\"]\nenabled = true\n",
            MINIMAL
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.enabled_chains().len(), 1);
        assert_eq!(
            settings.get_chain_by_id(11155111).map(|c| c.name.as_str()),
            Some("sepolia")
        );
    }
}
