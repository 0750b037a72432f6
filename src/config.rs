//! Configuration management for the executor
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use ethers::types::Address;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

lazy_static! {
    static ref ENV_VAR: Regex =
        Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("env var pattern is valid");
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub executor: ExecutorConfig,
    pub signer: SignerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub forwarder_address: String,
    #[serde(default = "default_domain_name")]
    pub domain_name: String,
    #[serde(default = "default_domain_version")]
    pub domain_version: String,
    #[serde(default = "default_multiplier")]
    pub priority_fee_multiplier: f64,
    #[serde(default = "default_fee_bump")]
    pub fee_bump: f64,
    #[serde(default = "default_collision_retries")]
    pub collision_retries: u32,
    #[serde(default = "default_fee_ttl_ms")]
    pub fee_ttl_ms: u64,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_preflight_gas")]
    pub preflight_gas: u64,
    #[serde(default = "default_confirmation_poll_ms")]
    pub confirmation_poll_ms: u64,
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum NativeSignerKind {
    /// Application-held key, signs raw transactions itself
    Burner,
    /// Key wrapped in a signing middleware that broadcasts on our behalf
    Wallet,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignerConfig {
    pub native: NativeSignerKind,
    pub native_key_env: String,
    /// Separate burner key for meta-transactions; falls back to the native key
    pub burner_key_env: Option<String>,
    /// Key used to attest offchain ownership challenges
    pub attester_key_env: Option<String>,
    /// Ask the EIP-3668 gateway URLs instead of attesting locally
    #[serde(default)]
    pub use_gateway_attester: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub relayer_uri: Option<String>,
    #[serde(default = "default_relay_timeout_ms")]
    pub timeout_ms: u64,
    pub forwarder_abi_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

fn default_domain_name() -> String {
    "Essential Forwarder".to_string()
}

fn default_domain_version() -> String {
    "0.0.1".to_string()
}

fn default_multiplier() -> f64 {
    1.0
}

fn default_fee_bump() -> f64 {
    1.1
}

fn default_collision_retries() -> u32 {
    1
}

fn default_fee_ttl_ms() -> u64 {
    12_000
}

fn default_rpc_timeout_ms() -> u64 {
    10_000
}

fn default_preflight_gas() -> u64 {
    1_000_000
}

fn default_confirmation_poll_ms() -> u64 {
    1_000
}

fn default_confirmation_timeout_secs() -> u64 {
    120
}

fn default_relay_timeout_ms() -> u64 {
    15_000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            relayer_uri: None,
            timeout_ms: default_relay_timeout_ms(),
            forwarder_abi_path: None,
        }
    }
}

/// Upper bound on nonce-collision retries a config may ask for
pub const MAX_COLLISION_RETRIES: u32 = 3;

impl Settings {
    /// Load settings from the file named by `ESSENTIAL_EXECUTOR_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("ESSENTIAL_EXECUTOR_CONFIG")
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

    /// Parse settings from TOML text, substituting environment variables first
    pub fn parse(config_str: &str) -> Result<Self> {
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        let executor = &self.executor;

        if executor.rpc_url.is_empty() {
            anyhow::bail!("executor.rpc_url must be set");
        }

        executor
            .forwarder_address
            .parse::<Address>()
            .with_context(|| format!("Invalid forwarder address: {}", executor.forwarder_address))?;

        if executor.priority_fee_multiplier <= 0.0 {
            anyhow::bail!("executor.priority_fee_multiplier must be positive");
        }

        // A replacement transaction needs at least a 10% higher tip to be accepted
        if executor.fee_bump < 1.1 {
            anyhow::bail!("executor.fee_bump must be at least 1.1");
        }

        if executor.collision_retries > MAX_COLLISION_RETRIES {
            anyhow::bail!(
                "executor.collision_retries must be at most {}",
                MAX_COLLISION_RETRIES
            );
        }

        if self.relay.relayer_uri.is_none() {
            tracing::warn!("No relayer URI configured - meta-transactions will be rejected");
        }

        Ok(())
    }
}

impl RelayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl ExecutorConfig {
    pub fn forwarder(&self) -> Result<Address> {
        self.forwarder_address
            .parse()
            .with_context(|| format!("Invalid forwarder address: {}", self.forwarder_address))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn fee_ttl(&self) -> Duration {
        Duration::from_millis(self.fee_ttl_ms)
    }

    pub fn confirmation_poll(&self) -> Duration {
        Duration::from_millis(self.confirmation_poll_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();

    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[executor]
chain_id = 421613
rpc_url = "http://localhost:8545"
forwarder_address = "0x5FbDB2315678afecb367f032d93F642f64180aa3"

[signer]
native = "burner"
native_key_env = "EXECUTOR_NATIVE_KEY"

[relay]
relayer_uri = "https://relay.example.com/${TEST_RELAY_PATH}"

[api]
host = "127.0.0.1"
port = 8080

[metrics]
enabled = false
port = 9090
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_load_applies_defaults() {
        env::set_var("TEST_RELAY_PATH", "relay");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.executor.chain_id, 421613);
        assert_eq!(settings.executor.domain_name, "Essential Forwarder");
        assert_eq!(settings.executor.collision_retries, 1);
        assert_eq!(settings.executor.fee_bump, 1.1);
        assert_eq!(settings.signer.native, NativeSignerKind::Burner);
        assert_eq!(
            settings.relay.relayer_uri.as_deref(),
            Some("https://relay.example.com/relay")
        );
    }

    #[test]
    fn test_rejects_small_fee_bump() {
        let config = SAMPLE.replace(
            "chain_id = 421613",
            "chain_id = 421613\nfee_bump = 1.05",
        );
        assert!(Settings::parse(&config).is_err());
    }

    #[test]
    fn test_rejects_unbounded_retries() {
        let config = SAMPLE.replace(
            "chain_id = 421613",
            "chain_id = 421613\ncollision_retries = 10",
        );
        assert!(Settings::parse(&config).is_err());
    }
}
