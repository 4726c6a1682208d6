/// Configuration module for the potato relay
///
/// This module defines the configuration structures used throughout the relay:
/// named chain profiles, SMTP settings, the HTTP API and general service settings.
/// The file is YAML (`config/relay_config.yaml`); secrets come from the environment.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use ethers::types::Address;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{RelayError, RelayResult};

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "config/relay_config.yaml";

/// Operator key variables tried after the profile's own `operator_key_env`
const FALLBACK_KEY_ENVS: &[&str] = &["DEPLOYER_PRIVATE_KEY", "PRIVATE_KEY"];

/// Main configuration structure for the relay
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelayConfig {
    /// General service settings
    pub general: GeneralConfig,

    /// Chain profiles by name (`localhost`, `sepolia`, ...)
    pub chains: HashMap<String, ChainConfig>,

    /// Outbound mail
    pub mail: MailConfig,

    /// HTTP API
    pub api: ApiConfig,
}

/// General service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Service name, reported by `/health`
    pub service_name: String,

    /// Log level (error, warn, info, debug, trace)
    pub log_level: String,

    /// Emit JSON log lines instead of plain text
    #[serde(default)]
    pub json_logs: bool,

    /// Enable metrics collection
    pub enable_metrics: bool,

    /// Name of the chain profile to use
    pub active_network: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            service_name: "potato-relay".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            enable_metrics: true,
            active_network: "localhost".to_string(),
        }
    }
}

/// One chain profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Profile display name
    pub name: String,

    /// Expected chain id; checked against the node on connect
    pub chain_id: u64,

    /// HTTP JSON-RPC endpoint
    pub rpc_url: String,

    /// PotatoVendor contract address
    pub vendor_address: Address,

    /// First block to scan; latest block when unset
    #[serde(default)]
    pub start_block: Option<u64>,

    /// Log polling interval in milliseconds
    pub poll_interval_ms: u64,

    /// Confirmations to wait for on relay writes
    pub confirmations: usize,

    /// Upper bound for a single chain call, confirmation wait included
    pub call_timeout_secs: u64,

    /// Environment variable holding the operator private key
    pub operator_key_env: String,
}

impl ChainConfig {
    /// Local hardhat / anvil node
    pub fn localhost() -> Self {
        Self {
            name: "localhost".to_string(),
            chain_id: 31337,
            rpc_url: "http://localhost:8545".to_string(),
            vendor_address: Address::zero(),
            start_block: Some(0),
            poll_interval_ms: 1_000,
            confirmations: 1,
            call_timeout_secs: 60,
            operator_key_env: "OPERATOR_PRIVATE_KEY".to_string(),
        }
    }

    /// Sepolia testnet
    pub fn sepolia() -> Self {
        Self {
            name: "sepolia".to_string(),
            chain_id: 11155111,
            rpc_url: "https://rpc.sepolia.org".to_string(),
            vendor_address: Address::zero(),
            start_block: None,
            poll_interval_ms: 12_000,
            confirmations: 1,
            call_timeout_secs: 120,
            operator_key_env: "OPERATOR_PRIVATE_KEY".to_string(),
        }
    }

    /// Read the operator key from the environment
    ///
    /// Tries `operator_key_env` first, then the deployer key variables.
    pub fn operator_key(&self) -> RelayResult<String> {
        std::iter::once(self.operator_key_env.as_str())
            .chain(FALLBACK_KEY_ENVS.iter().copied())
            .find_map(|name| std::env::var(name).ok().filter(|v| !v.trim().is_empty()))
            .ok_or_else(|| {
                RelayError::Config(format!(
                    "Operator key not set: export {} (or {})",
                    self.operator_key_env,
                    FALLBACK_KEY_ENVS.join(", ")
                ))
            })
    }
}

/// SMTP settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    /// Send real mail; otherwise emails are only logged
    pub enabled: bool,

    /// SMTP relay host (implicit TLS)
    pub smtp_host: String,

    /// SMTP port
    pub smtp_port: u16,

    /// Sender account, usually from `EMAIL_USER`
    #[serde(default)]
    pub username: Option<String>,

    /// Sender password, usually from `EMAIL_PASS`
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// From header; defaults to the username
    #[serde(default)]
    pub from_address: Option<String>,

    /// SMTP timeout in seconds
    pub timeout_secs: u64,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: "smtp.gmail.com".to_string(),
            smtp_port: 465,
            username: None,
            password: None,
            from_address: None,
            timeout_secs: 30,
        }
    }
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable API server
    pub enable_api: bool,

    /// API server port
    pub port: u16,

    /// CORS allowed origins
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enable_api: true,
            port: 3000,
            cors_origins: vec!["*".to_string()],
        }
    }
}

impl RelayConfig {
    /// Resolve the active chain profile
    ///
    /// # Errors
    /// * `Config` if the profile does not exist or has no vendor address
    pub fn active_chain(&self) -> RelayResult<&ChainConfig> {
        let name = &self.general.active_network;
        let chain = self.chains.get(name).ok_or_else(|| {
            RelayError::Config(format!("Chain profile '{}' not found in configuration", name))
        })?;
        if chain.vendor_address.is_zero() {
            return Err(RelayError::Config(format!(
                "Chain profile '{}' has no vendor_address (set it in the file or VENDOR_ADDRESS)",
                name
            )));
        }
        Ok(chain)
    }

    /// Apply environment overrides on top of the file
    ///
    /// `RPC_URL` and `VENDOR_ADDRESS` patch the active profile; `EMAIL_USER`
    /// and `EMAIL_PASS` fill the mail credentials; `RELAY_NETWORK` switches
    /// the active profile.
    pub fn apply_env_overrides(&mut self) -> RelayResult<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> RelayResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(network) = lookup("RELAY_NETWORK") {
            self.general.active_network = network;
        }
        if let Some(user) = lookup("EMAIL_USER") {
            self.mail.username = Some(user);
        }
        if let Some(pass) = lookup("EMAIL_PASS") {
            self.mail.password = Some(pass);
        }

        let rpc_url = lookup("RPC_URL");
        let vendor = lookup("VENDOR_ADDRESS");
        if rpc_url.is_none() && vendor.is_none() {
            return Ok(());
        }

        let active = self.general.active_network.clone();
        let chain = match self.chains.get_mut(&active) {
            Some(chain) => chain,
            None => {
                warn!("RPC_URL/VENDOR_ADDRESS set but chain profile '{}' does not exist", active);
                return Ok(());
            }
        };
        if let Some(url) = rpc_url {
            chain.rpc_url = url;
        }
        if let Some(address) = vendor {
            chain.vendor_address = address
                .trim()
                .parse::<Address>()
                .map_err(|e| RelayError::Config(format!("Invalid VENDOR_ADDRESS {}: {}", address, e)))?;
        }
        Ok(())
    }
}

/// Configuration manager for handling config loading/saving
pub struct ConfigManager {
    /// Current configuration
    config: RwLock<RelayConfig>,

    /// Configuration file path
    config_path: String,
}

impl ConfigManager {
    /// Create a new configuration manager
    pub fn new(config_path: &str) -> Self {
        Self {
            config: RwLock::new(initialize_default_config()),
            config_path: config_path.to_string(),
        }
    }

    /// Load configuration from file, then apply environment overrides
    pub async fn load(&self) -> RelayResult<()> {
        let path = Path::new(&self.config_path);

        let mut config = if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| {
                RelayError::Config(format!("Failed to read configuration file {}: {}", self.config_path, e))
            })?;
            let parsed: RelayConfig = serde_yaml::from_str(&content)
                .map_err(|e| RelayError::Config(format!("Failed to parse configuration file: {}", e)))?;
            info!("Configuration loaded from {}", self.config_path);
            parsed
        } else {
            info!("Configuration file not found, using default configuration");
            initialize_default_config()
        };

        config.apply_env_overrides()?;
        *self.config.write().await = config;
        Ok(())
    }

    /// Save configuration to file
    pub async fn save(&self) -> RelayResult<()> {
        let config = self.config.read().await;
        let yaml = serde_yaml::to_string(&*config)
            .map_err(|e| RelayError::Config(format!("Failed to serialize configuration: {}", e)))?;

        let path = Path::new(&self.config_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    RelayError::Config(format!("Failed to create directory {:?}: {}", parent, e))
                })?;
            }
        }

        fs::write(path, yaml).map_err(|e| {
            RelayError::Config(format!("Failed to write configuration to {}: {}", self.config_path, e))
        })?;

        info!("Configuration saved to {}", self.config_path);
        Ok(())
    }

    /// Get the current configuration
    pub async fn get_config(&self) -> RelayConfig {
        self.config.read().await.clone()
    }

    /// Replace the configuration and persist it
    pub async fn update_config(&self, config: RelayConfig) -> RelayResult<()> {
        *self.config.write().await = config;
        self.save().await
    }

    /// Path this manager reads and writes
    pub fn config_path(&self) -> &str {
        &self.config_path
    }
}

/// Default configuration with the localhost and sepolia profiles
pub fn initialize_default_config() -> RelayConfig {
    let mut config = RelayConfig::default();

    let localhost = ChainConfig::localhost();
    config.chains.insert(localhost.name.clone(), localhost);

    let sepolia = ChainConfig::sepolia();
    config.chains.insert(sepolia.name.clone(), sepolia);

    config
}
