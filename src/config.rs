//! Configuration module for the nonce keeper
//!
//! This module handles configuration loading from TOML files and `.env`
//! overrides, and turns the result into the settings the connectors use.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chain::{ChainDescriptor, ConnectorSettings};
use crate::nonce_manager::{ReconcilerConfig, RetryConfig};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Storage locations
    #[serde(default)]
    pub server: ServerConfig,

    /// Reconciliation timing
    #[serde(default)]
    pub reconciler: ReconcilerSettings,

    /// Monitoring and metrics
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Networks to connect
    #[serde(default)]
    pub chains: Vec<ChainDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base directory for relative database paths
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_nonce_db_path")]
    pub nonce_db_path: PathBuf,

    #[serde(default = "default_transaction_db_path")]
    pub transaction_db_path: PathBuf,

    /// Flush to disk before every write returns
    #[serde(default = "default_true")]
    pub flush_on_write: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerSettings {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_staleness_window_secs")]
    pub staleness_window_secs: u64,

    #[serde(default = "default_reservation_timeout_secs")]
    pub reservation_timeout_secs: u64,

    #[serde(default = "default_drop_window_secs")]
    pub drop_window_secs: u64,

    #[serde(default = "default_oracle_timeout_ms")]
    pub oracle_timeout_ms: u64,

    /// Receipts cached by the oracle wrapper for this long
    #[serde(default = "default_receipt_cache_secs")]
    pub receipt_cache_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub json_logs: bool,
}

// Default value functions
fn default_data_dir() -> PathBuf { PathBuf::from("db") }
fn default_nonce_db_path() -> PathBuf { PathBuf::from("evm-nonces") }
fn default_transaction_db_path() -> PathBuf { PathBuf::from("transactions") }
fn default_interval_secs() -> u64 { 15 }
fn default_staleness_window_secs() -> u64 { 30 }
fn default_reservation_timeout_secs() -> u64 { 120 }
fn default_drop_window_secs() -> u64 { 600 }
fn default_oracle_timeout_ms() -> u64 { 5_000 }
fn default_receipt_cache_secs() -> u64 { 3_600 }
fn default_metrics_port() -> u16 { 9090 }
fn default_true() -> bool { true }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            nonce_db_path: default_nonce_db_path(),
            transaction_db_path: default_transaction_db_path(),
            flush_on_write: default_true(),
        }
    }
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            staleness_window_secs: default_staleness_window_secs(),
            reservation_timeout_secs: default_reservation_timeout_secs(),
            drop_window_secs: default_drop_window_secs(),
            oracle_timeout_ms: default_oracle_timeout_ms(),
            receipt_cache_secs: default_receipt_cache_secs(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: default_true(),
            metrics_port: default_metrics_port(),
            json_logs: false,
        }
    }
}

impl ReconcilerSettings {
    pub fn to_reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: Duration::from_secs(self.interval_secs),
            staleness_window: Duration::from_secs(self.staleness_window_secs),
            reservation_timeout: Duration::from_secs(self.reservation_timeout_secs),
            drop_window: Duration::from_secs(self.drop_window_secs),
            oracle_timeout: Duration::from_millis(self.oracle_timeout_ms),
            retry: self.retry.clone(),
        }
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.oracle_timeout_ms)
    }

    pub fn receipt_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.receipt_cache_secs)
    }
}

impl ServerConfig {
    /// Absolute paths are used as is; relative ones land under `data_dir`,
    /// which is created on demand.
    pub fn resolve_db_path(&self, path: &Path) -> anyhow::Result<PathBuf> {
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("Failed to create data dir {}", self.data_dir.display()))?;
        Ok(self.data_dir.join(path))
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &str) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// `NONCE_KEEPER_DATA_DIR`, `NONCE_KEEPER_NONCE_DB_PATH` and
    /// `NONCE_KEEPER_TRANSACTION_DB_PATH` replace the file values
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("NONCE_KEEPER_DATA_DIR") {
            self.server.data_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("NONCE_KEEPER_NONCE_DB_PATH") {
            self.server.nonce_db_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("NONCE_KEEPER_TRANSACTION_DB_PATH") {
            self.server.transaction_db_path = PathBuf::from(path);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chains.is_empty() {
            bail!("no chains configured");
        }
        let r = &self.reconciler;
        if r.interval_secs == 0 || r.oracle_timeout_ms == 0 {
            bail!("reconciler interval and oracle timeout must be non-zero");
        }
        if r.retry.max_attempts == 0 {
            bail!("reconciler retry.max_attempts must be at least 1");
        }

        let mut seen = HashSet::new();
        for chain in &self.chains {
            chain
                .validate()
                .with_context(|| format!("invalid chain {}", chain.ledger_id()))?;
            if !seen.insert(chain.key()) {
                bail!("duplicate chain {}", chain.ledger_id());
            }
        }

        // One sled database per path; both stores cannot share a directory
        if self.server.nonce_db_path == self.server.transaction_db_path {
            bail!("nonce_db_path and transaction_db_path must differ");
        }
        Ok(())
    }

    /// Resolve storage paths and build connector settings
    pub fn connector_settings(&self) -> anyhow::Result<ConnectorSettings> {
        Ok(ConnectorSettings {
            nonce_db_path: self.server.resolve_db_path(&self.server.nonce_db_path)?,
            transaction_db_path: self
                .server
                .resolve_db_path(&self.server.transaction_db_path)?,
            reconciler: self.reconciler.to_reconciler_config(),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            reconciler: ReconcilerSettings::default(),
            monitoring: MonitoringConfig::default(),
            chains: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
        [server]
        nonce_db_path = "nonces"
        transaction_db_path = "/var/lib/keeper/tx"

        [reconciler]
        interval_secs = 5
        oracle_timeout_ms = 1500

        [reconciler.retry]
        max_attempts = 4
        base_backoff_ms = 50
        max_backoff_ms = 1000
        jitter_factor = 0.1

        [[chains]]
        name = "base"
        network = "mainnet"
        chain_id = 8453
        rpc_url = "https://mainnet.base.org"
        addresses = ["0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed"]

        [chains.gas]
        manual_gas_price_gwei = 0.5
    "#;

    #[test]
    fn test_parse_sample_config() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.data_dir, PathBuf::from("db"));
        assert!(config.server.flush_on_write);
        assert_eq!(config.reconciler.reservation_timeout_secs, 120);
        assert_eq!(config.reconciler.retry.max_attempts, 4);
        assert_eq!(config.chains[0].gas.manual_gas_price_gwei, 0.5);
        assert_eq!(config.chains[0].gas.gas_limit_transaction, 3_000_000);

        let reconciler = config.reconciler.to_reconciler_config();
        assert_eq!(reconciler.interval, Duration::from_secs(5));
        assert_eq!(reconciler.oracle_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_validate_rejects_duplicates_and_shared_paths() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.chains.push(config.chains[0].clone());
        assert!(config.validate().is_err());

        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.server.transaction_db_path = config.server.nonce_db_path.clone();
        assert!(config.validate().is_err());

        assert!(Config::default().validate().is_err());
    }

    #[test]
    fn test_resolve_db_path() {
        let dir = TempDir::new().unwrap();
        let server = ServerConfig {
            data_dir: dir.path().join("data"),
            ..ServerConfig::default()
        };

        let relative = server.resolve_db_path(Path::new("nonces")).unwrap();
        assert_eq!(relative, dir.path().join("data").join("nonces"));
        assert!(dir.path().join("data").is_dir());

        let absolute = dir.path().join("elsewhere");
        assert_eq!(server.resolve_db_path(&absolute).unwrap(), absolute);
    }
}
