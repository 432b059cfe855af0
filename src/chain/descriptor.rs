//! Data-driven description of one EVM network

use serde::{Deserialize, Serialize};

use crate::nonce_manager::nonce_errors::{NonceError, NonceResult};
use crate::types::ChainAddress;

/// Static gas settings; the connector does not estimate fees itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GasSettings {
    /// Gas price used when the caller does not supply EIP-1559 fees
    #[serde(default = "default_manual_gas_price_gwei")]
    pub manual_gas_price_gwei: f64,

    #[serde(default = "default_gas_limit_transaction")]
    pub gas_limit_transaction: u64,
}

impl Default for GasSettings {
    fn default() -> Self {
        Self {
            manual_gas_price_gwei: default_manual_gas_price_gwei(),
            gas_limit_transaction: default_gas_limit_transaction(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainDescriptor {
    /// Chain family, e.g. `base` or `ethereum`
    pub name: String,

    /// Network within the chain, e.g. `mainnet` or `sepolia`
    pub network: String,

    pub chain_id: u64,

    /// JSON-RPC endpoint of the node
    pub rpc_url: String,

    #[serde(default = "default_native_currency_symbol")]
    pub native_currency_symbol: String,

    #[serde(default)]
    pub gas: GasSettings,

    /// Wallets synced at startup and reconciled on every pass
    #[serde(default)]
    pub addresses: Vec<String>,
}

fn default_manual_gas_price_gwei() -> f64 { 110.0 }
fn default_gas_limit_transaction() -> u64 { 3_000_000 }
fn default_native_currency_symbol() -> String { "ETH".to_string() }

impl ChainDescriptor {
    pub fn new(name: &str, network: &str, chain_id: u64, rpc_url: &str) -> Self {
        Self {
            name: name.to_string(),
            network: network.to_string(),
            chain_id,
            rpc_url: rpc_url.to_string(),
            native_currency_symbol: default_native_currency_symbol(),
            gas: GasSettings::default(),
            addresses: Vec::new(),
        }
    }

    pub fn with_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    /// Registry key
    pub fn key(&self) -> (String, String) {
        (self.name.clone(), self.network.clone())
    }

    /// Chain identifier used in nonce store keys
    pub fn ledger_id(&self) -> String {
        format!("{}/{}", self.name, self.network)
    }

    pub fn chain_address(&self, address: &str) -> NonceResult<ChainAddress> {
        ChainAddress::new(&self.ledger_id(), address)
    }

    /// Parsed tracked addresses
    pub fn tracked_addresses(&self) -> NonceResult<Vec<ChainAddress>> {
        self.addresses
            .iter()
            .map(|address| self.chain_address(address))
            .collect()
    }

    pub fn validate(&self) -> NonceResult<()> {
        if self.name.trim().is_empty() || self.network.trim().is_empty() {
            return Err(NonceError::Configuration(
                "chain name and network must not be empty".to_string(),
            ));
        }
        if self.chain_id == 0 {
            return Err(NonceError::Configuration(format!(
                "{} has no chain_id",
                self.ledger_id()
            )));
        }
        if !self.rpc_url.starts_with("http://") && !self.rpc_url.starts_with("https://") {
            return Err(NonceError::Configuration(format!(
                "{} rpc_url must be http(s): {}",
                self.ledger_id(),
                self.rpc_url
            )));
        }
        if self.gas.manual_gas_price_gwei < 0.0 || self.gas.gas_limit_transaction == 0 {
            return Err(NonceError::Configuration(format!(
                "{} has invalid gas settings",
                self.ledger_id()
            )));
        }
        self.tracked_addresses().map(|_| ())
    }
}
