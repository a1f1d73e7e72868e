//! Environment-based Configuration for the Channel Store
//!
//! # Environment Variables
//!
//! - `CHANSTORE_NETWORK` - "mainnet", "testnet", "signet" or "regtest" (default: "regtest")
//! - `CHANSTORE_DB_PATH` - SQLite database file (default: `~/.chanstore/<network>/lightningd.sqlite3`)
//! - `CHANSTORE_FEE_BASE` - Base forwarding fee in msat, used when seeding channel fee policy (default: 1000)
//! - `CHANSTORE_FEE_PPM` - Proportional forwarding fee in parts per million (default: 10)
//! - `CHANSTORE_LOG_LEVEL` - Logging level (trace, debug, info, warn, error)
//! - `CHANSTORE_LOG_JSON` - Set to "1" or "true" for JSON log output

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

use bitcoin::hashes::Hash;
use bitcoin::BlockHash;

use crate::db::migrations::MigrationContext;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Chain the node runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Signet,
    Regtest,
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" | "bitcoin" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "signet" => Ok(Network::Signet),
            "regtest" => Ok(Network::Regtest),
            _ => Err(ConfigError::InvalidValue(
                "CHANSTORE_NETWORK".to_string(),
                format!("unknown network: {}", s),
            )),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
            Network::Signet => write!(f, "signet"),
            Network::Regtest => write!(f, "regtest"),
        }
    }
}

impl Network {
    /// Get bitcoin network enum
    pub fn bitcoin_network(&self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Signet => bitcoin::Network::Signet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }

    /// Hash of the chain's genesis block, the value guarded in `vars`
    pub fn genesis_hash(&self) -> BlockHash {
        bitcoin::constants::genesis_block(self.bitcoin_network()).block_hash()
    }

    /// Genesis hash as raw bytes
    pub fn genesis_bytes(&self) -> [u8; 32] {
        self.genesis_hash().to_byte_array()
    }
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Chain the store belongs to
    pub network: Network,

    /// Database file
    pub db_path: PathBuf,

    /// Base forwarding fee (msat)
    pub fee_base: u32,

    /// Proportional forwarding fee (ppm)
    pub fee_per_satoshi: u32,

    /// Log level
    pub log_level: String,

    /// Emit JSON logs
    pub log_json: bool,
}

impl StoreConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let network: Network = env::var("CHANSTORE_NETWORK")
            .unwrap_or_else(|_| "regtest".to_string())
            .parse()?;

        let db_path = match env::var("CHANSTORE_DB_PATH") {
            Ok(path) => PathBuf::from(path),
            Err(_) => default_db_path(network)?,
        };

        let fee_base = parse_u32("CHANSTORE_FEE_BASE", 1000)?;
        let fee_per_satoshi = parse_u32("CHANSTORE_FEE_PPM", 10)?;

        let log_level = env::var("CHANSTORE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_json = env::var("CHANSTORE_LOG_JSON")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            network,
            db_path,
            fee_base,
            fee_per_satoshi,
            log_level,
            log_json,
        })
    }

    /// Configuration for tests and tools: regtest, default fee policy
    pub fn for_network(network: Network, db_path: impl Into<PathBuf>) -> Self {
        Self {
            network,
            db_path: db_path.into(),
            fee_base: 1000,
            fee_per_satoshi: 10,
            log_level: "info".to_string(),
            log_json: false,
        }
    }

    /// Host-side parameters needed by callback migrations
    pub fn migration_context(&self) -> MigrationContext {
        MigrationContext {
            fee_base: self.fee_base,
            fee_ppm: self.fee_per_satoshi,
        }
    }
}

fn default_db_path(network: Network) -> Result<PathBuf, ConfigError> {
    let home = env::var("HOME").map_err(|_| ConfigError::MissingEnvVar("HOME".to_string()))?;
    Ok(PathBuf::from(home)
        .join(".chanstore")
        .join(network.to_string())
        .join("lightningd.sqlite3"))
}

fn parse_u32(var: &str, default: u32) -> Result<u32, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue(var.to_string(), value)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_parsing() {
        assert_eq!("mainnet".parse::<Network>().unwrap(), Network::Mainnet);
        assert_eq!("BITCOIN".parse::<Network>().unwrap(), Network::Mainnet);
        assert_eq!("regtest".parse::<Network>().unwrap(), Network::Regtest);
        assert!("liquid".parse::<Network>().is_err());
    }

    #[test]
    fn test_genesis_hashes_differ() {
        assert_ne!(Network::Mainnet.genesis_bytes(), Network::Regtest.genesis_bytes());
        assert_eq!(
            Network::Mainnet.genesis_hash().to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn test_migration_context() {
        let config = StoreConfig::for_network(Network::Regtest, "/tmp/test.sqlite3");
        let ctx = config.migration_context();
        assert_eq!(ctx.fee_base, 1000);
        assert_eq!(ctx.fee_ppm, 10);
    }
}
