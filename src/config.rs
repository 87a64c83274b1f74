use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blockchain::chain::ChainOptions;
use crate::blockchain::consensus::ConsensusSettings;
use crate::blockchain::crypto::{CryptoError, Wallet};
use crate::blockchain::mempool::ReconnectPolicy;

/// Env var naming the JSON config file
pub const CONFIG_PATH_VAR: &str = "POA_LEDGER_CONFIG";

/// Errors that can occur while loading the node configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for {name}: {value}")]
    InvalidOverride { name: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid authority key: {0}")]
    AuthorityKey(#[from] CryptoError),
}

/// How submitted transactions reach block production
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    /// Straight into the consensus mechanism
    Direct,
    /// Through the mempool and its worker
    Mempool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub chain_id: u16,
    pub data_dir: PathBuf,
    pub difficulty: u16,
    pub transaction_fee: u64,
    pub seal_timeout_ms: u64,

    /// Hex secp256k1 secret of the authority
    pub authority_key: Option<String>,

    pub validator_id: String,
    pub ingest: IngestMode,
    pub http: HttpConfig,
    pub feed: ReconnectPolicy,
    pub pubsub_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            chain_id: 1,
            data_dir: PathBuf::from("data/ledger"),
            difficulty: 2,
            transaction_fee: 1,
            seal_timeout_ms: 30_000,
            authority_key: None,
            validator_id: "authority".to_string(),
            ingest: IngestMode::Direct,
            http: HttpConfig::default(),
            feed: ReconnectPolicy::default(),
            pubsub_capacity: 64,
        }
    }
}

fn parse_override<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidOverride { name, value })
}

impl NodeConfig {
    /// Reads a JSON config file; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// File named by `POA_LEDGER_CONFIG` (if set), then env overrides
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) => {
                info!("Loading configuration from {}", path);
                Self::from_file(Path::new(&path))?
            }
            Err(_) => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `POA_LEDGER_*` overrides looked up through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("POA_LEDGER_CHAIN_ID") {
            self.chain_id = parse_override("POA_LEDGER_CHAIN_ID", value)?;
        }
        if let Some(value) = lookup("POA_LEDGER_DATA_DIR") {
            self.data_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("POA_LEDGER_DIFFICULTY") {
            self.difficulty = parse_override("POA_LEDGER_DIFFICULTY", value)?;
        }
        if let Some(value) = lookup("POA_LEDGER_HTTP_PORT") {
            self.http.port = parse_override("POA_LEDGER_HTTP_PORT", value)?;
        }
        if let Some(value) = lookup("POA_LEDGER_AUTHORITY_KEY") {
            self.authority_key = Some(value);
        }
        if let Some(value) = lookup("POA_LEDGER_INGEST") {
            self.ingest = match value.to_ascii_lowercase().as_str() {
                "direct" => IngestMode::Direct,
                "mempool" => IngestMode::Mempool,
                _ => {
                    return Err(ConfigError::InvalidOverride {
                        name: "POA_LEDGER_INGEST",
                        value,
                    })
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.seal_timeout_ms == 0 {
            return Err(ConfigError::Invalid("seal_timeout_ms must be positive".to_string()));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("data_dir must not be empty".to_string()));
        }
        if self.feed.initial_delay_ms == 0 || self.feed.initial_delay_ms > self.feed.max_delay_ms {
            return Err(ConfigError::Invalid(
                "feed delays must satisfy 0 < initial_delay_ms <= max_delay_ms".to_string(),
            ));
        }
        if self.difficulty > 64 {
            return Err(ConfigError::Invalid("difficulty cannot exceed 64 hex digits".to_string()));
        }
        Ok(())
    }

    /// The configured authority, or a fresh one when no key is set
    pub fn authority_wallet(&self) -> Result<Wallet, ConfigError> {
        match &self.authority_key {
            Some(key) => Ok(Wallet::from_hex(key)?),
            None => {
                let wallet = Wallet::new();
                warn!(
                    "No authority key configured; generated {} (secret {})",
                    wallet.address(),
                    hex::encode(wallet.export_secret_key())
                );
                Ok(wallet)
            }
        }
    }

    pub fn chain_options(&self) -> ChainOptions {
        ChainOptions {
            chain_id: self.chain_id,
            validator_id: self.validator_id.clone(),
            consensus: ConsensusSettings {
                difficulty: self.difficulty,
                transaction_fee: self.transaction_fee,
                seal_timeout: Duration::from_millis(self.seal_timeout_ms),
            },
            feed: self.feed.clone(),
            pubsub_capacity: self.pubsub_capacity,
        }
    }
}
