use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};

/// Environment overrides honored at startup.
pub const BLOCK_TIME_ENV: &str = "BLOCK_TIME_MS";
pub const BLOCK_PRODUCER_ENV: &str = "BLOCK_PRODUCER";
pub const FINALIZER_PUBKEY_ENV: &str = "FINALIZER_PUBKEY";
pub const FINALIZER_KEY_PATH_ENV: &str = "FINALIZER_PRIVATE_KEY_PATH";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub key_path: PathBuf,
    pub api_listen: SocketAddr,
    pub p2p_listen: SocketAddr,
    #[serde(default = "default_block_time_ms")]
    pub block_time_ms: u64,
    #[serde(default = "default_fallback_grace_ms")]
    pub fallback_grace_ms: u64,
    #[serde(default = "default_mempool_limit")]
    pub mempool_limit: usize,
    #[serde(default = "default_max_block_transactions")]
    pub max_block_transactions: usize,
    #[serde(default = "default_genesis_path")]
    pub genesis_path: PathBuf,
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    #[serde(default)]
    pub produce_blocks: bool,
    #[serde(default)]
    pub finalizer_pubkey: Option<String>,
    #[serde(default)]
    pub finalizer_key_path: Option<PathBuf>,
}

fn default_block_time_ms() -> u64 {
    3_000
}

fn default_fallback_grace_ms() -> u64 {
    500
}

fn default_mempool_limit() -> usize {
    1_000
}

fn default_max_block_transactions() -> usize {
    512
}

fn default_genesis_path() -> PathBuf {
    PathBuf::from("genesis.json")
}

impl NodeConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))?;
        config.apply_env();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    /// Environment variables win over the file for the operational knobs.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var(BLOCK_TIME_ENV) {
            if let Ok(ms) = value.parse() {
                self.block_time_ms = ms;
            }
        }
        if let Ok(value) = std::env::var(BLOCK_PRODUCER_ENV) {
            self.produce_blocks = value == "1";
        }
        if let Ok(value) = std::env::var(FINALIZER_PUBKEY_ENV) {
            if !value.is_empty() {
                self.finalizer_pubkey = Some(value);
            }
        }
        if let Ok(value) = std::env::var(FINALIZER_KEY_PATH_ENV) {
            if !value.is_empty() {
                self.finalizer_key_path = Some(PathBuf::from(value));
            }
        }
    }

    pub fn ensure_directories(&self) -> ChainResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        if let Some(parent) = self.key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            key_path: PathBuf::from("./identity.key"),
            api_listen: "127.0.0.1:8080".parse().expect("valid socket addr"),
            p2p_listen: "127.0.0.1:3000".parse().expect("valid socket addr"),
            block_time_ms: default_block_time_ms(),
            fallback_grace_ms: default_fallback_grace_ms(),
            mempool_limit: default_mempool_limit(),
            max_block_transactions: default_max_block_transactions(),
            genesis_path: default_genesis_path(),
            bootstrap_peers: Vec::new(),
            produce_blocks: false,
            finalizer_pubkey: None,
            finalizer_key_path: None,
        }
    }
}
