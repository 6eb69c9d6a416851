use std::fs;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{ChainError, ChainResult};
use crate::types::{Block, ChainedEvent, Id};

/// Multi-party signatures required before a genesis block may be minted.
const SIGNATURE_THRESHOLD: usize = 2;

pub const GENESIS_EVENT_TYPE: &str = "genesis";
const GENESIS_DESCRIPTION: &str = "First light of the care ledger.";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidatorConfig {
    pub did: String,
    #[serde(rename = "pubKey")]
    pub pub_key: String,
    #[serde(default)]
    pub bond: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitialParams {
    #[serde(rename = "tokenId", default)]
    pub token_id: String,
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(rename = "blockTime", default)]
    pub block_time: u64,
    #[serde(rename = "maxBlockSize", default)]
    pub max_block_size: u64,
    #[serde(rename = "confirmationDepth", default)]
    pub confirmation_depth: u64,
    #[serde(rename = "epochBlockCount", default = "default_epoch_block_count")]
    pub epoch_block_count: u64,
}

fn default_epoch_block_count() -> u64 {
    4
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisConfig {
    #[serde(default)]
    pub signatures: Vec<String>,
    #[serde(rename = "chainId")]
    pub chain_id: String,
    #[serde(rename = "genesisTime")]
    pub genesis_time: DateTime<Utc>,
    #[serde(rename = "initialValidators", default)]
    pub initial_validators: Vec<ValidatorConfig>,
    #[serde(rename = "initialParams")]
    pub initial_params: InitialParams,
    #[serde(rename = "initialSchemaHash", default)]
    pub initial_schema_hash: String,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            signatures: vec!["genesis-signer-a".into(), "genesis-signer-b".into()],
            chain_id: "carechain-local".into(),
            genesis_time: Utc.with_ymd_and_hms(2024, 4, 30, 0, 0, 0).unwrap(),
            initial_validators: Vec::new(),
            initial_params: InitialParams {
                token_id: String::new(),
                protocol_version: "1.0.0".into(),
                block_time: 3_000,
                max_block_size: 0,
                confirmation_depth: 0,
                epoch_block_count: default_epoch_block_count(),
            },
            initial_schema_hash: String::new(),
        }
    }
}

pub fn load_genesis_config(path: &Path) -> ChainResult<GenesisConfig> {
    let raw = fs::read_to_string(path)
        .map_err(|err| ChainError::Config(format!("could not open genesis config: {err}")))?;
    serde_json::from_str(&raw)
        .map_err(|err| ChainError::Config(format!("could not parse genesis config: {err}")))
}

/// Builds the height-0 block from the genesis configuration. A digest of
/// the configuration itself is anchored in `extra_data` so later audits can
/// tie the chain to the ceremony that started it.
pub fn create_genesis_block(cfg: &GenesisConfig) -> ChainResult<Block> {
    if cfg.signatures.len() < SIGNATURE_THRESHOLD {
        return Err(ChainError::Config(format!(
            "genesis requires {SIGNATURE_THRESHOLD} signatures, found {}",
            cfg.signatures.len()
        )));
    }
    let validator_did = cfg
        .initial_validators
        .first()
        .map(|validator| validator.did.clone())
        .unwrap_or_else(|| "did:carechain:genesis".into());

    let event_seed = format!(
        "{GENESIS_DESCRIPTION}{}",
        cfg.genesis_time
            .to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
    );
    let genesis_event = ChainedEvent {
        event_id: Id::new(event_seed.as_bytes()),
        event_type: GENESIS_EVENT_TYPE.into(),
        description: GENESIS_DESCRIPTION.into(),
        timestamp: cfg.genesis_time,
        ..ChainedEvent::default()
    };

    let audit_anchor = Id::new(&serde_json::to_vec(cfg)?);
    let mut block = Block {
        block_id: Id::zero(),
        version: cfg.initial_params.protocol_version.clone(),
        protocol_version: cfg.initial_params.protocol_version.clone(),
        height: 0,
        prev_hash: String::new(),
        merkle_root: cfg.initial_schema_hash.clone(),
        timestamp: cfg.genesis_time,
        validator_did,
        op_units_used: 0,
        events: vec![genesis_event],
        audit_log: Vec::new(),
        ban_events: Vec::new(),
        extra_data: audit_anchor.as_bytes().to_vec(),
        parent_gas_used: 0,
        state_root: String::new(),
        signature: Vec::new(),
        epoch: 0,
    };
    block.block_id = block.compute_id();
    info!(block_id = %block.block_id, chain_id = %cfg.chain_id, "created genesis block");
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn genesis_block_is_deterministic_for_a_config() {
        let cfg = GenesisConfig::default();
        let a = create_genesis_block(&cfg).expect("genesis");
        let b = create_genesis_block(&cfg).expect("genesis");
        assert_eq!(a.block_id, b.block_id);
        assert_eq!(a.height, 0);
        assert!(a.is_genesis());
        assert_eq!(a.events[0].event_type, GENESIS_EVENT_TYPE);
        assert_eq!(a.extra_data.len(), 32);
    }

    #[test]
    fn signature_threshold_gates_creation() {
        let mut cfg = GenesisConfig::default();
        cfg.signatures = vec!["only-one".into()];
        assert!(create_genesis_block(&cfg).is_err());
    }

    #[test]
    fn config_loads_from_json() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("genesis.json");
        let cfg = GenesisConfig::default();
        std::fs::write(&path, serde_json::to_vec_pretty(&cfg).expect("encode")).expect("write");
        let loaded = load_genesis_config(&path).expect("load");
        assert_eq!(loaded.chain_id, cfg.chain_id);
        assert_eq!(loaded.initial_params.epoch_block_count, 4);
    }

    #[test]
    fn validator_did_comes_from_config_when_present() {
        let mut cfg = GenesisConfig::default();
        cfg.initial_validators.push(ValidatorConfig {
            did: "did:carechain:val-1".into(),
            pub_key: "aa".repeat(32),
            bond: 10,
        });
        let block = create_genesis_block(&cfg).expect("genesis");
        assert_eq!(block.validator_did, "did:carechain:val-1");
    }
}
