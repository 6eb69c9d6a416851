use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::errors::ChainResult;
use crate::storage::Storage;
use crate::types::{
    Block, BlockReference, ChainedEvent, EpochFinalizationReceipt, FinalizationStatus,
    FinalizeEpochTx, FinalizeEventTx,
};

pub const FINALIZE_EVENT_TYPE: &str = "finalize_event";

/// Classic binary Merkle root over hex-digest strings: adjacent digests are
/// concatenated and hashed; an odd node is paired with itself. Empty input
/// yields the empty string.
pub fn merkle_root(hashes: &[String]) -> String {
    if hashes.is_empty() {
        return String::new();
    }
    let mut level: Vec<String> = hashes.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(pair[0].as_bytes());
            hasher.update(pair.get(1).unwrap_or(&pair[0]).as_bytes());
            next.push(hex::encode(hasher.finalize()));
        }
        level = next;
    }
    level.remove(0)
}

/// Canonical finalize-event transaction reconstructed from a stored event;
/// its canonical-JSON hash is the epoch Merkle leaf for that event.
fn finalize_tx_from_event(block: &Block, event: &ChainedEvent) -> FinalizeEventTx {
    FinalizeEventTx {
        tx_id: event.event_id.to_hex(),
        submit_record_tx: serde_json::Value::Null,
        finalizer_signature: String::new(),
        auth_token: String::new(),
        block: BlockReference {
            block_hash: block.block_id.to_hex(),
            epoch: block.epoch,
        },
        timestamp: event.timestamp,
        status: FinalizationStatus::Finalized,
        audit_log_id: String::new(),
    }
}

/// Gathers the canonical hashes of every finalize event in the given epoch,
/// ordered by `(block_height, event_index)`. Storage iteration order does
/// not matter; unreadable blocks are skipped loudly.
pub fn gather_finalized_event_hashes(storage: &Storage, epoch: u64) -> ChainResult<Vec<String>> {
    let mut entries: Vec<(u64, usize, String)> = Vec::new();
    for block_id in storage.list_block_ids()? {
        let block = match storage.get_block_decoded(&block_id) {
            Ok(block) => block,
            Err(err) => {
                warn!(%block_id, %err, "skipping unreadable block during epoch gather");
                continue;
            }
        };
        if block.epoch != epoch {
            continue;
        }
        for (index, event) in block.events.iter().enumerate() {
            if event.event_type != FINALIZE_EVENT_TYPE {
                continue;
            }
            let tx = finalize_tx_from_event(&block, event);
            match tx.canonical_hash() {
                Ok(hash) => entries.push((block.height, index, hash)),
                Err(err) => warn!(%err, "failed to hash finalize event"),
            }
        }
    }
    entries.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    Ok(entries.into_iter().map(|(_, _, hash)| hash).collect())
}

pub fn compute_epoch_merkle_root(storage: &Storage, epoch: u64) -> ChainResult<String> {
    let hashes = gather_finalized_event_hashes(storage, epoch)?;
    Ok(merkle_root(&hashes))
}

/// Seals an epoch: computes the Merkle summary, wraps it in a
/// [`FinalizeEpochTx`], and persists the result. Validation failures are
/// recorded on the receipt rather than unwinding the caller; the epoch
/// counter advances regardless.
pub fn finalize_epoch(
    storage: &Storage,
    epoch_number: u64,
    finalizer_signature: String,
    audit_log_id: String,
) -> ChainResult<(FinalizeEpochTx, EpochFinalizationReceipt)> {
    let root = compute_epoch_merkle_root(storage, epoch_number)?;
    let mut tx = FinalizeEpochTx::new(epoch_number, finalizer_signature, root);
    tx.audit_log_id = audit_log_id;
    tx.timestamp = Utc::now();

    if let Err(err) = tx.validate() {
        tx.status = "failed".into();
        let receipt = EpochFinalizationReceipt {
            tx_id: tx.tx_id.clone(),
            status: tx.status.clone(),
            epoch_number,
            timestamp: tx.timestamp,
            errors: vec![err.to_string()],
        };
        return Ok((tx, receipt));
    }

    tx.status = "finalized".into();
    storage.put_epoch_finalization(&tx)?;
    let receipt = EpochFinalizationReceipt {
        tx_id: tx.tx_id.clone(),
        status: tx.status.clone(),
        epoch_number,
        timestamp: tx.timestamp,
        errors: Vec::new(),
    };
    Ok((tx, receipt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::BlockCipher;
    use crate::types::Id;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn open_store(path: &std::path::Path) -> Storage {
        Storage::open(path, BlockCipher::new([5u8; 32])).expect("open storage")
    }

    fn hash_pair(a: &str, b: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(a.as_bytes());
        hasher.update(b.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn finalize_block(height: u64, epoch: u64, event_count: usize) -> Block {
        let mut block = Block {
            block_id: Id::zero(),
            version: "1.0.0".into(),
            protocol_version: "1.0.0".into(),
            height,
            prev_hash: if height == 0 {
                String::new()
            } else {
                // Parent linkage is irrelevant to epoch gathering.
                "11".repeat(32)
            },
            merkle_root: String::new(),
            timestamp: Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
            validator_did: "ed25519:bb".into(),
            op_units_used: 0,
            events: (0..event_count)
                .map(|i| ChainedEvent {
                    event_id: Id::new(format!("final-{height}-{i}").as_bytes()),
                    event_type: FINALIZE_EVENT_TYPE.into(),
                    timestamp: Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
                    finalized: true,
                    ..ChainedEvent::default()
                })
                .collect(),
            audit_log: Vec::new(),
            ban_events: Vec::new(),
            extra_data: Vec::new(),
            parent_gas_used: 0,
            state_root: String::new(),
            signature: Vec::new(),
            epoch,
        };
        block.block_id = block.compute_id();
        block
    }

    #[test]
    fn empty_set_has_empty_root() {
        assert_eq!(merkle_root(&[]), "");
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let leaf = "ab".repeat(32);
        assert_eq!(merkle_root(&[leaf.clone()]), leaf);
    }

    #[test]
    fn odd_level_duplicates_the_lone_node() {
        let leaves: Vec<String> = ["aa", "bb", "cc"]
            .iter()
            .map(|s| s.repeat(32))
            .collect();
        let left = hash_pair(&leaves[0], &leaves[1]);
        let right = hash_pair(&leaves[2], &leaves[2]);
        assert_eq!(merkle_root(&leaves), hash_pair(&left, &right));
    }

    #[test]
    fn four_leaves_build_a_balanced_tree() {
        let leaves: Vec<String> = ["aa", "bb", "cc", "dd"]
            .iter()
            .map(|s| s.repeat(32))
            .collect();
        let left = hash_pair(&leaves[0], &leaves[1]);
        let right = hash_pair(&leaves[2], &leaves[3]);
        assert_eq!(merkle_root(&leaves), hash_pair(&left, &right));
    }

    #[test]
    fn epoch_root_is_insensitive_to_storage_order() {
        let blocks: Vec<Block> = (0..4).map(|h| finalize_block(h, 0, 1)).collect();

        let dir_a = tempdir().expect("tempdir");
        let store_a = open_store(dir_a.path());
        for block in &blocks {
            store_a
                .put_block(&block.block_id, &block.serialize().expect("serialize"))
                .expect("put");
        }

        let dir_b = tempdir().expect("tempdir");
        let store_b = open_store(dir_b.path());
        for block in blocks.iter().rev() {
            store_b
                .put_block(&block.block_id, &block.serialize().expect("serialize"))
                .expect("put");
        }

        let root_a = compute_epoch_merkle_root(&store_a, 0).expect("root a");
        let root_b = compute_epoch_merkle_root(&store_b, 0).expect("root b");
        assert!(!root_a.is_empty());
        assert_eq!(root_a, root_b);
    }

    #[test]
    fn gather_orders_by_height_then_event_index() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let block_a = finalize_block(1, 0, 2);
        let block_b = finalize_block(0, 0, 1);
        for block in [&block_a, &block_b] {
            store
                .put_block(&block.block_id, &block.serialize().expect("serialize"))
                .expect("put");
        }
        let hashes = gather_finalized_event_hashes(&store, 0).expect("gather");
        assert_eq!(hashes.len(), 3);
        let tx = finalize_tx_from_event(&block_b, &block_b.events[0]);
        assert_eq!(hashes[0], tx.canonical_hash().expect("hash"));
    }

    #[test]
    fn other_epochs_are_excluded() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        for (height, epoch) in [(0u64, 0u64), (1, 0), (2, 1)] {
            let block = finalize_block(height, epoch, 1);
            store
                .put_block(&block.block_id, &block.serialize().expect("serialize"))
                .expect("put");
        }
        assert_eq!(
            gather_finalized_event_hashes(&store, 0).expect("gather").len(),
            2
        );
        assert_eq!(
            gather_finalized_event_hashes(&store, 1).expect("gather").len(),
            1
        );
    }

    #[test]
    fn finalize_epoch_persists_a_sealed_tx() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let block = finalize_block(0, 0, 1);
        store
            .put_block(&block.block_id, &block.serialize().expect("serialize"))
            .expect("put");
        let (tx, receipt) =
            finalize_epoch(&store, 0, "sig".into(), String::new()).expect("finalize");
        assert_eq!(receipt.status, "finalized");
        let stored = store
            .get_epoch_finalization(0)
            .expect("get")
            .expect("present");
        assert_eq!(stored.epoch_summary_hash, tx.epoch_summary_hash);
    }

    #[test]
    fn finalize_epoch_without_signature_fails_softly() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let (tx, receipt) =
            finalize_epoch(&store, 0, String::new(), String::new()).expect("finalize");
        assert_eq!(tx.status, "failed");
        assert_eq!(receipt.errors.len(), 1);
        assert!(store.get_epoch_finalization(0).expect("get").is_none());
    }
}
