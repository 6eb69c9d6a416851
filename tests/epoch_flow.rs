use carechain::crypto::BlockCipher;
use carechain::epoch::{compute_epoch_merkle_root, gather_finalized_event_hashes, merkle_root};
use carechain::ledger::{Acceptance, ChainState};
use carechain::mempool::Mempool;
use carechain::storage::Storage;
use carechain::types::{Block, ChainedEvent, Id};
use chrono::{TimeZone, Utc};
use sha2::{Digest, Sha256};
use tempfile::tempdir;

const EPOCH_BLOCK_COUNT: u64 = 4;

fn open_store(path: &std::path::Path) -> Storage {
    Storage::open(path, BlockCipher::new([8u8; 32])).expect("open storage")
}

fn block_with_finalize_event(height: u64, prev: &str) -> Block {
    let epoch = if height == 0 {
        0
    } else {
        (height - 1) / EPOCH_BLOCK_COUNT
    };
    let events = if height == 0 {
        vec![ChainedEvent {
            event_id: Id::new(b"genesis"),
            event_type: "genesis".into(),
            timestamp: Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap(),
            ..ChainedEvent::default()
        }]
    } else {
        vec![ChainedEvent {
            event_id: Id::new(format!("finalize-{height}").as_bytes()),
            event_type: "finalize_event".into(),
            timestamp: Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap(),
            finalized: true,
            ..ChainedEvent::default()
        }]
    };
    let mut block = Block {
        block_id: Id::zero(),
        version: "1.0.0".into(),
        protocol_version: "1.0.0".into(),
        height,
        prev_hash: prev.to_string(),
        merkle_root: String::new(),
        timestamp: Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap(),
        validator_did: "ed25519:ff".into(),
        op_units_used: 0,
        events,
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

fn hash_pair(a: &str, b: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(a.as_bytes());
    hasher.update(b.as_bytes());
    hex::encode(hasher.finalize())
}

#[test]
fn epoch_seals_after_four_finalize_blocks() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());
    let mempool = Mempool::new(32);
    let mut state = ChainState::new(hex::encode([1u8; 32]));

    let mut prev = String::new();
    for height in 0..=EPOCH_BLOCK_COUNT {
        let block = block_with_finalize_event(height, &prev);
        prev = block.block_id.to_hex();
        let outcome = state
            .accept_block(&store, &mempool, &block, EPOCH_BLOCK_COUNT, None)
            .expect("accept");
        assert_eq!(outcome, Acceptance::Extended);
    }

    // Four post-genesis blocks close epoch 0.
    assert_eq!(state.epoch, 1);
    assert_eq!(state.blocks_in_epoch, 0);
    assert_eq!(store.load_epoch_state().expect("state"), (1, 0));

    // The epoch summary equals the classic binary Merkle root of the four
    // canonical event hashes in (height, event_index) order.
    let hashes = gather_finalized_event_hashes(&store, 0).expect("gather");
    assert_eq!(hashes.len(), 4);
    let left = hash_pair(&hashes[0], &hashes[1]);
    let right = hash_pair(&hashes[2], &hashes[3]);
    let expected = hash_pair(&left, &right);
    assert_eq!(merkle_root(&hashes), expected);
    assert_eq!(compute_epoch_merkle_root(&store, 0).expect("root"), expected);
}

#[test]
fn epoch_root_is_retryable_from_stored_blocks() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());
    let mempool = Mempool::new(32);
    let mut state = ChainState::new(hex::encode([1u8; 32]));

    let mut prev = String::new();
    for height in 0..=EPOCH_BLOCK_COUNT {
        let block = block_with_finalize_event(height, &prev);
        prev = block.block_id.to_hex();
        state
            .accept_block(&store, &mempool, &block, EPOCH_BLOCK_COUNT, None)
            .expect("accept");
    }

    let first = compute_epoch_merkle_root(&store, 0).expect("first");
    let second = compute_epoch_merkle_root(&store, 0).expect("second");
    assert!(!first.is_empty());
    assert_eq!(first, second);
}
