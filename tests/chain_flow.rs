use carechain::crypto::BlockCipher;
use carechain::ledger::{Acceptance, ChainState};
use carechain::mempool::Mempool;
use carechain::storage::Storage;
use carechain::types::{Block, ChainedEvent, Id};
use chrono::Utc;
use tempfile::tempdir;

const EPOCH_BLOCK_COUNT: u64 = 4;

fn open_store(path: &std::path::Path) -> Storage {
    Storage::open(path, BlockCipher::new([6u8; 32])).expect("open storage")
}

fn make_block(height: u64, prev: &str, tag: &str) -> Block {
    let mut block = Block {
        block_id: Id::zero(),
        version: "1.0.0".into(),
        protocol_version: "1.0.0".into(),
        height,
        prev_hash: prev.to_string(),
        merkle_root: String::new(),
        timestamp: Utc::now(),
        validator_did: "ed25519:ee".into(),
        op_units_used: 0,
        events: vec![ChainedEvent {
            event_id: Id::new(format!("{tag}-{height}").as_bytes()),
            event_type: "medical_record".into(),
            timestamp: Utc::now(),
            author_validator: Id::new(tag.as_bytes()),
            ..ChainedEvent::default()
        }],
        audit_log: Vec::new(),
        ban_events: Vec::new(),
        extra_data: Vec::new(),
        parent_gas_used: 0,
        state_root: String::new(),
        signature: Vec::new(),
        epoch: if height == 0 {
            0
        } else {
            (height - 1) / EPOCH_BLOCK_COUNT
        },
    };
    block.block_id = block.compute_id();
    block
}

/// Builds a chain of `len` blocks (genesis included) on `state`, returning
/// the accepted blocks.
fn grow_chain(
    store: &Storage,
    mempool: &Mempool,
    state: &mut ChainState,
    from: &[Block],
    len: u64,
    tag: &str,
) -> Vec<Block> {
    let mut blocks: Vec<Block> = from.to_vec();
    let mut prev = blocks
        .last()
        .map(|block| block.block_id.to_hex())
        .unwrap_or_default();
    let start = blocks.last().map(|block| block.height + 1).unwrap_or(0);
    for height in start..start + len {
        let block = make_block(height, &prev, tag);
        prev = block.block_id.to_hex();
        let outcome = state
            .accept_block(store, mempool, &block, EPOCH_BLOCK_COUNT, None)
            .expect("accept");
        assert_eq!(outcome, Acceptance::Extended);
        blocks.push(block);
    }
    blocks
}

#[test]
fn divergent_chain_rolls_back_to_fork_point_and_reapplies() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());
    let mempool = Mempool::new(64);
    let mut state = ChainState::new(hex::encode([1u8; 32]));

    // Local chain: genesis..height 4 on the "b" fork.
    let shared = grow_chain(&store, &mempool, &mut state, &[], 4, "shared");
    let local = grow_chain(&store, &mempool, &mut state, &shared, 1, "b");
    assert_eq!(state.chain_height(), 4);

    // A peer diverged after height 3 and advanced to height 6.
    let fork_point = shared[3].clone();
    let mut peer_side = Vec::new();
    let mut prev = fork_point.block_id.to_hex();
    for height in 4..=6u64 {
        let block = make_block(height, &prev, "a");
        prev = block.block_id.to_hex();
        peer_side.push(block);
    }

    // Fork choice resolved the fork point; roll back and apply peer blocks.
    store.rollback_to(&fork_point.block_id).expect("rollback");
    state.reset_to(&fork_point, EPOCH_BLOCK_COUNT);
    assert_eq!(state.chain_height(), 3);
    assert!(!store.has_block(&local[4].block_id).expect("local dropped"));

    for block in &peer_side {
        let outcome = state
            .accept_block(&store, &mempool, block, EPOCH_BLOCK_COUNT, None)
            .expect("apply");
        assert_eq!(outcome, Acceptance::Extended);
    }

    // Fork-choice monotonicity: local tip and height now match the peer.
    let peer_tip = peer_side.last().expect("peer tip");
    assert_eq!(state.tip, peer_tip.block_id);
    assert_eq!(state.chain_height(), 6);
    for block in &peer_side {
        assert_eq!(
            store.block_id_by_height(block.height).expect("index"),
            block.block_id
        );
    }
}

#[test]
fn orphans_feed_the_mempool_and_leave_the_chain_unchanged() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());
    let mempool = Mempool::new(64);
    let mut state = ChainState::new(hex::encode([1u8; 32]));

    let chain = grow_chain(&store, &mempool, &mut state, &[], 3, "main");
    let tip_before = state.tip;

    let orphan = make_block(7, &"99".repeat(32), "stray");
    let orphan_event = orphan.events[0].event_id.to_hex();
    let outcome = state
        .accept_block(&store, &mempool, &orphan, EPOCH_BLOCK_COUNT, None)
        .expect("offer orphan");
    assert_eq!(outcome, Acceptance::Orphaned);
    assert_eq!(state.tip, tip_before);
    assert_eq!(state.chain_height(), chain.last().expect("tip").height);
    assert!(mempool.contains(&orphan_event));
}

#[test]
fn chain_survives_a_store_reopen() {
    let dir = tempdir().expect("tempdir");
    let tip = {
        let store = open_store(dir.path());
        let mempool = Mempool::new(64);
        let mut state = ChainState::new(hex::encode([1u8; 32]));
        grow_chain(&store, &mempool, &mut state, &[], 5, "persist");
        state.tip
    };

    let store = open_store(dir.path());
    let (recovered_tip, height) = store.recover_tip().expect("recover").expect("tip found");
    assert_eq!(recovered_tip, tip);
    assert_eq!(height, 4);
    for h in 0..=4u64 {
        let block = store.get_by_height(h).expect("block decrypts");
        assert_eq!(block.height, h);
    }
}
