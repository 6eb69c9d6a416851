use std::collections::HashSet;

use ed25519_dalek::{Keypair, Signer};
use tracing::{info, warn};

use crate::consensus::ProducerSet;
use crate::epoch;
use crate::errors::ChainResult;
use crate::mempool::Mempool;
use crate::network::PeerTable;
use crate::storage::Storage;
use crate::types::{Block, Id, Transaction};

/// Outcome of offering a block to the chain head.
#[derive(Debug, PartialEq, Eq)]
pub enum Acceptance {
    AlreadyTip,
    Extended,
    Orphaned,
}

/// In-memory chain head and the shared maps guarded by the tip lock: peer
/// table, producer set, recent-block dedup set, epoch counters. Everything
/// here is reconstructible from storage at startup.
pub struct ChainState {
    pub tip: Id,
    pub height: u64,
    pub epoch: u64,
    pub blocks_in_epoch: u64,
    pub recent_blocks: HashSet<String>,
    pub peers: PeerTable,
    pub producers: ProducerSet,
    pub consecutive_fallbacks: u64,
}

impl ChainState {
    pub fn new(own_producer_key: String) -> Self {
        Self {
            tip: Id::zero(),
            height: 0,
            epoch: 0,
            blocks_in_epoch: 0,
            recent_blocks: HashSet::new(),
            peers: PeerTable::new(),
            producers: ProducerSet::new(own_producer_key),
            consecutive_fallbacks: 0,
        }
    }

    /// Height of the canonical chain, read from the cached tip.
    pub fn chain_height(&self) -> u64 {
        self.height
    }

    pub fn tip_hex(&self) -> String {
        self.tip.to_hex()
    }

    /// Marks a block id as recently seen; returns false if it already was.
    pub fn note_recent(&mut self, block_id_hex: &str) -> bool {
        self.recent_blocks.insert(block_id_hex.to_string())
    }

    /// Offers a block at the chain head. Runs entirely under the tip lock:
    /// either the block is the tip already, extends it (persist + tip move +
    /// epoch accounting), or it is an orphan (events reclaimed, block
    /// dropped) and the caller should launch a fork-choice reorg.
    pub fn accept_block(
        &mut self,
        storage: &Storage,
        mempool: &Mempool,
        block: &Block,
        epoch_block_count: u64,
        epoch_signer: Option<&Keypair>,
    ) -> ChainResult<Acceptance> {
        if block.block_id == self.tip {
            return Ok(Acceptance::AlreadyTip);
        }

        let extends_tip = block.prev_hash == self.tip_hex();
        let starts_chain = block.is_genesis() && self.tip.is_zero();
        if !extends_tip && !starts_chain {
            warn!(
                block_id = %block.block_id,
                prev_hash = %block.prev_hash,
                tip = %self.tip,
                "orphan block; reclaiming events"
            );
            self.reclaim_orphan(storage, mempool, block);
            return Ok(Acceptance::Orphaned);
        }

        for ban in &block.ban_events {
            match ban.expiry_time() {
                Ok(expiry) => self.peers.apply_ban_event(storage, &ban.address, expiry),
                Err(err) => warn!(address = %ban.address, %err, "ignoring malformed ban event"),
            }
        }

        storage.put_block(&block.block_id, &block.serialize()?)?;
        storage.set_latest_block_id(&block.block_id)?;
        self.tip = block.block_id;
        self.height = block.height;
        self.note_recent(&block.block_id.to_hex());
        self.consecutive_fallbacks = 0;
        // Genesis seeds the chain but does not count toward the epoch
        // window; epoch e closes when block (e+1)·N lands.
        if block.height > 0 {
            self.advance_epoch(storage, epoch_block_count, epoch_signer)?;
        }
        info!(height = block.height, block_id = %block.block_id, "block accepted");
        Ok(Acceptance::Extended)
    }

    /// Returns every event of the orphan to the mempool, keyed by event id
    /// with the author validator as sender, then drops the block from
    /// storage if it ever landed there.
    fn reclaim_orphan(&mut self, storage: &Storage, mempool: &Mempool, block: &Block) {
        for event in &block.events {
            let payload = serde_json::to_vec(event).unwrap_or_default();
            mempool.add(Transaction {
                tx_id: event.event_id.to_hex(),
                payload,
                timestamp: event.timestamp.timestamp(),
                sender: event.author_validator.to_hex(),
            });
        }
        self.recent_blocks.remove(&block.block_id.to_hex());
        if let Err(err) = storage.delete_block(&block.block_id) {
            warn!(block_id = %block.block_id, %err, "failed to drop orphan block");
        }
    }

    /// Counts the block toward the current epoch; on the boundary, seals
    /// the closing epoch with its Merkle summary and rolls the counters.
    /// Finalization failures are logged and the epoch advances anyway; the
    /// root stays recomputable from stored blocks.
    pub fn advance_epoch(
        &mut self,
        storage: &Storage,
        epoch_block_count: u64,
        signer: Option<&Keypair>,
    ) -> ChainResult<()> {
        self.blocks_in_epoch += 1;
        if epoch_block_count > 0 && self.blocks_in_epoch >= epoch_block_count {
            let closing = self.epoch;
            let signature = match (signer, epoch::compute_epoch_merkle_root(storage, closing)) {
                (Some(keypair), Ok(root)) => {
                    hex::encode(keypair.sign(root.as_bytes()).to_bytes())
                }
                _ => String::new(),
            };
            match epoch::finalize_epoch(storage, closing, signature, String::new()) {
                Ok((tx, receipt)) => {
                    info!(
                        epoch = closing,
                        status = %receipt.status,
                        summary = %tx.epoch_summary_hash,
                        "epoch sealed"
                    );
                }
                Err(err) => warn!(epoch = closing, %err, "epoch finalization failed"),
            }
            self.epoch += 1;
            self.blocks_in_epoch = 0;
        }
        storage.save_epoch_state(self.epoch, self.blocks_in_epoch)?;
        Ok(())
    }

    /// Re-derives the head caches after a storage rollback to `fork_block`.
    pub fn reset_to(&mut self, fork_block: &Block, epoch_block_count: u64) {
        self.tip = fork_block.block_id;
        self.height = fork_block.height;
        if epoch_block_count > 0 {
            self.epoch = fork_block.height / epoch_block_count;
            self.blocks_in_epoch = fork_block.height % epoch_block_count;
        }
        self.recent_blocks.clear();
        self.note_recent(&fork_block.block_id.to_hex());
    }

    /// Helper used by gossip refresh after handshakes: `host:api_port`
    /// addresses of every known peer.
    pub fn gossip_targets(&self) -> Vec<String> {
        self.peers
            .list()
            .into_iter()
            .map(|peer| format!("{}:{}", peer.host(), peer.api_port))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::BlockCipher;
    use chrono::Utc;
    use tempfile::tempdir;

    use crate::types::{BanEvent, ChainedEvent};

    fn open_store(path: &std::path::Path) -> Storage {
        Storage::open(path, BlockCipher::new([2u8; 32])).expect("open storage")
    }

    fn new_state() -> ChainState {
        ChainState::new(hex::encode([1u8; 32]))
    }

    fn block_on(prev: &str, height: u64, epoch: u64) -> Block {
        let mut block = Block {
            block_id: Id::zero(),
            version: "1.0.0".into(),
            protocol_version: "1.0.0".into(),
            height,
            prev_hash: prev.to_string(),
            merkle_root: String::new(),
            timestamp: Utc::now(),
            validator_did: "ed25519:cc".into(),
            op_units_used: 0,
            events: vec![ChainedEvent {
                event_id: Id::new(format!("e-{height}").as_bytes()),
                event_type: "medical_record".into(),
                timestamp: Utc::now(),
                author_validator: Id::new(b"author"),
                ..ChainedEvent::default()
            }],
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
    fn genesis_starts_an_empty_chain() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let mempool = Mempool::new(16);
        let mut state = new_state();
        let genesis = block_on("", 0, 0);
        let outcome = state
            .accept_block(&store, &mempool, &genesis, 4, None)
            .expect("accept");
        assert_eq!(outcome, Acceptance::Extended);
        assert_eq!(state.tip, genesis.block_id);
        assert_eq!(state.chain_height(), 0);
        assert!(store.has_block(&genesis.block_id).expect("stored"));
    }

    #[test]
    fn extending_block_moves_tip_and_counts_epoch() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let mempool = Mempool::new(16);
        let mut state = new_state();
        let genesis = block_on("", 0, 0);
        state
            .accept_block(&store, &mempool, &genesis, 4, None)
            .expect("genesis");
        let next = block_on(&genesis.block_id.to_hex(), 1, 0);
        let outcome = state
            .accept_block(&store, &mempool, &next, 4, None)
            .expect("accept");
        assert_eq!(outcome, Acceptance::Extended);
        assert_eq!(state.tip, next.block_id);
        assert_eq!(state.blocks_in_epoch, 1);
        assert_eq!(state.epoch, 0);
        assert_eq!(store.load_epoch_state().expect("persisted"), (0, 1));
    }

    #[test]
    fn duplicate_tip_is_a_no_op() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let mempool = Mempool::new(16);
        let mut state = new_state();
        let genesis = block_on("", 0, 0);
        state
            .accept_block(&store, &mempool, &genesis, 4, None)
            .expect("genesis");
        let outcome = state
            .accept_block(&store, &mempool, &genesis, 4, None)
            .expect("again");
        assert_eq!(outcome, Acceptance::AlreadyTip);
        assert_eq!(state.blocks_in_epoch, 0);
    }

    #[test]
    fn orphans_reclaim_events_into_the_mempool() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let mempool = Mempool::new(16);
        let mut state = new_state();
        let genesis = block_on("", 0, 0);
        state
            .accept_block(&store, &mempool, &genesis, 4, None)
            .expect("genesis");
        let orphan = block_on(&"dd".repeat(32), 5, 1);
        let orphan_event = orphan.events[0].event_id.to_hex();
        let outcome = state
            .accept_block(&store, &mempool, &orphan, 4, None)
            .expect("orphan");
        assert_eq!(outcome, Acceptance::Orphaned);
        assert_eq!(state.tip, genesis.block_id);
        assert!(mempool.contains(&orphan_event));
        assert!(!store.has_block(&orphan.block_id).expect("dropped"));
        let reclaimed = mempool.get(&orphan_event).expect("tx");
        assert_eq!(reclaimed.sender, orphan.events[0].author_validator.to_hex());
    }

    #[test]
    fn epoch_boundary_rolls_counters_and_seals() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let mempool = Mempool::new(16);
        let mut state = new_state();
        let mut prev = String::new();
        for height in 0..=4u64 {
            let epoch = if height == 0 { 0 } else { (height - 1) / 4 };
            let block = block_on(&prev, height, epoch);
            prev = block.block_id.to_hex();
            state
                .accept_block(&store, &mempool, &block, 4, None)
                .expect("accept");
        }
        assert_eq!(state.epoch, 1);
        assert_eq!(state.blocks_in_epoch, 0);
        assert_eq!(store.load_epoch_state().expect("persisted"), (1, 0));
    }

    #[test]
    fn ban_events_in_accepted_blocks_apply_locally() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let mempool = Mempool::new(16);
        let mut state = new_state();
        let mut genesis = block_on("", 0, 0);
        genesis.ban_events.push(BanEvent {
            address: "10.9.9.9".into(),
            expiry: (Utc::now() + chrono::Duration::minutes(30)).to_rfc3339(),
            reason: "flood".into(),
            origin: "peer".into(),
            ban_count: 1,
            timestamp: Utc::now(),
        });
        genesis.block_id = genesis.compute_id();
        state
            .accept_block(&store, &mempool, &genesis, 4, None)
            .expect("accept");
        assert!(state.peers.is_banned(&store, "10.9.9.9"));
    }

    #[test]
    fn fallback_counter_resets_on_acceptance() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let mempool = Mempool::new(16);
        let mut state = new_state();
        state.consecutive_fallbacks = 3;
        let genesis = block_on("", 0, 0);
        state
            .accept_block(&store, &mempool, &genesis, 4, None)
            .expect("accept");
        assert_eq!(state.consecutive_fallbacks, 0);
    }
}
