use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, info};

/// Hex length of a 32-byte Ed25519 public key.
const PRODUCER_KEY_HEX_LEN: usize = 64;

/// Role this node plays for one slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotRole {
    Leader,
    Fallback,
    Observer,
}

/// Dynamic set of block-producer public keys (hex). The node's own key is a
/// permanent member; peer keys come and go with handshakes and liveness.
pub struct ProducerSet {
    own_key: String,
    keys: BTreeSet<String>,
    missed_turns: HashMap<String, u64>,
}

impl ProducerSet {
    pub fn new(own_key_hex: String) -> Self {
        let mut keys = BTreeSet::new();
        keys.insert(own_key_hex.clone());
        Self {
            own_key: own_key_hex,
            keys,
            missed_turns: HashMap::new(),
        }
    }

    pub fn own_key(&self) -> &str {
        &self.own_key
    }

    /// Inserts a peer producer key. Entries that are not 64 hex chars are
    /// rejected; address-shaped strings must never enter the table.
    pub fn add(&mut self, pubkey: &[u8]) -> bool {
        let hex_key = hex::encode(pubkey);
        if hex_key.len() != PRODUCER_KEY_HEX_LEN {
            debug!(key = %hex_key, "rejected malformed producer key");
            return false;
        }
        if self.keys.insert(hex_key.clone()) {
            info!(key = %hex_key, "added producer");
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, pubkey_hex: &str) {
        if pubkey_hex == self.own_key {
            return;
        }
        if self.keys.remove(pubkey_hex) {
            self.missed_turns.remove(pubkey_hex);
            info!(key = %pubkey_hex, "removed producer");
        }
    }

    /// Drops every producer not in `live_keys`, keeping the node's own key
    /// unconditionally.
    pub fn retain_live(&mut self, live_keys: &HashSet<String>) {
        let own = self.own_key.clone();
        let stale: Vec<String> = self
            .keys
            .iter()
            .filter(|key| **key != own && !live_keys.contains(*key))
            .cloned()
            .collect();
        for key in stale {
            info!(key = %key, "pruning stale producer");
            self.keys.remove(&key);
            self.missed_turns.remove(&key);
        }
    }

    pub fn record_missed_turn(&mut self, pubkey_hex: &str) {
        *self.missed_turns.entry(pubkey_hex.to_string()).or_insert(0) += 1;
    }

    pub fn missed_turns(&self, pubkey_hex: &str) -> u64 {
        self.missed_turns.get(pubkey_hex).copied().unwrap_or(0)
    }

    pub fn contains(&self, pubkey_hex: &str) -> bool {
        self.keys.contains(pubkey_hex)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Producers in canonical (sorted) order; the slot schedule indexes
    /// into this list.
    pub fn sorted(&self) -> Vec<String> {
        self.keys.iter().cloned().collect()
    }

    /// Slot assignment for the block following `height`: the leader sits at
    /// `height mod N`, the fallback one past it.
    pub fn role_at(&self, height: u64) -> SlotRole {
        let producers = self.sorted();
        let n = producers.len();
        if n == 0 {
            return SlotRole::Observer;
        }
        let leader_idx = (height as usize) % n;
        let fallback_idx = (leader_idx + 1) % n;
        let Some(my_idx) = producers.iter().position(|key| *key == self.own_key) else {
            return SlotRole::Observer;
        };
        if my_idx == leader_idx {
            SlotRole::Leader
        } else if my_idx == fallback_idx {
            SlotRole::Fallback
        } else {
            SlotRole::Observer
        }
    }

    /// The key expected to lead the slot after `height`.
    pub fn leader_at(&self, height: u64) -> Option<String> {
        let producers = self.sorted();
        if producers.is_empty() {
            return None;
        }
        let idx = (height as usize) % producers.len();
        Some(producers[idx].clone())
    }
}
