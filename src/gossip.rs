use std::collections::HashSet;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::errors::{ChainError, ChainResult};
use crate::mempool::Mempool;
use crate::types::{GossipMessage, Transaction};

/// Slow peers must not stall a broadcast; posts are bounded independently
/// of the sync client's longer timeout.
const GOSSIP_TIMEOUT: Duration = Duration::from_secs(5);

/// Floods transactions to the current peer set, deduplicating by tx id.
pub struct GossipEngine {
    peers: RwLock<Vec<String>>,
    seen: Mutex<HashSet<String>>,
    http: reqwest::Client,
}

impl GossipEngine {
    pub fn new(peers: Vec<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(GOSSIP_TIMEOUT)
            .build()
            .expect("building gossip http client");
        Self {
            peers: RwLock::new(peers),
            seen: Mutex::new(HashSet::new()),
            http,
        }
    }

    /// Replaces the fan-out list; called after every handshake change.
    pub fn update_peers(&self, peers: Vec<String>) {
        *self.peers.write() = peers;
    }

    pub fn peers(&self) -> Vec<String> {
        self.peers.read().clone()
    }

    fn mark_seen(&self, tx_id: &str) -> bool {
        self.seen.lock().insert(tx_id.to_string())
    }

    pub fn is_seen(&self, tx_id: &str) -> bool {
        self.seen.lock().contains(tx_id)
    }

    /// Marks the tx seen, inserts it locally, and fans it out to every
    /// peer. Send failures are logged and skipped; gossip is best-effort.
    pub async fn broadcast(&self, tx: Transaction, mempool: &Mempool) {
        if !self.mark_seen(&tx.tx_id) {
            return;
        }
        mempool.add(tx.clone());
        let message = GossipMessage { tx };
        let peers = self.peers();
        debug!(tx_id = %message.tx.tx_id, peer_count = peers.len(), "broadcasting transaction");
        for peer in peers {
            let url = format!("http://{peer}/gossip_tx");
            match self.http.post(&url).json(&message).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    warn!(%peer, status = %response.status(), "peer rejected gossip")
                }
                Err(err) => warn!(%peer, %err, "failed to send gossip"),
            }
        }
    }

    /// Handles an incoming gossip payload. Duplicates are dropped; fresh
    /// transactions are inserted into the mempool.
    pub fn receive(&self, data: &[u8], mempool: &Mempool) -> ChainResult<bool> {
        let message: GossipMessage = serde_json::from_slice(data)
            .map_err(|err| ChainError::Transaction(format!("invalid gossip message: {err}")))?;
        if !self.mark_seen(&message.tx.tx_id) {
            debug!(tx_id = %message.tx.tx_id, "ignored duplicate gossip");
            return Ok(false);
        }
        let added = mempool.add(message.tx);
        Ok(added)
    }
}
