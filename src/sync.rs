use std::collections::HashMap;
use std::time::Duration;

use ed25519_dalek::Keypair;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::errors::{ChainError, ChainResult};
use crate::ledger::{Acceptance, ChainState};
use crate::mempool::Mempool;
use crate::storage::Storage;
use crate::types::{Block, BlockAnnounce, BlockBroadcast, Id};

/// Round-trip bound for lineage/sync/admin HTTP calls toward peers.
const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct ChainHeightResponse {
    #[serde(rename = "chainHeight")]
    chain_height: u64,
}

#[derive(Deserialize)]
struct ChainTipResponse {
    #[serde(rename = "latestBlockID")]
    latest_block_id: String,
}

/// HTTP client for the peer endpoints the core consumes.
#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
}

impl PeerClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(SYNC_TIMEOUT)
            .build()
            .expect("building sync http client");
        Self { http }
    }

    pub async fn chain_height(&self, host: &str, api_port: u16) -> ChainResult<u64> {
        let url = format!("http://{host}:{api_port}/chain_height");
        let response: ChainHeightResponse = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| ChainError::Network(format!("chain height request failed: {err}")))?
            .json()
            .await
            .map_err(|err| ChainError::Network(format!("invalid chain height response: {err}")))?;
        Ok(response.chain_height)
    }

    pub async fn chain_tip(&self, host: &str, api_port: u16) -> ChainResult<Id> {
        let url = format!("http://{host}:{api_port}/get_chain_tip");
        let response: ChainTipResponse = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| ChainError::Network(format!("chain tip request failed: {err}")))?
            .json()
            .await
            .map_err(|err| ChainError::Network(format!("invalid chain tip response: {err}")))?;
        response.latest_block_id.parse()
    }

    /// Fetches the serialized block bytes for an id.
    pub async fn request_block(
        &self,
        host: &str,
        api_port: u16,
        block_id: &Id,
    ) -> ChainResult<Vec<u8>> {
        let url = format!(
            "http://{host}:{api_port}/request_block?block_id={}",
            block_id.to_hex()
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| ChainError::Network(format!("block request failed: {err}")))?;
        if !response.status().is_success() {
            return Err(ChainError::Network(format!(
                "peer returned {} for block {block_id}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ChainError::Network(format!("block body read failed: {err}")))?;
        Ok(bytes.to_vec())
    }

    /// Resolves the block id at a height via the range endpoint.
    pub async fn block_id_by_height(
        &self,
        host: &str,
        api_port: u16,
        height: u64,
    ) -> ChainResult<Id> {
        let url = format!("http://{host}:{api_port}/blocks?start={height}&end={height}");
        let blocks: Vec<Block> = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| ChainError::Network(format!("blocks request failed: {err}")))?
            .json()
            .await
            .map_err(|err| ChainError::Network(format!("invalid blocks response: {err}")))?;
        blocks
            .first()
            .map(|block| block.block_id)
            .ok_or_else(|| ChainError::NotFound(format!("peer block at height {height}")))
    }

    pub async fn announce_block(&self, host: &str, api_port: u16, announce: &BlockAnnounce) {
        let url = format!("http://{host}:{api_port}/announce_block");
        if let Err(err) = self.http.post(&url).json(announce).send().await {
            warn!(%url, %err, "failed to send block announcement");
        }
    }

    pub async fn broadcast_block(&self, host: &str, api_port: u16, broadcast: &BlockBroadcast) {
        let url = format!("http://{host}:{api_port}/broadcast_block");
        if let Err(err) = self.http.post(&url).json(broadcast).send().await {
            warn!(%url, %err, "failed to send block broadcast");
        }
    }
}

impl Default for PeerClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a sync pass needs about one peer, snapshotted outside the
/// tip lock.
#[derive(Clone, Debug)]
struct PeerView {
    address: String,
    host: String,
    api_port: u16,
    height: u64,
    tip: Option<Id>,
}

fn peer_views(chain: &Mutex<ChainState>) -> Vec<PeerView> {
    chain
        .lock()
        .peers
        .list()
        .into_iter()
        .map(|peer| PeerView {
            host: peer.host(),
            api_port: peer.api_port,
            height: peer.chain_height,
            tip: peer.tip_block_id.parse().ok(),
            address: peer.address,
        })
        .collect()
}

/// Queries every known peer for its current height and writes the answers
/// back into the peer table.
pub async fn refresh_peer_heights(client: &PeerClient, chain: &Mutex<ChainState>) {
    let peers = peer_views(chain);
    let mut updates: HashMap<String, u64> = HashMap::new();
    for peer in peers {
        match client.chain_height(&peer.host, peer.api_port).await {
            Ok(height) => {
                updates.insert(peer.address.clone(), height);
            }
            Err(err) => debug!(address = %peer.address, %err, "peer height refresh failed"),
        }
    }
    let mut chain = chain.lock();
    for (address, height) in updates {
        chain.peers.set_height(&address, height);
    }
}

/// Fetches every block the peer has beyond the local tip and feeds each
/// through acceptance in order. Per-peer rate limited to one pass a second.
pub async fn sync_chain_from_peer(
    client: &PeerClient,
    storage: &Storage,
    chain: &Mutex<ChainState>,
    mempool: &Mempool,
    address: &str,
    epoch_block_count: u64,
    epoch_signer: Option<&Keypair>,
) -> ChainResult<u64> {
    let (my_height, peer) = {
        let mut chain = chain.lock();
        if !chain.peers.should_sync(address) {
            debug!(%address, "sync rate limit, skipping");
            return Ok(0);
        }
        let Some(peer) = chain.peers.get(address).cloned() else {
            return Err(ChainError::NotFound(format!("peer {address}")));
        };
        (
            chain.chain_height(),
            PeerView {
                host: peer.host(),
                api_port: peer.api_port,
                height: peer.chain_height,
                tip: peer.tip_block_id.parse().ok(),
                address: peer.address,
            },
        )
    };
    if peer.height <= my_height {
        debug!(%address, "peer is not ahead, skipping sync");
        return Ok(0);
    }

    info!(%address, my_height, peer_height = peer.height, "syncing from peer");
    let mut applied = 0u64;
    for height in (my_height + 1)..=peer.height {
        let block_id = client
            .block_id_by_height(&peer.host, peer.api_port, height)
            .await?;
        let bytes = client
            .request_block(&peer.host, peer.api_port, &block_id)
            .await?;
        let block = Block::deserialize(&bytes)?;
        let outcome = chain.lock().accept_block(
            storage,
            mempool,
            &block,
            epoch_block_count,
            epoch_signer,
        )?;
        if outcome == Acceptance::Orphaned {
            return Err(ChainError::Network(format!(
                "peer {address} served a non-contiguous block at height {height}"
            )));
        }
        applied += 1;
    }
    Ok(applied)
}

/// Outcome of a fork-choice pass.
#[derive(Debug, PartialEq, Eq)]
pub enum ReorgOutcome {
    NoPeerAhead,
    Completed { tip: Id, height: u64 },
}

/// Longest-chain fork choice: finds the highest peer, walks its chain back
/// to the most recent common ancestor, rolls local storage back to it, and
/// applies the peer-side blocks fork→tip. A missing fork point aborts with
/// [`ChainError::ForkPointNotFound`] and leaves the chain untouched.
pub async fn fork_choice_reorg(
    client: &PeerClient,
    storage: &Storage,
    chain: &Mutex<ChainState>,
    mempool: &Mempool,
    epoch_block_count: u64,
    epoch_signer: Option<&Keypair>,
) -> ChainResult<ReorgOutcome> {
    refresh_peer_heights(client, chain).await;

    let (my_height, my_tip) = {
        let chain = chain.lock();
        (chain.chain_height(), chain.tip)
    };
    let best = peer_views(chain)
        .into_iter()
        .filter(|peer| peer.height > my_height && peer.tip.is_some())
        .max_by_key(|peer| peer.height);
    let Some(best) = best else {
        debug!("no peer ahead; staying on current tip");
        return Ok(ReorgOutcome::NoPeerAhead);
    };
    let Some(peer_tip) = best.tip else {
        return Ok(ReorgOutcome::NoPeerAhead);
    };
    info!(
        address = %best.address,
        peer_height = best.height,
        "found longer chain, performing fork-choice reorg"
    );

    // Our ancestor ids, tip back to genesis.
    let mut ancestors = std::collections::HashSet::new();
    let mut current = my_tip;
    while !current.is_zero() {
        ancestors.insert(current);
        let Ok(block) = storage.get_block_decoded(&current) else {
            break;
        };
        if block.is_genesis() {
            break;
        }
        match block.prev_hash.parse::<Id>() {
            Ok(prev) => current = prev,
            Err(_) => break,
        }
    }

    // Walk the peer chain backwards until we meet one of our ancestors,
    // keeping the fetched bytes so the forward apply needs no second fetch.
    let mut to_apply: Vec<(Id, Vec<u8>)> = Vec::new();
    let mut cursor = peer_tip;
    let mut fork_point: Option<Id> = None;
    let mut remaining = best.height + 1;
    while remaining > 0 {
        if ancestors.contains(&cursor) {
            fork_point = Some(cursor);
            break;
        }
        let bytes = client
            .request_block(&best.host, best.api_port, &cursor)
            .await?;
        let block = Block::deserialize(&bytes)?;
        to_apply.insert(0, (cursor, bytes));
        if block.is_genesis() {
            break;
        }
        cursor = block.prev_hash.parse()?;
        remaining -= 1;
    }
    let Some(fork_point) = fork_point else {
        warn!("no common ancestor found; reorg aborted");
        return Err(ChainError::ForkPointNotFound);
    };
    info!(fork_point = %fork_point, replay = to_apply.len(), "fork point located");

    // Rollback and replay under one tip-lock hold so observers never see a
    // half-switched chain.
    let mut chain = chain.lock();
    storage.rollback_to(&fork_point)?;
    let fork_block = storage.get_block_decoded(&fork_point)?;
    chain.reset_to(&fork_block, epoch_block_count);
    for (block_id, bytes) in to_apply {
        let block = Block::deserialize(&bytes)?;
        let outcome =
            chain.accept_block(storage, mempool, &block, epoch_block_count, epoch_signer)?;
        if outcome != Acceptance::Extended {
            return Err(ChainError::Network(format!(
                "peer block {block_id} did not extend the chain during reorg"
            )));
        }
    }
    let tip = chain.tip;
    let height = chain.chain_height();
    info!(%tip, height, "reorg complete");
    Ok(ReorgOutcome::Completed { tip, height })
}
