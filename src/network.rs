use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::storage::Storage;
use crate::types::b64;

const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
const MAX_REQUESTS_PER_WINDOW: usize = 3000;
/// Progressive ban ladder; violations past the ladder are effectively
/// permanent.
const BAN_DURATIONS: [Duration; 3] = [
    Duration::from_secs(10 * 60),
    Duration::from_secs(60 * 60),
    Duration::from_secs(24 * 60 * 60),
];
const PERMABAN: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);
/// Minimum spacing between sync attempts toward the same peer.
const SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Known peer row, keyed by canonical `host:port` of the P2P socket.
#[derive(Clone, Debug)]
pub struct Peer {
    pub address: String,
    pub api_port: u16,
    pub chain_height: u64,
    pub tip_block_id: String,
    pub last_seen: DateTime<Utc>,
    pub host_only: String,
    pub pub_key: Vec<u8>,
}

impl Peer {
    pub fn host(&self) -> String {
        if !self.host_only.is_empty() {
            return self.host_only.clone();
        }
        split_host(&self.address)
    }
}

/// Single-line JSON hello exchanged in both directions over TCP.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hello {
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "APIPort")]
    pub api_port: u16,
    #[serde(rename = "ChainHeight")]
    pub chain_height: u64,
    #[serde(rename = "TipBlockID")]
    pub tip_block_id: String,
    #[serde(rename = "LastSeen")]
    pub last_seen: DateTime<Utc>,
    #[serde(rename = "HostOnly", default, skip_serializing_if = "String::is_empty")]
    pub host_only: String,
    #[serde(rename = "PubKey", default, with = "b64")]
    pub pub_key: Vec<u8>,
}

/// Per-peer tip comparison for the operator diagnostics endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct PeerTipStatus {
    #[serde(rename = "peerAddress")]
    pub peer_address: String,
    #[serde(rename = "peerHeight")]
    pub peer_height: u64,
    #[serde(rename = "peerTipBlock")]
    pub peer_tip_block: String,
    #[serde(rename = "myHeight")]
    pub my_height: u64,
    #[serde(rename = "myTipBlock")]
    pub my_tip_block: String,
    pub status: String,
}

/// Peer table plus the ban and rate-limit state that guards it. Lives under
/// the process-wide tip lock; no interior synchronization.
pub struct PeerTable {
    peers: Vec<Peer>,
    banned: HashMap<String, DateTime<Utc>>,
    ban_counts: HashMap<String, u64>,
    request_log: HashMap<String, Vec<Instant>>,
    last_sync: HashMap<String, Instant>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            peers: Vec::new(),
            banned: HashMap::new(),
            ban_counts: HashMap::new(),
            request_log: HashMap::new(),
            last_sync: HashMap::new(),
        }
    }

    /// Restores persisted ban state after a restart.
    pub fn load_ban_state(&mut self, storage: &Storage) {
        match storage.load_bans() {
            Ok((bans, counts)) => {
                info!(count = bans.len(), "imported persistent bans");
                self.banned = bans;
                self.ban_counts = counts;
            }
            Err(err) => warn!(%err, "failed to load persisted ban state"),
        }
    }

    /// Inserts or refreshes a peer row under its canonical address. The
    /// address always comes from the socket, never from the peer's claim.
    pub fn upsert(&mut self, peer: Peer) {
        match self
            .peers
            .iter_mut()
            .find(|existing| existing.address == peer.address)
        {
            Some(existing) => *existing = peer,
            None => self.peers.push(peer),
        }
    }

    pub fn get(&self, address: &str) -> Option<&Peer> {
        self.peers.iter().find(|peer| peer.address == address)
    }

    pub fn list(&self) -> Vec<Peer> {
        self.peers.clone()
    }

    pub fn set_height(&mut self, address: &str, height: u64) {
        if let Some(peer) = self
            .peers
            .iter_mut()
            .find(|peer| peer.address == address)
        {
            peer.chain_height = height;
        }
    }

    pub fn api_port(&self, address: &str) -> u16 {
        self.get(address).map(|peer| peer.api_port).unwrap_or(8080)
    }

    pub fn height_of(&self, address: &str) -> u64 {
        self.get(address).map(|peer| peer.chain_height).unwrap_or(0)
    }

    /// Highest chain height among peers seen within `live_within`.
    pub fn max_height(&self, live_within: Duration) -> u64 {
        let now = Utc::now();
        self.peers
            .iter()
            .filter(|peer| age_within(now, peer.last_seen, live_within))
            .map(|peer| peer.chain_height)
            .max()
            .unwrap_or(0)
    }

    /// Producer keys of peers seen within `live_within`; feeds the
    /// producer-set liveness prune.
    pub fn live_producer_keys(&self, live_within: Duration) -> HashSet<String> {
        let now = Utc::now();
        self.peers
            .iter()
            .filter(|peer| {
                age_within(now, peer.last_seen, live_within) && peer.pub_key.len() == 32
            })
            .map(|peer| hex::encode(&peer.pub_key))
            .collect()
    }

    pub fn check_tips(&self, my_height: u64, my_tip: &str) -> Vec<PeerTipStatus> {
        self.peers
            .iter()
            .map(|peer| {
                let status = if peer.chain_height > my_height {
                    "peer ahead (needs sync)"
                } else if peer.tip_block_id != my_tip {
                    "tip mismatch"
                } else {
                    "ok"
                };
                PeerTipStatus {
                    peer_address: peer.address.clone(),
                    peer_height: peer.chain_height,
                    peer_tip_block: peer.tip_block_id.clone(),
                    my_height,
                    my_tip_block: my_tip.to_string(),
                    status: status.to_string(),
                }
            })
            .collect()
    }

    // --- Bans ---

    pub fn ban(&mut self, storage: &Storage, address: &str, duration: Duration) {
        let expiry = Utc::now()
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::hours(1));
        self.banned.insert(address.to_string(), expiry);
        let count = self.ban_counts.get(address).copied().unwrap_or(0);
        warn!(%address, until = %expiry.to_rfc3339(), "peer banned");
        if let Err(err) = storage.put_ban(address, expiry, count) {
            warn!(%address, %err, "failed to persist ban");
        }
    }

    /// Applies a ban carried inside an accepted block.
    pub fn apply_ban_event(&mut self, storage: &Storage, address: &str, expiry: DateTime<Utc>) {
        self.banned.insert(address.to_string(), expiry);
        let count = self.ban_counts.get(address).copied().unwrap_or(0);
        if let Err(err) = storage.put_ban(address, expiry, count) {
            warn!(%address, %err, "failed to persist block ban event");
        }
    }

    /// Expired bans are removed (including the persistent record) on check.
    pub fn is_banned(&mut self, storage: &Storage, address: &str) -> bool {
        let Some(expiry) = self.banned.get(address) else {
            return false;
        };
        if Utc::now() > *expiry {
            info!(%address, "ban expired");
            self.banned.remove(address);
            if let Err(err) = storage.remove_ban(address) {
                warn!(%address, %err, "failed to remove persisted ban");
            }
            return false;
        }
        true
    }

    /// Sliding-window rate limiter. Exceeding the cap triggers the
    /// progressive ban ladder; the violating request is refused.
    pub fn allow_request(&mut self, storage: &Storage, address: &str) -> bool {
        let now = Instant::now();
        let window = self.request_log.entry(address.to_string()).or_default();
        window.retain(|at| now.duration_since(*at) < RATE_LIMIT_WINDOW);
        window.push(now);
        if window.len() <= MAX_REQUESTS_PER_WINDOW {
            return true;
        }
        if !self.is_banned(storage, address) {
            let count = self.ban_counts.entry(address.to_string()).or_insert(0);
            *count += 1;
            let violations = *count;
            let duration = BAN_DURATIONS
                .get(violations as usize - 1)
                .copied()
                .unwrap_or(PERMABAN);
            warn!(%address, violations, "rate limit exceeded");
            self.ban(storage, address, duration);
        }
        false
    }

    /// One sync attempt per peer per second.
    pub fn should_sync(&mut self, address: &str) -> bool {
        let now = Instant::now();
        match self.last_sync.get(address) {
            Some(last) if now.duration_since(*last) < SYNC_INTERVAL => false,
            _ => {
                self.last_sync.insert(address.to_string(), now);
                true
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn force_ban_expiry(&mut self, address: &str, expiry: DateTime<Utc>) {
        self.banned.insert(address.to_string(), expiry);
    }

    #[cfg(test)]
    pub(crate) fn ban_count(&self, address: &str) -> u64 {
        self.ban_counts.get(address).copied().unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn ban_expiry(&self, address: &str) -> Option<DateTime<Utc>> {
        self.banned.get(address).copied()
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

fn age_within(now: DateTime<Utc>, seen: DateTime<Utc>, window: Duration) -> bool {
    let age = now.signed_duration_since(seen);
    age < chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::hours(1))
}

/// Host part of a `host:port` address; the input itself if it has no port.
pub fn split_host(address: &str) -> String {
    match address.rsplit_once(':') {
        Some((host, _port)) => host.to_string(),
        None => address.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::BlockCipher;
    use tempfile::tempdir;

    fn peer(address: &str, height: u64, seen_secs_ago: i64, key_byte: Option<u8>) -> Peer {
        Peer {
            address: address.to_string(),
            api_port: 8080,
            chain_height: height,
            tip_block_id: "00".repeat(32),
            last_seen: Utc::now() - chrono::Duration::seconds(seen_secs_ago),
            host_only: String::new(),
            pub_key: key_byte.map(|b| vec![b; 32]).unwrap_or_default(),
        }
    }

    fn open_store(path: &std::path::Path) -> Storage {
        Storage::open(path, BlockCipher::new([1u8; 32])).expect("open storage")
    }

    #[test]
    fn upsert_replaces_rows_by_address() {
        let mut table = PeerTable::new();
        table.upsert(peer("127.0.0.1:3001", 4, 0, None));
        table.upsert(peer("127.0.0.1:3001", 9, 0, None));
        assert_eq!(table.list().len(), 1);
        assert_eq!(table.height_of("127.0.0.1:3001"), 9);
    }

    #[test]
    fn max_height_ignores_stale_peers() {
        let mut table = PeerTable::new();
        table.upsert(peer("a:1", 10, 0, None));
        table.upsert(peer("b:1", 99, 120, None));
        assert_eq!(table.max_height(Duration::from_secs(6)), 10);
    }

    #[test]
    fn live_producer_keys_require_recent_handshake_and_full_key() {
        let mut table = PeerTable::new();
        table.upsert(peer("a:1", 1, 0, Some(2)));
        table.upsert(peer("b:1", 1, 120, Some(3)));
        table.upsert(peer("c:1", 1, 0, None));
        let live = table.live_producer_keys(Duration::from_secs(6));
        assert_eq!(live.len(), 1);
        assert!(live.contains(&hex::encode([2u8; 32])));
    }

    #[test]
    fn rate_limit_bans_progressively() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let mut table = PeerTable::new();

        for _ in 0..MAX_REQUESTS_PER_WINDOW {
            assert!(table.allow_request(&store, "10.0.0.5"));
        }
        assert!(!table.allow_request(&store, "10.0.0.5"));
        assert!(table.is_banned(&store, "10.0.0.5"));
        assert_eq!(table.ban_count("10.0.0.5"), 1);
        let first_expiry = table.ban_expiry("10.0.0.5").expect("banned");
        let expected = Utc::now() + chrono::Duration::minutes(10);
        assert!((expected - first_expiry).num_seconds().abs() < 5);

        // Expire the first ban, trip the limiter again: 1 h this time.
        table.force_ban_expiry("10.0.0.5", Utc::now() - chrono::Duration::seconds(1));
        assert!(!table.is_banned(&store, "10.0.0.5"));
        assert!(!table.allow_request(&store, "10.0.0.5"));
        assert_eq!(table.ban_count("10.0.0.5"), 2);
        let second_expiry = table.ban_expiry("10.0.0.5").expect("banned again");
        let expected = Utc::now() + chrono::Duration::hours(1);
        assert!((expected - second_expiry).num_seconds().abs() < 5);
    }

    #[test]
    fn expired_bans_are_removed_persistently() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let mut table = PeerTable::new();
        table.ban(&store, "10.1.1.1", Duration::from_secs(600));
        table.force_ban_expiry("10.1.1.1", Utc::now() - chrono::Duration::seconds(1));
        assert!(!table.is_banned(&store, "10.1.1.1"));
        let (bans, _) = store.load_bans().expect("load");
        assert!(bans.is_empty());
    }

    #[test]
    fn ban_state_reloads_from_storage() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        {
            let mut table = PeerTable::new();
            table.ban(&store, "10.2.2.2", Duration::from_secs(600));
        }
        let mut table = PeerTable::new();
        table.load_ban_state(&store);
        assert!(table.is_banned(&store, "10.2.2.2"));
    }

    #[test]
    fn sync_attempts_are_rate_limited_per_peer() {
        let mut table = PeerTable::new();
        assert!(table.should_sync("a:1"));
        assert!(!table.should_sync("a:1"));
        assert!(table.should_sync("b:1"));
    }

    #[test]
    fn check_tips_reports_status_per_peer() {
        let mut table = PeerTable::new();
        let my_tip = "ff".repeat(32);
        let mut ahead = peer("a:1", 9, 0, None);
        ahead.tip_block_id = "aa".repeat(32);
        table.upsert(ahead);
        let mut same = peer("b:1", 3, 0, None);
        same.tip_block_id = my_tip.clone();
        table.upsert(same);
        let report = table.check_tips(3, &my_tip);
        assert_eq!(report[0].status, "peer ahead (needs sync)");
        assert_eq!(report[1].status, "ok");
    }
}
