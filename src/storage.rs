use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch};
use tracing::warn;

use crate::crypto::BlockCipher;
use crate::errors::{ChainError, ChainResult};
use crate::types::{Block, FinalizeEpochTx, Id};

const BLOCK_PREFIX: &str = "block:";
const HEIGHT_PREFIX: &str = "height:";
const BAN_PREFIX: &str = "ban:";
const BAN_COUNT_PREFIX: &str = "banCount:";
const LATEST_BLOCK_KEY: &[u8] = b"latestBlockID";
const CURRENT_EPOCH_KEY: &[u8] = b"current_epoch";
const BLOCKS_IN_EPOCH_KEY: &[u8] = b"blocks_in_epoch";
const EPOCH_FINAL_PREFIX: &str = "epoch_final:";

/// Compact listing entry for operator block queries.
#[derive(Clone, Debug, serde::Serialize)]
pub struct BlockSummary {
    #[serde(rename = "blockID")]
    pub block_id: String,
    #[serde(rename = "prevHash")]
    pub prev_hash: String,
    pub height: u64,
    pub timestamp: String,
}

/// Persistent key-value store holding the chain. Block values are encrypted
/// with AES-256-GCM; every other namespace is plaintext.
pub struct Storage {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    cipher: BlockCipher,
}

impl Storage {
    pub fn open(path: &Path, cipher: BlockCipher) -> ChainResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DBWithThreadMode::open(&opts, path)?;
        Ok(Self {
            db: Arc::new(db),
            cipher,
        })
    }

    fn block_key(id: &Id) -> Vec<u8> {
        format!("{BLOCK_PREFIX}{}", id.to_hex()).into_bytes()
    }

    fn height_key(height: u64) -> Vec<u8> {
        format!("{HEIGHT_PREFIX}{height}").into_bytes()
    }

    /// Writes the encrypted block and its height-index entry in one batch.
    /// The height is read from the plaintext before encryption.
    pub fn put_block(&self, block_id: &Id, plaintext: &[u8]) -> ChainResult<()> {
        let block = Block::deserialize(plaintext)?;
        let sealed = self.cipher.encrypt(plaintext)?;
        let mut batch = WriteBatch::default();
        batch.put(Self::block_key(block_id), sealed);
        batch.put(Self::height_key(block.height), block_id.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    pub fn get_block(&self, block_id: &Id) -> ChainResult<Vec<u8>> {
        let sealed = self
            .db
            .get(Self::block_key(block_id))?
            .ok_or_else(|| ChainError::NotFound(format!("block {block_id}")))?;
        self.cipher.decrypt(&sealed)
    }

    pub fn get_block_decoded(&self, block_id: &Id) -> ChainResult<Block> {
        let bytes = self.get_block(block_id)?;
        Block::deserialize(&bytes)
    }

    pub fn has_block(&self, block_id: &Id) -> ChainResult<bool> {
        Ok(self.db.get(Self::block_key(block_id))?.is_some())
    }

    pub fn block_id_by_height(&self, height: u64) -> ChainResult<Id> {
        let bytes = self
            .db
            .get(Self::height_key(height))?
            .ok_or_else(|| ChainError::NotFound(format!("block id for height {height}")))?;
        Id::from_bytes(&bytes)
    }

    pub fn get_by_height(&self, height: u64) -> ChainResult<Block> {
        let id = self.block_id_by_height(height)?;
        self.get_block_decoded(&id)
    }

    pub fn has_genesis_block(&self) -> ChainResult<bool> {
        let mut iter = self.prefix_iter(BLOCK_PREFIX);
        Ok(iter.next().transpose()?.is_some())
    }

    /// Number of stored blocks. Recovery diagnostics only; the runtime
    /// reads the chain height from the cached tip.
    pub fn count_blocks(&self) -> ChainResult<u64> {
        let mut count = 0u64;
        for entry in self.prefix_iter(BLOCK_PREFIX) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    pub fn list_block_ids(&self) -> ChainResult<Vec<Id>> {
        let mut ids = Vec::new();
        for entry in self.prefix_iter(BLOCK_PREFIX) {
            let (key, _value) = entry?;
            let hex_id = &key[BLOCK_PREFIX.len()..];
            match std::str::from_utf8(hex_id)
                .map_err(|err| ChainError::Config(format!("invalid block key: {err}")))
                .and_then(|s| s.parse::<Id>())
            {
                Ok(id) => ids.push(id),
                Err(err) => warn!(%err, "skipping malformed block key"),
            }
        }
        Ok(ids)
    }

    /// Newest-first block summaries for the listing endpoint. Corrupt
    /// entries are skipped with a logged error.
    pub fn list_recent(&self, max: usize) -> ChainResult<Vec<BlockSummary>> {
        let mut summaries = Vec::new();
        let iter = self.db.iterator(IteratorMode::End);
        for entry in iter {
            if summaries.len() >= max {
                break;
            }
            let (key, value) = entry?;
            if !key.starts_with(BLOCK_PREFIX.as_bytes()) {
                continue;
            }
            let block = match self
                .cipher
                .decrypt(&value)
                .and_then(|bytes| Block::deserialize(&bytes))
            {
                Ok(block) => block,
                Err(err) => {
                    warn!(%err, "skipping unreadable block during listing");
                    continue;
                }
            };
            summaries.push(BlockSummary {
                block_id: block.block_id.to_hex(),
                prev_hash: block.prev_hash,
                height: block.height,
                timestamp: block.timestamp.to_rfc3339(),
            });
        }
        Ok(summaries)
    }

    pub fn delete_block(&self, block_id: &Id) -> ChainResult<()> {
        let height = match self.get_block_decoded(block_id) {
            Ok(block) => Some(block.height),
            Err(_) => None,
        };
        let mut batch = WriteBatch::default();
        batch.delete(Self::block_key(block_id));
        if let Some(height) = height {
            batch.delete(Self::height_key(height));
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Rolls the chain back to `fork_point`: keeps the fork point and its
    /// ancestors, deletes every other block and height entry, and moves the
    /// tip pointer to the fork point.
    pub fn rollback_to(&self, fork_point: &Id) -> ChainResult<()> {
        let mut keep: HashSet<Id> = HashSet::new();
        let mut current = *fork_point;
        loop {
            let block = match self.get_block_decoded(&current) {
                Ok(block) => block,
                Err(_) => break,
            };
            keep.insert(current);
            if block.is_genesis() {
                break;
            }
            match block.prev_hash.parse::<Id>() {
                Ok(prev) => current = prev,
                Err(_) => break,
            }
        }

        let mut batch = WriteBatch::default();
        for id in self.list_block_ids()? {
            if keep.contains(&id) {
                continue;
            }
            if let Ok(block) = self.get_block_decoded(&id) {
                batch.delete(Self::height_key(block.height));
            }
            batch.delete(Self::block_key(&id));
        }
        batch.put(LATEST_BLOCK_KEY, fork_point.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    pub fn latest_block_id(&self) -> ChainResult<Option<Id>> {
        match self.db.get(LATEST_BLOCK_KEY)? {
            Some(bytes) => Ok(Some(Id::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set_latest_block_id(&self, block_id: &Id) -> ChainResult<()> {
        self.db.put(LATEST_BLOCK_KEY, block_id.as_bytes())?;
        Ok(())
    }

    /// Scans every stored block, picks the one of maximum height, and
    /// persists it as the tip. Unreadable entries are skipped loudly so a
    /// corrupt record never silently truncates the chain.
    pub fn recover_tip(&self) -> ChainResult<Option<(Id, u64)>> {
        let mut best: Option<(Id, u64)> = None;
        for entry in self.prefix_iter(BLOCK_PREFIX) {
            let (key, value) = entry?;
            let block = match self
                .cipher
                .decrypt(&value)
                .and_then(|bytes| Block::deserialize(&bytes))
            {
                Ok(block) => block,
                Err(err) => {
                    let key = String::from_utf8_lossy(&key).into_owned();
                    warn!(%key, %err, "skipping unreadable block during tip recovery");
                    continue;
                }
            };
            if best.map(|(_, h)| block.height > h).unwrap_or(true) {
                best = Some((block.block_id, block.height));
            }
        }
        if let Some((tip, _)) = best.as_ref() {
            self.set_latest_block_id(tip)?;
        }
        Ok(best)
    }

    // --- Ban state ---

    pub fn put_ban(&self, address: &str, expiry: DateTime<Utc>, count: u64) -> ChainResult<()> {
        let mut batch = WriteBatch::default();
        batch.put(
            format!("{BAN_PREFIX}{address}").into_bytes(),
            expiry.to_rfc3339().into_bytes(),
        );
        batch.put(
            format!("{BAN_COUNT_PREFIX}{address}").into_bytes(),
            count.to_be_bytes(),
        );
        self.db.write(batch)?;
        Ok(())
    }

    pub fn remove_ban(&self, address: &str) -> ChainResult<()> {
        let mut batch = WriteBatch::default();
        batch.delete(format!("{BAN_PREFIX}{address}").into_bytes());
        batch.delete(format!("{BAN_COUNT_PREFIX}{address}").into_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    /// Loads persisted bans and ban counters. Entries that fail to parse are
    /// dropped with a logged warning.
    pub fn load_bans(&self) -> ChainResult<(HashMap<String, DateTime<Utc>>, HashMap<String, u64>)> {
        let mut bans = HashMap::new();
        let mut counts = HashMap::new();
        for entry in self.prefix_iter(BAN_PREFIX) {
            let (key, value) = entry?;
            let address = String::from_utf8_lossy(&key[BAN_PREFIX.len()..]).into_owned();
            match std::str::from_utf8(&value)
                .ok()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            {
                Some(expiry) => {
                    bans.insert(address, expiry.with_timezone(&Utc));
                }
                None => warn!(%address, "dropping unparseable persisted ban"),
            }
        }
        for entry in self.prefix_iter(BAN_COUNT_PREFIX) {
            let (key, value) = entry?;
            let address = String::from_utf8_lossy(&key[BAN_COUNT_PREFIX.len()..]).into_owned();
            if value.len() == 8 {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&value);
                counts.insert(address, u64::from_be_bytes(raw));
            }
        }
        Ok((bans, counts))
    }

    // --- Epoch state ---

    pub fn save_epoch_state(&self, epoch: u64, blocks_in_epoch: u64) -> ChainResult<()> {
        let mut batch = WriteBatch::default();
        batch.put(CURRENT_EPOCH_KEY, serde_json::to_vec(&epoch)?);
        batch.put(BLOCKS_IN_EPOCH_KEY, serde_json::to_vec(&blocks_in_epoch)?);
        self.db.write(batch)?;
        Ok(())
    }

    pub fn load_epoch_state(&self) -> ChainResult<(u64, u64)> {
        let epoch = match self.db.get(CURRENT_EPOCH_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => 0,
        };
        let blocks_in_epoch = match self.db.get(BLOCKS_IN_EPOCH_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => 0,
        };
        Ok((epoch, blocks_in_epoch))
    }

    pub fn put_epoch_finalization(&self, tx: &FinalizeEpochTx) -> ChainResult<()> {
        let key = format!("{EPOCH_FINAL_PREFIX}{}", tx.epoch_number).into_bytes();
        self.db.put(key, serde_json::to_vec(tx)?)?;
        Ok(())
    }

    pub fn get_epoch_finalization(&self, epoch: u64) -> ChainResult<Option<FinalizeEpochTx>> {
        let key = format!("{EPOCH_FINAL_PREFIX}{epoch}").into_bytes();
        match self.db.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn prefix_iter(
        &self,
        prefix: &'static str,
    ) -> impl Iterator<Item = Result<(Box<[u8]>, Box<[u8]>), rocksdb::Error>> + '_ {
        self.db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward))
            .take_while(move |entry| match entry {
                Ok((key, _)) => key.starts_with(prefix.as_bytes()),
                Err(_) => true,
            })
    }

    #[cfg(test)]
    pub(crate) fn put_raw(&self, key: &[u8], value: &[u8]) -> ChainResult<()> {
        self.db.put(key, value)?;
        Ok(())
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            cipher: self.cipher.clone(),
        }
    }
}
