use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::types::{ExpiredTx, Transaction};

/// Bounded FIFO of pending transactions keyed by tx id. The insertion-order
/// list drives both eviction and snapshot iteration order.
pub struct Mempool {
    inner: Mutex<MempoolInner>,
    pub expired: ExpiredTxPool,
}

struct MempoolInner {
    txs: HashMap<String, Transaction>,
    order: Vec<String>,
    max_txs: usize,
}

impl Mempool {
    pub fn new(max_txs: usize) -> Self {
        Self {
            inner: Mutex::new(MempoolInner {
                txs: HashMap::new(),
                order: Vec::new(),
                max_txs,
            }),
            expired: ExpiredTxPool::new(),
        }
    }

    /// Returns false on duplicate. At capacity the oldest entry is evicted
    /// before the new one is inserted.
    pub fn add(&self, tx: Transaction) -> bool {
        let mut inner = self.inner.lock();
        if inner.txs.contains_key(&tx.tx_id) {
            return false;
        }
        if inner.txs.len() >= inner.max_txs {
            if let Some(oldest) = inner.order.first().cloned() {
                inner.txs.remove(&oldest);
                inner.order.remove(0);
                debug!(tx_id = %oldest, "evicted oldest mempool entry at capacity");
            }
        }
        inner.order.push(tx.tx_id.clone());
        inner.txs.insert(tx.tx_id.clone(), tx);
        true
    }

    pub fn remove(&self, tx_id: &str) {
        let mut inner = self.inner.lock();
        if inner.txs.remove(tx_id).is_some() {
            inner.order.retain(|id| id != tx_id);
        }
    }

    pub fn get(&self, tx_id: &str) -> Option<Transaction> {
        self.inner.lock().txs.get(tx_id).cloned()
    }

    pub fn contains(&self, tx_id: &str) -> bool {
        self.inner.lock().txs.contains_key(tx_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot in insertion order.
    pub fn all(&self) -> Vec<Transaction> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.txs.get(id).cloned())
            .collect()
    }

    /// Moves every transaction older than `max_age` to the expired pool with
    /// reason "timeout", preserving any prior retry metadata. Returns the
    /// number of archived transactions.
    pub fn purge_expired(&self, max_age: Duration) -> usize {
        let now = Utc::now().timestamp();
        let cutoff = max_age.as_secs() as i64;
        let mut archived = 0;
        let mut inner = self.inner.lock();
        let mut kept = Vec::with_capacity(inner.order.len());
        for tx_id in std::mem::take(&mut inner.order) {
            let Some(tx) = inner.txs.get(&tx_id) else {
                continue;
            };
            if now - tx.timestamp > cutoff {
                let tx = inner.txs.remove(&tx_id).expect("tx present");
                self.expired.archive_timeout(tx);
                archived += 1;
            } else {
                kept.push(tx_id);
            }
        }
        inner.order = kept;
        if archived > 0 {
            info!(archived, "archived expired mempool transactions");
        }
        archived
    }
}

/// In-memory archive of expired transactions awaiting retry or operator
/// action. Lives until restart.
pub struct ExpiredTxPool {
    pool: RwLock<HashMap<String, ExpiredTx>>,
}

impl ExpiredTxPool {
    pub fn new() -> Self {
        Self {
            pool: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, tx: ExpiredTx) {
        self.pool.write().insert(tx.tx_id.clone(), tx);
    }

    pub fn get(&self, tx_id: &str) -> Option<ExpiredTx> {
        self.pool.read().get(tx_id).cloned()
    }

    pub fn list(&self) -> Vec<ExpiredTx> {
        self.pool.read().values().cloned().collect()
    }

    pub fn remove(&self, tx_id: &str) {
        self.pool.write().remove(tx_id);
    }

    /// Archives a timed-out transaction, keeping the retry counters of any
    /// earlier archive entry for the same id.
    fn archive_timeout(&self, tx: Transaction) {
        let mut pool = self.pool.write();
        match pool.get_mut(&tx.tx_id) {
            Some(existing) => {
                existing.expired_at = Utc::now();
                existing.reason = "timeout".into();
            }
            None => {
                pool.insert(
                    tx.tx_id.clone(),
                    ExpiredTx {
                        tx_id: tx.tx_id,
                        payload: tx.payload,
                        expired_at: Utc::now(),
                        reason: "timeout".into(),
                        resubmit_count: 0,
                        resubmission_tx_ids: Vec::new(),
                        last_error: String::new(),
                    },
                );
            }
        }
    }
}

impl Default for ExpiredTxPool {
    fn default() -> Self {
        Self::new()
    }
}

pub const MAX_RESUBMISSIONS: u32 = 3;

/// One pass of the background resubmission worker: re-inserts retryable
/// expired transactions under their original ids, bumping their counters.
/// Returns the resubmitted tx ids.
pub fn resubmit_expired(mempool: &Mempool) -> Vec<String> {
    let mut resubmitted = Vec::new();
    for mut expired in mempool.expired.list() {
        if expired.is_resubmission_descendant() {
            continue;
        }
        if expired.resubmit_count >= MAX_RESUBMISSIONS {
            debug!(tx_id = %expired.tx_id, "resubmission limit reached");
            continue;
        }
        if !expired.is_retryable() {
            debug!(tx_id = %expired.tx_id, last_error = %expired.last_error, "not retrying terminal failure");
            continue;
        }
        let tx = Transaction {
            tx_id: expired.tx_id.clone(),
            payload: expired.payload.clone(),
            timestamp: Utc::now().timestamp(),
            sender: String::new(),
        };
        if mempool.add(tx) {
            expired.resubmit_count += 1;
            info!(tx_id = %expired.tx_id, attempt = expired.resubmit_count, "auto-resubmitted expired transaction");
            resubmitted.push(expired.tx_id.clone());
            mempool.expired.add(expired);
        }
    }
    resubmitted
}
