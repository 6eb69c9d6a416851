use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::block::b64;
use super::Id;

/// Suffix appended to expired tx ids when an operator resubmits manually;
/// descendants carrying it are excluded from automatic retry.
pub const RESUBMISSION_MARKER: &str = "-auto-resubmitted-";

/// Pending transaction as held by the mempool and carried by gossip.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "TxID")]
    pub tx_id: String,
    #[serde(rename = "Payload", with = "b64")]
    pub payload: Vec<u8>,
    #[serde(rename = "Timestamp")]
    pub timestamp: i64,
    #[serde(rename = "Sender", default, skip_serializing_if = "String::is_empty")]
    pub sender: String,
}

impl Transaction {
    pub fn new(payload: Vec<u8>, sender: impl Into<String>) -> Self {
        Self {
            tx_id: Id::new(&payload).to_hex(),
            payload,
            timestamp: Utc::now().timestamp(),
            sender: sender.into(),
        }
    }
}

/// One transaction wrapped for peer fan-out.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipMessage {
    #[serde(rename = "Tx")]
    pub tx: Transaction,
}

/// Archive entry for a transaction that aged out of the mempool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExpiredTx {
    pub tx_id: String,
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
    pub expired_at: DateTime<Utc>,
    pub reason: String,
    #[serde(default)]
    pub resubmit_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resubmission_tx_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
}

impl ExpiredTx {
    /// Transient failures are worth retrying; anything else is terminal.
    pub fn is_retryable(&self) -> bool {
        if self.last_error.is_empty() {
            return true;
        }
        let err = self.last_error.to_lowercase();
        err.contains("timeout") || err.contains("network")
    }

    pub fn is_resubmission_descendant(&self) -> bool {
        self.tx_id.contains(RESUBMISSION_MARKER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expired(tx_id: &str, last_error: &str) -> ExpiredTx {
        ExpiredTx {
            tx_id: tx_id.into(),
            payload: Vec::new(),
            expired_at: Utc::now(),
            reason: "timeout".into(),
            resubmit_count: 0,
            resubmission_tx_ids: Vec::new(),
            last_error: last_error.into(),
        }
    }

    #[test]
    fn tx_id_is_payload_hash() {
        let tx = Transaction::new(b"payload".to_vec(), "sender");
        assert_eq!(tx.tx_id, Id::new(b"payload").to_hex());
    }

    #[test]
    fn retryable_errors_match_transient_patterns() {
        assert!(expired("a", "").is_retryable());
        assert!(expired("a", "request Timeout after 10s").is_retryable());
        assert!(expired("a", "NETWORK unreachable").is_retryable());
        assert!(!expired("a", "schema validation failed").is_retryable());
    }

    #[test]
    fn descendants_are_flagged() {
        assert!(expired("tx-auto-resubmitted-1", "").is_resubmission_descendant());
        assert!(!expired("tx", "").is_resubmission_descendant());
    }
}
