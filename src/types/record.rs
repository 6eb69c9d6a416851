use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Medical-record submission payload as it arrives from a wallet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MedicalRecordSubmission {
    pub record: serde_json::Value,
    #[serde(default)]
    pub signature: String,
    #[serde(rename = "walletAddress")]
    pub wallet_address: String,
    #[serde(rename = "revisionOf", default, skip_serializing_if = "String::is_empty")]
    pub revision_of: String,
    #[serde(
        rename = "revisionReason",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub revision_reason: String,
    #[serde(rename = "docLineage", default, skip_serializing_if = "Vec::is_empty")]
    pub doc_lineage: Vec<String>,
    #[serde(rename = "submissionTimestamp", default)]
    pub submission_timestamp: DateTime<Utc>,
}

impl MedicalRecordSubmission {
    pub fn record_id(&self) -> String {
        self.record
            .get("recordId")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

/// Result handed back for one submission attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionReceipt {
    #[serde(rename = "txID")]
    pub tx_id: String,
    #[serde(rename = "blockHash", default, skip_serializing_if = "String::is_empty")]
    pub block_hash: String,
    #[serde(rename = "blockHeight")]
    pub block_height: u64,
    pub status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl TransactionReceipt {
    pub fn failed(block_height: u64, error: impl Into<String>) -> Self {
        Self {
            tx_id: String::new(),
            block_hash: String::new(),
            block_height,
            status: "failed".into(),
            errors: vec![error.into()],
        }
    }

    pub fn pending(tx_id: String, block_height: u64) -> Self {
        Self {
            tx_id,
            block_hash: String::new(),
            block_height,
            status: "pending".into(),
            errors: Vec::new(),
        }
    }
}
