use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use ed25519_dalek::{PublicKey, Signature, Verifier};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::errors::{ChainError, ChainResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalizationStatus {
    Pending,
    Finalized,
    Failed,
    Duplicate,
}

/// Block metadata a finalization is anchored to.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BlockReference {
    #[serde(rename = "blockHash")]
    pub block_hash: String,
    pub epoch: u64,
}

/// Certifies a previously submitted medical record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FinalizeEventTx {
    #[serde(rename = "txID")]
    pub tx_id: String,
    #[serde(rename = "submitRecordTx")]
    pub submit_record_tx: serde_json::Value,
    #[serde(rename = "finalizerSignature", default)]
    pub finalizer_signature: String,
    #[serde(rename = "authToken", default, skip_serializing_if = "String::is_empty")]
    pub auth_token: String,
    pub block: BlockReference,
    pub timestamp: DateTime<Utc>,
    pub status: FinalizationStatus,
    #[serde(rename = "auditLogId", default, skip_serializing_if = "String::is_empty")]
    pub audit_log_id: String,
}

/// Canonical rendering of [`FinalizeEventTx`]: sorted object keys and an
/// RFC3339-nanosecond UTC timestamp. The serialized bytes are the hash
/// pre-image for epoch Merkle leaves.
#[derive(Serialize)]
struct CanonicalFinalizeEventTx<'a> {
    #[serde(rename = "txID")]
    tx_id: &'a str,
    #[serde(rename = "submitRecordTx")]
    submit_record_tx: &'a serde_json::Value,
    #[serde(rename = "finalizerSignature")]
    finalizer_signature: &'a str,
    #[serde(rename = "authToken")]
    auth_token: &'a str,
    block: &'a BlockReference,
    timestamp: String,
    status: FinalizationStatus,
    #[serde(rename = "auditLogId")]
    audit_log_id: &'a str,
}

impl FinalizeEventTx {
    pub fn new(
        submit_record_tx: serde_json::Value,
        signature: &[u8],
        auth_token: impl Into<String>,
        block: BlockReference,
    ) -> ChainResult<Self> {
        if submit_record_tx.is_null() {
            return Err(ChainError::Transaction(
                "submit record payload cannot be empty".into(),
            ));
        }
        Ok(Self {
            tx_id: Uuid::new_v4().to_string(),
            submit_record_tx,
            finalizer_signature: if signature.is_empty() {
                String::new()
            } else {
                BASE64.encode(signature)
            },
            auth_token: auth_token.into(),
            block,
            timestamp: Utc::now(),
            status: FinalizationStatus::Pending,
            audit_log_id: String::new(),
        })
    }

    pub fn marshal_canonical(&self) -> ChainResult<Vec<u8>> {
        let canonical = CanonicalFinalizeEventTx {
            tx_id: &self.tx_id,
            submit_record_tx: &self.submit_record_tx,
            finalizer_signature: &self.finalizer_signature,
            auth_token: &self.auth_token,
            block: &self.block,
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            status: self.status,
            audit_log_id: &self.audit_log_id,
        };
        // Round-tripping through Value sorts every object's keys.
        let value = serde_json::to_value(&canonical)?;
        Ok(serde_json::to_vec(&value)?)
    }

    pub fn canonical_hash(&self) -> ChainResult<String> {
        let bytes = self.marshal_canonical()?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// The message a finalizer signs: tx id concatenated with the block hash.
    pub fn signing_message(&self) -> Vec<u8> {
        let mut message = self.tx_id.as_bytes().to_vec();
        message.extend_from_slice(self.block.block_hash.as_bytes());
        message
    }

    pub fn validate(&self, finalizer_pub_key: &PublicKey) -> ChainResult<()> {
        if self.tx_id.is_empty() {
            return Err(ChainError::Transaction("txID cannot be empty".into()));
        }
        if self.submit_record_tx.is_null() {
            return Err(ChainError::Transaction(
                "submit record payload cannot be empty".into(),
            ));
        }
        if self.block.block_hash.is_empty() {
            return Err(ChainError::Transaction("block hash cannot be empty".into()));
        }
        if self.timestamp.timestamp() == 0 {
            return Err(ChainError::Transaction("timestamp cannot be zero".into()));
        }
        let signature_bytes = BASE64
            .decode(&self.finalizer_signature)
            .map_err(|_| ChainError::Crypto("invalid signature encoding".into()))?;
        let signature = Signature::from_bytes(&signature_bytes)
            .map_err(|err| ChainError::Crypto(format!("invalid signature bytes: {err}")))?;
        finalizer_pub_key
            .verify(&self.signing_message(), &signature)
            .map_err(|_| ChainError::Crypto("invalid finalizer signature".into()))
    }

    pub fn finalize(&mut self) {
        self.status = FinalizationStatus::Finalized;
        self.timestamp = Utc::now();
        self.audit_log_id = "finalized".into();
    }

    pub fn mark_failed(&mut self, reason: &str) {
        self.status = FinalizationStatus::Failed;
        if self.audit_log_id.is_empty() {
            self.audit_log_id = format!("failed:{reason}");
        }
    }
}

/// Seals an epoch with the Merkle root of its finalized events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FinalizeEpochTx {
    #[serde(rename = "txID")]
    pub tx_id: String,
    #[serde(rename = "epochNumber")]
    pub epoch_number: u64,
    #[serde(rename = "finalizerSignature")]
    pub finalizer_signature: String,
    #[serde(rename = "epochSummaryHash", default, skip_serializing_if = "String::is_empty")]
    pub epoch_summary_hash: String,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    #[serde(rename = "auditLogID", default, skip_serializing_if = "String::is_empty")]
    pub audit_log_id: String,
}

impl FinalizeEpochTx {
    pub fn new(epoch_number: u64, finalizer_signature: String, epoch_summary_hash: String) -> Self {
        Self {
            tx_id: Uuid::new_v4().to_string(),
            epoch_number,
            finalizer_signature,
            epoch_summary_hash,
            timestamp: Utc::now(),
            status: "pending".into(),
            audit_log_id: String::new(),
        }
    }

    pub fn validate(&self) -> ChainResult<()> {
        if self.finalizer_signature.is_empty() {
            return Err(ChainError::Transaction(
                "finalizerSignature is required".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EpochFinalizationReceipt {
    #[serde(rename = "txID")]
    pub tx_id: String,
    pub status: String,
    #[serde(rename = "epochNumber")]
    pub epoch_number: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}
