use chrono::{DateTime, Utc};
use ed25519_dalek::{PublicKey, Signature, Verifier};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{ChainError, ChainResult};

use super::Id;

/// Serde helper rendering byte fields as standard base64 strings.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let value = String::deserialize(deserializer)?;
        BASE64.decode(value).map_err(D::Error::custom)
    }
}

/// Event embedded in a block. Either a medical-record submission, a
/// finalize event certifying one, or the genesis marker.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChainedEvent {
    #[serde(rename = "recordId", default, skip_serializing_if = "String::is_empty")]
    pub record_id: String,
    #[serde(rename = "eventID")]
    pub event_id: Id,
    #[serde(rename = "eventType")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "authorValidator", default)]
    pub author_validator: Id,
    #[serde(rename = "patientId", default, skip_serializing_if = "String::is_empty")]
    pub patient_id: String,
    #[serde(rename = "providerId", default, skip_serializing_if = "String::is_empty")]
    pub provider_id: String,
    #[serde(default)]
    pub epoch: u64,
    #[serde(rename = "payloadHash", default, skip_serializing_if = "String::is_empty")]
    pub payload_hash: String,
    #[serde(rename = "payloadRef", default, skip_serializing_if = "String::is_empty")]
    pub payload_ref: String,
    #[serde(
        rename = "revisionReason",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub revision_reason: String,
    #[serde(rename = "revisionOf", default, skip_serializing_if = "String::is_empty")]
    pub revision_of: String,
    #[serde(rename = "docLineage", default, skip_serializing_if = "Vec::is_empty")]
    pub doc_lineage: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub finalized: bool,
}

/// Hash-chained audit record of one submission attempt during assembly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditLogEntry {
    #[serde(rename = "eventID")]
    pub event_id: String,
    #[serde(rename = "submittedBy")]
    pub submitted_by: String,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub reason: String,
    #[serde(rename = "prevHash")]
    pub prev_hash: String,
    #[serde(rename = "entryHash")]
    pub entry_hash: String,
}

/// Ban propagated inside a block so the whole network converges on it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BanEvent {
    pub address: String,
    pub expiry: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub origin: String,
    #[serde(rename = "ban_count", default)]
    pub ban_count: u64,
    pub timestamp: DateTime<Utc>,
}

impl BanEvent {
    pub fn expiry_time(&self) -> ChainResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.expiry)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|err| ChainError::Config(format!("invalid ban expiry: {err}")))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    #[serde(rename = "block_id", default)]
    pub block_id: Id,
    pub version: String,
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub height: u64,
    #[serde(rename = "prevHash")]
    pub prev_hash: String,
    #[serde(rename = "merkleRoot")]
    pub merkle_root: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "validatorDID")]
    pub validator_did: String,
    #[serde(rename = "opUnitsUsed", default)]
    pub op_units_used: u64,
    #[serde(default)]
    pub events: Vec<ChainedEvent>,
    #[serde(rename = "auditLog", default, skip_serializing_if = "Vec::is_empty")]
    pub audit_log: Vec<AuditLogEntry>,
    #[serde(rename = "banEvents", default, skip_serializing_if = "Vec::is_empty")]
    pub ban_events: Vec<BanEvent>,
    #[serde(
        rename = "extraData",
        default,
        with = "b64",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub extra_data: Vec<u8>,
    #[serde(rename = "parentGasUsed", default)]
    pub parent_gas_used: u64,
    #[serde(rename = "stateRoot", default, skip_serializing_if = "String::is_empty")]
    pub state_root: String,
    #[serde(default, with = "b64", skip_serializing_if = "Vec::is_empty")]
    pub signature: Vec<u8>,
    #[serde(default)]
    pub epoch: u64,
}

/// Header fields in declaration order; the serialized form is the hash
/// pre-image for the block id. Excludes the id itself and the signature.
#[derive(Serialize)]
struct HeaderPreimage<'a> {
    version: &'a str,
    protocol_version: &'a str,
    height: u64,
    prev_hash: &'a str,
    merkle_root: &'a str,
    timestamp: &'a DateTime<Utc>,
    validator_did: &'a str,
    op_units_used: u64,
    extra_data: &'a [u8],
    parent_gas_used: u64,
    state_root: &'a str,
    epoch: u64,
}

impl Block {
    pub fn compute_id(&self) -> Id {
        let header = HeaderPreimage {
            version: &self.version,
            protocol_version: &self.protocol_version,
            height: self.height,
            prev_hash: &self.prev_hash,
            merkle_root: &self.merkle_root,
            timestamp: &self.timestamp,
            validator_did: &self.validator_did,
            op_units_used: self.op_units_used,
            extra_data: &self.extra_data,
            parent_gas_used: self.parent_gas_used,
            state_root: &self.state_root,
            epoch: self.epoch,
        };
        let bytes = serde_json::to_vec(&header).expect("serializing block header");
        Id::new(&bytes)
    }

    pub fn serialize(&self) -> ChainResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(data: &[u8]) -> ChainResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// A genesis block has no parent reference at all.
    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_empty() || self.prev_hash.chars().all(|c| c == '0')
    }

    pub fn verify_signature(&self, public_key: &PublicKey) -> ChainResult<()> {
        let signature = Signature::from_bytes(&self.signature)
            .map_err(|err| ChainError::Crypto(format!("invalid block signature bytes: {err}")))?;
        public_key
            .verify(self.block_id.as_bytes(), &signature)
            .map_err(|err| ChainError::Crypto(format!("block signature verification failed: {err}")))
    }

    /// Appends a hash-chained audit entry for one submission attempt.
    pub fn push_audit(
        &mut self,
        event_id: &str,
        submitted_by: &str,
        status: &str,
        reason: &str,
        timestamp: DateTime<Utc>,
    ) {
        let prev_hash = self
            .audit_log
            .last()
            .map(|entry| entry.entry_hash.clone())
            .unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(event_id.as_bytes());
        hasher.update(submitted_by.as_bytes());
        hasher.update(
            timestamp
                .to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
                .as_bytes(),
        );
        hasher.update(status.as_bytes());
        hasher.update(reason.as_bytes());
        hasher.update(prev_hash.as_bytes());
        let entry_hash = hex::encode(hasher.finalize());
        self.audit_log.push(AuditLogEntry {
            event_id: event_id.to_string(),
            submitted_by: submitted_by.to_string(),
            timestamp,
            status: status.to_string(),
            reason: reason.to_string(),
            prev_hash,
            entry_hash,
        });
    }
}

/// Compact header-first propagation message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockAnnounce {
    pub block_id: String,
    pub height: u64,
    pub prev_hash: String,
    pub timestamp: i64,
}

/// Full-block propagation message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockBroadcast {
    #[serde(with = "b64")]
    pub block_bytes: Vec<u8>,
    pub block_id: String,
}
