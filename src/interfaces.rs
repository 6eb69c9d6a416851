use serde_json::Value;

use crate::errors::{ChainError, ChainResult};
use crate::types::FinalizationStatus;

/// Validates medical-record payloads against the deployment's schema.
/// Implementations decide what a well-formed record is; the core only
/// routes accept/reject.
pub trait RecordValidator: Send + Sync {
    fn validate_record(&self, record: &Value) -> ChainResult<()>;
}

/// Verifies wallet signatures over submitted records and answers whether a
/// wallet is allowed to submit at all.
pub trait WalletVerifier: Send + Sync {
    fn is_authorized(&self, wallet_address: &str) -> bool;
    fn verify_signature(
        &self,
        record: &Value,
        signature_b64: &str,
        wallet_address: &str,
    ) -> ChainResult<()>;
}

/// Verifies bearer tokens on finalization requests.
pub trait TokenVerifier: Send + Sync {
    fn verify_token(&self, token: &str) -> ChainResult<()>;
}

/// Write-only sink for compliance audit entries.
pub trait AuditSink: Send + Sync {
    fn log_finalization(&self, tx_id: &str, status: FinalizationStatus, reason: &str);
}

/// Accepts every record with the minimal structural checks the chain
/// itself depends on. Stands in until a deployment wires a real schema
/// validator.
pub struct DummyRecordValidator;

impl RecordValidator for DummyRecordValidator {
    fn validate_record(&self, record: &Value) -> ChainResult<()> {
        let Some(object) = record.as_object() else {
            return Err(ChainError::Transaction(
                "record must be a JSON object".into(),
            ));
        };
        match object.get("recordId").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => Ok(()),
            _ => Err(ChainError::Transaction(
                "record is missing a recordId".into(),
            )),
        }
    }
}

/// Open wallet policy: every wallet is authorized and signatures only need
/// to be present.
pub struct DummyWalletVerifier;

impl WalletVerifier for DummyWalletVerifier {
    fn is_authorized(&self, _wallet_address: &str) -> bool {
        true
    }

    fn verify_signature(
        &self,
        _record: &Value,
        signature_b64: &str,
        _wallet_address: &str,
    ) -> ChainResult<()> {
        if signature_b64.is_empty() {
            return Err(ChainError::Crypto("missing wallet signature".into()));
        }
        Ok(())
    }
}

pub struct DummyTokenVerifier;

impl TokenVerifier for DummyTokenVerifier {
    fn verify_token(&self, _token: &str) -> ChainResult<()> {
        Ok(())
    }
}

/// Audit sink that writes structured log lines.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn log_finalization(&self, tx_id: &str, status: FinalizationStatus, reason: &str) {
        tracing::info!(%tx_id, ?status, %reason, "finalization audit");
    }
}
