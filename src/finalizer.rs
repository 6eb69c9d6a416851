use std::collections::HashSet;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Keypair, Signer};
use serde_json::Value;
use tracing::{debug, info};

use crate::crypto::public_key_from_base64;
use crate::errors::{ChainError, ChainResult};
use crate::interfaces::{AuditSink, RecordValidator};
use crate::types::FinalizeEventTx;

/// Finalizes medical-record submissions with atomic commit/rollback: every
/// check runs against staged values and nothing on the transaction mutates
/// unless the whole sequence passes.
pub struct Finalizer {
    authorized: HashSet<String>,
    audit: Arc<dyn AuditSink>,
    record_validator: Arc<dyn RecordValidator>,
    private_key: Option<Keypair>,
}

impl Finalizer {
    pub fn new(
        authorized: Vec<String>,
        audit: Arc<dyn AuditSink>,
        record_validator: Arc<dyn RecordValidator>,
        private_key: Option<Keypair>,
    ) -> Self {
        Self {
            authorized: authorized.into_iter().collect(),
            audit,
            record_validator,
            private_key,
        }
    }

    pub fn is_authorized(&self, finalizer_pub_key_b64: &str) -> bool {
        self.authorized.contains(finalizer_pub_key_b64)
    }

    /// Runs the full finalization sequence for `tx` under the claimed
    /// public key. On success the staged signature is installed, the status
    /// flips to finalized, and the audit sink is notified; any failure
    /// returns an error with the transaction untouched.
    pub fn finalize_event(
        &self,
        tx: &mut FinalizeEventTx,
        finalizer_pub_key_b64: &str,
    ) -> ChainResult<()> {
        if !self.is_authorized(finalizer_pub_key_b64) {
            return Err(ChainError::Crypto("unauthorized finalizer".into()));
        }
        let public_key = public_key_from_base64(finalizer_pub_key_b64)?;

        // Stage a signature when the node holds the finalizer key and the
        // submission arrived unsigned.
        let staged_signature = match &self.private_key {
            Some(keypair)
                if tx.finalizer_signature.is_empty()
                    && !tx.tx_id.is_empty()
                    && !tx.block.block_hash.is_empty() =>
            {
                let signature = keypair.sign(&tx.signing_message());
                debug!(tx_id = %tx.tx_id, "staged finalizer signature");
                Some(BASE64.encode(signature.to_bytes()))
            }
            _ => None,
        };

        // Validate against the staged candidate without touching `tx`.
        let mut candidate = tx.clone();
        if let Some(signature) = &staged_signature {
            candidate.finalizer_signature = signature.clone();
        }
        candidate.validate(&public_key)?;

        let envelope = tx
            .submit_record_tx
            .as_object()
            .ok_or_else(|| ChainError::Transaction("submit record is not a JSON object".into()))?;
        let record = envelope
            .get("record")
            .ok_or_else(|| ChainError::Transaction("submit record has no record field".into()))?;
        self.record_validator.validate_record(record)?;

        // Commit point: install staged state in one step.
        if let Some(signature) = staged_signature {
            tx.finalizer_signature = signature;
        }
        tx.finalize();
        info!(tx_id = %tx.tx_id, "record finalized");
        self.audit
            .log_finalization(&tx.tx_id, tx.status, "finalization_successful");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::testing::{RecordingAuditSink, RejectingRecordValidator};
    use crate::interfaces::DummyRecordValidator;
    use crate::types::{BlockReference, FinalizationStatus};
    use ed25519_dalek::Keypair;
    use rand::rngs::OsRng;
    use serde_json::json;

    struct Fixture {
        finalizer: Finalizer,
        pub_key_b64: String,
        audit: Arc<RecordingAuditSink>,
    }

    fn fixture(with_private_key: bool, validator: Arc<dyn RecordValidator>) -> Fixture {
        let keypair = Keypair::generate(&mut OsRng);
        let pub_key_b64 = BASE64.encode(keypair.public.to_bytes());
        let audit = Arc::new(RecordingAuditSink::default());
        let finalizer = Finalizer::new(
            vec![pub_key_b64.clone()],
            audit.clone(),
            validator,
            with_private_key.then_some(keypair),
        );
        Fixture {
            finalizer,
            pub_key_b64,
            audit,
        }
    }

    fn pending_tx() -> FinalizeEventTx {
        FinalizeEventTx::new(
            json!({"record": {"recordId": "r-77"}}),
            &[],
            "",
            BlockReference {
                block_hash: "ee".repeat(32),
                epoch: 1,
            },
        )
        .expect("build tx")
    }

    #[test]
    fn finalizes_and_signs_an_unsigned_tx() {
        let fix = fixture(true, Arc::new(DummyRecordValidator));
        let mut tx = pending_tx();
        fix.finalizer
            .finalize_event(&mut tx, &fix.pub_key_b64)
            .expect("finalize");
        assert_eq!(tx.status, FinalizationStatus::Finalized);
        assert!(!tx.finalizer_signature.is_empty());
        let entries = fix.audit.entries.lock().expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, FinalizationStatus::Finalized);
    }

    #[test]
    fn unauthorized_key_is_rejected_before_any_mutation() {
        let fix = fixture(true, Arc::new(DummyRecordValidator));
        let mut tx = pending_tx();
        let other = BASE64.encode(Keypair::generate(&mut OsRng).public.to_bytes());
        let err = fix.finalizer.finalize_event(&mut tx, &other).unwrap_err();
        assert!(matches!(err, ChainError::Crypto(_)));
        assert_eq!(tx.status, FinalizationStatus::Pending);
        assert!(tx.finalizer_signature.is_empty());
        assert!(fix.audit.entries.lock().expect("entries").is_empty());
    }

    #[test]
    fn unsigned_tx_without_private_key_fails_untouched() {
        let fix = fixture(false, Arc::new(DummyRecordValidator));
        let mut tx = pending_tx();
        assert!(fix
            .finalizer
            .finalize_event(&mut tx, &fix.pub_key_b64)
            .is_err());
        assert_eq!(tx.status, FinalizationStatus::Pending);
        assert!(tx.finalizer_signature.is_empty());
    }

    #[test]
    fn record_rejection_rolls_back_staged_signature() {
        let fix = fixture(true, Arc::new(RejectingRecordValidator));
        let mut tx = pending_tx();
        assert!(fix
            .finalizer
            .finalize_event(&mut tx, &fix.pub_key_b64)
            .is_err());
        assert_eq!(tx.status, FinalizationStatus::Pending);
        assert!(tx.finalizer_signature.is_empty());
        assert!(fix.audit.entries.lock().expect("entries").is_empty());
    }

    #[test]
    fn envelope_without_record_field_is_rejected() {
        let fix = fixture(true, Arc::new(DummyRecordValidator));
        let mut tx = pending_tx();
        tx.submit_record_tx = json!({"notRecord": {}});
        assert!(fix
            .finalizer
            .finalize_event(&mut tx, &fix.pub_key_b64)
            .is_err());
        assert_eq!(tx.status, FinalizationStatus::Pending);
    }
}
