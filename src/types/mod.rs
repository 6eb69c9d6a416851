mod block;
mod finalize;
mod ids;
mod record;
mod transaction;

pub use block::{
    b64, AuditLogEntry, BanEvent, Block, BlockAnnounce, BlockBroadcast, ChainedEvent,
};
pub use finalize::{
    BlockReference, EpochFinalizationReceipt, FinalizationStatus, FinalizeEpochTx, FinalizeEventTx,
};
pub use ids::Id;
pub use record::{MedicalRecordSubmission, TransactionReceipt};
pub use transaction::{ExpiredTx, GossipMessage, Transaction, RESUBMISSION_MARKER};
