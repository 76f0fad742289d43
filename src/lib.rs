//! MediaVault: Registry & Cache Reconciliation Engine
//!
//! Keeps an authoritative, crash-tolerant record of every media file in a set
//! of managed directories and the operation that produced it:
//! - Scanner (fingerprints what is actually on disk)
//! - Reconciler (repairs drift between the registry and the disk)
//! - Incinerator (evicts cache entries without breaking provenance)
//! - Librarian (background watcher that triggers the other two)

pub mod config;
pub mod error;
pub mod incinerator;
pub mod librarian;
pub mod reconciler;
pub mod registry;
pub mod retry;
pub mod scanner;
pub mod state;
pub mod storage;

pub use config::{EngineConfig, EvictionPolicy, RetryPolicy};
pub use error::{MediaError, Result};
pub use incinerator::{EvictionReport, EvictedFile, EvictionReason};
pub use librarian::Librarian;
pub use reconciler::{RecoveredFile, RecoveryOrigin, ReconciliationReport};
pub use registry::{HealthReport, OperationDraft, RegisterRequest, Registry, VerifyReport};
pub use state::SystemState;
pub use storage::{
    FileId, FileKind, FileRecord, FileStatus, OperationId, OperationRecord, RecordFilter,
};
