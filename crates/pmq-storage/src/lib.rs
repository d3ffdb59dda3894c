//! Replica-guarded market storage: read-side scans, writer-side upserts, and the
//! reader counter that gates snapshot replacement.

mod guard;
mod scan;
mod sqlite;

use async_trait::async_trait;
use pmq_core::MarketRecord;
use thiserror::Error;

pub use guard::{ReadToken, ReplicaGuard, SnapshotWriter, DEFAULT_POLL_INTERVAL};
pub use scan::{OrderBy, Predicate, ScanRequest, TextColumn};
pub use sqlite::{count_active_records, snapshot_into, MarketWriter, SqliteRowStore};

pub const CRATE_NAME: &str = "pmq-storage";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("market store unavailable at {path}: {reason}")]
    Unavailable { path: String, reason: String },
    #[error("invalid scan: {0}")]
    InvalidQuery(String),
}

/// Typed read access to market records.
///
/// Implementations run every scan inside a [`ReplicaGuard`] read section.
#[async_trait]
pub trait RowStore: Send + Sync {
    async fn scan(&self, request: &ScanRequest) -> Result<Vec<MarketRecord>, StoreError>;
}
