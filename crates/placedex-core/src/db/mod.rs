//! Database access for the indexing engine
//!
//! The engine only talks to the database through the [`PlaceStore`] and
//! [`IndexConnection`] traits. The PostgreSQL implementation lives in
//! [`postgres`].

#[cfg(test)]
pub(crate) mod memory;
pub mod postgres;

pub use postgres::{PgIndexConnection, PgStore};

use crate::index::status::ProgressMarker;
use crate::{FailurePolicy, Phase, PlaceId, Rank, RankRange, WorkUnit};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("Database connection error: {0}")]
    Connection(String),
    #[error("Invalid connection settings: {0}")]
    Configuration(String),
    #[error("Deadlock detected: {0}")]
    Deadlock(String),
    #[error("Lock contention: {0}")]
    LockContention(String),
    #[error("Indexing place {place_id} failed: {message}")]
    Data { place_id: PlaceId, message: String },
    #[error("Schema error: {0}")]
    Schema(String),
    #[error("Query execution error: {0}")]
    Query(String),
}

impl DbError {
    /// Errors worth retrying: the same work may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DbError::Connection(_) | DbError::Deadlock(_) | DbError::LockContention(_)
        )
    }

    /// The connection itself is unusable and must be replaced before retrying.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, DbError::Connection(_))
    }
}

/// Result type for database operations
pub type DbResult<T> = Result<T, DbError>;

/// One claim-and-index request issued by a worker
#[derive(Debug, Clone)]
pub struct BatchRequest<'a> {
    pub unit: WorkUnit,
    /// Maximum number of places to claim
    pub limit: usize,
    /// Places never to claim again during this pass
    pub exclude: &'a [PlaceId],
    pub policy: FailurePolicy,
}

/// A place left pending because its computation failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPlace {
    pub place_id: PlaceId,
    pub reason: String,
}

/// Committed result of one batch
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Every place claimed by the batch
    pub claimed: Vec<PlaceId>,
    /// Places marked indexed by the commit
    pub indexed: usize,
    /// Places rolled back individually under [`FailurePolicy::SkipAndLog`]
    pub skipped: Vec<SkippedPlace>,
}

impl BatchOutcome {
    pub fn is_empty(&self) -> bool {
        self.claimed.is_empty()
    }
}

/// Opens connections to the place database
#[async_trait]
pub trait PlaceStore: Send + Sync + 'static {
    type Connection: IndexConnection;

    async fn connect(&self) -> DbResult<Self::Connection>;
}

/// A single database session, owned by one worker at a time
#[async_trait]
pub trait IndexConnection: Send + 'static {
    /// Claim up to `request.limit` pending places of the unit, run the
    /// indexing computation on each and commit, all in one transaction.
    ///
    /// Claimed places stay locked against other sessions until the
    /// transaction ends. On error the transaction is rolled back and every
    /// claimed place returns to the pending state. An empty `claimed` list
    /// means no unclaimed place is left for this unit.
    async fn run_batch(&mut self, request: &BatchRequest<'_>) -> DbResult<BatchOutcome>;

    /// Number of places of the unit that still need indexing
    async fn count_pending(&mut self, unit: WorkUnit) -> DbResult<u64>;

    /// Create the progress table if missing
    async fn prepare_progress(&mut self) -> DbResult<()>;

    async fn load_progress(&mut self, phase: Phase) -> DbResult<Option<ProgressMarker>>;

    /// Start a fresh pass over `range` for `phase`, forgetting earlier progress
    async fn reset_progress(&mut self, phase: Phase, range: RankRange) -> DbResult<()>;

    /// Raise the completed rank of `phase`. Never lowers a stored value.
    async fn record_progress(&mut self, phase: Phase, rank: Rank) -> DbResult<()>;

    /// Flag the database import as fully indexed
    async fn mark_import_indexed(&mut self) -> DbResult<()>;

    /// Try to take the session-level exclusive lease identified by `key`
    async fn try_acquire_lease(&mut self, key: i64) -> DbResult<bool>;

    async fn release_lease(&mut self, key: i64) -> DbResult<()>;

    /// Close the session. Any open transaction is rolled back.
    async fn close(self) -> DbResult<()>;
}
