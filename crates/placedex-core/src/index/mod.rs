//! Indexing orchestration
//!
//! [`Indexer`] is the entry point. It opens the connection pool, takes the
//! exclusive lease, and lets the [`scheduler::RankScheduler`] drain every
//! rank in order.

pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod status;
pub mod worker;

pub use status::{ProgressMarker, StatusTracker};

use crate::config::{ConfigError, IndexerConfig};
use crate::db::{DbError, DbResult, IndexConnection, PgStore, PlaceStore};
use crate::{IndexingJob, Phase, PhaseSelector, PlaceId, RankError, RankRange, WorkUnit};
use pool::ConnectionPool;
use scheduler::RankScheduler;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Invalid rank: {0}")]
    Rank(#[from] RankError),
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("Indexing place {place_id} at {unit} failed: {message}")]
    Data {
        unit: WorkUnit,
        place_id: PlaceId,
        message: String,
    },
    #[error("Giving up on {unit} after {attempts} attempts: {source}")]
    RetriesExhausted {
        unit: WorkUnit,
        attempts: u32,
        source: DbError,
    },
    #[error("{remaining} places of {unit} are still pending after draining")]
    Incomplete { unit: WorkUnit, remaining: u64 },
    #[error("Another indexing run holds the lock '{0}'")]
    LockHeld(String),
    #[error("Worker failed: {0}")]
    Worker(String),
    #[error("Connection pool is checked out")]
    PoolCheckedOut,
    #[error("Indexing was cancelled")]
    Cancelled,
}

/// Result type for indexing operations
pub type IndexResult<T> = Result<T, IndexError>;

/// Statistics from an indexing run
#[derive(Debug, Clone, Default)]
pub struct IndexingStats {
    /// Connections (and workers) used
    pub workers: usize,
    /// Units drained to completion in this run
    pub units_completed: usize,
    /// Units skipped because an earlier run completed them
    pub units_resumed: usize,
    /// Committed batches
    pub batches: usize,
    /// Places marked indexed
    pub places_indexed: usize,
    /// Places left pending after their computation failed
    pub places_skipped: usize,
    /// Retries after transient errors
    pub retries: usize,
    /// Total duration
    pub duration: Duration,
}

impl std::fmt::Display for IndexingStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Indexing Statistics:")?;
        writeln!(f, "  Workers:          {}", self.workers)?;
        writeln!(f, "  Units completed:  {}", self.units_completed)?;
        writeln!(f, "  Units resumed:    {}", self.units_resumed)?;
        writeln!(f, "  Batches:          {}", self.batches)?;
        writeln!(f, "  Places indexed:   {}", self.places_indexed)?;
        writeln!(f, "  Places skipped:   {}", self.places_skipped)?;
        writeln!(f, "  Retries:          {}", self.retries)?;
        writeln!(f, "  Duration:         {:.2?}", self.duration)?;
        Ok(())
    }
}

/// Pending places at one rank
#[derive(Debug, Clone, Serialize)]
pub struct RankBacklog {
    pub rank: u8,
    pub boundary: u64,
    pub regular: u64,
}

/// Progress markers and remaining work
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub markers: Vec<ProgressMarker>,
    pub backlog: Vec<RankBacklog>,
}

/// Public entry point of the indexing engine
pub struct Indexer<S: PlaceStore> {
    store: Arc<S>,
    config: IndexerConfig,
    workers: usize,
    cancel: CancellationToken,
}

impl Indexer<PgStore> {
    /// Build an indexer for the PostgreSQL database named by `config.dsn`
    pub fn new(config: IndexerConfig) -> IndexResult<Self> {
        config.validate()?;
        let store = PgStore::new(&config.dsn).map_err(|e| ConfigError::InvalidDsn(e.to_string()))?;
        Self::with_store(store, config)
    }
}

impl<S: PlaceStore> Indexer<S> {
    pub fn with_store(store: S, config: IndexerConfig) -> IndexResult<Self> {
        config.validate()?;
        let workers = config.worker_count();
        Ok(Self {
            store: Arc::new(store),
            config,
            workers,
            cancel: CancellationToken::new(),
        })
    }

    /// Number of worker connections every run opens
    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Token that stops the current run after in-flight batches finish
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Index administrative boundaries in `rank_min..=rank_max`
    pub async fn index_boundaries(&self, rank_min: i64, rank_max: i64) -> IndexResult<IndexingStats> {
        self.run(PhaseSelector::BoundariesOnly, rank_min, rank_max).await
    }

    /// Index all places except administrative boundaries in `rank_min..=rank_max`
    pub async fn index_by_rank(&self, rank_min: i64, rank_max: i64) -> IndexResult<IndexingStats> {
        self.run(PhaseSelector::RegularOnly, rank_min, rank_max).await
    }

    /// Index boundaries and places, boundaries first within each rank
    pub async fn index_full(&self, rank_min: i64, rank_max: i64) -> IndexResult<IndexingStats> {
        self.run(PhaseSelector::Both, rank_min, rank_max).await
    }

    /// Flag the import as indexed after a complete pass
    pub async fn update_status_table(&self) -> IndexResult<()> {
        let mut conn = self.store.connect().await?;
        let result = conn.mark_import_indexed().await;
        conn.close().await?;
        result?;
        info!("Import status updated");
        Ok(())
    }

    /// Stored markers and pending counts for every rank
    pub async fn status(&self) -> IndexResult<StatusReport> {
        let mut conn = self.store.connect().await?;
        let report = collect_status(&mut conn).await;
        conn.close().await?;
        report
    }

    async fn run(&self, phases: PhaseSelector, rank_min: i64, rank_max: i64) -> IndexResult<IndexingStats> {
        let ranks = RankRange::new(rank_min, rank_max)?;
        let job = IndexingJob::new(phases, ranks);
        let start = Instant::now();
        let mut stats = IndexingStats::default();

        if ranks.is_empty() {
            warn!("Empty rank range {}, nothing to index", ranks);
            return Ok(stats);
        }

        info!(
            "Indexing {:?} over ranks {} with {} workers",
            phases, ranks, self.workers
        );

        let mut pool = ConnectionPool::open(self.store.as_ref(), self.workers).await?;
        stats.workers = pool.size();

        let result = self.run_exclusive(&mut pool, job, &mut stats).await;
        let closed = pool.close().await;

        stats.duration = start.elapsed();
        result?;
        closed?;

        info!("Indexing complete in {:.2?}", stats.duration);
        Ok(stats)
    }

    /// Hold the lease on the primary connection for the whole run
    async fn run_exclusive(
        &self,
        pool: &mut ConnectionPool<S::Connection>,
        job: IndexingJob,
        stats: &mut IndexingStats,
    ) -> IndexResult<()> {
        let lease = Lease::new(&self.config.lock_name);
        lease.acquire(pool.primary()?).await?;

        let result = RankScheduler::new(&self.store, &self.config, &self.cancel)
            .with_lease(&lease)
            .run(pool, job, stats)
            .await;

        match pool.primary() {
            Ok(conn) => {
                if let Err(e) = lease.release(conn).await {
                    warn!("Failed to release lock '{}': {}", lease.name(), e);
                }
            }
            Err(e) => warn!("Lock '{}' released on close: {}", lease.name(), e),
        }

        result
    }
}

/// Session-level advisory lock that keeps indexing runs exclusive
#[derive(Debug, Clone)]
pub struct Lease {
    name: String,
    key: i64,
}

impl Lease {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            key: lease_key(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    /// Take the lock on `conn`, failing with `LockHeld` if another session has it
    pub async fn acquire<C: IndexConnection>(&self, conn: &mut C) -> IndexResult<()> {
        if conn.try_acquire_lease(self.key).await? {
            Ok(())
        } else {
            Err(IndexError::LockHeld(self.name.clone()))
        }
    }

    pub async fn release<C: IndexConnection>(&self, conn: &mut C) -> DbResult<()> {
        conn.release_lease(self.key).await
    }
}

/// Read-only: a database that was never indexed has no progress table and
/// reports no markers.
async fn collect_status<C: IndexConnection>(conn: &mut C) -> IndexResult<StatusReport> {
    let mut markers = Vec::new();
    for phase in Phase::ALL {
        if let Some(marker) = conn.load_progress(phase).await? {
            markers.push(marker);
        }
    }

    let mut backlog = Vec::new();
    for rank in RankRange::full().iter() {
        let boundary = conn
            .count_pending(WorkUnit {
                phase: Phase::Boundary,
                rank,
            })
            .await?;
        let regular = conn
            .count_pending(WorkUnit {
                phase: Phase::Regular,
                rank,
            })
            .await?;
        if boundary > 0 || regular > 0 {
            backlog.push(RankBacklog {
                rank: rank.value(),
                boundary,
                regular,
            });
        }
    }

    Ok(StatusReport { markers, backlog })
}

/// Advisory lock key for `name`: the first 8 bytes of its SHA-256
fn lease_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}
