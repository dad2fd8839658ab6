//! Engine configuration

use crate::FailurePolicy;
use std::time::Duration;
use thiserror::Error;

/// Default database DSN (libpq keyword form)
pub const DEFAULT_DSN: &str = "dbname=nominatim";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Database DSN must not be empty")]
    EmptyDsn,
    #[error("Batch size must be at least 1")]
    InvalidBatchSize,
    #[error("Invalid DSN: {0}")]
    InvalidDsn(String),
}

/// Configuration for an indexing engine
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Database connection string (URL or libpq keyword/value form)
    pub dsn: String,
    /// Number of worker connections (None or 0 = number of CPUs)
    pub threads: Option<usize>,
    /// Places claimed per worker transaction
    pub batch_size: usize,
    /// Retries of a batch after a transient database error
    pub max_retries: u32,
    /// Delay before the first retry, doubled for every further attempt
    pub retry_backoff: Duration,
    /// Handling of places whose computation fails
    pub failure_policy: FailurePolicy,
    /// Name of the advisory lock that keeps indexing runs exclusive
    pub lock_name: String,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            dsn: DEFAULT_DSN.to_string(),
            threads: None,
            batch_size: 100,
            max_retries: 3,
            retry_backoff: Duration::from_millis(250),
            failure_policy: FailurePolicy::AbortBatch,
            lock_name: "placedex.indexer".to_string(),
        }
    }
}

impl IndexerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dsn.trim().is_empty() {
            return Err(ConfigError::EmptyDsn);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        Ok(())
    }

    /// Number of workers (and connections) this configuration resolves to
    pub fn worker_count(&self) -> usize {
        resolve_worker_count(self.threads)
    }
}

/// Resolve the worker count.
///
/// An explicit positive count is used as is. Otherwise the number of CPUs
/// available to the process is used (honouring affinity masks and cgroup
/// quotas), with a floor of 1.
pub fn resolve_worker_count(requested: Option<usize>) -> usize {
    match requested {
        Some(n) if n > 0 => n,
        _ => num_cpus::get().max(1),
    }
}
