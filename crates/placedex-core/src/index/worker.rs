//! Index worker
//!
//! One worker per pooled connection. A worker keeps claiming batches until the
//! queue is exhausted, the run is cancelled, or a fatal error occurs. Cancellation
//! is only observed between batches, so the current transaction always ends in a
//! commit or a rollback.

use super::queue::{Claim, ClaimQueue};
use super::{IndexError, IndexResult, Lease};
use crate::config::IndexerConfig;
use crate::db::{DbError, IndexConnection, PlaceStore};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry settings for transient database errors
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &IndexerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: config.retry_backoff,
        }
    }

    /// Wait before retry number `attempt` (starting at 1)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(factor)
    }
}

/// Why a worker stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Exhausted,
    Cancelled,
}

/// Work done by one worker on one unit
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub exit: WorkerExit,
    pub batches: usize,
    pub indexed: usize,
    pub skipped: usize,
    pub retries: usize,
    pub reconnects: usize,
}

impl WorkerReport {
    fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            exit: WorkerExit::Exhausted,
            batches: 0,
            indexed: 0,
            skipped: 0,
            retries: 0,
            reconnects: 0,
        }
    }
}

/// A finished worker hands its connection back together with the outcome
pub struct FinishedWorker<C> {
    pub worker_id: usize,
    pub connection: C,
    pub report: IndexResult<WorkerReport>,
}

pub struct IndexWorker<S: PlaceStore> {
    id: usize,
    store: Arc<S>,
    conn: S::Connection,
    queue: Arc<ClaimQueue>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    lease: Option<Lease>,
}

impl<S: PlaceStore> IndexWorker<S> {
    pub fn new(
        id: usize,
        store: Arc<S>,
        conn: S::Connection,
        queue: Arc<ClaimQueue>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            store,
            conn,
            queue,
            retry,
            cancel,
            lease: None,
        }
    }

    /// The worker's connection carries `lease`; a replacement connection
    /// must take it over before any further claim.
    pub fn holding_lease(mut self, lease: Lease) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Drain the queue. A panic inside the loop is reported as an error so the
    /// connection still goes back to the pool.
    pub async fn run(mut self) -> FinishedWorker<S::Connection> {
        let mut report = WorkerReport::new(self.id);
        let result = match AssertUnwindSafe(self.drain(&mut report))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(IndexError::Worker(format!(
                "worker {} panicked: {}",
                self.id,
                panic_message(&*panic)
            ))),
        };

        FinishedWorker {
            worker_id: self.id,
            connection: self.conn,
            report: result.map(|()| report),
        }
    }

    async fn drain(&mut self, report: &mut WorkerReport) -> IndexResult<()> {
        let unit = self.queue.unit();
        loop {
            if self.cancel.is_cancelled() {
                debug!("Worker {} stopping on cancellation ({})", self.id, unit);
                report.exit = WorkerExit::Cancelled;
                return Ok(());
            }

            match self.claim_with_retry(report).await? {
                None => {
                    report.exit = WorkerExit::Cancelled;
                    return Ok(());
                }
                Some(Claim::Exhausted) => {
                    debug!(
                        "Worker {} finished {} after {} batches",
                        self.id, unit, report.batches
                    );
                    report.exit = WorkerExit::Exhausted;
                    return Ok(());
                }
                Some(Claim::Batch(outcome)) => {
                    report.batches += 1;
                    report.indexed += outcome.indexed;
                    report.skipped += outcome.skipped.len();
                    for skipped in &outcome.skipped {
                        warn!(
                            "Skipped place {} at {}: {}",
                            skipped.place_id, unit, skipped.reason
                        );
                    }
                    debug!(
                        "Worker {} committed {} places of {}",
                        self.id, outcome.indexed, unit
                    );
                }
            }
        }
    }

    /// Claim one batch, retrying transient failures. `None` means the run was
    /// cancelled while waiting to retry.
    async fn claim_with_retry(&mut self, report: &mut WorkerReport) -> IndexResult<Option<Claim>> {
        let unit = self.queue.unit();
        let mut attempt = 0;

        loop {
            let err = match self.queue.next(&mut self.conn).await {
                Ok(claim) => return Ok(Some(claim)),
                Err(e) => e,
            };

            if !err.is_transient() {
                return Err(match err {
                    DbError::Data { place_id, message } => IndexError::Data {
                        unit,
                        place_id,
                        message,
                    },
                    other => IndexError::Db(other),
                });
            }

            if attempt >= self.retry.max_retries {
                return Err(IndexError::RetriesExhausted {
                    unit,
                    attempts: attempt + 1,
                    source: err,
                });
            }

            attempt += 1;
            report.retries += 1;
            let delay = self.retry.delay(attempt);
            warn!(
                "Worker {}: transient error on {} ({}), retry {}/{} in {:?}",
                self.id, unit, err, attempt, self.retry.max_retries, delay
            );

            if err.is_connection_loss() {
                self.reconnect(report).await?;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Swap in a fresh connection. On failure the old one is kept and the
    /// next attempt fails again, consuming another retry. A lease held by the
    /// old session is taken over by the new one or the run fails.
    async fn reconnect(&mut self, report: &mut WorkerReport) -> IndexResult<()> {
        let fresh = match self.store.connect().await {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!("Worker {} failed to reconnect: {}", self.id, e);
                return Ok(());
            }
        };

        let stale = std::mem::replace(&mut self.conn, fresh);
        let _ = stale.close().await;
        report.reconnects += 1;
        debug!("Worker {} reconnected", self.id);

        if let Some(lease) = &self.lease {
            lease.acquire(&mut self.conn).await?;
            debug!("Worker {} took over lock '{}'", self.id, lease.name());
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
