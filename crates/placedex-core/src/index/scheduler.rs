//! Rank scheduler
//!
//! Walks the units of a job in ascending rank, boundaries before regular
//! places, and drains each unit with the full worker pool before moving on.
//! The join of all workers is the barrier between ranks: no place of rank R+1
//! is claimed before every place of rank R has been committed.

use super::pool::ConnectionPool;
use super::queue::ClaimQueue;
use super::status::StatusTracker;
use super::worker::{FinishedWorker, IndexWorker, RetryPolicy, WorkerExit};
use super::{IndexError, IndexResult, IndexingStats, Lease};
use crate::config::IndexerConfig;
use crate::db::{IndexConnection, PlaceStore};
use crate::{IndexingJob, WorkUnit};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct RankScheduler<'a, S: PlaceStore> {
    store: &'a Arc<S>,
    config: &'a IndexerConfig,
    cancel: &'a CancellationToken,
    lease: Option<&'a Lease>,
}

impl<'a, S: PlaceStore> RankScheduler<'a, S> {
    pub fn new(store: &'a Arc<S>, config: &'a IndexerConfig, cancel: &'a CancellationToken) -> Self {
        Self {
            store,
            config,
            cancel,
            lease: None,
        }
    }

    /// `lease` is held by the primary connection and must survive reconnects
    pub fn with_lease(mut self, lease: &'a Lease) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Run every unit of `job` that is not already recorded as complete
    pub async fn run(
        &self,
        pool: &mut ConnectionPool<S::Connection>,
        job: IndexingJob,
        stats: &mut IndexingStats,
    ) -> IndexResult<()> {
        let mut tracker = StatusTracker::load(pool.primary()?, job).await?;
        if let Some(unit) = tracker.last_completed() {
            info!("Everything up to {} is already indexed", unit);
        }

        for unit in job.units() {
            if tracker.is_complete(unit) {
                debug!("Skipping {}, already complete", unit);
                stats.units_resumed += 1;
                continue;
            }
            if self.cancel.is_cancelled() {
                return Err(IndexError::Cancelled);
            }

            self.complete(pool, unit, stats).await?;
            tracker.record_completion(pool.primary()?, unit).await?;
            stats.units_completed += 1;
        }

        Ok(())
    }

    /// Drain `unit` until no claimable place is left, then check that nothing
    /// is still pending. Places locked by a foreign session are invisible to
    /// the claim, so the unit is drained again after a backoff.
    async fn complete(
        &self,
        pool: &mut ConnectionPool<S::Connection>,
        unit: WorkUnit,
        stats: &mut IndexingStats,
    ) -> IndexResult<()> {
        let queue = Arc::new(ClaimQueue::new(
            unit,
            self.config.batch_size,
            self.config.failure_policy,
        ));
        let retry = RetryPolicy::from_config(self.config);
        let mut rounds = 0;

        loop {
            let remaining = remaining(pool.primary()?, &queue).await?;
            if remaining == 0 {
                if rounds == 0 {
                    debug!("Nothing to index for {}", unit);
                }
                return Ok(());
            }

            if rounds > 0 {
                if rounds > retry.max_retries {
                    return Err(IndexError::Incomplete { unit, remaining });
                }
                stats.retries += 1;
                let delay = retry.delay(rounds);
                warn!(
                    "{} places of {} could not be claimed, draining again in {:?}",
                    remaining, unit, delay
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(IndexError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            self.drain(pool, &queue, remaining, stats).await?;
            rounds += 1;
        }
    }

    /// Run the whole pool on `queue` and wait for all workers
    async fn drain(
        &self,
        pool: &mut ConnectionPool<S::Connection>,
        queue: &Arc<ClaimQueue>,
        pending: u64,
        stats: &mut IndexingStats,
    ) -> IndexResult<()> {
        let unit = queue.unit();
        let start = Instant::now();
        let claimed_before = queue.claimed();
        info!("Indexing {} places of {}", pending, unit);

        let retry = RetryPolicy::from_config(self.config);
        // Aborting a unit stops sibling workers without cancelling the caller's token.
        let unit_cancel = self.cancel.child_token();

        let mut workers = JoinSet::new();
        for (worker_id, conn) in pool.checkout().into_iter().enumerate() {
            let mut worker = IndexWorker::new(
                worker_id,
                Arc::clone(self.store),
                conn,
                Arc::clone(queue),
                retry,
                unit_cancel.clone(),
            );
            // The primary connection is checked out first.
            if let (0, Some(lease)) = (worker_id, self.lease) {
                worker = worker.holding_lease(lease.clone());
            }
            workers.spawn(worker.run());
        }

        let mut returned: Vec<(usize, S::Connection)> = Vec::with_capacity(pool.size());
        let mut failure: Option<IndexError> = None;
        let mut cancelled = false;

        while let Some(joined) = workers.join_next().await {
            let finished: FinishedWorker<S::Connection> = match joined {
                Ok(finished) => finished,
                Err(e) => {
                    error!("Worker task for {} died: {}", unit, e);
                    unit_cancel.cancel();
                    failure.get_or_insert(IndexError::Worker(e.to_string()));
                    continue;
                }
            };
            returned.push((finished.worker_id, finished.connection));

            match finished.report {
                Ok(report) => {
                    stats.batches += report.batches;
                    stats.places_indexed += report.indexed;
                    stats.places_skipped += report.skipped;
                    stats.retries += report.retries;
                    if report.exit == WorkerExit::Cancelled {
                        cancelled = true;
                    }
                }
                Err(e) => {
                    error!("Worker {} failed on {}: {}", finished.worker_id, unit, e);
                    unit_cancel.cancel();
                    failure.get_or_insert(e);
                }
            }
        }

        // Keep the pool order stable so the primary connection stays first.
        returned.sort_by_key(|(worker_id, _)| *worker_id);
        pool.checkin(returned.into_iter().map(|(_, conn)| conn).collect());

        if let Some(e) = failure {
            return Err(e);
        }
        if cancelled {
            info!("Indexing of {} interrupted", unit);
            return Err(IndexError::Cancelled);
        }

        info!(
            "Finished {} in {:.2?} ({} places claimed in {} batches)",
            unit,
            start.elapsed(),
            queue.claimed() - claimed_before,
            queue.batches()
        );
        Ok(())
    }
}

/// Pending places of the queue's unit, not counting places skipped in this pass
async fn remaining<C: IndexConnection>(conn: &mut C, queue: &ClaimQueue) -> IndexResult<u64> {
    let pending = conn.count_pending(queue.unit()).await?;
    Ok(pending.saturating_sub(queue.excluded().len() as u64))
}
