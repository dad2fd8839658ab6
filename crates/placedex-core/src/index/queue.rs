//! Claim queue for one unit of work
//!
//! The claim itself is a database primitive (row locks taken with
//! `SKIP LOCKED`), so two sessions never hold the same place. The queue adds
//! the per-pass state shared by the workers of a unit: places excluded after
//! failing, and counters.

use crate::db::{BatchOutcome, BatchRequest, DbResult, IndexConnection};
use crate::{FailurePolicy, PlaceId, WorkUnit};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Result of asking the queue for work
#[derive(Debug)]
pub enum Claim {
    /// A batch was claimed, indexed and committed
    Batch(BatchOutcome),
    /// No unclaimed place is left for this unit
    Exhausted,
}

pub struct ClaimQueue {
    unit: WorkUnit,
    batch_size: usize,
    policy: FailurePolicy,
    excluded: Mutex<HashSet<PlaceId>>,
    batches: AtomicUsize,
    claimed: AtomicUsize,
}

impl ClaimQueue {
    pub fn new(unit: WorkUnit, batch_size: usize, policy: FailurePolicy) -> Self {
        Self {
            unit,
            batch_size: batch_size.max(1),
            policy,
            excluded: Mutex::new(HashSet::new()),
            batches: AtomicUsize::new(0),
            claimed: AtomicUsize::new(0),
        }
    }

    pub fn unit(&self) -> WorkUnit {
        self.unit
    }

    /// Claim the next batch on `conn` and apply the indexing computation to it.
    pub async fn next<C: IndexConnection>(&self, conn: &mut C) -> DbResult<Claim> {
        let exclude = self.excluded();
        let request = BatchRequest {
            unit: self.unit,
            limit: self.batch_size,
            exclude: &exclude,
            policy: self.policy,
        };

        let mut outcome = conn.run_batch(&request).await?;
        if outcome.is_empty() {
            return Ok(Claim::Exhausted);
        }

        self.batches.fetch_add(1, Ordering::Relaxed);
        self.claimed.fetch_add(outcome.claimed.len(), Ordering::Relaxed);
        if !outcome.skipped.is_empty() {
            // A worker holding a stale exclusion list may retry a place another
            // worker already skipped. Report each place once.
            let mut excluded = self.excluded.lock().unwrap_or_else(|e| e.into_inner());
            outcome.skipped.retain(|s| excluded.insert(s.place_id));
        }

        Ok(Claim::Batch(outcome))
    }

    /// Places skipped so far in this pass
    pub fn excluded(&self) -> Vec<PlaceId> {
        let mut ids: Vec<PlaceId> = self
            .excluded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn claimed(&self) -> usize {
        self.claimed.load(Ordering::Relaxed)
    }
}
