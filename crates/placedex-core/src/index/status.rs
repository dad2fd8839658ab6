//! Durable indexing progress
//!
//! One marker per phase records the rank range of the current pass and the
//! highest rank whose places have all been committed. A run over the same range
//! picks up after that rank; any other run starts a fresh pass.

use crate::db::{DbResult, IndexConnection};
use crate::{IndexingJob, Phase, Rank, RankRange, WorkUnit};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// Stored progress of one phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressMarker {
    pub phase: Phase,
    pub rank_min: Rank,
    pub rank_max: Rank,
    /// Highest fully indexed rank of the pass, if any
    pub last_rank: Option<Rank>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressMarker {
    pub fn range(&self) -> RankRange {
        RankRange {
            min: self.rank_min,
            max: self.rank_max,
        }
    }

    /// The pass reached its last rank
    pub fn is_finished(&self) -> bool {
        self.last_rank == Some(self.rank_max)
    }
}

/// Tracks which units of a job are already complete
#[derive(Debug)]
pub struct StatusTracker {
    job: IndexingJob,
    completed: HashMap<Phase, Rank>,
}

impl StatusTracker {
    /// Read the stored markers once and decide, per phase, between a fresh
    /// pass and a resumption.
    pub async fn load<C: IndexConnection>(conn: &mut C, job: IndexingJob) -> DbResult<Self> {
        conn.prepare_progress().await?;

        let mut completed = HashMap::new();
        for &phase in job.phases.phases() {
            match conn.load_progress(phase).await? {
                Some(marker) if marker.range() == job.ranks && !marker.is_finished() => {
                    match marker.last_rank {
                        Some(rank) => {
                            info!("Resuming {} indexing after rank {}", phase, rank);
                            completed.insert(phase, rank);
                        }
                        None => debug!("Restarting unfinished {} pass from rank {}", phase, job.ranks.min),
                    }
                }
                _ => {
                    debug!("Starting fresh {} pass over ranks {}", phase, job.ranks);
                    conn.reset_progress(phase, job.ranks).await?;
                }
            }
        }

        Ok(Self { job, completed })
    }

    /// Highest completed rank of `phase` in this pass
    pub fn last_completed_rank(&self, phase: Phase) -> Option<Rank> {
        self.completed.get(&phase).copied()
    }

    /// The latest unit, in scheduling order, up to which everything is complete
    pub fn last_completed(&self) -> Option<WorkUnit> {
        self.job
            .units()
            .take_while(|unit| self.is_complete(*unit))
            .last()
    }

    pub fn is_complete(&self, unit: WorkUnit) -> bool {
        self.last_completed_rank(unit.phase)
            .is_some_and(|last| unit.rank <= last)
    }

    /// Durably mark `unit` complete. Recording an already covered unit is a no-op.
    pub async fn record_completion<C: IndexConnection>(
        &mut self,
        conn: &mut C,
        unit: WorkUnit,
    ) -> DbResult<()> {
        if self.is_complete(unit) {
            return Ok(());
        }
        conn.record_progress(unit.phase, unit.rank).await?;
        self.completed.insert(unit.phase, unit.rank);
        debug!("Recorded completion of {}", unit);
        Ok(())
    }
}
