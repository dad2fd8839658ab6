//! In-memory place store used by the engine's tests
//!
//! Mirrors the PostgreSQL semantics the engine relies on: claimed places are
//! locked per session until commit or rollback, computations only see
//! committed state, and progress writes never lower a stored rank. Every claim,
//! commit and rollback is logged so tests can check ordering and partitioning.

use super::{
    BatchOutcome, BatchRequest, DbError, DbResult, IndexConnection, PlaceStore, SkippedPlace,
};
use crate::index::status::ProgressMarker;
use crate::{FailurePolicy, Phase, PlaceId, Rank, RankRange, WorkUnit};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// A place row
#[derive(Debug, Clone)]
pub struct MemPlace {
    pub id: PlaceId,
    pub name: String,
    pub rank: Rank,
    pub boundary: bool,
    pub parent: Option<PlaceId>,
    pub pending: bool,
    /// Derived value written by the indexing computation
    pub address: Option<String>,
}

impl MemPlace {
    pub fn new(id: PlaceId, rank: i64) -> Self {
        Self {
            id,
            name: format!("place {}", id),
            rank: Rank::new(rank).unwrap(),
            boundary: false,
            parent: None,
            pending: true,
            address: None,
        }
    }

    pub fn boundary(mut self) -> Self {
        self.boundary = true;
        self
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn child_of(mut self, parent: PlaceId) -> Self {
        self.parent = Some(parent);
        self
    }

    fn phase(&self) -> Phase {
        if self.boundary {
            Phase::Boundary
        } else {
            Phase::Regular
        }
    }
}

/// Logged database activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Claim {
        conn: usize,
        unit: WorkUnit,
        places: Vec<PlaceId>,
    },
    Commit {
        conn: usize,
        unit: WorkUnit,
        places: Vec<PlaceId>,
    },
    Rollback {
        conn: usize,
        unit: WorkUnit,
        places: Vec<PlaceId>,
    },
}

#[derive(Default)]
struct State {
    places: BTreeMap<PlaceId, MemPlace>,
    locks: HashMap<PlaceId, usize>,
    progress: HashMap<Phase, ProgressMarker>,
    progress_writes: Vec<(Phase, Rank)>,
    import_indexed: bool,
    leases: HashMap<i64, usize>,
    deadlocks: HashMap<PlaceId, u32>,
    disconnects: HashMap<PlaceId, u32>,
    broken_data: HashSet<PlaceId>,
    foreign_locks: HashMap<PlaceId, u32>,
    panics: HashSet<PlaceId>,
    progress_prepared: bool,
    cancel_after_commit: Option<(WorkUnit, CancellationToken)>,
    events: Vec<Event>,
    next_conn: usize,
    opened: usize,
    closed: usize,
}

impl State {
    fn claim(&mut self, conn: usize, request: &BatchRequest<'_>) -> Vec<PlaceId> {
        let unit = request.unit;
        let candidates: Vec<PlaceId> = self
            .places
            .values()
            .filter(|p| p.pending && p.rank == unit.rank && p.phase() == unit.phase)
            .filter(|p| !self.locks.contains_key(&p.id) && !request.exclude.contains(&p.id))
            .map(|p| p.id)
            .collect();

        let mut ids = Vec::with_capacity(request.limit);
        for id in candidates {
            if ids.len() == request.limit {
                break;
            }
            // SKIP LOCKED passes over rows another session holds.
            if let Some(skips) = self.foreign_locks.get_mut(&id).filter(|n| **n > 0) {
                *skips -= 1;
                continue;
            }
            ids.push(id);
        }

        if !ids.is_empty() {
            for id in &ids {
                self.locks.insert(*id, conn);
            }
            self.events.push(Event::Claim {
                conn,
                unit,
                places: ids.clone(),
            });
        }
        ids
    }

    fn compute(&mut self, place_id: PlaceId) -> DbResult<String> {
        if let Some(remaining) = self.deadlocks.get_mut(&place_id).filter(|n| **n > 0) {
            *remaining -= 1;
            return Err(DbError::Deadlock(format!("deadlock on place {}", place_id)));
        }
        if let Some(remaining) = self.disconnects.get_mut(&place_id).filter(|n| **n > 0) {
            *remaining -= 1;
            return Err(DbError::Connection("server closed the connection".to_string()));
        }
        if self.broken_data.contains(&place_id) {
            return Err(DbError::Data {
                place_id,
                message: "invalid geometry".to_string(),
            });
        }

        let place = self
            .places
            .get(&place_id)
            .ok_or_else(|| DbError::Query(format!("place {} vanished", place_id)))?;

        let parent_address = place
            .parent
            .and_then(|id| self.places.get(&id))
            .filter(|parent| !parent.pending)
            .and_then(|parent| parent.address.clone());

        Ok(match parent_address {
            Some(parent) => format!("{}, {}", place.name, parent),
            None => place.name.clone(),
        })
    }

    fn commit(&mut self, conn: usize, unit: WorkUnit, claimed: &[PlaceId], staged: Vec<(PlaceId, String)>) {
        let mut written = Vec::with_capacity(staged.len());
        for (id, address) in staged {
            if let Some(place) = self.places.get_mut(&id) {
                place.pending = false;
                place.address = Some(address);
                written.push(id);
            }
        }
        self.release(claimed);
        self.events.push(Event::Commit {
            conn,
            unit,
            places: written,
        });

        if self
            .cancel_after_commit
            .as_ref()
            .is_some_and(|(target, _)| *target == unit)
        {
            if let Some((_, token)) = self.cancel_after_commit.take() {
                token.cancel();
            }
        }
    }

    fn rollback(&mut self, conn: usize, unit: WorkUnit, claimed: &[PlaceId]) {
        self.release(claimed);
        self.events.push(Event::Rollback {
            conn,
            unit,
            places: claimed.to_vec(),
        });
    }

    fn release(&mut self, claimed: &[PlaceId]) {
        for id in claimed {
            self.locks.remove(id);
        }
    }
}

/// Shared in-memory database; clones see the same data
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn insert(&self, place: MemPlace) {
        self.state().places.insert(place.id, place);
    }

    /// Insert `count` regular places per rank for every rank in `ranks`
    pub fn populate(&self, ranks: RankRange, count: i64) {
        for rank in ranks.iter() {
            for n in 0..count {
                let id = rank.value() as i64 * 1000 + n;
                self.insert(MemPlace::new(id, rank.value() as i64));
            }
        }
    }

    pub fn place(&self, id: PlaceId) -> MemPlace {
        self.state().places[&id].clone()
    }

    pub fn pending_count(&self) -> usize {
        self.state().places.values().filter(|p| p.pending).count()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state().events.clone()
    }

    /// Places of every claim, in claim order
    pub fn claimed_ids(&self) -> Vec<PlaceId> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Claim { places, .. } => Some(places),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Places written by commits at `rank`
    pub fn committed_at(&self, rank: Rank) -> Vec<PlaceId> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Commit { unit, places, .. } if unit.rank == rank => Some(places),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn clear_events(&self) {
        self.state().events.clear();
    }

    pub fn progress(&self, phase: Phase) -> Option<ProgressMarker> {
        self.state().progress.get(&phase).cloned()
    }

    pub fn progress_writes(&self) -> Vec<(Phase, Rank)> {
        self.state().progress_writes.clone()
    }

    pub fn import_indexed(&self) -> bool {
        self.state().import_indexed
    }

    pub fn connections_opened(&self) -> usize {
        self.state().opened
    }

    pub fn connections_closed(&self) -> usize {
        self.state().closed
    }

    /// Computing `place_id` deadlocks the next `times` attempts
    pub fn deadlock_on(&self, place_id: PlaceId, times: u32) {
        self.state().deadlocks.insert(place_id, times);
    }

    /// Computing `place_id` kills the session for the next `times` attempts
    pub fn disconnect_on(&self, place_id: PlaceId, times: u32) {
        self.state().disconnects.insert(place_id, times);
    }

    /// Computing `place_id` always fails with a data error
    pub fn break_place(&self, place_id: PlaceId) {
        self.state().broken_data.insert(place_id);
    }

    /// Another session holds the row of `place_id` for the next `claims`
    /// claims that would otherwise take it
    pub fn lock_elsewhere(&self, place_id: PlaceId, claims: u32) {
        self.state().foreign_locks.insert(place_id, claims);
    }

    /// Computing `place_id` panics
    pub fn panic_on(&self, place_id: PlaceId) {
        self.state().panics.insert(place_id);
    }

    pub fn progress_prepared(&self) -> bool {
        self.state().progress_prepared
    }

    /// Cancel `token` right after the first commit for `unit`
    pub fn cancel_after_commit(&self, unit: WorkUnit, token: CancellationToken) {
        self.state().cancel_after_commit = Some((unit, token));
    }

    /// Pretend another session holds the lease `key`
    pub fn hold_lease_elsewhere(&self, key: i64) {
        self.state().leases.insert(key, usize::MAX);
    }

    pub fn lease_holder(&self, key: i64) -> Option<usize> {
        self.state().leases.get(&key).copied()
    }
}

#[async_trait]
impl PlaceStore for MemoryStore {
    type Connection = MemConnection;

    async fn connect(&self) -> DbResult<MemConnection> {
        let mut state = self.state();
        let id = state.next_conn;
        state.next_conn += 1;
        state.opened += 1;
        Ok(MemConnection {
            id,
            state: Arc::clone(&self.state),
            broken: false,
        })
    }
}

pub struct MemConnection {
    id: usize,
    state: Arc<Mutex<State>>,
    broken: bool,
}

impl MemConnection {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn check(&self) -> DbResult<()> {
        if self.broken {
            return Err(DbError::Connection("connection is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl IndexConnection for MemConnection {
    async fn run_batch(&mut self, request: &BatchRequest<'_>) -> DbResult<BatchOutcome> {
        self.check()?;

        let claimed = self.state().claim(self.id, request);
        if claimed.is_empty() {
            return Ok(BatchOutcome::default());
        }
        tokio::task::yield_now().await;

        let mut staged = Vec::with_capacity(claimed.len());
        let mut skipped = Vec::new();
        for &place_id in &claimed {
            // Panic after releasing the state lock so the mutex is not poisoned.
            let crash = self.state().panics.contains(&place_id);
            if crash {
                panic!("computation of place {} crashed", place_id);
            }
            let computed = self.state().compute(place_id);
            match computed {
                Ok(address) => staged.push((place_id, address)),
                Err(DbError::Data { message, .. })
                    if request.policy == FailurePolicy::SkipAndLog =>
                {
                    skipped.push(SkippedPlace {
                        place_id,
                        reason: message,
                    });
                }
                Err(e) => {
                    if e.is_connection_loss() {
                        self.broken = true;
                    }
                    self.state().rollback(self.id, request.unit, &claimed);
                    return Err(e);
                }
            }
            tokio::task::yield_now().await;
        }

        let indexed = staged.len();
        self.state().commit(self.id, request.unit, &claimed, staged);

        Ok(BatchOutcome {
            claimed,
            indexed,
            skipped,
        })
    }

    async fn count_pending(&mut self, unit: WorkUnit) -> DbResult<u64> {
        self.check()?;
        let state = self.state();
        let count = state
            .places
            .values()
            .filter(|p| p.pending && p.rank == unit.rank && p.phase() == unit.phase)
            .count();
        Ok(count as u64)
    }

    async fn prepare_progress(&mut self) -> DbResult<()> {
        self.check()?;
        self.state().progress_prepared = true;
        Ok(())
    }

    async fn load_progress(&mut self, phase: Phase) -> DbResult<Option<ProgressMarker>> {
        self.check()?;
        Ok(self.state().progress.get(&phase).cloned())
    }

    async fn reset_progress(&mut self, phase: Phase, range: RankRange) -> DbResult<()> {
        self.check()?;
        self.state().progress.insert(
            phase,
            ProgressMarker {
                phase,
                rank_min: range.min,
                rank_max: range.max,
                last_rank: None,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn record_progress(&mut self, phase: Phase, rank: Rank) -> DbResult<()> {
        self.check()?;
        let mut state = self.state();
        let advanced = match state.progress.get_mut(&phase) {
            Some(marker) if marker.last_rank.is_none_or(|last| last < rank) => {
                marker.last_rank = Some(rank);
                marker.updated_at = Utc::now();
                true
            }
            _ => false,
        };
        if advanced {
            state.progress_writes.push((phase, rank));
        }
        Ok(())
    }

    async fn mark_import_indexed(&mut self) -> DbResult<()> {
        self.check()?;
        self.state().import_indexed = true;
        Ok(())
    }

    async fn try_acquire_lease(&mut self, key: i64) -> DbResult<bool> {
        self.check()?;
        let id = self.id;
        let mut state = self.state();
        let holder = *state.leases.entry(key).or_insert(id);
        Ok(holder == id)
    }

    async fn release_lease(&mut self, key: i64) -> DbResult<()> {
        self.check()?;
        let id = self.id;
        let mut state = self.state();
        if state.leases.get(&key) == Some(&id) {
            state.leases.remove(&key);
        }
        Ok(())
    }

    async fn close(self) -> DbResult<()> {
        let mut state = self.state();
        state.closed += 1;
        let id = self.id;
        state.leases.retain(|_, holder| *holder != id);
        state.locks.retain(|_, holder| *holder != id);
        Ok(())
    }
}
