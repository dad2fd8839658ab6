//! Placedex Core Library
//!
//! Indexing engine for a geocoding place database.
//! Computes the search-ready state of every place rank by rank, spreads the
//! work over a fixed set of worker connections and resumes after interruption.

pub mod config;
pub mod db;
pub mod index;

pub use config::IndexerConfig;
pub use index::{Indexer, IndexError, IndexResult, IndexingStats};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Highest valid search rank
pub const MAX_RANK: u8 = 30;

/// Identifier of a place row
pub type PlaceId = i64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RankError {
    #[error("Rank {0} is outside the valid range 0..={MAX_RANK}")]
    OutOfRange(i64),
}

/// Indexing phase. Boundaries at a rank are always processed before
/// regular places at the same rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Boundary,
    Regular,
}

impl Phase {
    pub const ALL: [Phase; 2] = [Phase::Boundary, Phase::Regular];

    /// Name used for storage and display
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Boundary => "boundary",
            Phase::Regular => "regular",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "boundary" | "boundaries" => Ok(Phase::Boundary),
            "regular" | "place" | "places" => Ok(Phase::Regular),
            _ => Err(format!("Unknown phase: {}", s)),
        }
    }
}

/// A search rank in `0..=30`. Lower ranks are broader areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Rank(u8);

impl Rank {
    pub const MIN: Rank = Rank(0);
    pub const MAX: Rank = Rank(MAX_RANK);

    pub fn new(value: i64) -> Result<Self, RankError> {
        if (0..=MAX_RANK as i64).contains(&value) {
            Ok(Rank(value as u8))
        } else {
            Err(RankError::OutOfRange(value))
        }
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Rank {
    type Error = RankError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Rank::new(value)
    }
}

impl From<Rank> for i64 {
    fn from(rank: Rank) -> Self {
        rank.0 as i64
    }
}

impl std::fmt::Display for Rank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inclusive rank range. `min > max` is a valid, empty range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RankRange {
    pub min: Rank,
    pub max: Rank,
}

impl RankRange {
    /// Validate caller-supplied bounds. Both ends must be in `0..=30`.
    pub fn new(min: i64, max: i64) -> Result<Self, RankError> {
        Ok(Self {
            min: Rank::new(min)?,
            max: Rank::new(max)?,
        })
    }

    pub fn full() -> Self {
        Self {
            min: Rank::MIN,
            max: Rank::MAX,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    /// Ranks in ascending order
    pub fn iter(&self) -> impl Iterator<Item = Rank> + use<> {
        (self.min.0..=self.max.0).map(Rank)
    }
}

impl std::fmt::Display for RankRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.min, self.max)
    }
}

/// Which phases a run covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseSelector {
    BoundariesOnly,
    RegularOnly,
    Both,
}

impl PhaseSelector {
    /// Phases in processing order
    pub fn phases(&self) -> &'static [Phase] {
        match self {
            PhaseSelector::BoundariesOnly => &[Phase::Boundary],
            PhaseSelector::RegularOnly => &[Phase::Regular],
            PhaseSelector::Both => &Phase::ALL,
        }
    }
}

/// Descriptor of one engine invocation. Derived from caller bounds, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexingJob {
    pub phases: PhaseSelector,
    pub ranks: RankRange,
}

impl IndexingJob {
    pub fn new(phases: PhaseSelector, ranks: RankRange) -> Self {
        Self { phases, ranks }
    }

    /// All units of work in scheduling order: ascending rank, boundaries
    /// before regular places within a rank.
    pub fn units(&self) -> impl Iterator<Item = WorkUnit> + use<> {
        let phases = self.phases.phases();
        self.ranks
            .iter()
            .flat_map(move |rank| phases.iter().map(move |&phase| WorkUnit { phase, rank }))
    }
}

/// The set of places sharing a phase and a rank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkUnit {
    pub phase: Phase,
    pub rank: Rank,
}

impl std::fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} rank {}", self.phase, self.rank)
    }
}

/// What to do when the indexing computation fails for a single place
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Roll back the whole batch and fail the run
    #[default]
    AbortBatch,
    /// Roll back only the failing place, commit the rest and keep going
    SkipAndLog,
}
