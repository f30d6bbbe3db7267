//! Working tier of the Cavern consensus grid.
//!
//! Holds the active epoch's observations, the aggregate grid derived from
//! them, and the scoring logic that reads both. Nothing here performs I/O;
//! the engine in `cavern-core` owns locking, persistence, and rotation.
//!
//! # Modules
//!
//! - [`observation`] -- Per-user, per-coordinate claims
//! - [`aggregate`] -- Counters, dominant types, change tokens
//! - [`working`] -- Observations and grid updated as one unit
//! - [`high_water`] -- Per-difficulty high-water marks
//! - [`leaderboard`] -- First-claim scoring and ranking
//! - [`error`] -- Shared error type

pub mod aggregate;
pub mod error;
pub mod high_water;
pub mod leaderboard;
pub mod observation;
pub mod working;

pub use aggregate::{
    AggregateGrid, ChangeTokens, DEFAULT_CHANGE_TOKENS, DeltaOutcome, GridBounds, GridView,
};
pub use error::GridError;
pub use high_water::MaxCounts;
pub use leaderboard::{Leaderboard, LeaderboardRow};
pub use observation::{ObservationStore, UpsertOutcome};
pub use working::{ReportOutcome, WorkingSet};
