//! Shared type definitions for the Cavern consensus grid.
//!
//! This crate is the single source of truth for the vocabulary used across
//! the workspace: participants, coordinates, epochs, the item-type table and
//! the cross-epoch record types.
//!
//! # Modules
//!
//! - [`ids`] -- Participant ids, grid coordinates, epoch keys
//! - [`enums`] -- Item types (with their rule table), difficulties, roles
//! - [`structs`] -- Observations, counters, disagreements, cross-epoch records

pub mod enums;
pub mod ids;
pub mod structs;

// Re-export all public types at crate root for convenience.
pub use enums::{Difficulty, ItemTraits, ItemType, ParseAliasError, ScoreBucket, UserRole};
pub use ids::{Coord, EpochKey, UserId};
pub use structs::{
    CellCounters, Disagreement, HistoricalReport, MAX_PRESET_NAME_LEN, MaxCountRecord,
    NamedPreset, Observation, RoleGrant, UserConfig,
};
