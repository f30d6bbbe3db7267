//! Error types for the working tier.

use cavern_types::{Coord, UserId};

/// Errors raised by the working-tier grid operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GridError {
    /// The coordinate lies outside the configured grid.
    #[error("coordinate {coord} is outside the {width}x{height} grid")]
    OutOfBounds {
        /// The rejected coordinate.
        coord: Coord,
        /// Grid width.
        width: u16,
        /// Grid height.
        height: u16,
    },

    /// Two hydrated rows share the same `(user, coordinate)` key.
    #[error("duplicate observation for user {user} at {coord}")]
    DuplicateObservation {
        /// The participant.
        user: UserId,
        /// The coordinate.
        coord: Coord,
    },

    /// The aggregate counters disagree with the observations they summarize.
    #[error("conservation violated at {coord}: aggregate holds {aggregate}, observations hold {observed}")]
    Conservation {
        /// The first offending coordinate.
        coord: Coord,
        /// Sum of the aggregate counters.
        aggregate: u64,
        /// Number of observations at the coordinate.
        observed: u64,
    },
}
