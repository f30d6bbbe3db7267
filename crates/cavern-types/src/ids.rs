//! Identifier and key types: participants, grid coordinates, and epochs.
//!
//! Participants are identified by the 64-bit ids handed to us by the chat
//! platform. Coordinates are 1-based grid positions validated upstream.
//! An [`EpochKey`] names one calendar-week generation of the working dataset.

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Generates a newtype wrapper around an `i64` platform identifier.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Return the inner platform identifier.
            pub const fn into_inner(self) -> i64 {
                self.0
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id! {
    /// Identifier of a participant posting observations.
    UserId
}

/// A grid coordinate. Ordering is by `x`, then `y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Coord {
    /// Column, 1-based.
    pub x: i32,
    /// Row, 1-based.
    pub y: i32,
}

impl Coord {
    /// Create a coordinate.
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl core::fmt::Display for Coord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}-{}", self.x, self.y)
    }
}

/// Key of one epoch: the date on which its calendar week starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpochKey(NaiveDate);

impl EpochKey {
    /// The epoch whose week (starting on `week_start`) contains `at`.
    pub fn week_containing(at: DateTime<Utc>, week_start: Weekday) -> Self {
        let date = at.date_naive();
        let offset = (date.weekday().num_days_from_monday() + 7
            - week_start.num_days_from_monday())
            % 7;
        let start = date
            .checked_sub_days(Days::new(u64::from(offset)))
            .unwrap_or(date);
        Self(start)
    }

    /// Wrap a week-start date directly (hydration from storage).
    pub const fn from_date(date: NaiveDate) -> Self {
        Self(date)
    }

    /// The week-start date.
    pub const fn as_date(self) -> NaiveDate {
        self.0
    }

    /// Midnight UTC at the start of this epoch.
    pub fn starts_at(self) -> DateTime<Utc> {
        self.0
            .and_hms_opt(0, 0, 0)
            .map_or(DateTime::<Utc>::MIN_UTC, |dt| dt.and_utc())
    }

    /// The epoch one week later.
    pub fn following(self) -> Self {
        Self(self.0.checked_add_days(Days::new(7)).unwrap_or(self.0))
    }
}

impl core::fmt::Display for EpochKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}
