//! Derived per-coordinate counters and dominant-type resolution.
//!
//! The grid never accepts authored counters: it is hydrated by summing an
//! [`ObservationStore`] and then maintained incrementally through
//! [`AggregateGrid::apply_delta`]. Change tokens let renderers and scorers
//! poll for staleness instead of recomputing on every read.

use std::collections::BTreeMap;

use cavern_types::{CellCounters, Coord, ItemType};
use serde::{Deserialize, Serialize};

use crate::error::GridError;
use crate::observation::ObservationStore;

/// Default change-token names.
pub const DEFAULT_CHANGE_TOKENS: [&str; 2] = ["render", "score"];

/// Dimensions of the grid. Coordinates are 1-based and inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridBounds {
    /// Number of columns.
    pub width: u16,
    /// Number of rows.
    pub height: u16,
}

impl GridBounds {
    /// The 20x20 cave map.
    pub const DEFAULT: Self = Self::new(20, 20);

    /// Create bounds.
    pub const fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    /// Whether `coord` lies on the grid.
    pub fn contains(self, coord: Coord) -> bool {
        (1..=i32::from(self.width)).contains(&coord.x)
            && (1..=i32::from(self.height)).contains(&coord.y)
    }

    /// Number of cells.
    pub fn cell_count(self) -> u64 {
        u64::from(self.width).saturating_mul(u64::from(self.height))
    }

    /// Check `coord`, returning [`GridError::OutOfBounds`] when it is off-grid.
    pub fn check(self, coord: Coord) -> Result<(), GridError> {
        if self.contains(coord) {
            Ok(())
        } else {
            Err(GridError::OutOfBounds {
                coord,
                width: self.width,
                height: self.height,
            })
        }
    }
}

impl Default for GridBounds {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A named set of monotonically increasing staleness counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeTokens(BTreeMap<String, u64>);

impl ChangeTokens {
    /// Tokens with the given names, all starting at zero.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(|n| (n.into(), 0)).collect())
    }

    /// Current value of one token.
    pub fn get(&self, name: &str) -> Option<u64> {
        self.0.get(name).copied()
    }

    /// Token names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Every `(name, value)` pair in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(name, value)| (name.as_str(), *value))
    }

    /// Advance every token by one.
    pub fn bump_all(&mut self) {
        for value in self.0.values_mut() {
            *value = value.saturating_add(1);
        }
    }
}

impl Default for ChangeTokens {
    fn default() -> Self {
        Self::new(DEFAULT_CHANGE_TOKENS)
    }
}

/// Result of [`AggregateGrid::apply_delta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaOutcome {
    /// Dominant type before the delta.
    pub before: ItemType,
    /// Dominant type after the delta.
    pub after: ItemType,
    /// The counter would have gone negative and was held at zero.
    pub clamped: bool,
}

impl DeltaOutcome {
    /// Whether the dominant type changed.
    pub fn dominant_changed(&self) -> bool {
        self.before != self.after
    }
}

/// A rendered snapshot of the dominant type of every cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridView {
    /// Grid dimensions.
    pub bounds: GridBounds,
    /// Rows from `y = 1` downward, each holding columns from `x = 1`.
    pub rows: Vec<Vec<ItemType>>,
}

impl GridView {
    /// Dominant type at `coord`, `None` when off-grid.
    pub fn at(&self, coord: Coord) -> Option<ItemType> {
        let y = usize::try_from(coord.y).ok()?.checked_sub(1)?;
        let x = usize::try_from(coord.x).ok()?.checked_sub(1)?;
        self.rows.get(y)?.get(x).copied()
    }
}

/// Per-coordinate counters for the active epoch.
///
/// Coordinates with all counters at zero are not stored; they read as empty
/// counters with a dominant type of [`ItemType::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateGrid {
    bounds: GridBounds,
    cells: BTreeMap<Coord, CellCounters>,
    tokens: ChangeTokens,
}

impl AggregateGrid {
    /// An empty grid.
    pub const fn new(bounds: GridBounds, tokens: ChangeTokens) -> Self {
        Self {
            bounds,
            cells: BTreeMap::new(),
            tokens,
        }
    }

    /// Rebuild the grid by summing every observation in `store`.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::OutOfBounds`] if an observation lies off-grid.
    pub fn hydrate(
        bounds: GridBounds,
        tokens: ChangeTokens,
        store: &ObservationStore,
    ) -> Result<Self, GridError> {
        let mut grid = Self::new(bounds, tokens);
        for row in store.iter() {
            bounds.check(row.coord)?;
            let cell = grid.cells.entry(row.coord).or_default();
            cell.set(row.item, cell.get(row.item).saturating_add(1));
        }
        Ok(grid)
    }

    /// An empty grid for the next epoch: same bounds, tokens carried over and
    /// bumped so every consumer refreshes.
    #[must_use]
    pub fn successor(&self) -> Self {
        let mut tokens = self.tokens.clone();
        tokens.bump_all();
        Self::new(self.bounds, tokens)
    }

    /// Grid dimensions.
    pub const fn bounds(&self) -> GridBounds {
        self.bounds
    }

    /// Adjust one counter by `delta` and recompute the dominant type.
    ///
    /// A counter that would drop below zero is held at zero and logged; the
    /// outcome reports the clamp. Every change token is bumped when the
    /// dominant type changes.
    pub fn apply_delta(&mut self, coord: Coord, item: ItemType, delta: i32) -> DeltaOutcome {
        let cell = self.cells.entry(coord).or_default();
        let before = cell.dominant();
        let current = cell.get(item);

        let (next, clamped) = if delta >= 0 {
            (current.saturating_add(delta.unsigned_abs()), false)
        } else {
            current
                .checked_sub(delta.unsigned_abs())
                .map_or((0, true), |value| (value, false))
        };
        cell.set(item, next);
        let after = cell.dominant();
        let now_empty = cell.is_empty();

        if now_empty {
            self.cells.remove(&coord);
        }
        if clamped {
            tracing::error!(
                %coord,
                item = %item,
                current,
                delta,
                "Aggregate counter would go negative; clamped at zero"
            );
        }
        if before != after {
            self.tokens.bump_all();
        }

        DeltaOutcome {
            before,
            after,
            clamped,
        }
    }

    /// Counters at `coord`.
    pub fn counters(&self, coord: Coord) -> CellCounters {
        self.cells.get(&coord).copied().unwrap_or_default()
    }

    /// Dominant type at `coord`. Ties go to the lowest ordinal.
    pub fn dominant_type(&self, coord: Coord) -> ItemType {
        self.cells
            .get(&coord)
            .map_or(ItemType::Unknown, CellCounters::dominant)
    }

    /// Number of cells whose dominant type is `item`.
    ///
    /// [`ItemType::Unknown`] also counts every cell nobody has reported on.
    pub fn count_for_type(&self, item: ItemType) -> u64 {
        if item == ItemType::Unknown {
            let reported = self
                .cells
                .values()
                .filter(|cell| cell.dominant() != ItemType::Unknown)
                .count();
            self.bounds
                .cell_count()
                .saturating_sub(u64::try_from(reported).unwrap_or(u64::MAX))
        } else {
            let matching = self
                .cells
                .values()
                .filter(|cell| cell.dominant() == item)
                .count();
            u64::try_from(matching).unwrap_or(u64::MAX)
        }
    }

    /// Current value of a change token.
    pub fn change_token(&self, name: &str) -> Option<u64> {
        self.tokens.get(name)
    }

    /// All change tokens.
    pub const fn tokens(&self) -> &ChangeTokens {
        &self.tokens
    }

    /// Every non-empty cell in coordinate order.
    pub fn cells(&self) -> impl Iterator<Item = (Coord, &CellCounters)> {
        self.cells.iter().map(|(coord, cell)| (*coord, cell))
    }

    /// Snapshot the dominant type of every cell.
    pub fn view(&self) -> GridView {
        let rows = (1..=i32::from(self.bounds.height))
            .map(|y| {
                (1..=i32::from(self.bounds.width))
                    .map(|x| self.dominant_type(Coord::new(x, y)))
                    .collect()
            })
            .collect();
        GridView {
            bounds: self.bounds,
            rows,
        }
    }

    /// Check that every cell's counters sum to the number of observations at
    /// that coordinate, and match a fresh summation exactly.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::Conservation`] for the first mismatching cell, or
    /// [`GridError::OutOfBounds`] if `store` holds an off-grid observation.
    pub fn verify(&self, store: &ObservationStore) -> Result<(), GridError> {
        let rebuilt = Self::hydrate(self.bounds, self.tokens.clone(), store)?;
        let coords = self.cells.keys().chain(rebuilt.cells.keys());
        for &coord in coords {
            if self.counters(coord) != rebuilt.counters(coord) {
                return Err(GridError::Conservation {
                    coord,
                    aggregate: self.counters(coord).total(),
                    observed: u64::try_from(store.count_at(coord)).unwrap_or(u64::MAX),
                });
            }
        }
        Ok(())
    }
}
