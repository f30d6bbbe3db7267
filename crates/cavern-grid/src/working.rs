//! The working set of one epoch: observations plus their aggregate grid.
//!
//! Every mutation here pairs the row change with the matching counter
//! adjustment so the two can never drift apart. Callers hold exclusive
//! access for the duration of each call.

use cavern_types::{Coord, Disagreement, HistoricalReport, ItemType, Observation, UserId};
use chrono::{DateTime, Utc};

use crate::aggregate::{AggregateGrid, ChangeTokens, GridBounds};
use crate::error::GridError;
use crate::observation::{ObservationStore, UpsertOutcome};

/// Result of [`WorkingSet::report`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportOutcome {
    /// What the observation store did with the report.
    pub upsert: UpsertOutcome,
    /// Set when the claim goes against an established dominant type.
    pub disagreement: Option<Disagreement>,
    /// Whether the coordinate's dominant type changed.
    pub dominant_changed: bool,
}

/// Observations and aggregate grid for the active epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingSet {
    observations: ObservationStore,
    grid: AggregateGrid,
}

impl WorkingSet {
    /// An empty working set.
    pub const fn new(bounds: GridBounds, tokens: ChangeTokens) -> Self {
        Self {
            observations: ObservationStore::new(),
            grid: AggregateGrid::new(bounds, tokens),
        }
    }

    /// Build a working set from persisted observation rows, deriving the
    /// grid by summation.
    ///
    /// # Errors
    ///
    /// Returns [`GridError`] on duplicate or off-grid rows.
    pub fn hydrate(
        bounds: GridBounds,
        tokens: ChangeTokens,
        rows: impl IntoIterator<Item = Observation>,
    ) -> Result<Self, GridError> {
        let observations = ObservationStore::from_rows(rows)?;
        let grid = AggregateGrid::hydrate(bounds, tokens, &observations)?;
        Ok(Self { observations, grid })
    }

    /// An empty working set for the next epoch. Change tokens carry over and
    /// are bumped.
    #[must_use]
    pub fn successor(&self) -> Self {
        Self {
            observations: ObservationStore::new(),
            grid: self.grid.successor(),
        }
    }

    /// The observation table.
    pub const fn observations(&self) -> &ObservationStore {
        &self.observations
    }

    /// The aggregate grid.
    pub const fn grid(&self) -> &AggregateGrid {
        &self.grid
    }

    /// Record a claim and update the aggregate.
    ///
    /// Reporting the type already held is a no-op. A report that goes against
    /// the established dominant type is still accepted; the outcome carries a
    /// [`Disagreement`] describing the conflict.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::OutOfBounds`] if `coord` is off-grid.
    pub fn report(
        &mut self,
        user: UserId,
        coord: Coord,
        item: ItemType,
        at: DateTime<Utc>,
    ) -> Result<ReportOutcome, GridError> {
        self.grid.bounds().check(coord)?;

        let upsert = self.observations.upsert(user, coord, item, at);
        let mut dominant_changed = false;
        match upsert {
            UpsertOutcome::Unchanged { .. } => {
                return Ok(ReportOutcome {
                    upsert,
                    disagreement: None,
                    dominant_changed,
                });
            }
            UpsertOutcome::Replaced { previous } => {
                dominant_changed |= self.grid.apply_delta(coord, previous, -1).dominant_changed();
                dominant_changed |= self.grid.apply_delta(coord, item, 1).dominant_changed();
            }
            UpsertOutcome::Inserted => {
                dominant_changed |= self.grid.apply_delta(coord, item, 1).dominant_changed();
            }
        }

        let disagreement = self.disagreement_at(coord, item);
        if let Some(conflict) = &disagreement {
            tracing::debug!(
                %user,
                %coord,
                claimed = %conflict.claimed,
                dominant = %conflict.dominant,
                "Report disagrees with dominant type"
            );
        }

        Ok(ReportOutcome {
            upsert,
            disagreement,
            dominant_changed,
        })
    }

    /// Remove a claim and update the aggregate. `None` means there was
    /// nothing to remove.
    pub fn retract(&mut self, user: UserId, coord: Coord) -> Option<ItemType> {
        let removed = self.observations.delete(user, coord)?;
        self.grid.apply_delta(coord, removed, -1);
        Some(removed)
    }

    /// Remove every claim held by `user`, returning the removed rows.
    pub fn retract_all(&mut self, user: UserId) -> Vec<Observation> {
        let rows = self.observations.list_by_user(user);
        for row in &rows {
            self.retract(row.user, row.coord);
        }
        rows
    }

    /// Replay one historical report through the same path as a live report.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::OutOfBounds`] if the report is off-grid.
    pub fn ingest(&mut self, report: &HistoricalReport) -> Result<ReportOutcome, GridError> {
        self.report(report.user, report.coord, report.item, report.at)
    }

    /// Check the conservation invariant between rows and counters.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::Conservation`] on the first mismatch.
    pub fn verify(&self) -> Result<(), GridError> {
        self.grid.verify(&self.observations)
    }

    fn disagreement_at(&self, coord: Coord, claimed: ItemType) -> Option<Disagreement> {
        let counters = self.grid.counters(coord);
        let dominant = counters.dominant();
        if dominant == claimed || !dominant.traits().signals_conflict {
            return None;
        }
        Some(Disagreement {
            coord,
            dominant,
            dominant_count: counters.get(dominant),
            claimed,
            claimed_count: counters.get(claimed).saturating_sub(1),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    fn working() -> WorkingSet {
        WorkingSet::new(GridBounds::DEFAULT, ChangeTokens::default())
    }

    #[test]
    fn sum_invariant_holds_through_mixed_sequence() {
        let mut ws = working();
        let items = [
            ItemType::Spider,
            ItemType::Empty,
            ItemType::DemonHead,
            ItemType::Unknown,
            ItemType::GoldenCompass,
        ];
        let mut step = 0_i64;
        for round in 0..4_i64 {
            for user in 1..=6_i64 {
                for x in 1..=3_i32 {
                    let slot = usize::try_from((round + user + i64::from(x)) % 5).unwrap();
                    step += 1;
                    ws.report(UserId(user), Coord::new(x, 2), items[slot], at(step))
                        .unwrap();
                    if (user + round) % 3 == 0 {
                        ws.retract(UserId(user), Coord::new(x, 2));
                    }
                }
            }
            ws.verify().unwrap();
            for x in 1..=3 {
                let coord = Coord::new(x, 2);
                assert_eq!(
                    ws.grid().counters(coord).total(),
                    u64::try_from(ws.observations().count_at(coord)).unwrap()
                );
            }
        }
    }

    #[test]
    fn repeated_report_is_idempotent() {
        let mut ws = working();
        let coord = Coord::new(4, 4);
        ws.report(UserId(1), coord, ItemType::Spider, at(0)).unwrap();
        let before = ws.clone();

        let outcome = ws.report(UserId(1), coord, ItemType::Spider, at(5)).unwrap();
        assert_eq!(
            outcome.upsert,
            UpsertOutcome::Unchanged {
                current: ItemType::Spider
            }
        );
        assert!(!outcome.dominant_changed);
        assert_eq!(ws, before);
    }

    #[test]
    fn overwrite_moves_the_count() {
        let mut ws = working();
        let coord = Coord::new(1, 1);
        ws.report(UserId(1), coord, ItemType::Spider, at(0)).unwrap();
        let outcome = ws.report(UserId(1), coord, ItemType::Empty, at(1)).unwrap();
        assert_eq!(outcome.upsert.previous(), Some(ItemType::Spider));
        assert!(outcome.dominant_changed);
        assert_eq!(ws.grid().counters(coord).get(ItemType::Spider), 0);
        assert_eq!(ws.grid().counters(coord).get(ItemType::Empty), 1);
    }

    #[test]
    fn disagreement_reports_prior_claims() {
        let mut ws = working();
        let coord = Coord::new(7, 7);
        ws.report(UserId(1), coord, ItemType::Spider, at(0)).unwrap();
        ws.report(UserId(2), coord, ItemType::Spider, at(1)).unwrap();
        ws.report(UserId(3), coord, ItemType::Empty, at(2)).unwrap();

        let outcome = ws.report(UserId(4), coord, ItemType::Empty, at(3)).unwrap();
        // Tie 2-2: empty has the lower ordinal and takes over.
        assert_eq!(outcome.disagreement, None);
        assert!(outcome.dominant_changed);

        let outcome = ws.report(UserId(5), coord, ItemType::Spider, at(4)).unwrap();
        assert_eq!(outcome.disagreement, None);

        let outcome = ws.report(UserId(6), coord, ItemType::DemonTail, at(5)).unwrap();
        assert_eq!(
            outcome.disagreement,
            Some(Disagreement {
                coord,
                dominant: ItemType::Spider,
                dominant_count: 3,
                claimed: ItemType::DemonTail,
                claimed_count: 0,
            })
        );
        assert_eq!(ws.observations().get(UserId(6), coord), Some(ItemType::DemonTail));
    }

    #[test]
    fn unknown_dominant_raises_no_disagreement() {
        let mut ws = working();
        let coord = Coord::new(2, 3);
        ws.report(UserId(1), coord, ItemType::Unknown, at(0)).unwrap();
        ws.report(UserId(2), coord, ItemType::Unknown, at(1)).unwrap();
        let outcome = ws.report(UserId(3), coord, ItemType::Spider, at(2)).unwrap();
        assert_eq!(outcome.disagreement, None);
    }

    #[test]
    fn retract_all_clears_one_user() {
        let mut ws = working();
        ws.report(UserId(1), Coord::new(1, 1), ItemType::Spider, at(0)).unwrap();
        ws.report(UserId(1), Coord::new(2, 1), ItemType::Empty, at(1)).unwrap();
        ws.report(UserId(2), Coord::new(1, 1), ItemType::Spider, at(2)).unwrap();

        let removed = ws.retract_all(UserId(1));
        assert_eq!(removed.len(), 2);
        assert!(ws.observations().list_by_user(UserId(1)).is_empty());
        assert_eq!(ws.grid().counters(Coord::new(1, 1)).total(), 1);
        assert_eq!(ws.grid().counters(Coord::new(2, 1)).total(), 0);
        assert_eq!(ws.retract(UserId(1), Coord::new(1, 1)), None);
        ws.verify().unwrap();
    }

    #[test]
    fn off_grid_report_is_rejected() {
        let mut ws = working();
        let result = ws.report(UserId(1), Coord::new(0, 1), ItemType::Spider, at(0));
        assert!(matches!(result, Err(GridError::OutOfBounds { .. })));
        assert!(ws.observations().is_empty());
    }

    #[test]
    fn hydrate_matches_incremental_build() {
        let mut ws = working();
        ws.report(UserId(1), Coord::new(1, 1), ItemType::Spider, at(0)).unwrap();
        ws.report(UserId(2), Coord::new(1, 1), ItemType::Empty, at(1)).unwrap();
        ws.report(UserId(2), Coord::new(3, 9), ItemType::LuckyBones, at(2)).unwrap();

        let rows: Vec<Observation> = ws.observations().iter().copied().collect();
        let rebuilt =
            WorkingSet::hydrate(GridBounds::DEFAULT, ws.grid().tokens().clone(), rows).unwrap();
        assert_eq!(rebuilt, ws);
    }
}
