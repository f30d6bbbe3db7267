//! Authoritative per-user, per-coordinate claims for the active epoch.
//!
//! Rows are keyed by `(user, coordinate)`; a secondary index from coordinate
//! to reporting users backs the per-cell listing used by the conflict signal
//! and the leaderboard. Every method is atomic at row granularity because the
//! store is only ever touched under the engine's exclusive section.

use std::collections::{BTreeMap, BTreeSet};

use cavern_types::{Coord, ItemType, Observation, UserId};
use chrono::{DateTime, Utc};

use crate::error::GridError;

/// Lowest and highest coordinates, used to bound per-user range scans.
const COORD_MIN: Coord = Coord::new(i32::MIN, i32::MIN);
const COORD_MAX: Coord = Coord::new(i32::MAX, i32::MAX);

/// Result of [`ObservationStore::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No prior claim existed; a new row was created.
    Inserted,
    /// A claim of a different type was overwritten.
    Replaced {
        /// The overwritten type.
        previous: ItemType,
    },
    /// The claim already had this type. Nothing was modified.
    Unchanged {
        /// The existing type.
        current: ItemType,
    },
}

impl UpsertOutcome {
    /// Whether the store was modified.
    pub const fn is_change(self) -> bool {
        !matches!(self, Self::Unchanged { .. })
    }

    /// The type replaced by this upsert, if any.
    pub const fn previous(self) -> Option<ItemType> {
        match self {
            Self::Replaced { previous } => Some(previous),
            Self::Inserted | Self::Unchanged { .. } => None,
        }
    }
}

/// In-memory observation table for one epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservationStore {
    rows: BTreeMap<(UserId, Coord), Observation>,
    by_coord: BTreeMap<Coord, BTreeSet<UserId>>,
}

impl ObservationStore {
    /// Create an empty store.
    pub const fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
            by_coord: BTreeMap::new(),
        }
    }

    /// Build a store from persisted rows.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::DuplicateObservation`] if two rows share a key.
    pub fn from_rows(rows: impl IntoIterator<Item = Observation>) -> Result<Self, GridError> {
        let mut store = Self::new();
        for row in rows {
            if store.rows.contains_key(&(row.user, row.coord)) {
                return Err(GridError::DuplicateObservation {
                    user: row.user,
                    coord: row.coord,
                });
            }
            store.insert_row(row);
        }
        Ok(store)
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the store holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The type `user` claimed at `coord`.
    pub fn get(&self, user: UserId, coord: Coord) -> Option<ItemType> {
        self.rows.get(&(user, coord)).map(|row| row.item)
    }

    /// The full claim row for `user` at `coord`.
    pub fn claim(&self, user: UserId, coord: Coord) -> Option<&Observation> {
        self.rows.get(&(user, coord))
    }

    /// Insert or overwrite a claim.
    ///
    /// Overwriting with a different type resets `claimed_at` to `at`.
    /// Reporting the type already held changes nothing.
    pub fn upsert(
        &mut self,
        user: UserId,
        coord: Coord,
        item: ItemType,
        at: DateTime<Utc>,
    ) -> UpsertOutcome {
        match self.rows.get_mut(&(user, coord)) {
            Some(row) if row.item == item => UpsertOutcome::Unchanged { current: item },
            Some(row) => {
                let previous = row.item;
                row.item = item;
                row.claimed_at = at;
                UpsertOutcome::Replaced { previous }
            }
            None => {
                self.insert_row(Observation {
                    user,
                    coord,
                    item,
                    claimed_at: at,
                });
                UpsertOutcome::Inserted
            }
        }
    }

    /// Remove a claim, returning its type. `None` means nothing was there.
    pub fn delete(&mut self, user: UserId, coord: Coord) -> Option<ItemType> {
        let removed = self.rows.remove(&(user, coord))?;
        if let Some(users) = self.by_coord.get_mut(&coord) {
            users.remove(&user);
            if users.is_empty() {
                self.by_coord.remove(&coord);
            }
        }
        Some(removed.item)
    }

    /// Every claim made by `user`, ordered by `(x, y)`.
    pub fn list_by_user(&self, user: UserId) -> Vec<Observation> {
        self.rows
            .range((user, COORD_MIN)..=(user, COORD_MAX))
            .map(|(_, row)| *row)
            .collect()
    }

    /// Claims of one type made by `user`, ordered by `(x, y)`.
    pub fn list_by_type(&self, user: UserId, item: ItemType) -> Vec<Observation> {
        self.rows
            .range((user, COORD_MIN)..=(user, COORD_MAX))
            .map(|(_, row)| *row)
            .filter(|row| row.item == item)
            .collect()
    }

    /// Every claim at `coord` as `(type, user)`, ordered by type ordinal then
    /// user id.
    pub fn list_by_coordinate(&self, coord: Coord) -> Vec<(ItemType, UserId)> {
        let mut claims: Vec<(ItemType, UserId)> = self
            .by_coord
            .get(&coord)
            .into_iter()
            .flatten()
            .filter_map(|user| self.get(*user, coord).map(|item| (item, *user)))
            .collect();
        claims.sort_unstable();
        claims
    }

    /// Number of claims at `coord`.
    pub fn count_at(&self, coord: Coord) -> usize {
        self.by_coord.get(&coord).map_or(0, BTreeSet::len)
    }

    /// Every participant holding at least one claim.
    pub fn users(&self) -> BTreeSet<UserId> {
        self.rows.keys().map(|(user, _)| *user).collect()
    }

    /// Every coordinate holding at least one claim, in order.
    pub fn coords(&self) -> impl Iterator<Item = Coord> + '_ {
        self.by_coord.keys().copied()
    }

    /// All rows in `(user, x, y)` order.
    pub fn iter(&self) -> impl Iterator<Item = &Observation> {
        self.rows.values()
    }

    fn insert_row(&mut self, row: Observation) {
        self.by_coord.entry(row.coord).or_default().insert(row.user);
        self.rows.insert((row.user, row.coord), row);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    #[test]
    fn upsert_reports_insert_replace_and_noop() {
        let mut store = ObservationStore::new();
        let user = UserId(1);
        let coord = Coord::new(3, 4);

        assert_eq!(
            store.upsert(user, coord, ItemType::Spider, at(0)),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.upsert(user, coord, ItemType::Spider, at(10)),
            UpsertOutcome::Unchanged {
                current: ItemType::Spider
            }
        );
        assert_eq!(store.claim(user, coord).map(|c| c.claimed_at), Some(at(0)));

        assert_eq!(
            store.upsert(user, coord, ItemType::Empty, at(20)),
            UpsertOutcome::Replaced {
                previous: ItemType::Spider
            }
        );
        assert_eq!(store.get(user, coord), Some(ItemType::Empty));
        assert_eq!(store.claim(user, coord).map(|c| c.claimed_at), Some(at(20)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn delete_is_noop_when_absent() {
        let mut store = ObservationStore::new();
        assert_eq!(store.delete(UserId(1), Coord::new(1, 1)), None);

        store.upsert(UserId(1), Coord::new(1, 1), ItemType::Empty, at(0));
        assert_eq!(store.delete(UserId(1), Coord::new(1, 1)), Some(ItemType::Empty));
        assert!(store.is_empty());
        assert_eq!(store.count_at(Coord::new(1, 1)), 0);
        assert_eq!(store.coords().count(), 0);
    }

    #[test]
    fn listings_are_ordered() {
        let mut store = ObservationStore::new();
        store.upsert(UserId(2), Coord::new(5, 1), ItemType::Spider, at(0));
        store.upsert(UserId(2), Coord::new(1, 9), ItemType::Empty, at(1));
        store.upsert(UserId(2), Coord::new(1, 2), ItemType::Spider, at(2));
        store.upsert(UserId(1), Coord::new(1, 2), ItemType::Spider, at(3));
        store.upsert(UserId(3), Coord::new(1, 2), ItemType::Empty, at(4));

        let coords: Vec<Coord> = store
            .list_by_user(UserId(2))
            .into_iter()
            .map(|o| o.coord)
            .collect();
        assert_eq!(
            coords,
            vec![Coord::new(1, 2), Coord::new(1, 9), Coord::new(5, 1)]
        );

        let spiders: Vec<Coord> = store
            .list_by_type(UserId(2), ItemType::Spider)
            .into_iter()
            .map(|o| o.coord)
            .collect();
        assert_eq!(spiders, vec![Coord::new(1, 2), Coord::new(5, 1)]);

        assert_eq!(
            store.list_by_coordinate(Coord::new(1, 2)),
            vec![
                (ItemType::Empty, UserId(3)),
                (ItemType::Spider, UserId(1)),
                (ItemType::Spider, UserId(2)),
            ]
        );
        assert_eq!(store.users().len(), 3);
    }

    #[test]
    fn from_rows_rejects_duplicates() {
        let row = Observation {
            user: UserId(1),
            coord: Coord::new(2, 2),
            item: ItemType::Spider,
            claimed_at: at(0),
        };
        let result = ObservationStore::from_rows([row, row]);
        assert_eq!(
            result.err(),
            Some(GridError::DuplicateObservation {
                user: UserId(1),
                coord: Coord::new(2, 2)
            })
        );

        let store = ObservationStore::from_rows([row]).unwrap();
        assert_eq!(store.count_at(Coord::new(2, 2)), 1);
    }
}
