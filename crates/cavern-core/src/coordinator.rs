//! Propagation between the working tier and the durable tier.
//!
//! Every durable table belongs to a [`TableClass`], and every class has one
//! [`SyncPolicy`]:
//!
//! | Class | Policy |
//! |-------|--------|
//! | observations, cell aggregates | [`SyncPolicy::Batched`] |
//! | roles, last scan, user config, presets, max counts | [`SyncPolicy::PerMutation`] |
//!
//! Batched tables are written as whole-epoch snapshots by
//! [`PersistenceCoordinator::flush`]. Per-mutation tables are written one row
//! at a time by [`PersistenceCoordinator::mirror`] as the engine changes them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use cavern_db::{CellRow, DbError, DurableStore, EpochSnapshot};
use cavern_grid::{ChangeTokens, GridBounds, GridError, WorkingSet};
use cavern_types::{
    Coord, EpochKey, MaxCountRecord, NamedPreset, RoleGrant, UserConfig, UserId,
};
use chrono::{DateTime, Utc};

use crate::records::CrossEpochRecords;

/// Logical durable table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableClass {
    /// Per-epoch observation rows.
    Observation,
    /// Per-epoch cell counters.
    CellAggregate,
    /// Role grants.
    Role,
    /// The singleton last-scan marker.
    LastScanMarker,
    /// Per-participant configuration.
    UserConfig,
    /// Named cosmetic presets.
    NamedPreset,
    /// Per-(difficulty, type) high-water marks.
    DifficultyMaxCounts,
}

impl TableClass {
    /// Every table class.
    pub const ALL: [Self; 7] = [
        Self::Observation,
        Self::CellAggregate,
        Self::Role,
        Self::LastScanMarker,
        Self::UserConfig,
        Self::NamedPreset,
        Self::DifficultyMaxCounts,
    ];

    /// How writes to this class reach the durable tier.
    pub const fn policy(self) -> SyncPolicy {
        match self {
            Self::Observation | Self::CellAggregate => SyncPolicy::Batched,
            Self::Role
            | Self::LastScanMarker
            | Self::UserConfig
            | Self::NamedPreset
            | Self::DifficultyMaxCounts => SyncPolicy::PerMutation,
        }
    }
}

impl core::fmt::Display for TableClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Observation => "observations",
            Self::CellAggregate => "cell_aggregates",
            Self::Role => "roles",
            Self::LastScanMarker => "last_scan",
            Self::UserConfig => "user_configs",
            Self::NamedPreset => "named_presets",
            Self::DifficultyMaxCounts => "difficulty_max_counts",
        };
        f.write_str(name)
    }
}

/// When working-tier writes are propagated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Replaced wholesale on flush.
    Batched,
    /// Written immediately, row by row.
    PerMutation,
}

/// One cross-epoch write to propagate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordMutation {
    /// Insert or update a role grant.
    UpsertRole(RoleGrant),
    /// Remove a role grant.
    DeleteRole(UserId),
    /// Overwrite the last-scan marker.
    SetLastScan(DateTime<Utc>),
    /// Insert or update a participant's configuration.
    UpsertUserConfig(UserConfig),
    /// Remove a participant's configuration.
    DeleteUserConfig(UserId),
    /// Insert or update a preset.
    UpsertPreset(NamedPreset),
    /// Remove a preset.
    DeletePreset {
        /// Owner of the preset.
        owner: UserId,
        /// Preset name.
        name: String,
    },
    /// Insert or update a high-water mark.
    UpsertMaxCount(MaxCountRecord),
}

impl RecordMutation {
    /// The table this mutation writes.
    pub const fn table(&self) -> TableClass {
        match self {
            Self::UpsertRole(_) | Self::DeleteRole(_) => TableClass::Role,
            Self::SetLastScan(_) => TableClass::LastScanMarker,
            Self::UpsertUserConfig(_) | Self::DeleteUserConfig(_) => TableClass::UserConfig,
            Self::UpsertPreset(_) | Self::DeletePreset { .. } => TableClass::NamedPreset,
            Self::UpsertMaxCount(_) => TableClass::DifficultyMaxCounts,
        }
    }
}

/// Errors from batched persistence and hydration.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Writing an epoch snapshot failed.
    #[error("flush of epoch {epoch} failed: {source}")]
    Flush {
        /// The epoch being flushed.
        epoch: EpochKey,
        /// The underlying store error.
        source: DbError,
    },

    /// Reading from the durable tier failed.
    #[error("load of {what} failed: {source}")]
    Load {
        /// What was being read.
        what: String,
        /// The underlying store error.
        source: DbError,
    },

    /// Stored observations cannot form a valid working set.
    #[error("stored observations of epoch {epoch} are inconsistent: {source}")]
    Inconsistent {
        /// The epoch being hydrated.
        epoch: EpochKey,
        /// What the grid rejected.
        source: GridError,
    },

    /// A record could not be written during a full resync.
    #[error("resync of {table} failed: {source}")]
    Resync {
        /// The table being written.
        table: TableClass,
        /// The underlying store error.
        source: DbError,
    },
}

/// Rows written by one flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    /// The flushed epoch.
    pub epoch: EpochKey,
    /// Observation rows written.
    pub observations: usize,
    /// Aggregate rows written.
    pub cells: usize,
}

/// Rows touched by a full cross-epoch resync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncReport {
    /// Rows upserted.
    pub upserted: usize,
    /// Stale durable rows deleted.
    pub deleted: usize,
}

/// Moves data between the working set and a [`DurableStore`].
#[derive(Debug)]
pub struct PersistenceCoordinator<D> {
    store: Arc<D>,
}

impl<D> Clone for PersistenceCoordinator<D> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<D: DurableStore> PersistenceCoordinator<D> {
    /// Wrap a durable store.
    pub fn new(store: D) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &D {
        &self.store
    }

    // =========================================================================
    // Batched tables
    // =========================================================================

    /// Replace every durable grid row of `epoch` with the working rows.
    ///
    /// Safe to repeat: the store swaps the rows inside one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::Flush`] if the store rejects the snapshot; the
    /// previous durable rows are left as they were.
    pub async fn flush(
        &self,
        epoch: EpochKey,
        working: &WorkingSet,
    ) -> Result<FlushReport, PersistError> {
        let rows = snapshot(epoch, working);
        self.store
            .replace_epoch(&rows)
            .await
            .map_err(|source| PersistError::Flush { epoch, source })?;

        let report = FlushReport {
            epoch,
            observations: rows.observations.len(),
            cells: rows.cells.len(),
        };
        tracing::info!(
            %epoch,
            observations = report.observations,
            cells = report.cells,
            "Flushed epoch to durable tier"
        );
        Ok(report)
    }

    /// Insert the epoch marker if missing.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::Flush`] if the insert fails.
    pub async fn register_epoch(&self, epoch: EpochKey) -> Result<(), PersistError> {
        self.store
            .register_epoch(epoch)
            .await
            .map_err(|source| PersistError::Flush { epoch, source })
    }

    /// Rebuild the working set of `epoch` from its durable observations.
    ///
    /// Counters are always derived from observations. Stored counters that
    /// disagree with the derivation are logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::Load`] if the read fails, or
    /// [`PersistError::Inconsistent`] if the stored observations hold
    /// duplicate or off-grid rows.
    pub async fn hydrate(
        &self,
        epoch: EpochKey,
        bounds: GridBounds,
        tokens: ChangeTokens,
    ) -> Result<WorkingSet, PersistError> {
        let stored = self
            .store
            .load_epoch(epoch)
            .await
            .map_err(|source| PersistError::Load {
                what: format!("epoch {epoch}"),
                source,
            })?;

        let observations = stored.observations.len();
        let working = WorkingSet::hydrate(bounds, tokens, stored.observations)
            .map_err(|source| PersistError::Inconsistent { epoch, source })?;

        let mismatched = mismatched_cells(&working, &stored.cells);
        if mismatched > 0 {
            tracing::warn!(
                %epoch,
                mismatched,
                "Stored cell counters disagree with observations, using rebuilt counters"
            );
        }

        tracing::info!(%epoch, observations, "Hydrated epoch from durable tier");
        Ok(working)
    }

    // =========================================================================
    // Per-mutation tables
    // =========================================================================

    /// Read every cross-epoch record into a working copy.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::Load`] if the read fails.
    pub async fn load_records(&self) -> Result<CrossEpochRecords, PersistError> {
        let records = self
            .store
            .load_records()
            .await
            .map_err(|source| PersistError::Load {
                what: "cross-epoch records".to_owned(),
                source,
            })?;
        Ok(CrossEpochRecords::from_durable(records))
    }

    /// Propagate one cross-epoch write.
    ///
    /// # Errors
    ///
    /// Returns the store's [`DbError`]; the caller decides how to surface it.
    pub async fn mirror(&self, mutation: &RecordMutation) -> Result<(), DbError> {
        let table = mutation.table();
        debug_assert_eq!(table.policy(), SyncPolicy::PerMutation);
        match mutation {
            RecordMutation::UpsertRole(grant) => self.store.upsert_role(*grant).await,
            RecordMutation::DeleteRole(user) => self.store.delete_role(*user).await,
            RecordMutation::SetLastScan(at) => self.store.set_last_scan(*at).await,
            RecordMutation::UpsertUserConfig(config) => {
                self.store.upsert_user_config(config).await
            }
            RecordMutation::DeleteUserConfig(user) => self.store.delete_user_config(*user).await,
            RecordMutation::UpsertPreset(preset) => self.store.upsert_preset(preset).await,
            RecordMutation::DeletePreset { owner, name } => {
                self.store.delete_preset(*owner, name).await
            }
            RecordMutation::UpsertMaxCount(record) => self.store.upsert_max_count(*record).await,
        }?;
        tracing::debug!(%table, "Mirrored cross-epoch record");
        Ok(())
    }

    /// Make the durable cross-epoch tables match `records`: upsert every
    /// working row and delete durable rows the working copy no longer has.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError`] on the first failed read or write. Rows
    /// written before the failure stay written.
    pub async fn resync_records(
        &self,
        records: &CrossEpochRecords,
    ) -> Result<ResyncReport, PersistError> {
        let durable = self
            .store
            .load_records()
            .await
            .map_err(|source| PersistError::Load {
                what: "cross-epoch records".to_owned(),
                source,
            })?;
        let working = records.to_durable();
        let mut report = ResyncReport::default();

        let mut plan: Vec<RecordMutation> = Vec::new();

        let kept_roles: BTreeSet<UserId> = working.roles.iter().map(|g| g.user).collect();
        plan.extend(
            durable
                .roles
                .iter()
                .filter(|g| !kept_roles.contains(&g.user))
                .map(|g| RecordMutation::DeleteRole(g.user)),
        );
        let kept_configs: BTreeSet<UserId> =
            working.user_configs.iter().map(|c| c.user).collect();
        plan.extend(
            durable
                .user_configs
                .iter()
                .filter(|c| !kept_configs.contains(&c.user))
                .map(|c| RecordMutation::DeleteUserConfig(c.user)),
        );
        let kept_presets: BTreeSet<(UserId, &str)> = working
            .presets
            .iter()
            .map(|p| (p.owner, p.name.as_str()))
            .collect();
        plan.extend(
            durable
                .presets
                .iter()
                .filter(|p| !kept_presets.contains(&(p.owner, p.name.as_str())))
                .map(|p| RecordMutation::DeletePreset {
                    owner: p.owner,
                    name: p.name.clone(),
                }),
        );
        report.deleted = plan.len();

        plan.extend(working.roles.into_iter().map(RecordMutation::UpsertRole));
        plan.extend(working.last_scan.map(RecordMutation::SetLastScan));
        plan.extend(
            working
                .user_configs
                .into_iter()
                .map(RecordMutation::UpsertUserConfig),
        );
        plan.extend(working.presets.into_iter().map(RecordMutation::UpsertPreset));
        plan.extend(
            working
                .max_counts
                .into_iter()
                .map(RecordMutation::UpsertMaxCount),
        );
        report.upserted = plan.len().saturating_sub(report.deleted);

        for mutation in &plan {
            self.mirror(mutation)
                .await
                .map_err(|source| PersistError::Resync {
                    table: mutation.table(),
                    source,
                })?;
        }

        tracing::info!(
            upserted = report.upserted,
            deleted = report.deleted,
            "Resynced cross-epoch records"
        );
        Ok(report)
    }
}

/// The durable form of a working set.
pub fn snapshot(epoch: EpochKey, working: &WorkingSet) -> EpochSnapshot {
    EpochSnapshot {
        epoch,
        observations: working.observations().iter().copied().collect(),
        cells: working
            .grid()
            .cells()
            .map(|(coord, counters)| CellRow {
                coord,
                counters: *counters,
            })
            .collect(),
    }
}

/// Number of coordinates whose stored counters differ from the working grid.
fn mismatched_cells(working: &WorkingSet, stored: &[CellRow]) -> usize {
    let stored: BTreeMap<Coord, _> = stored.iter().map(|row| (row.coord, row.counters)).collect();
    let coords: BTreeSet<Coord> = stored
        .keys()
        .copied()
        .chain(working.grid().cells().map(|(coord, _)| coord))
        .collect();
    coords
        .into_iter()
        .filter(|coord| {
            stored.get(coord).copied().unwrap_or_default() != working.grid().counters(*coord)
        })
        .count()
}
