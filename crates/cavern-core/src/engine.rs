//! The engine context: the active epoch, the cross-epoch records, and every
//! ingestion, query and administrative operation on them.
//!
//! # Locking
//!
//! The active epoch (key plus [`WorkingSet`]) sits behind one
//! [`tokio::sync::RwLock`]; the cross-epoch records behind a second. Queries
//! take the epoch read lock. Mutations, flushes and rotations take the write
//! lock, so a flush holds it across the whole durable transaction and no
//! half-flushed state is observable. When both locks are needed the epoch
//! lock is always taken first.
//!
//! # Epoch gate
//!
//! Every entry point first compares the active key with the key the
//! schedule assigns to the clock's current instant. On a mismatch the
//! caller takes the write lock, re-checks, and rotates. A failed rotation is
//! logged and the operation proceeds on the prior epoch; the next operation
//! tries again.

use std::sync::Arc;

use cavern_db::{DbError, DurableStore};
use cavern_grid::leaderboard;
use cavern_grid::{
    ChangeTokens, DEFAULT_CHANGE_TOKENS, GridBounds, GridError, GridView, Leaderboard,
    ReportOutcome, WorkingSet,
};
use cavern_types::{
    CellCounters, Coord, Difficulty, EpochKey, HistoricalReport, ItemType, MAX_PRESET_NAME_LEN,
    MaxCountRecord, NamedPreset, Observation, RoleGrant, UserConfig, UserId, UserRole,
};
use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::coordinator::{
    FlushReport, PersistError, PersistenceCoordinator, RecordMutation, ResyncReport, TableClass,
};
use crate::epoch::{Clock, ReingestHook, RotationDetails, WeeklySchedule};
use crate::records::CrossEpochRecords;

/// Errors returned by [`Engine`] operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The working set rejected the operation.
    #[error("grid error: {source}")]
    Grid {
        /// The underlying grid error.
        #[from]
        source: GridError,
    },

    /// Batched persistence, hydration or rotation failed.
    #[error("persistence error: {source}")]
    Persist {
        /// The underlying persistence error.
        #[from]
        source: PersistError,
    },

    /// A cross-epoch write was applied to the working tier but could not be
    /// mirrored to the durable tier. [`Engine::save_all`] reconciles it.
    #[error("mirror to {table} failed: {source}")]
    Mirror {
        /// The table being written.
        table: TableClass,
        /// The underlying store error.
        source: DbError,
    },

    /// A preset name is empty or too long.
    #[error("invalid preset name: {reason}")]
    InvalidPresetName {
        /// Why the name was rejected.
        reason: String,
    },

    /// No preset with this owner and name exists.
    #[error("no preset {name:?} owned by {owner}")]
    PresetNotFound {
        /// The owner looked up.
        owner: UserId,
        /// The name looked up.
        name: String,
    },
}

/// Static engine settings, usually built from
/// [`CavernConfig::engine_settings`](crate::config::CavernConfig::engine_settings).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Grid dimensions.
    pub bounds: GridBounds,
    /// Change-token names.
    pub change_tokens: Vec<String>,
    /// Epoch boundaries.
    pub schedule: WeeklySchedule,
    /// Difficulty of participants without a stored configuration.
    pub default_difficulty: Difficulty,
    /// Participant granted `super_admin` when the engine opens.
    pub super_admin: Option<UserId>,
}

impl EngineSettings {
    /// A fresh token set at zero.
    pub fn tokens(&self) -> ChangeTokens {
        ChangeTokens::new(self.change_tokens.iter().map(String::as_str))
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            bounds: GridBounds::DEFAULT,
            change_tokens: DEFAULT_CHANGE_TOKENS.iter().map(|&s| s.to_owned()).collect(),
            schedule: WeeklySchedule::default(),
            default_difficulty: Difficulty::default(),
            super_admin: None,
        }
    }
}

/// Outcome of a bulk historical ingestion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Reports that inserted or replaced an observation.
    pub applied: usize,
    /// Reports that repeated an existing observation.
    pub unchanged: usize,
    /// Reports the grid rejected (off-grid coordinates).
    pub rejected: usize,
    /// Reports dated before the active epoch began.
    pub stale: usize,
    /// Time of the newest report seen.
    pub newest: Option<DateTime<Utc>>,
}

/// Outcome of [`Engine::save_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveReport {
    /// Grid rows written.
    pub flush: FlushReport,
    /// Cross-epoch rows written.
    pub records: ResyncReport,
}

/// Everything an out-of-process renderer needs, captured under one lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridPublication {
    /// The active epoch.
    pub epoch: EpochKey,
    /// Dominant type of every cell.
    pub view: GridView,
    /// Current change tokens.
    pub tokens: ChangeTokens,
}

struct ActiveEpoch {
    key: EpochKey,
    working: WorkingSet,
}

/// The consensus grid engine.
///
/// Share it between tasks behind an [`Arc`]. Independent engines do not
/// interact, so tests can run many side by side.
pub struct Engine<D> {
    settings: EngineSettings,
    coordinator: PersistenceCoordinator<D>,
    clock: Arc<dyn Clock>,
    hook: Arc<dyn ReingestHook>,
    active: RwLock<ActiveEpoch>,
    records: RwLock<CrossEpochRecords>,
}

impl<D: DurableStore> Engine<D> {
    /// Open an engine on `store`.
    ///
    /// Registers and hydrates the epoch containing the clock's current
    /// instant, loads the cross-epoch records, and grants the configured
    /// super-admin.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persist`] if the durable tier cannot be read or
    /// written, or [`EngineError::Mirror`] if the super-admin grant cannot be
    /// stored.
    pub async fn open(
        store: D,
        settings: EngineSettings,
        clock: Arc<dyn Clock>,
        hook: Arc<dyn ReingestHook>,
    ) -> Result<Self, EngineError> {
        let coordinator = PersistenceCoordinator::new(store);
        let key = settings.schedule.key_for(clock.now());

        coordinator.register_epoch(key).await?;
        let working = coordinator
            .hydrate(key, settings.bounds, settings.tokens())
            .await?;
        let mut records = coordinator.load_records().await?;

        let pending_admin = settings
            .super_admin
            .filter(|&admin| records.role_of(admin) != UserRole::SuperAdmin);
        if let Some(admin) = pending_admin {
            let grant = RoleGrant {
                user: admin,
                role: UserRole::SuperAdmin,
            };
            records.grant_role(grant);
            mirror(&coordinator, &RecordMutation::UpsertRole(grant)).await?;
            tracing::info!(user = %admin, "Granted super_admin from configuration");
        }

        tracing::info!(
            epoch = %key,
            observations = working.observations().len(),
            roles = records.roles().len(),
            "Engine opened"
        );

        Ok(Self {
            settings,
            coordinator,
            clock,
            hook,
            active: RwLock::new(ActiveEpoch { key, working }),
            records: RwLock::new(records),
        })
    }

    /// The settings the engine was opened with.
    pub const fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// The durable store.
    pub fn store(&self) -> &D {
        self.coordinator.store()
    }

    // =========================================================================
    // Epoch gate
    // =========================================================================

    fn due_key(&self) -> EpochKey {
        self.settings.schedule.key_for(self.clock.now())
    }

    async fn read_active(&self) -> RwLockReadGuard<'_, ActiveEpoch> {
        let due = self.due_key();
        let active = self.active.read().await;
        if active.key >= due {
            return active;
        }
        drop(active);

        let mut active = self.active.write().await;
        self.rotate_in_gate(&mut active, due).await;
        active.downgrade()
    }

    async fn write_active(&self) -> RwLockWriteGuard<'_, ActiveEpoch> {
        let due = self.due_key();
        let mut active = self.active.write().await;
        if active.key < due {
            self.rotate_in_gate(&mut active, due).await;
        }
        active
    }

    async fn gate(&self) {
        drop(self.read_active().await);
    }

    async fn rotate_in_gate(&self, active: &mut ActiveEpoch, due: EpochKey) {
        if let Err(e) = self.rotate_locked(active, due).await {
            tracing::warn!(
                active = %active.key,
                due = %due,
                error = %e,
                "Epoch rotation failed, continuing on the prior epoch"
            );
        }
    }

    /// Rotate to `due` unless already there. The caller holds the write lock.
    async fn rotate_locked(
        &self,
        active: &mut ActiveEpoch,
        due: EpochKey,
    ) -> Result<Option<RotationDetails>, EngineError> {
        // Another caller may have rotated while we waited for the lock.
        if active.key >= due {
            return Ok(None);
        }
        let previous = active.key;
        tracing::info!(%previous, current = %due, "Rotating epoch");

        self.coordinator.flush(previous, &active.working).await?;
        self.coordinator.register_epoch(due).await?;
        let mut tokens = active.working.grid().tokens().clone();
        tokens.bump_all();
        let working = self
            .coordinator
            .hydrate(due, self.settings.bounds, tokens)
            .await?;
        *active = ActiveEpoch { key: due, working };

        let details = RotationDetails {
            previous,
            current: due,
            week_start: due.starts_at(),
            last_scan: self.records.read().await.last_scan(),
        };
        let replay = self.hook.reports(&details).await;
        if !replay.is_empty() {
            let summary = ingest_into(active, &replay);
            if let Err(e) = self.advance_last_scan(summary.newest).await {
                tracing::warn!(error = %e, "Could not record last scan after replay");
            }
            tracing::info!(
                epoch = %due,
                applied = summary.applied,
                stale = summary.stale,
                rejected = summary.rejected,
                "Replayed history into new epoch"
            );
        }

        tracing::info!(%previous, current = %due, "Epoch rotated");
        Ok(Some(details))
    }

    async fn advance_last_scan(&self, newest: Option<DateTime<Utc>>) -> Result<(), EngineError> {
        let Some(newest) = newest else {
            return Ok(());
        };
        let mut records = self.records.write().await;
        if records.last_scan().is_some_and(|current| current >= newest) {
            return Ok(());
        }
        records.set_last_scan(newest);
        mirror(&self.coordinator, &RecordMutation::SetLastScan(newest)).await
    }

    // =========================================================================
    // Ingestion
    // =========================================================================

    /// Record that `user` saw `item` at `coord`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Grid`] if `coord` is off-grid.
    pub async fn report(
        &self,
        user: UserId,
        coord: Coord,
        item: ItemType,
        at: DateTime<Utc>,
    ) -> Result<ReportOutcome, EngineError> {
        let mut active = self.write_active().await;
        let outcome = active.working.report(user, coord, item, at)?;
        if let Some(conflict) = outcome.disagreement {
            tracing::debug!(
                %user,
                %coord,
                claimed = %conflict.claimed,
                dominant = %conflict.dominant,
                dominant_count = conflict.dominant_count,
                "Report disagrees with established dominant type"
            );
        }
        Ok(outcome)
    }

    /// Withdraw `user`'s observation at `coord`. `None` if there was none.
    pub async fn retract(&self, user: UserId, coord: Coord) -> Option<ItemType> {
        self.write_active().await.working.retract(user, coord)
    }

    /// Withdraw every observation `user` made this epoch.
    pub async fn retract_all(&self, user: UserId) -> Vec<Observation> {
        let removed = self.write_active().await.working.retract_all(user);
        tracing::debug!(%user, removed = removed.len(), "Retracted all observations");
        removed
    }

    /// Replay historical reports into the active epoch and advance the
    /// last-scan marker to the newest report time.
    ///
    /// Reports dated before the epoch began are skipped. Off-grid reports are
    /// counted and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Mirror`] if the new last-scan marker cannot be
    /// stored. The reports stay ingested.
    pub async fn ingest_historical<I>(&self, reports: I) -> Result<IngestSummary, EngineError>
    where
        I: IntoIterator<Item = HistoricalReport>,
    {
        let reports: Vec<HistoricalReport> = reports.into_iter().collect();
        let mut active = self.write_active().await;
        let summary = ingest_into(&mut active, &reports);
        tracing::info!(
            epoch = %active.key,
            applied = summary.applied,
            unchanged = summary.unchanged,
            stale = summary.stale,
            rejected = summary.rejected,
            "Ingested historical reports"
        );
        self.advance_last_scan(summary.newest).await?;
        Ok(summary)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Key of the active epoch.
    pub async fn active_epoch(&self) -> EpochKey {
        self.read_active().await.key
    }

    /// Consensus type at `coord`.
    pub async fn dominant_type(&self, coord: Coord) -> ItemType {
        self.read_active().await.working.grid().dominant_type(coord)
    }

    /// Counters at `coord`.
    pub async fn counters(&self, coord: Coord) -> CellCounters {
        self.read_active().await.working.grid().counters(coord)
    }

    /// Number of cells whose dominant type is `item`.
    pub async fn count_for_type(&self, item: ItemType) -> u64 {
        self.read_active().await.working.grid().count_for_type(item)
    }

    /// Current value of a change token.
    pub async fn change_token(&self, name: &str) -> Option<u64> {
        self.read_active().await.working.grid().change_token(name)
    }

    /// `user`'s observation at `coord`.
    pub async fn claim(&self, user: UserId, coord: Coord) -> Option<Observation> {
        self.read_active()
            .await
            .working
            .observations()
            .claim(user, coord)
            .copied()
    }

    /// Every observation by `user`, ordered by coordinate.
    pub async fn claims_by_user(&self, user: UserId) -> Vec<Observation> {
        self.read_active()
            .await
            .working
            .observations()
            .list_by_user(user)
    }

    /// `user`'s observations that agree with their cell's dominant type.
    pub async fn aligned_claims(&self, user: UserId) -> Vec<Observation> {
        leaderboard::aligned_claims(&self.read_active().await.working, user)
    }

    /// `user`'s observations of `item`, ordered by coordinate.
    pub async fn claims_by_type(&self, user: UserId, item: ItemType) -> Vec<Observation> {
        self.read_active()
            .await
            .working
            .observations()
            .list_by_type(user, item)
    }

    /// Who claimed what at `coord`, ordered by type then user.
    pub async fn claims_at(&self, coord: Coord) -> Vec<(ItemType, UserId)> {
        self.read_active()
            .await
            .working
            .observations()
            .list_by_coordinate(coord)
    }

    /// Dominant type of every cell.
    pub async fn grid_view(&self) -> GridView {
        self.read_active().await.working.grid().view()
    }

    /// Epoch, view and tokens captured together.
    pub async fn publication(&self) -> GridPublication {
        let active = self.read_active().await;
        GridPublication {
            epoch: active.key,
            view: active.working.grid().view(),
            tokens: active.working.grid().tokens().clone(),
        }
    }

    /// Check the conservation invariant of the active epoch.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Grid`] describing the first violation.
    pub async fn verify(&self) -> Result<(), EngineError> {
        Ok(self.read_active().await.working.verify()?)
    }

    /// Rank participants at `difficulty`.
    ///
    /// Raises the high-water mark of every scored type to its current count
    /// first, mirroring each raise.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Mirror`] if a raised mark cannot be stored.
    pub async fn leaderboard(
        &self,
        difficulty: Difficulty,
        limit: Option<usize>,
    ) -> Result<Leaderboard, EngineError> {
        let active = self.read_active().await;
        let mut records = self.records.write().await;

        let raised: Vec<MaxCountRecord> = ItemType::ALL
            .into_iter()
            .filter(|item| item.is_scored())
            .filter_map(|item| {
                let count = u32::try_from(active.working.grid().count_for_type(item))
                    .unwrap_or(u32::MAX);
                records.observe_count(difficulty, item, count)
            })
            .collect();
        for record in raised {
            mirror(&self.coordinator, &RecordMutation::UpsertMaxCount(record)).await?;
        }

        Ok(leaderboard::rank(
            &active.working,
            difficulty,
            records.max_counts(),
            limit,
        ))
    }

    // =========================================================================
    // Roles
    // =========================================================================

    /// Set `user`'s role. Returns the previous explicit grant.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Mirror`] if the grant cannot be stored.
    pub async fn grant_role(
        &self,
        user: UserId,
        role: UserRole,
    ) -> Result<Option<UserRole>, EngineError> {
        self.gate().await;
        let grant = RoleGrant { user, role };
        let mut records = self.records.write().await;
        let previous = records.grant_role(grant);
        mirror(&self.coordinator, &RecordMutation::UpsertRole(grant)).await?;
        tracing::info!(%user, ?role, "Role granted");
        Ok(previous)
    }

    /// Raise `user` one role step. Returns the new role.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Mirror`] if the grant cannot be stored.
    pub async fn promote(&self, user: UserId) -> Result<UserRole, EngineError> {
        self.step_role(user, UserRole::promoted).await
    }

    /// Lower `user` one role step. Returns the new role.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Mirror`] if the grant cannot be stored.
    pub async fn demote(&self, user: UserId) -> Result<UserRole, EngineError> {
        self.step_role(user, UserRole::demoted).await
    }

    /// Read and rewrite a role under one records guard, so concurrent steps
    /// each see the previous step's result.
    async fn step_role(
        &self,
        user: UserId,
        step: fn(UserRole) -> UserRole,
    ) -> Result<UserRole, EngineError> {
        self.gate().await;
        let mut records = self.records.write().await;
        let role = step(records.role_of(user));
        let grant = RoleGrant { user, role };
        records.grant_role(grant);
        mirror(&self.coordinator, &RecordMutation::UpsertRole(grant)).await?;
        tracing::info!(%user, ?role, "Role stepped");
        Ok(role)
    }

    /// Drop `user`'s explicit grant.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Mirror`] if the deletion cannot be stored.
    pub async fn revoke_role(&self, user: UserId) -> Result<Option<UserRole>, EngineError> {
        self.gate().await;
        let mut records = self.records.write().await;
        let previous = records.revoke_role(user);
        if previous.is_some() {
            mirror(&self.coordinator, &RecordMutation::DeleteRole(user)).await?;
        }
        Ok(previous)
    }

    /// `user`'s role, [`UserRole::Nobody`] by default.
    pub async fn role_of(&self, user: UserId) -> UserRole {
        self.gate().await;
        self.records.read().await.role_of(user)
    }

    /// Every explicit grant.
    pub async fn roles(&self) -> Vec<RoleGrant> {
        self.gate().await;
        self.records.read().await.roles()
    }

    // =========================================================================
    // User configuration and presets
    // =========================================================================

    /// `user`'s configuration, or the default one.
    pub async fn user_config(&self, user: UserId) -> UserConfig {
        self.gate().await;
        self.records
            .read()
            .await
            .user_config(user, self.settings.default_difficulty)
    }

    /// Store a participant's configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Mirror`] if the configuration cannot be stored.
    pub async fn set_user_config(&self, config: UserConfig) -> Result<(), EngineError> {
        self.gate().await;
        let mut records = self.records.write().await;
        records.set_user_config(config.clone());
        mirror(&self.coordinator, &RecordMutation::UpsertUserConfig(config)).await
    }

    /// Drop a participant's configuration. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Mirror`] if the deletion cannot be stored.
    pub async fn reset_user_config(&self, user: UserId) -> Result<bool, EngineError> {
        self.gate().await;
        let mut records = self.records.write().await;
        let existed = records.reset_user_config(user);
        if existed {
            mirror(&self.coordinator, &RecordMutation::DeleteUserConfig(user)).await?;
        }
        Ok(existed)
    }

    /// Save `owner`'s current cosmetic settings under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidPresetName`] for an empty or overlong
    /// name, or [`EngineError::Mirror`] if the preset cannot be stored.
    pub async fn save_preset(&self, owner: UserId, name: &str) -> Result<NamedPreset, EngineError> {
        validate_preset_name(name)?;
        self.gate().await;
        let mut records = self.records.write().await;
        let settings = records
            .user_config(owner, self.settings.default_difficulty)
            .settings;
        let preset = NamedPreset {
            owner,
            name: name.to_owned(),
            settings,
        };
        records.save_preset(preset.clone());
        mirror(&self.coordinator, &RecordMutation::UpsertPreset(preset.clone())).await?;
        Ok(preset)
    }

    /// Delete one of `owner`'s presets. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Mirror`] if the deletion cannot be stored.
    pub async fn delete_preset(&self, owner: UserId, name: &str) -> Result<bool, EngineError> {
        self.gate().await;
        let mut records = self.records.write().await;
        let existed = records.delete_preset(owner, name).is_some();
        if existed {
            let mutation = RecordMutation::DeletePreset {
                owner,
                name: name.to_owned(),
            };
            mirror(&self.coordinator, &mutation).await?;
        }
        Ok(existed)
    }

    /// Copy the settings of `owner`'s preset `name` into `user`'s
    /// configuration. `user`'s difficulty is kept.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PresetNotFound`] if there is no such preset, or
    /// [`EngineError::Mirror`] if the configuration cannot be stored.
    pub async fn load_preset(
        &self,
        user: UserId,
        owner: UserId,
        name: &str,
    ) -> Result<UserConfig, EngineError> {
        self.gate().await;
        let mut records = self.records.write().await;
        let settings = records
            .preset(owner, name)
            .map(|preset| preset.settings.clone())
            .ok_or_else(|| EngineError::PresetNotFound {
                owner,
                name: name.to_owned(),
            })?;
        let mut config = records.user_config(user, self.settings.default_difficulty);
        config.settings = settings;
        records.set_user_config(config.clone());
        mirror(
            &self.coordinator,
            &RecordMutation::UpsertUserConfig(config.clone()),
        )
        .await?;
        Ok(config)
    }

    /// Presets whose name contains `partial`, optionally for one owner.
    pub async fn search_presets(&self, owner: Option<UserId>, partial: &str) -> Vec<NamedPreset> {
        self.gate().await;
        self.records.read().await.search_presets(owner, partial)
    }

    // =========================================================================
    // High-water marks and last scan
    // =========================================================================

    /// Raise a high-water mark if `count` exceeds it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Mirror`] if a raised mark cannot be stored.
    pub async fn observe_count(
        &self,
        difficulty: Difficulty,
        item: ItemType,
        count: u32,
    ) -> Result<Option<MaxCountRecord>, EngineError> {
        self.gate().await;
        let mut records = self.records.write().await;
        let raised = records.observe_count(difficulty, item, count);
        if let Some(record) = raised {
            mirror(&self.coordinator, &RecordMutation::UpsertMaxCount(record)).await?;
        }
        Ok(raised)
    }

    /// Largest count seen for `item` at `difficulty`.
    pub async fn max_known_count(&self, difficulty: Difficulty, item: ItemType) -> u32 {
        self.gate().await;
        self.records.read().await.max_known_count(difficulty, item)
    }

    /// Time of the newest report ingested from history.
    pub async fn last_scan(&self) -> Option<DateTime<Utc>> {
        self.gate().await;
        self.records.read().await.last_scan()
    }

    /// Overwrite the last-scan marker.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Mirror`] if the marker cannot be stored.
    pub async fn set_last_scan(&self, at: DateTime<Utc>) -> Result<(), EngineError> {
        self.gate().await;
        let mut records = self.records.write().await;
        records.set_last_scan(at);
        mirror(&self.coordinator, &RecordMutation::SetLastScan(at)).await
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Flush the active epoch to the durable tier now.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persist`] if the flush fails; the next flush
    /// retries from scratch.
    pub async fn flush_now(&self) -> Result<FlushReport, EngineError> {
        let active = self.write_active().await;
        Ok(self.coordinator.flush(active.key, &active.working).await?)
    }

    /// Flush grid data and rewrite every cross-epoch record, reconciling
    /// earlier mirror failures.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persist`] on the first failed write.
    pub async fn save_all(&self) -> Result<SaveReport, EngineError> {
        let active = self.write_active().await;
        let flush = self.coordinator.flush(active.key, &active.working).await?;
        let records = self.records.read().await;
        let resync = self.coordinator.resync_records(&records).await?;
        tracing::info!(epoch = %active.key, "Saved all data to durable tier");
        Ok(SaveReport {
            flush,
            records: resync,
        })
    }

    /// Rotate if the clock has entered a new epoch.
    ///
    /// Returns the rotation details, or `None` when the active epoch is
    /// current.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persist`] if a rotation step fails; the prior
    /// epoch stays active.
    pub async fn rotate_if_due(&self) -> Result<Option<RotationDetails>, EngineError> {
        let due = self.due_key();
        let mut active = self.active.write().await;
        self.rotate_locked(&mut active, due).await
    }
}

async fn mirror<D: DurableStore>(
    coordinator: &PersistenceCoordinator<D>,
    mutation: &RecordMutation,
) -> Result<(), EngineError> {
    coordinator.mirror(mutation).await.map_err(|source| {
        let table = mutation.table();
        tracing::warn!(%table, error = %source, "Mirror to durable tier failed");
        EngineError::Mirror { table, source }
    })
}

fn ingest_into(active: &mut ActiveEpoch, reports: &[HistoricalReport]) -> IngestSummary {
    let week_start = active.key.starts_at();
    let mut summary = IngestSummary::default();
    for report in reports {
        summary.newest = summary.newest.max(Some(report.at));
        if report.at < week_start {
            summary.stale = summary.stale.saturating_add(1);
            continue;
        }
        match active.working.ingest(report) {
            Ok(outcome) if outcome.upsert.is_change() => {
                summary.applied = summary.applied.saturating_add(1);
            }
            Ok(_) => summary.unchanged = summary.unchanged.saturating_add(1),
            Err(e) => {
                tracing::debug!(error = %e, "Skipped historical report");
                summary.rejected = summary.rejected.saturating_add(1);
            }
        }
    }
    summary
}

fn validate_preset_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidPresetName {
            reason: "name is empty".to_owned(),
        });
    }
    let len = name.chars().count();
    if len > MAX_PRESET_NAME_LEN {
        return Err(EngineError::InvalidPresetName {
            reason: format!("expected at most {MAX_PRESET_NAME_LEN} characters, got {len}"),
        });
    }
    Ok(())
}


#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use cavern_db::MemoryDurableStore;
    use cavern_types::ScoreBucket;
    use chrono::{TimeDelta, TimeZone};
    use futures::FutureExt as _;
    use futures::future::BoxFuture;

    use super::*;
    use crate::epoch::{ManualClock, NoReplay};

    /// Wednesday of the week starting Monday 2026-10-12.
    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 14, 12, 0, 0).single().unwrap()
    }

    fn secs(n: i64) -> DateTime<Utc> {
        start() + TimeDelta::seconds(n)
    }

    async fn open_with(
        store: &MemoryDurableStore,
        clock: &Arc<ManualClock>,
        settings: EngineSettings,
        hook: Arc<dyn ReingestHook>,
    ) -> Engine<MemoryDurableStore> {
        let clock: Arc<dyn Clock> = Arc::clone(clock) as Arc<dyn Clock>;
        Engine::open(store.clone(), settings, clock, hook).await.unwrap()
    }

    async fn open(store: &MemoryDurableStore, clock: &Arc<ManualClock>) -> Engine<MemoryDurableStore> {
        open_with(store, clock, EngineSettings::default(), Arc::new(NoReplay)).await
    }

    fn fixture() -> (MemoryDurableStore, Arc<ManualClock>) {
        (MemoryDurableStore::new(), Arc::new(ManualClock::new(start())))
    }

    struct FixedReplay(Vec<HistoricalReport>);

    impl ReingestHook for FixedReplay {
        fn reports<'a>(
            &'a self,
            _rotation: &'a RotationDetails,
        ) -> BoxFuture<'a, Vec<HistoricalReport>> {
            futures::future::ready(self.0.clone()).boxed()
        }
    }

    #[tokio::test]
    async fn tied_cell_goes_to_lower_ordinal() {
        let (store, clock) = fixture();
        let engine = open(&store, &clock).await;
        let cell = Coord::new(3, 4);

        engine
            .report(UserId(1), cell, ItemType::Spider, secs(0))
            .await
            .unwrap();
        engine
            .report(UserId(2), cell, ItemType::DemonHead, secs(1))
            .await
            .unwrap();
        assert_eq!(engine.dominant_type(cell).await, ItemType::DemonHead);

        engine
            .report(UserId(3), cell, ItemType::Spider, secs(2))
            .await
            .unwrap();
        assert_eq!(engine.dominant_type(cell).await, ItemType::Spider);
        assert_eq!(
            engine.claims_at(cell).await,
            vec![
                (ItemType::DemonHead, UserId(2)),
                (ItemType::Spider, UserId(1)),
                (ItemType::Spider, UserId(3)),
            ]
        );
    }

    #[tokio::test]
    async fn aligned_claim_scores_squared_weight_over_mark() {
        let (store, clock) = fixture();
        let engine = open(&store, &clock).await;
        engine
            .observe_count(Difficulty::Normal, ItemType::Spider, 5)
            .await
            .unwrap();
        engine
            .report(UserId(1), Coord::new(2, 2), ItemType::Spider, secs(0))
            .await
            .unwrap();

        let board = engine.leaderboard(Difficulty::Normal, None).await.unwrap();
        assert_eq!(board.rewards[&ScoreBucket::Item(ItemType::Spider)], 125);
        assert_eq!(board.rows.len(), 1);
        assert_eq!(board.rows[0].score, 125);
    }

    #[tokio::test]
    async fn only_the_earlier_aligned_claim_is_credited() {
        let (store, clock) = fixture();
        let engine = open(&store, &clock).await;
        let cell = Coord::new(6, 6);
        engine
            .observe_count(Difficulty::Normal, ItemType::Spider, 5)
            .await
            .unwrap();
        engine
            .report(UserId(2), cell, ItemType::Spider, secs(0))
            .await
            .unwrap();
        engine
            .report(UserId(1), cell, ItemType::Spider, secs(60))
            .await
            .unwrap();

        let board = engine.leaderboard(Difficulty::Normal, Some(10)).await.unwrap();
        assert_eq!(board.rows.len(), 1);
        assert_eq!(board.rows[0].user, UserId(2));
        assert_eq!(engine.counters(cell).await.get(ItemType::Spider), 2);
    }

    #[tokio::test]
    async fn leaderboard_raises_and_mirrors_marks() {
        let (store, clock) = fixture();
        let engine = open(&store, &clock).await;
        for x in 1..=3 {
            engine
                .report(UserId(1), Coord::new(x, 1), ItemType::Empty, secs(0))
                .await
                .unwrap();
        }
        engine.leaderboard(Difficulty::Easy, None).await.unwrap();
        assert_eq!(engine.max_known_count(Difficulty::Easy, ItemType::Empty).await, 3);

        let durable = store.load_records().await.unwrap();
        assert!(durable.max_counts.iter().any(|r| {
            r.difficulty == Difficulty::Easy && r.item == ItemType::Empty && r.max_count == 3
        }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reports_lose_no_increments() {
        let (store, clock) = fixture();
        let engine = Arc::new(open(&store, &clock).await);
        let cell = Coord::new(10, 10);

        let tasks: Vec<_> = (0..8_i64)
            .map(|task| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    for n in 0..25_i64 {
                        let user = UserId(task * 100 + n);
                        engine
                            .report(user, cell, ItemType::Spider, secs(n))
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(engine.counters(cell).await.get(ItemType::Spider), 200);
        engine.verify().await.unwrap();
    }

    #[tokio::test]
    async fn flush_round_trips_through_a_fresh_engine() {
        let (store, clock) = fixture();
        let engine = open(&store, &clock).await;
        engine
            .report(UserId(1), Coord::new(1, 1), ItemType::Spider, secs(0))
            .await
            .unwrap();
        engine
            .report(UserId(2), Coord::new(1, 1), ItemType::Empty, secs(5))
            .await
            .unwrap();
        engine
            .report(UserId(2), Coord::new(4, 9), ItemType::GoldenCompass, secs(9))
            .await
            .unwrap();

        let report = engine.flush_now().await.unwrap();
        assert_eq!(report.observations, 3);
        engine.flush_now().await.unwrap();

        let reopened = open(&store, &clock).await;
        assert_eq!(reopened.claims_by_user(UserId(2)).await, engine.claims_by_user(UserId(2)).await);
        assert_eq!(reopened.grid_view().await, engine.grid_view().await);
        assert_eq!(
            reopened.counters(Coord::new(1, 1)).await,
            engine.counters(Coord::new(1, 1)).await
        );
    }

    #[tokio::test]
    async fn rotation_retires_the_week_once() {
        let (store, clock) = fixture();
        let engine = open(&store, &clock).await;
        let first = engine.active_epoch().await;
        engine
            .report(UserId(1), Coord::new(1, 1), ItemType::Spider, secs(0))
            .await
            .unwrap();
        let token_before = engine.change_token("render").await.unwrap();

        clock.advance(TimeDelta::days(7));
        let second = engine.active_epoch().await;
        assert_eq!(second, first.following());
        assert!(engine.claims_by_user(UserId(1)).await.is_empty());
        assert!(engine.change_token("render").await.unwrap() > token_before);

        let counts = store.row_counts().await.unwrap();
        assert_eq!(counts.epochs, 2);
        assert_eq!(counts.observations, 1);
        assert_eq!(counts.cells, 1);
        let writes = store.write_count().await;

        assert!(engine.rotate_if_due().await.unwrap().is_none());
        assert!(engine.rotate_if_due().await.unwrap().is_none());
        assert_eq!(store.row_counts().await.unwrap(), counts);
        assert_eq!(store.write_count().await, writes);
        assert_eq!(store.epochs().await, vec![first, second]);
        assert_eq!(store.load_epoch(first).await.unwrap().observations.len(), 1);
    }

    #[tokio::test]
    async fn failed_rotation_keeps_the_prior_epoch() {
        let (store, clock) = fixture();
        let engine = open(&store, &clock).await;
        let first = engine.active_epoch().await;

        store.set_available(false).await;
        clock.advance(TimeDelta::days(7));
        engine
            .report(UserId(1), Coord::new(2, 3), ItemType::Spider, secs(0))
            .await
            .unwrap();
        assert_eq!(engine.active_epoch().await, first);
        assert!(engine.rotate_if_due().await.is_err());

        store.set_available(true).await;
        let details = engine.rotate_if_due().await.unwrap().unwrap();
        assert_eq!(details.previous, first);
        assert_eq!(engine.active_epoch().await, first.following());
        assert_eq!(store.load_epoch(first).await.unwrap().observations.len(), 1);
    }

    #[tokio::test]
    async fn rotation_replays_history_into_the_new_week() {
        let (store, clock) = fixture();
        let next_week = secs(0) + TimeDelta::days(7);
        let replay = FixedReplay(vec![
            HistoricalReport {
                user: UserId(4),
                coord: Coord::new(5, 5),
                item: ItemType::LuckyBones,
                at: next_week,
            },
            HistoricalReport {
                user: UserId(4),
                coord: Coord::new(6, 6),
                item: ItemType::Spider,
                at: secs(0),
            },
        ]);
        let engine = open_with(&store, &clock, EngineSettings::default(), Arc::new(replay)).await;

        clock.set(next_week);
        let details = engine.rotate_if_due().await.unwrap().unwrap();
        assert_eq!(details.week_start, details.current.starts_at());
        assert_eq!(engine.claims_by_user(UserId(4)).await.len(), 1);
        assert_eq!(engine.dominant_type(Coord::new(5, 5)).await, ItemType::LuckyBones);
        assert_eq!(engine.last_scan().await, Some(next_week));
    }

    #[tokio::test]
    async fn historical_ingest_counts_and_advances_last_scan() {
        let (store, clock) = fixture();
        let engine = open(&store, &clock).await;
        let report = |user: i64, x: i32, at: DateTime<Utc>| HistoricalReport {
            user: UserId(user),
            coord: Coord::new(x, 1),
            item: ItemType::Spider,
            at,
        };

        let summary = engine
            .ingest_historical(vec![
                report(1, 1, secs(0)),
                report(1, 1, secs(10)),
                report(2, 99, secs(20)),
                report(3, 2, secs(-3 * 86_400)),
                report(4, 3, secs(30)),
            ])
            .await
            .unwrap();
        assert_eq!(summary.applied, 2);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.stale, 1);
        assert_eq!(summary.newest, Some(secs(30)));

        assert_eq!(engine.last_scan().await, Some(secs(30)));
        assert_eq!(store.load_records().await.unwrap().last_scan, Some(secs(30)));
        // A replay that ends earlier never moves the marker back.
        engine
            .ingest_historical(vec![report(5, 4, secs(1))])
            .await
            .unwrap();
        assert_eq!(engine.last_scan().await, Some(secs(30)));
    }

    #[tokio::test]
    async fn mirror_failure_surfaces_and_save_all_reconciles() {
        let (store, clock) = fixture();
        let engine = open(&store, &clock).await;
        engine
            .grant_role(UserId(8), UserRole::Admin)
            .await
            .unwrap();

        store.set_available(false).await;
        let err = engine.revoke_role(UserId(8)).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Mirror {
                table: TableClass::Role,
                ..
            }
        ));
        let err = engine.grant_role(UserId(9), UserRole::Banned).await.unwrap_err();
        assert!(matches!(err, EngineError::Mirror { .. }));
        // The working tier keeps both writes.
        assert_eq!(engine.role_of(UserId(8)).await, UserRole::Nobody);
        assert_eq!(engine.role_of(UserId(9)).await, UserRole::Banned);

        store.set_available(true).await;
        let saved = engine.save_all().await.unwrap();
        assert_eq!(saved.records.deleted, 1);

        let durable = store.load_records().await.unwrap();
        assert_eq!(
            durable.roles,
            vec![RoleGrant {
                user: UserId(9),
                role: UserRole::Banned,
            }]
        );
    }

    #[tokio::test]
    async fn presets_capture_and_copy_settings() {
        let (store, clock) = fixture();
        let engine = open(&store, &clock).await;
        engine
            .set_user_config(UserConfig {
                user: UserId(1),
                difficulty: Difficulty::Hard,
                settings: serde_json::json!({ "palette": "ember" }),
            })
            .await
            .unwrap();
        engine
            .set_user_config(UserConfig {
                user: UserId(2),
                difficulty: Difficulty::Normal,
                settings: serde_json::json!({ "palette": "frost" }),
            })
            .await
            .unwrap();

        let saved = engine.save_preset(UserId(1), "Ember").await.unwrap();
        assert_eq!(saved.settings, serde_json::json!({ "palette": "ember" }));

        let loaded = engine.load_preset(UserId(2), UserId(1), "Ember").await.unwrap();
        assert_eq!(loaded.difficulty, Difficulty::Normal);
        assert_eq!(loaded.settings, serde_json::json!({ "palette": "ember" }));
        assert_eq!(engine.user_config(UserId(2)).await, loaded);

        assert_eq!(engine.search_presets(None, "emb").await.len(), 1);
        assert!(matches!(
            engine.load_preset(UserId(2), UserId(1), "missing").await,
            Err(EngineError::PresetNotFound { .. })
        ));
        assert!(matches!(
            engine.save_preset(UserId(1), &"x".repeat(256)).await,
            Err(EngineError::InvalidPresetName { .. })
        ));
        assert!(engine.delete_preset(UserId(1), "Ember").await.unwrap());
        assert!(!engine.delete_preset(UserId(1), "Ember").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_promotions_each_take_one_step() {
        let (store, clock) = fixture();
        let engine = Arc::new(open(&store, &clock).await);
        engine.grant_role(UserId(5), UserRole::Banned).await.unwrap();

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move { engine.promote(UserId(5)).await.unwrap() })
            })
            .collect();
        let mut stepped = Vec::new();
        for task in tasks {
            stepped.push(task.await.unwrap());
        }
        stepped.sort();

        assert_eq!(stepped, vec![UserRole::Nobody, UserRole::Admin]);
        assert_eq!(engine.role_of(UserId(5)).await, UserRole::Admin);
        let durable = store.load_records().await.unwrap();
        assert!(durable.roles.contains(&RoleGrant {
            user: UserId(5),
            role: UserRole::Admin,
        }));
    }

    #[tokio::test]
    async fn configured_super_admin_is_granted_on_open() {
        let (store, clock) = fixture();
        let settings = EngineSettings {
            super_admin: Some(UserId(77)),
            ..EngineSettings::default()
        };
        let engine = open_with(&store, &clock, settings, Arc::new(NoReplay)).await;
        assert_eq!(engine.role_of(UserId(77)).await, UserRole::SuperAdmin);
        assert_eq!(engine.demote(UserId(77)).await.unwrap(), UserRole::Admin);
        assert_eq!(engine.promote(UserId(77)).await.unwrap(), UserRole::SuperAdmin);
        assert!(
            store
                .load_records()
                .await
                .unwrap()
                .roles
                .contains(&RoleGrant {
                    user: UserId(77),
                    role: UserRole::SuperAdmin,
                })
        );
    }

    #[tokio::test]
    async fn default_config_uses_the_configured_difficulty() {
        let (store, clock) = fixture();
        let settings = EngineSettings {
            default_difficulty: Difficulty::Hard,
            ..EngineSettings::default()
        };
        let engine = open_with(&store, &clock, settings, Arc::new(NoReplay)).await;
        assert_eq!(engine.user_config(UserId(3)).await.difficulty, Difficulty::Hard);
        assert!(!engine.reset_user_config(UserId(3)).await.unwrap());
    }

    #[tokio::test]
    async fn aligned_claims_follow_the_consensus() {
        let (store, clock) = fixture();
        let engine = open(&store, &clock).await;
        let coord = Coord::new(3, 3);
        engine.report(UserId(1), coord, ItemType::Spider, secs(0)).await.unwrap();
        engine.report(UserId(2), coord, ItemType::Spider, secs(1)).await.unwrap();
        engine.report(UserId(3), coord, ItemType::DemonHead, secs(2)).await.unwrap();

        assert_eq!(engine.aligned_claims(UserId(1)).await.len(), 1);
        assert!(engine.aligned_claims(UserId(3)).await.is_empty());
        assert_eq!(engine.claims_by_user(UserId(3)).await.len(), 1);

        engine.report(UserId(4), coord, ItemType::DemonHead, secs(3)).await.unwrap();
        engine.report(UserId(5), coord, ItemType::DemonHead, secs(4)).await.unwrap();
        assert!(engine.aligned_claims(UserId(1)).await.is_empty());
        assert_eq!(engine.aligned_claims(UserId(3)).await.len(), 1);
    }

    #[tokio::test]
    async fn retract_all_clears_only_that_user() {
        let (store, clock) = fixture();
        let engine = open(&store, &clock).await;
        engine
            .report(UserId(1), Coord::new(1, 2), ItemType::Spider, secs(0))
            .await
            .unwrap();
        engine
            .report(UserId(1), Coord::new(2, 2), ItemType::Empty, secs(0))
            .await
            .unwrap();
        engine
            .report(UserId(2), Coord::new(2, 2), ItemType::Empty, secs(0))
            .await
            .unwrap();

        assert_eq!(engine.retract(UserId(2), Coord::new(9, 9)).await, None);
        assert_eq!(engine.retract_all(UserId(1)).await.len(), 2);
        assert_eq!(engine.count_for_type(ItemType::Empty).await, 1);
        assert_eq!(engine.claims_by_type(UserId(2), ItemType::Empty).await.len(), 1);
        assert!(engine.claim(UserId(1), Coord::new(1, 2)).await.is_none());
        engine.verify().await.unwrap();
    }
}
