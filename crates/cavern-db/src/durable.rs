//! The durable-tier contract and its `PostgreSQL` implementation.
//!
//! The engine talks to the durable tier only through [`DurableStore`]. Grid
//! data moves as whole-epoch snapshots (replaced wholesale on every flush);
//! cross-epoch records move one row at a time as they are mutated.

use std::future::Future;

use cavern_types::{
    CellCounters, Coord, EpochKey, MaxCountRecord, NamedPreset, Observation, RoleGrant,
    UserConfig, UserId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DbError;
use crate::grid_store::GridStore;
use crate::postgres::PostgresPool;
use crate::record_store::RecordStore;

/// Stored counters of one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRow {
    /// The cell.
    pub coord: Coord,
    /// Its counters.
    pub counters: CellCounters,
}

/// Every grid row of one epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochSnapshot {
    /// The epoch.
    pub epoch: EpochKey,
    /// Observation rows.
    pub observations: Vec<Observation>,
    /// Aggregate rows, one per non-empty cell.
    pub cells: Vec<CellRow>,
}

impl EpochSnapshot {
    /// A snapshot with no rows.
    pub const fn empty(epoch: EpochKey) -> Self {
        Self {
            epoch,
            observations: Vec::new(),
            cells: Vec::new(),
        }
    }
}

/// Every cross-epoch record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableRecords {
    /// Role grants.
    pub roles: Vec<RoleGrant>,
    /// Time of the newest historical report ingested.
    pub last_scan: Option<DateTime<Utc>>,
    /// Per-participant configuration.
    pub user_configs: Vec<UserConfig>,
    /// Named cosmetic presets.
    pub presets: Vec<NamedPreset>,
    /// High-water marks.
    pub max_counts: Vec<MaxCountRecord>,
}

/// Row counts of the epoch-scoped tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCounts {
    /// Registered epoch markers.
    pub epochs: u64,
    /// Observation rows across all epochs.
    pub observations: u64,
    /// Aggregate rows across all epochs.
    pub cells: u64,
}

/// The durable tier.
///
/// Implementations must make [`DurableStore::replace_epoch`] atomic: either
/// every row of the snapshot is visible afterwards or none of the previous
/// rows were touched. All other writes are insert-or-update by primary key
/// and therefore idempotent.
pub trait DurableStore: Send + Sync + 'static {
    /// Record that `epoch` has been activated. Idempotent.
    fn register_epoch(&self, epoch: EpochKey) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Replace every grid row of `snapshot.epoch` with the snapshot's rows.
    fn replace_epoch(
        &self,
        snapshot: &EpochSnapshot,
    ) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Read every grid row of `epoch`. An unknown epoch yields an empty
    /// snapshot.
    fn load_epoch(
        &self,
        epoch: EpochKey,
    ) -> impl Future<Output = Result<EpochSnapshot, DbError>> + Send;

    /// Read every cross-epoch record.
    fn load_records(&self) -> impl Future<Output = Result<DurableRecords, DbError>> + Send;

    /// Insert or update a role grant.
    fn upsert_role(&self, grant: RoleGrant) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Remove a role grant.
    fn delete_role(&self, user: UserId) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Overwrite the last-scan marker.
    fn set_last_scan(&self, at: DateTime<Utc>)
    -> impl Future<Output = Result<(), DbError>> + Send;

    /// Insert or update a participant's configuration.
    fn upsert_user_config(
        &self,
        config: &UserConfig,
    ) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Remove a participant's configuration.
    fn delete_user_config(&self, user: UserId)
    -> impl Future<Output = Result<(), DbError>> + Send;

    /// Insert or update a named preset.
    fn upsert_preset(
        &self,
        preset: &NamedPreset,
    ) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Remove a named preset.
    fn delete_preset(
        &self,
        owner: UserId,
        name: &str,
    ) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Insert or update a high-water mark.
    fn upsert_max_count(
        &self,
        record: MaxCountRecord,
    ) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Count the rows of the epoch-scoped tables.
    fn row_counts(&self) -> impl Future<Output = Result<StoreCounts, DbError>> + Send;
}

/// [`DurableStore`] backed by `PostgreSQL`.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PostgresPool,
}

impl PostgresStore {
    /// Wrap a connected pool. Migrations must already have run.
    pub const fn new(pool: PostgresPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub const fn pool(&self) -> &PostgresPool {
        &self.pool
    }

    fn grid(&self) -> GridStore<'_> {
        GridStore::new(self.pool.pool())
    }

    fn records(&self) -> RecordStore<'_> {
        RecordStore::new(self.pool.pool())
    }
}

impl DurableStore for PostgresStore {
    async fn register_epoch(&self, epoch: EpochKey) -> Result<(), DbError> {
        self.grid().register_epoch(epoch).await
    }

    async fn replace_epoch(&self, snapshot: &EpochSnapshot) -> Result<(), DbError> {
        self.grid().replace_epoch(snapshot).await
    }

    async fn load_epoch(&self, epoch: EpochKey) -> Result<EpochSnapshot, DbError> {
        self.grid().load_epoch(epoch).await
    }

    async fn load_records(&self) -> Result<DurableRecords, DbError> {
        self.records().load_all().await
    }

    async fn upsert_role(&self, grant: RoleGrant) -> Result<(), DbError> {
        self.records().upsert_role(grant).await
    }

    async fn delete_role(&self, user: UserId) -> Result<(), DbError> {
        self.records().delete_role(user).await
    }

    async fn set_last_scan(&self, at: DateTime<Utc>) -> Result<(), DbError> {
        self.records().set_last_scan(at).await
    }

    async fn upsert_user_config(&self, config: &UserConfig) -> Result<(), DbError> {
        self.records().upsert_user_config(config).await
    }

    async fn delete_user_config(&self, user: UserId) -> Result<(), DbError> {
        self.records().delete_user_config(user).await
    }

    async fn upsert_preset(&self, preset: &NamedPreset) -> Result<(), DbError> {
        self.records().upsert_preset(preset).await
    }

    async fn delete_preset(&self, owner: UserId, name: &str) -> Result<(), DbError> {
        self.records().delete_preset(owner, name).await
    }

    async fn upsert_max_count(&self, record: MaxCountRecord) -> Result<(), DbError> {
        self.records().upsert_max_count(record).await
    }

    async fn row_counts(&self) -> Result<StoreCounts, DbError> {
        self.grid().row_counts().await
    }
}
