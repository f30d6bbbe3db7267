//! In-memory [`DurableStore`] for tests and embedded use.
//!
//! Mirrors the `PostgreSQL` semantics (wholesale epoch replacement, upsert by
//! primary key) without a server. Clones share the same backing tables, so a
//! test can keep a handle for inspection after handing one to the engine.
//! [`MemoryDurableStore::set_available`] simulates an outage.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use cavern_types::{
    Difficulty, EpochKey, ItemType, MaxCountRecord, NamedPreset, RoleGrant, UserConfig, UserId,
    UserRole,
};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::durable::{DurableRecords, DurableStore, EpochSnapshot, StoreCounts};
use crate::error::DbError;

#[derive(Debug, Default)]
struct Tables {
    epochs: BTreeSet<EpochKey>,
    grids: BTreeMap<EpochKey, EpochSnapshot>,
    roles: BTreeMap<UserId, UserRole>,
    last_scan: Option<DateTime<Utc>>,
    user_configs: BTreeMap<UserId, UserConfig>,
    presets: BTreeMap<(UserId, String), NamedPreset>,
    max_counts: BTreeMap<(Difficulty, ItemType), u32>,
    unavailable: bool,
    writes: u64,
}

impl Tables {
    fn check(&self) -> Result<(), DbError> {
        if self.unavailable {
            Err(DbError::Unavailable("memory store marked unavailable".to_owned()))
        } else {
            Ok(())
        }
    }

    fn write(&mut self) -> Result<(), DbError> {
        self.check()?;
        self.writes = self.writes.saturating_add(1);
        Ok(())
    }
}

/// A [`DurableStore`] held entirely in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryDurableStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryDurableStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call succeed (`true`) or fail with
    /// [`DbError::Unavailable`] (`false`).
    pub async fn set_available(&self, available: bool) {
        self.tables.lock().await.unavailable = !available;
    }

    /// Number of successful writes so far.
    pub async fn write_count(&self) -> u64 {
        self.tables.lock().await.writes
    }

    /// Registered epochs, oldest first.
    pub async fn epochs(&self) -> Vec<EpochKey> {
        self.tables.lock().await.epochs.iter().copied().collect()
    }
}

impl DurableStore for MemoryDurableStore {
    async fn register_epoch(&self, epoch: EpochKey) -> Result<(), DbError> {
        let mut tables = self.tables.lock().await;
        tables.write()?;
        tables.epochs.insert(epoch);
        Ok(())
    }

    async fn replace_epoch(&self, snapshot: &EpochSnapshot) -> Result<(), DbError> {
        let mut tables = self.tables.lock().await;
        tables.write()?;
        tables.epochs.insert(snapshot.epoch);
        tables.grids.insert(snapshot.epoch, snapshot.clone());
        Ok(())
    }

    async fn load_epoch(&self, epoch: EpochKey) -> Result<EpochSnapshot, DbError> {
        let tables = self.tables.lock().await;
        tables.check()?;
        Ok(tables
            .grids
            .get(&epoch)
            .cloned()
            .unwrap_or_else(|| EpochSnapshot::empty(epoch)))
    }

    async fn load_records(&self) -> Result<DurableRecords, DbError> {
        let tables = self.tables.lock().await;
        tables.check()?;
        Ok(DurableRecords {
            roles: tables
                .roles
                .iter()
                .map(|(&user, &role)| RoleGrant { user, role })
                .collect(),
            last_scan: tables.last_scan,
            user_configs: tables.user_configs.values().cloned().collect(),
            presets: tables.presets.values().cloned().collect(),
            max_counts: tables
                .max_counts
                .iter()
                .map(|(&(difficulty, item), &max_count)| MaxCountRecord {
                    difficulty,
                    item,
                    max_count,
                })
                .collect(),
        })
    }

    async fn upsert_role(&self, grant: RoleGrant) -> Result<(), DbError> {
        let mut tables = self.tables.lock().await;
        tables.write()?;
        tables.roles.insert(grant.user, grant.role);
        Ok(())
    }

    async fn delete_role(&self, user: UserId) -> Result<(), DbError> {
        let mut tables = self.tables.lock().await;
        tables.write()?;
        tables.roles.remove(&user);
        Ok(())
    }

    async fn set_last_scan(&self, at: DateTime<Utc>) -> Result<(), DbError> {
        let mut tables = self.tables.lock().await;
        tables.write()?;
        tables.last_scan = Some(at);
        Ok(())
    }

    async fn upsert_user_config(&self, config: &UserConfig) -> Result<(), DbError> {
        let mut tables = self.tables.lock().await;
        tables.write()?;
        tables.user_configs.insert(config.user, config.clone());
        Ok(())
    }

    async fn delete_user_config(&self, user: UserId) -> Result<(), DbError> {
        let mut tables = self.tables.lock().await;
        tables.write()?;
        tables.user_configs.remove(&user);
        Ok(())
    }

    async fn upsert_preset(&self, preset: &NamedPreset) -> Result<(), DbError> {
        let mut tables = self.tables.lock().await;
        tables.write()?;
        tables
            .presets
            .insert((preset.owner, preset.name.clone()), preset.clone());
        Ok(())
    }

    async fn delete_preset(&self, owner: UserId, name: &str) -> Result<(), DbError> {
        let mut tables = self.tables.lock().await;
        tables.write()?;
        tables.presets.remove(&(owner, name.to_owned()));
        Ok(())
    }

    async fn upsert_max_count(&self, record: MaxCountRecord) -> Result<(), DbError> {
        let mut tables = self.tables.lock().await;
        tables.write()?;
        tables
            .max_counts
            .insert((record.difficulty, record.item), record.max_count);
        Ok(())
    }

    async fn row_counts(&self) -> Result<StoreCounts, DbError> {
        let tables = self.tables.lock().await;
        tables.check()?;
        let len = |n: usize| u64::try_from(n).unwrap_or(u64::MAX);
        Ok(StoreCounts {
            epochs: len(tables.epochs.len()),
            observations: tables
                .grids
                .values()
                .map(|s| len(s.observations.len()))
                .fold(0, u64::saturating_add),
            cells: tables
                .grids
                .values()
                .map(|s| len(s.cells.len()))
                .fold(0, u64::saturating_add),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use cavern_types::{Coord, Observation};
    use chrono::NaiveDate;

    use super::*;

    fn epoch(day: u32) -> EpochKey {
        EpochKey::from_date(NaiveDate::from_ymd_opt(2026, 10, day).unwrap())
    }

    fn snapshot(key: EpochKey, users: i64) -> EpochSnapshot {
        EpochSnapshot {
            epoch: key,
            observations: (1..=users)
                .map(|u| Observation {
                    user: UserId(u),
                    coord: Coord::new(1, 1),
                    item: ItemType::Spider,
                    claimed_at: DateTime::<Utc>::UNIX_EPOCH,
                })
                .collect(),
            cells: Vec::new(),
        }
    }

    #[tokio::test]
    async fn replace_epoch_overwrites_rather_than_appends() {
        let store = MemoryDurableStore::new();
        store.replace_epoch(&snapshot(epoch(12), 3)).await.unwrap();
        store.replace_epoch(&snapshot(epoch(12), 2)).await.unwrap();

        let counts = store.row_counts().await.unwrap();
        assert_eq!(counts.epochs, 1);
        assert_eq!(counts.observations, 2);
        assert_eq!(store.load_epoch(epoch(12)).await.unwrap().observations.len(), 2);
        assert!(store.load_epoch(epoch(19)).await.unwrap().observations.is_empty());
    }

    #[tokio::test]
    async fn unavailable_store_rejects_everything() {
        let store = MemoryDurableStore::new();
        store.set_available(false).await;
        assert!(matches!(
            store.register_epoch(epoch(12)).await,
            Err(DbError::Unavailable(_))
        ));
        assert!(store.load_records().await.is_err());
        assert_eq!(store.write_count().await, 0);

        store.set_available(true).await;
        store.register_epoch(epoch(12)).await.unwrap();
        assert_eq!(store.epochs().await, vec![epoch(12)]);
    }

    #[tokio::test]
    async fn records_upsert_by_key() {
        let store = MemoryDurableStore::new();
        let shared = store.clone();
        store
            .upsert_role(RoleGrant {
                user: UserId(1),
                role: UserRole::Admin,
            })
            .await
            .unwrap();
        store
            .upsert_role(RoleGrant {
                user: UserId(1),
                role: UserRole::Banned,
            })
            .await
            .unwrap();
        store
            .upsert_preset(&NamedPreset {
                owner: UserId(1),
                name: "dark".to_owned(),
                settings: serde_json::json!({"bg": "black"}),
            })
            .await
            .unwrap();
        store.delete_preset(UserId(1), "dark").await.unwrap();

        let records = shared.load_records().await.unwrap();
        assert_eq!(records.roles.len(), 1);
        assert_eq!(records.roles[0].role, UserRole::Banned);
        assert!(records.presets.is_empty());
    }
}
