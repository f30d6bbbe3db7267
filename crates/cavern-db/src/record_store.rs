//! Cross-epoch records: roles, last-scan marker, user configuration, named
//! presets and high-water marks.
//!
//! Every write is an insert-or-update by primary key, so mirroring the same
//! mutation twice is harmless.

use cavern_types::{
    Difficulty, ItemType, MaxCountRecord, NamedPreset, RoleGrant, UserConfig, UserId, UserRole,
};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::durable::DurableRecords;
use crate::error::DbError;

/// Operations on the cross-epoch tables.
pub struct RecordStore<'a> {
    pool: &'a PgPool,
}

impl<'a> RecordStore<'a> {
    /// Create a new record store bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    // =========================================================================
    // Roles
    // =========================================================================

    /// Insert or update a role grant.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the upsert fails.
    pub async fn upsert_role(&self, grant: RoleGrant) -> Result<(), DbError> {
        sqlx::query(
            r"INSERT INTO roles (user_id, role) VALUES ($1, $2)
              ON CONFLICT (user_id) DO UPDATE SET role = EXCLUDED.role",
        )
        .bind(grant.user.into_inner())
        .bind(grant.role.value())
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Remove a role grant.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the delete fails.
    pub async fn delete_role(&self, user: UserId) -> Result<(), DbError> {
        sqlx::query("DELETE FROM roles WHERE user_id = $1")
            .bind(user.into_inner())
            .execute(self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Last scan
    // =========================================================================

    /// Overwrite the singleton last-scan marker.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the upsert fails.
    pub async fn set_last_scan(&self, at: DateTime<Utc>) -> Result<(), DbError> {
        sqlx::query(
            r"INSERT INTO last_scan (id, scanned_at) VALUES (1, $1)
              ON CONFLICT (id) DO UPDATE SET scanned_at = EXCLUDED.scanned_at",
        )
        .bind(at)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // User configuration
    // =========================================================================

    /// Insert or update a participant's configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the upsert fails.
    pub async fn upsert_user_config(&self, config: &UserConfig) -> Result<(), DbError> {
        sqlx::query(
            r"INSERT INTO user_configs (user_id, difficulty, settings) VALUES ($1, $2, $3)
              ON CONFLICT (user_id) DO UPDATE SET
                difficulty = EXCLUDED.difficulty,
                settings = EXCLUDED.settings",
        )
        .bind(config.user.into_inner())
        .bind(config.difficulty.value())
        .bind(&config.settings)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Remove a participant's configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the delete fails.
    pub async fn delete_user_config(&self, user: UserId) -> Result<(), DbError> {
        sqlx::query("DELETE FROM user_configs WHERE user_id = $1")
            .bind(user.into_inner())
            .execute(self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Named presets
    // =========================================================================

    /// Insert or update a named preset.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the upsert fails.
    pub async fn upsert_preset(&self, preset: &NamedPreset) -> Result<(), DbError> {
        sqlx::query(
            r"INSERT INTO named_presets (owner_id, name, settings) VALUES ($1, $2, $3)
              ON CONFLICT (owner_id, name) DO UPDATE SET settings = EXCLUDED.settings",
        )
        .bind(preset.owner.into_inner())
        .bind(&preset.name)
        .bind(&preset.settings)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Remove a named preset.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the delete fails.
    pub async fn delete_preset(&self, owner: UserId, name: &str) -> Result<(), DbError> {
        sqlx::query("DELETE FROM named_presets WHERE owner_id = $1 AND name = $2")
            .bind(owner.into_inner())
            .bind(name)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // High-water marks
    // =========================================================================

    /// Insert or update a high-water mark.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the upsert fails.
    pub async fn upsert_max_count(&self, record: MaxCountRecord) -> Result<(), DbError> {
        sqlx::query(
            r"INSERT INTO difficulty_max_counts (difficulty, item_type, max_count) VALUES ($1, $2, $3)
              ON CONFLICT (difficulty, item_type) DO UPDATE SET max_count = EXCLUDED.max_count",
        )
        .bind(record.difficulty.value())
        .bind(i16::from(record.item.ordinal()))
        .bind(i32::try_from(record.max_count).unwrap_or(i32::MAX))
        .execute(self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Bulk load
    // =========================================================================

    /// Read every cross-epoch record.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if a query fails.
    /// Returns [`DbError::CorruptRow`] if a stored enum value is unknown.
    pub async fn load_all(&self) -> Result<DurableRecords, DbError> {
        let roles = sqlx::query_as::<_, (i64, i16)>("SELECT user_id, role FROM roles ORDER BY user_id")
            .fetch_all(self.pool)
            .await?
            .into_iter()
            .map(|(user_id, role)| {
                Ok(RoleGrant {
                    user: UserId(user_id),
                    role: UserRole::from_value(role)
                        .ok_or_else(|| corrupt("roles", format!("unknown role {role}")))?,
                })
            })
            .collect::<Result<Vec<_>, DbError>>()?;

        let last_scan: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT scanned_at FROM last_scan WHERE id = 1")
                .fetch_optional(self.pool)
                .await?;

        let user_configs = sqlx::query_as::<_, (i64, i16, serde_json::Value)>(
            "SELECT user_id, difficulty, settings FROM user_configs ORDER BY user_id",
        )
        .fetch_all(self.pool)
        .await?
        .into_iter()
        .map(|(user_id, difficulty, settings)| {
            Ok(UserConfig {
                user: UserId(user_id),
                difficulty: parse_difficulty("user_configs", difficulty)?,
                settings,
            })
        })
        .collect::<Result<Vec<_>, DbError>>()?;

        let presets: Vec<NamedPreset> = sqlx::query_as::<_, (i64, String, serde_json::Value)>(
            "SELECT owner_id, name, settings FROM named_presets ORDER BY owner_id, name",
        )
        .fetch_all(self.pool)
        .await?
        .into_iter()
        .map(|(owner_id, name, settings)| NamedPreset {
            owner: UserId(owner_id),
            name,
            settings,
        })
        .collect();

        let max_counts = sqlx::query_as::<_, (i16, i16, i32)>(
            "SELECT difficulty, item_type, max_count FROM difficulty_max_counts ORDER BY difficulty, item_type",
        )
        .fetch_all(self.pool)
        .await?
        .into_iter()
        .map(|(difficulty, item_type, max_count)| {
            let item = u8::try_from(item_type)
                .ok()
                .and_then(ItemType::from_ordinal)
                .ok_or_else(|| {
                    corrupt(
                        "difficulty_max_counts",
                        format!("unknown item type ordinal {item_type}"),
                    )
                })?;
            Ok(MaxCountRecord {
                difficulty: parse_difficulty("difficulty_max_counts", difficulty)?,
                item,
                max_count: u32::try_from(max_count).unwrap_or(0),
            })
        })
        .collect::<Result<Vec<_>, DbError>>()?;

        tracing::debug!(
            roles = roles.len(),
            user_configs = user_configs.len(),
            presets = presets.len(),
            max_counts = max_counts.len(),
            "Loaded cross-epoch records"
        );

        Ok(DurableRecords {
            roles,
            last_scan,
            user_configs,
            presets,
            max_counts,
        })
    }
}

fn parse_difficulty(table: &'static str, value: i16) -> Result<Difficulty, DbError> {
    Difficulty::from_value(value).ok_or_else(|| corrupt(table, format!("unknown difficulty {value}")))
}

const fn corrupt(table: &'static str, detail: String) -> DbError {
    DbError::CorruptRow { table, detail }
}
