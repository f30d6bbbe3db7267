//! Epoch-scoped persistence: epoch markers, observations, cell aggregates.
//!
//! An epoch's grid rows are only ever written as a whole: the previous rows
//! are deleted and the new ones inserted inside a single transaction, so a
//! flush can be retried any number of times without duplicating history.

use cavern_types::{CellCounters, Coord, EpochKey, ItemType, Observation, UserId};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Row};

use crate::durable::{CellRow, EpochSnapshot, StoreCounts};
use crate::error::DbError;

/// Operations on the `epochs`, `observations` and `cell_aggregates` tables.
pub struct GridStore<'a> {
    pool: &'a PgPool,
}

impl<'a> GridStore<'a> {
    /// Create a new grid store bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Insert the epoch marker if it is not already present.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the insert fails.
    pub async fn register_epoch(&self, epoch: EpochKey) -> Result<(), DbError> {
        sqlx::query("INSERT INTO epochs (epoch) VALUES ($1) ON CONFLICT (epoch) DO NOTHING")
            .bind(epoch.as_date())
            .execute(self.pool)
            .await?;
        tracing::debug!(%epoch, "Registered epoch marker");
        Ok(())
    }

    /// Replace every grid row of the snapshot's epoch in one transaction.
    ///
    /// The epoch marker is inserted if missing so a replace never fails on
    /// the foreign key.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if any statement fails; the transaction
    /// is rolled back and the previous rows are left intact.
    pub async fn replace_epoch(&self, snapshot: &EpochSnapshot) -> Result<(), DbError> {
        let date = snapshot.epoch.as_date();
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO epochs (epoch) VALUES ($1) ON CONFLICT (epoch) DO NOTHING")
            .bind(date)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM observations WHERE epoch = $1")
            .bind(date)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM cell_aggregates WHERE epoch = $1")
            .bind(date)
            .execute(&mut *tx)
            .await?;

        if !snapshot.observations.is_empty() {
            let len = snapshot.observations.len();
            let mut user_ids = Vec::with_capacity(len);
            let mut xs = Vec::with_capacity(len);
            let mut ys = Vec::with_capacity(len);
            let mut item_types = Vec::with_capacity(len);
            let mut claimed = Vec::with_capacity(len);
            for row in &snapshot.observations {
                user_ids.push(row.user.into_inner());
                xs.push(row.coord.x);
                ys.push(row.coord.y);
                item_types.push(i16::from(row.item.ordinal()));
                claimed.push(row.claimed_at);
            }

            sqlx::query(
                r"INSERT INTO observations (epoch, user_id, x, y, item_type, claimed_at)
                  SELECT $1::DATE, * FROM UNNEST($2::BIGINT[], $3::INTEGER[], $4::INTEGER[], $5::SMALLINT[], $6::TIMESTAMPTZ[])",
            )
            .bind(date)
            .bind(&user_ids)
            .bind(&xs)
            .bind(&ys)
            .bind(&item_types)
            .bind(&claimed)
            .execute(&mut *tx)
            .await?;
        }

        if !snapshot.cells.is_empty() {
            let len = snapshot.cells.len();
            let mut xs = Vec::with_capacity(len);
            let mut ys = Vec::with_capacity(len);
            let mut columns: Vec<Vec<i32>> = ItemType::ALL
                .iter()
                .map(|_| Vec::with_capacity(len))
                .collect();
            for cell in &snapshot.cells {
                xs.push(cell.coord.x);
                ys.push(cell.coord.y);
                for (item, column) in ItemType::ALL.into_iter().zip(columns.iter_mut()) {
                    column.push(i32::try_from(cell.counters.get(item)).unwrap_or(i32::MAX));
                }
            }

            let sql = cell_insert_sql();
            let mut query = sqlx::query(&sql)
                .bind(date)
                .bind(&xs)
                .bind(&ys);
            for column in &columns {
                query = query.bind(column);
            }
            query.execute(&mut *tx).await?;
        }

        tx.commit().await?;

        tracing::debug!(
            epoch = %snapshot.epoch,
            observations = snapshot.observations.len(),
            cells = snapshot.cells.len(),
            "Replaced epoch grid rows"
        );
        Ok(())
    }

    /// Read every grid row of `epoch`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if a query fails.
    /// Returns [`DbError::CorruptRow`] if a stored value is out of range.
    pub async fn load_epoch(&self, epoch: EpochKey) -> Result<EpochSnapshot, DbError> {
        let rows = sqlx::query_as::<_, ObservationRow>(
            r"SELECT user_id, x, y, item_type, claimed_at
              FROM observations
              WHERE epoch = $1
              ORDER BY user_id, x, y",
        )
        .bind(epoch.as_date())
        .fetch_all(self.pool)
        .await?;
        let observations = rows
            .into_iter()
            .map(ObservationRow::into_observation)
            .collect::<Result<Vec<_>, _>>()?;

        let select = cell_select_sql();
        let cell_rows = sqlx::query(&select)
            .bind(epoch.as_date())
            .fetch_all(self.pool)
            .await?;
        let mut cells = Vec::with_capacity(cell_rows.len());
        for row in &cell_rows {
            let mut values = [0_u32; ItemType::COUNT];
            for (slot, name) in values.iter_mut().zip(ItemType::COLUMNS) {
                let raw: i32 = row.try_get(name)?;
                *slot = u32::try_from(raw).map_err(|e| DbError::CorruptRow {
                    table: "cell_aggregates",
                    detail: format!("counter {raw} in column {name}: {e}"),
                })?;
            }
            cells.push(CellRow {
                coord: Coord::new(row.try_get("x")?, row.try_get("y")?),
                counters: CellCounters::from_array(values),
            });
        }

        Ok(EpochSnapshot {
            epoch,
            observations,
            cells,
        })
    }

    /// Count the rows of the epoch-scoped tables.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn row_counts(&self) -> Result<StoreCounts, DbError> {
        let row = sqlx::query(
            r"SELECT
                (SELECT COUNT(*) FROM epochs) AS epochs,
                (SELECT COUNT(*) FROM observations) AS observations,
                (SELECT COUNT(*) FROM cell_aggregates) AS cells",
        )
        .fetch_one(self.pool)
        .await?;

        let count = |name: &str| -> Result<u64, DbError> {
            let raw: i64 = row.try_get(name)?;
            Ok(u64::try_from(raw).unwrap_or(0))
        };
        Ok(StoreCounts {
            epochs: count("epochs")?,
            observations: count("observations")?,
            cells: count("cells")?,
        })
    }

    /// Every registered epoch, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn list_epochs(&self) -> Result<Vec<EpochKey>, DbError> {
        let dates: Vec<NaiveDate> = sqlx::query_scalar("SELECT epoch FROM epochs ORDER BY epoch")
            .fetch_all(self.pool)
            .await?;
        Ok(dates.into_iter().map(EpochKey::from_date).collect())
    }
}

/// `INSERT` for `cell_aggregates` with one `UNNEST` array per item column.
fn cell_insert_sql() -> String {
    let columns = ItemType::COLUMNS.join(", ");
    let arrays = (0..ItemType::COUNT)
        .map(|i| format!("${}::INTEGER[]", i.saturating_add(4)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO cell_aggregates (epoch, x, y, {columns}) \
         SELECT $1::DATE, * FROM UNNEST($2::INTEGER[], $3::INTEGER[], {arrays})"
    )
}

/// `SELECT` of every counter column for one epoch.
fn cell_select_sql() -> String {
    format!(
        "SELECT x, y, {} FROM cell_aggregates WHERE epoch = $1 ORDER BY x, y",
        ItemType::COLUMNS.join(", ")
    )
}

/// A row from the `observations` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ObservationRow {
    /// Reporting participant.
    pub user_id: i64,
    /// Column.
    pub x: i32,
    /// Row.
    pub y: i32,
    /// Item type ordinal.
    pub item_type: i16,
    /// Time of the current claim.
    pub claimed_at: DateTime<Utc>,
}

impl ObservationRow {
    /// Convert into the domain type.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::CorruptRow`] if the ordinal names no item type.
    pub fn into_observation(self) -> Result<Observation, DbError> {
        let item = u8::try_from(self.item_type)
            .ok()
            .and_then(ItemType::from_ordinal)
            .ok_or_else(|| DbError::CorruptRow {
                table: "observations",
                detail: format!("unknown item type ordinal {}", self.item_type),
            })?;
        Ok(Observation {
            user: UserId(self.user_id),
            coord: Coord::new(self.x, self.y),
            item,
            claimed_at: self.claimed_at,
        })
    }
}
