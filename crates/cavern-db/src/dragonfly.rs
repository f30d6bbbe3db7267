//! `Dragonfly` (Redis-compatible) publication of the consensus grid.
//!
//! After each successful flush the engine publishes the active epoch, the
//! dominant-type view of the grid and the change tokens so that renderers
//! running in other processes can poll cheaply without touching `PostgreSQL`.
//!
//! # Key Patterns
//!
//! | Pattern | Type | Description |
//! |---------|------|-------------|
//! | `epoch:active` | String | Week-start date of the active epoch |
//! | `grid:{epoch}:view` | JSON | Dominant type of every cell; removed when the epoch is retired |
//! | `grid:token:{name}` | Integer | Current value of a change token |

use fred::prelude::*;
use serde::Serialize;
use serde::de::DeserializeOwned;

use cavern_types::EpochKey;

use crate::error::DbError;

/// Key holding the active epoch.
const ACTIVE_EPOCH_KEY: &str = "epoch:active";

/// Connection handle to a `Dragonfly` (Redis-compatible) instance.
#[derive(Clone)]
pub struct DragonflyPool {
    client: Client,
}

impl DragonflyPool {
    /// Connect to `Dragonfly` at the given URL.
    ///
    /// The URL should follow the Redis URL scheme:
    /// `redis://host:port` or `redis://host:port/db`
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if the URL cannot be parsed.
    /// Returns [`DbError::Dragonfly`] if the connection fails.
    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let config = Config::from_url(url)
            .map_err(|e| DbError::Config(format!("Invalid Dragonfly URL: {e}")))?;

        let client = Builder::from_config(config).build()?;
        client.init().await?;

        tracing::info!("Connected to Dragonfly");
        Ok(Self { client })
    }

    // =========================================================================
    // JSON values
    // =========================================================================

    async fn set_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<(), DbError> {
        let json = serde_json::to_string(value)?;
        let _: () = self.client.set(key, json.as_str(), None, None, false).await?;
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T, DbError> {
        let value: Option<String> = self.client.get(key).await?;
        value.map_or_else(
            || Err(DbError::KeyNotFound(key.to_owned())),
            |s| Ok(serde_json::from_str(&s)?),
        )
    }

    // =========================================================================
    // Active epoch -- epoch:active
    // =========================================================================

    /// Set the active epoch (`epoch:active`).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the write fails.
    pub async fn set_active_epoch(&self, epoch: EpochKey) -> Result<(), DbError> {
        let _: () = self
            .client
            .set(ACTIVE_EPOCH_KEY, epoch.to_string().as_str(), None, None, false)
            .await?;
        Ok(())
    }

    /// Get the active epoch (`epoch:active`).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::KeyNotFound`] if not set.
    /// Returns [`DbError::Config`] if the stored value is not a date.
    /// Returns [`DbError::Dragonfly`] if the read fails.
    pub async fn get_active_epoch(&self) -> Result<EpochKey, DbError> {
        let value: Option<String> = self.client.get(ACTIVE_EPOCH_KEY).await?;
        let raw = value.ok_or_else(|| DbError::KeyNotFound(ACTIVE_EPOCH_KEY.to_owned()))?;
        chrono::NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .map(EpochKey::from_date)
            .map_err(|e| DbError::Config(format!("{ACTIVE_EPOCH_KEY} is not a date: {e}")))
    }

    // =========================================================================
    // Grid view -- grid:{epoch}:view
    // =========================================================================

    /// Store the rendered grid view of `epoch`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if serialization or write fails.
    pub async fn set_grid_view<T: Serialize + Sync>(
        &self,
        epoch: EpochKey,
        view: &T,
    ) -> Result<(), DbError> {
        self.set_json(&grid_view_key(epoch), view).await
    }

    /// Read the rendered grid view of `epoch`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if not found, deserialization, or read fails.
    pub async fn get_grid_view<T: DeserializeOwned>(&self, epoch: EpochKey) -> Result<T, DbError> {
        self.get_json(&grid_view_key(epoch)).await
    }

    /// Remove the grid view of a retired epoch. Returns whether one was
    /// published.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the delete fails.
    pub async fn retire_grid_view(&self, epoch: EpochKey) -> Result<bool, DbError> {
        let removed: u32 = self.client.del(grid_view_key(epoch).as_str()).await?;
        if removed > 0 {
            tracing::debug!(%epoch, "Retired published grid view");
        }
        Ok(removed > 0)
    }

    // =========================================================================
    // Change tokens -- grid:token:{name}
    // =========================================================================

    /// Store one change token.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the write fails.
    pub async fn set_change_token(&self, name: &str, value: u64) -> Result<(), DbError> {
        let _: () = self
            .client
            .set(
                token_key(name).as_str(),
                value.to_string().as_str(),
                None,
                None,
                false,
            )
            .await?;
        Ok(())
    }

    /// Read one change token.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::KeyNotFound`] if not set.
    /// Returns [`DbError::Dragonfly`] if the read fails.
    pub async fn get_change_token(&self, name: &str) -> Result<u64, DbError> {
        let key = token_key(name);
        let value: Option<String> = self.client.get(key.as_str()).await?;
        value.map_or_else(
            || Err(DbError::KeyNotFound(key.clone())),
            |s| {
                s.parse::<u64>()
                    .map_err(|e| DbError::Config(format!("{key} is not a valid u64: {e}")))
            },
        )
    }

    /// Publish the active epoch, its grid view, and every change token.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if any write fails. Keys written before the
    /// failure stay written; the next publication overwrites them.
    pub async fn publish_grid<'t, T, I>(
        &self,
        epoch: EpochKey,
        view: &T,
        tokens: I,
    ) -> Result<(), DbError>
    where
        T: Serialize + Sync,
        I: IntoIterator<Item = (&'t str, u64)>,
    {
        self.set_active_epoch(epoch).await?;
        self.set_grid_view(epoch, view).await?;
        let mut published = 0_usize;
        for (name, value) in tokens {
            self.set_change_token(name, value).await?;
            published = published.saturating_add(1);
        }
        tracing::debug!(%epoch, tokens = published, "Published grid to Dragonfly");
        Ok(())
    }

    /// Flush all keys from the `Dragonfly` instance.
    ///
    /// **WARNING:** This deletes all data. Only use for testing.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the flush fails.
    pub async fn flush_all(&self) -> Result<(), DbError> {
        let _: () = self.client.flushall(false).await?;
        Ok(())
    }
}

fn grid_view_key(epoch: EpochKey) -> String {
    format!("grid:{epoch}:view")
}

fn token_key(name: &str) -> String {
    format!("grid:token:{name}")
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    #[test]
    fn key_patterns() {
        let epoch = NaiveDate::from_ymd_opt(2026, 10, 12).map_or_else(
            || EpochKey::from_date(NaiveDate::MIN),
            EpochKey::from_date,
        );
        assert_eq!(grid_view_key(epoch), "grid:2026-10-12:view");
        assert_eq!(token_key("render"), "grid:token:render");
    }
}
