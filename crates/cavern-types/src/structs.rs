//! Core record types shared by the grid engine and the persistence layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::{Difficulty, ItemType, UserRole};
use crate::ids::{Coord, UserId};

// ---------------------------------------------------------------------------
// Observations and counters
// ---------------------------------------------------------------------------

/// One participant's claim of an item type at a coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    /// The reporting participant.
    pub user: UserId,
    /// Where the item was seen.
    pub coord: Coord,
    /// What was seen.
    pub item: ItemType,
    /// When the current type was claimed. Overwritten when the type changes.
    pub claimed_at: DateTime<Utc>,
}

/// Per-coordinate counters, one per item type, indexed by ordinal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellCounters([u32; ItemType::COUNT]);

impl CellCounters {
    /// Build counters from a raw vector in ordinal order.
    pub const fn from_array(values: [u32; ItemType::COUNT]) -> Self {
        Self(values)
    }

    /// The raw vector in ordinal order.
    pub const fn as_array(&self) -> &[u32; ItemType::COUNT] {
        &self.0
    }

    /// Counter for one type.
    pub fn get(&self, item: ItemType) -> u32 {
        self.0.get(item.index()).copied().unwrap_or(0)
    }

    /// Overwrite the counter for one type.
    pub fn set(&mut self, item: ItemType, value: u32) {
        if let Some(slot) = self.0.get_mut(item.index()) {
            *slot = value;
        }
    }

    /// Sum of all counters.
    pub fn total(&self) -> u64 {
        self.0.iter().map(|&c| u64::from(c)).sum()
    }

    /// Whether every counter is zero.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&c| c == 0)
    }

    /// The type with the highest counter.
    ///
    /// Ties go to the lowest ordinal. With all counters at zero this is
    /// [`ItemType::Unknown`].
    pub fn dominant(&self) -> ItemType {
        let mut best = ItemType::Unknown;
        let mut best_count = self.get(best);
        for item in ItemType::ALL {
            let count = self.get(item);
            if count > best_count {
                best = item;
                best_count = count;
            }
        }
        best
    }
}

/// Raised alongside an accepted report whose type differs from the
/// coordinate's established dominant type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disagreement {
    /// Where the disagreement happened.
    pub coord: Coord,
    /// The established dominant type.
    pub dominant: ItemType,
    /// Claims backing the dominant type.
    pub dominant_count: u32,
    /// The type just claimed.
    pub claimed: ItemType,
    /// Prior claims of the claimed type, excluding the new one.
    pub claimed_count: u32,
}

/// A historical report replayed into an epoch (bulk backfill).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalReport {
    /// The reporting participant.
    pub user: UserId,
    /// Where the item was seen.
    pub coord: Coord,
    /// What was seen.
    pub item: ItemType,
    /// When the report was first made.
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Cross-epoch records
// ---------------------------------------------------------------------------

/// A participant's role grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleGrant {
    /// The participant.
    pub user: UserId,
    /// The granted role.
    pub role: UserRole,
}

/// Per-participant configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    /// The participant.
    pub user: UserId,
    /// Difficulty the participant plays on.
    pub difficulty: Difficulty,
    /// Opaque cosmetic settings owned by the renderer.
    pub settings: serde_json::Value,
}

impl UserConfig {
    /// The configuration a participant starts with.
    pub fn default_for(user: UserId) -> Self {
        Self {
            user,
            difficulty: Difficulty::default(),
            settings: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

/// Maximum length of a preset name.
pub const MAX_PRESET_NAME_LEN: usize = 255;

/// A named cosmetic preset, unique per owner and name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedPreset {
    /// The participant who saved it.
    pub owner: UserId,
    /// Preset name.
    pub name: String,
    /// Cosmetic settings captured from the owner's configuration.
    pub settings: serde_json::Value,
}

/// A per-(difficulty, type) high-water mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxCountRecord {
    /// The difficulty.
    pub difficulty: Difficulty,
    /// The item type.
    pub item: ItemType,
    /// Largest count ever observed.
    pub max_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dominant_prefers_lowest_ordinal_on_tie() {
        let mut counters = CellCounters::default();
        counters.set(ItemType::Unknown, 2);
        counters.set(ItemType::Spider, 2);
        assert_eq!(counters.dominant(), ItemType::Unknown);

        counters.set(ItemType::Empty, 2);
        counters.set(ItemType::Unknown, 0);
        assert_eq!(counters.dominant(), ItemType::Empty);
    }

    #[test]
    fn dominant_of_empty_counters_is_unknown() {
        let counters = CellCounters::default();
        assert!(counters.is_empty());
        assert_eq!(counters.dominant(), ItemType::Unknown);
        assert_eq!(counters.total(), 0);
    }

    #[test]
    fn dominant_follows_highest_count() {
        let mut counters = CellCounters::default();
        counters.set(ItemType::DemonHead, 1);
        counters.set(ItemType::IdleReward, 3);
        assert_eq!(counters.dominant(), ItemType::IdleReward);
        assert_eq!(counters.total(), 4);
    }

    #[test]
    fn default_user_config_is_easy_with_empty_settings() {
        let config = UserConfig::default_for(UserId(7));
        assert_eq!(config.difficulty, Difficulty::Easy);
        assert_eq!(config.settings, serde_json::json!({}));
    }
}
