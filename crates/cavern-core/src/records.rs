//! Working copy of the cross-epoch records.
//!
//! Roles, the last-scan marker, participant configuration, named presets and
//! high-water marks outlive every epoch. The engine mutates this copy and
//! mirrors each change to the durable tier straight away.

use std::collections::BTreeMap;

use cavern_db::DurableRecords;
use cavern_grid::MaxCounts;
use cavern_types::{
    Difficulty, ItemType, MaxCountRecord, NamedPreset, RoleGrant, UserConfig, UserId, UserRole,
};
use chrono::{DateTime, Utc};

/// In-memory cross-epoch state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrossEpochRecords {
    roles: BTreeMap<UserId, UserRole>,
    last_scan: Option<DateTime<Utc>>,
    user_configs: BTreeMap<UserId, UserConfig>,
    presets: BTreeMap<(UserId, String), NamedPreset>,
    max_counts: MaxCounts,
}

impl CrossEpochRecords {
    /// An empty record set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the working copy from durable rows.
    pub fn from_durable(records: DurableRecords) -> Self {
        Self {
            roles: records
                .roles
                .into_iter()
                .map(|grant| (grant.user, grant.role))
                .collect(),
            last_scan: records.last_scan,
            user_configs: records
                .user_configs
                .into_iter()
                .map(|config| (config.user, config))
                .collect(),
            presets: records
                .presets
                .into_iter()
                .map(|preset| ((preset.owner, preset.name.clone()), preset))
                .collect(),
            max_counts: MaxCounts::from_records(records.max_counts),
        }
    }

    /// Every record in durable form, for a full resync.
    pub fn to_durable(&self) -> DurableRecords {
        DurableRecords {
            roles: self.roles(),
            last_scan: self.last_scan,
            user_configs: self.user_configs.values().cloned().collect(),
            presets: self.presets.values().cloned().collect(),
            max_counts: self.max_counts.records(),
        }
    }

    // =========================================================================
    // Roles
    // =========================================================================

    /// A participant's role; [`UserRole::Nobody`] when none was granted.
    pub fn role_of(&self, user: UserId) -> UserRole {
        self.roles.get(&user).copied().unwrap_or(UserRole::Nobody)
    }

    /// Every explicit grant, ordered by user.
    pub fn roles(&self) -> Vec<RoleGrant> {
        self.roles
            .iter()
            .map(|(&user, &role)| RoleGrant { user, role })
            .collect()
    }

    /// Set a participant's role, returning the previous explicit grant.
    pub fn grant_role(&mut self, grant: RoleGrant) -> Option<UserRole> {
        self.roles.insert(grant.user, grant.role)
    }

    /// Drop a participant's explicit grant.
    pub fn revoke_role(&mut self, user: UserId) -> Option<UserRole> {
        self.roles.remove(&user)
    }

    // =========================================================================
    // Last scan
    // =========================================================================

    /// Time of the newest report ingested from history.
    pub const fn last_scan(&self) -> Option<DateTime<Utc>> {
        self.last_scan
    }

    /// Overwrite the last-scan marker.
    pub const fn set_last_scan(&mut self, at: DateTime<Utc>) {
        self.last_scan = Some(at);
    }

    // =========================================================================
    // User configuration
    // =========================================================================

    /// The stored configuration, if any.
    pub fn stored_user_config(&self, user: UserId) -> Option<&UserConfig> {
        self.user_configs.get(&user)
    }

    /// The stored configuration, or the default one at `default_difficulty`.
    pub fn user_config(&self, user: UserId, default_difficulty: Difficulty) -> UserConfig {
        self.user_configs.get(&user).cloned().unwrap_or_else(|| {
            let mut config = UserConfig::default_for(user);
            config.difficulty = default_difficulty;
            config
        })
    }

    /// Store a configuration, replacing any previous one.
    pub fn set_user_config(&mut self, config: UserConfig) {
        self.user_configs.insert(config.user, config);
    }

    /// Remove a participant's configuration. Returns whether one existed.
    pub fn reset_user_config(&mut self, user: UserId) -> bool {
        self.user_configs.remove(&user).is_some()
    }

    // =========================================================================
    // Named presets
    // =========================================================================

    /// Look up one preset.
    pub fn preset(&self, owner: UserId, name: &str) -> Option<&NamedPreset> {
        self.presets.get(&(owner, name.to_owned()))
    }

    /// Store a preset, replacing one with the same owner and name.
    pub fn save_preset(&mut self, preset: NamedPreset) {
        self.presets.insert((preset.owner, preset.name.clone()), preset);
    }

    /// Remove a preset.
    pub fn delete_preset(&mut self, owner: UserId, name: &str) -> Option<NamedPreset> {
        self.presets.remove(&(owner, name.to_owned()))
    }

    /// Presets whose name contains `partial` (case-insensitive), optionally
    /// restricted to one owner. Ordered by owner, then name.
    pub fn search_presets(&self, owner: Option<UserId>, partial: &str) -> Vec<NamedPreset> {
        let needle = partial.to_lowercase();
        self.presets
            .values()
            .filter(|preset| owner.is_none_or(|o| o == preset.owner))
            .filter(|preset| preset.name.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    // =========================================================================
    // High-water marks
    // =========================================================================

    /// The high-water marks.
    pub const fn max_counts(&self) -> &MaxCounts {
        &self.max_counts
    }

    /// Largest count seen for `item` at `difficulty`.
    pub fn max_known_count(&self, difficulty: Difficulty, item: ItemType) -> u32 {
        self.max_counts.get(difficulty, item)
    }

    /// Raise a mark if `count` exceeds it. Returns the new record when raised.
    pub fn observe_count(
        &mut self,
        difficulty: Difficulty,
        item: ItemType,
        count: u32,
    ) -> Option<MaxCountRecord> {
        self.max_counts.observe(difficulty, item, count)
    }
}
