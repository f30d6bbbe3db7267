//! Enumeration types for the Cavern grid.
//!
//! [`ItemType`] is generated from a single table by [`item_types!`]: the
//! enum, its canonical ordinals, names, aliases, per-type rule flags and the
//! durable column names all come from the same declaration, so aggregation,
//! scoring, and persistence cannot disagree about the type set.

use serde::{Deserialize, Serialize};

/// Error returned when parsing an alias that names no known value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} alias: {alias}")]
pub struct ParseAliasError {
    /// What was being parsed (`item type`, `difficulty`, ...).
    pub kind: &'static str,
    /// The rejected input.
    pub alias: String,
}

// ---------------------------------------------------------------------------
// Item types
// ---------------------------------------------------------------------------

/// Per-type rule flags consumed uniformly by aggregation and scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemTraits {
    /// Canonical snake-case name, also the durable column name.
    pub name: &'static str,
    /// Shortest alias, used as a compact label.
    pub short_alias: &'static str,
    /// All accepted aliases (lowercase).
    pub aliases: &'static [&'static str],
    /// Pooled into the single artifact scoring bucket.
    pub artifact: bool,
    /// Credited claims of this type earn leaderboard points.
    pub scored: bool,
    /// A dominant type of this kind raises a disagreement against new claims.
    pub signals_conflict: bool,
}

/// Generates [`ItemType`] and its lookup table from one declaration.
macro_rules! item_types {
    (
        $(
            $(#[$meta:meta])*
            $variant:ident = $ord:literal {
                name: $name:literal,
                aliases: [$short:literal $(, $alias:literal)*],
                artifact: $artifact:literal,
                scored: $scored:literal,
                signals_conflict: $conflict:literal $(,)?
            }
        )*
    ) => {
        /// An item that can be observed at a grid coordinate.
        ///
        /// Declaration order is the canonical ordinal order. The dominant-type
        /// tie-break depends on it: the lowest ordinal wins a tie.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        #[repr(u8)]
        pub enum ItemType {
            $(
                $(#[$meta])*
                $variant = $ord,
            )*
        }

        impl ItemType {
            /// Number of item types.
            pub const COUNT: usize = [$($ord),*].len();

            /// Every item type in ordinal order.
            pub const ALL: [Self; Self::COUNT] = [$(Self::$variant),*];

            /// Durable column names in ordinal order.
            pub const COLUMNS: [&'static str; Self::COUNT] = [$($name),*];

            /// The rule flags for this type.
            pub const fn traits(self) -> &'static ItemTraits {
                match self {
                    $(
                        Self::$variant => &ItemTraits {
                            name: $name,
                            short_alias: $short,
                            aliases: &[$short $(, $alias)*, $name],
                            artifact: $artifact,
                            scored: $scored,
                            signals_conflict: $conflict,
                        },
                    )*
                }
            }
        }
    };
}

item_types! {
    /// Nothing is known about the cell.
    Unknown = 0 {
        name: "unknown",
        aliases: ["u"],
        artifact: false,
        scored: false,
        signals_conflict: false,
    }
    /// The cell holds no reward.
    Empty = 1 {
        name: "empty",
        aliases: ["e"],
        artifact: false,
        scored: true,
        signals_conflict: true,
    }
    /// Lose the next turn.
    DemonHands = 2 {
        name: "demon_hands",
        aliases: ["dh", "demon's hand", "demon hands"],
        artifact: false,
        scored: true,
        signals_conflict: true,
    }
    /// Lose all remaining turns.
    DemonHead = 3 {
        name: "demon_head",
        aliases: ["d", "demon"],
        artifact: false,
        scored: true,
        signals_conflict: true,
    }
    /// Next direction is random.
    DemonTail = 4 {
        name: "demon_tail",
        aliases: ["dt", "demon's tail", "demon tail"],
        artifact: false,
        scored: true,
        signals_conflict: true,
    }
    /// Run back to the previous room.
    Spider = 5 {
        name: "spider",
        aliases: ["s"],
        artifact: false,
        scored: true,
        signals_conflict: true,
    }
    /// Thirty minutes of farming.
    IdleReward = 6 {
        name: "idle_reward",
        aliases: ["i", "idle reward", "idle rewards"],
        artifact: false,
        scored: true,
        signals_conflict: true,
    }
    /// Summoning stone.
    SummonStone = 7 {
        name: "summon_stone",
        aliases: ["ss", "summoning stone", "summon stone"],
        artifact: false,
        scored: true,
        signals_conflict: true,
    }
    /// Artifact: amulet of fear.
    AmuletOfFear = 8 {
        name: "amulet_of_fear",
        aliases: ["af", "amulet of fear"],
        artifact: true,
        scored: true,
        signals_conflict: true,
    }
    /// Artifact: demon skull.
    DemonSkull = 9 {
        name: "demon_skull",
        aliases: ["ds", "demon skull"],
        artifact: true,
        scored: true,
        signals_conflict: true,
    }
    /// Artifact: golden compass.
    GoldenCompass = 10 {
        name: "golden_compass",
        aliases: ["gc", "golden compass"],
        artifact: true,
        scored: true,
        signals_conflict: true,
    }
    /// Artifact: lucky bones.
    LuckyBones = 11 {
        name: "lucky_bones",
        aliases: ["lb", "lucky bones"],
        artifact: true,
        scored: true,
        signals_conflict: true,
    }
    /// Artifact: scepter of domination.
    ScepterOfDomination = 12 {
        name: "scepter_of_domination",
        aliases: ["sd", "scepter of domination"],
        artifact: true,
        scored: true,
        signals_conflict: true,
    }
    /// Artifact: spiral of time.
    SpiralOfTime = 13 {
        name: "spiral_of_time",
        aliases: ["st", "spiral of time"],
        artifact: true,
        scored: true,
        signals_conflict: true,
    }
    /// Artifact: token of memories.
    TokenOfMemories = 14 {
        name: "token_of_memories",
        aliases: ["tm", "token of memories"],
        artifact: true,
        scored: true,
        signals_conflict: true,
    }
}

impl ItemType {
    /// Canonical ordinal (position in [`ItemType::ALL`]).
    pub const fn ordinal(self) -> u8 {
        self as u8
    }

    /// Index into a counter vector.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Look up a type by ordinal.
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(usize::from(ordinal)).copied()
    }

    /// Canonical name.
    pub const fn name(self) -> &'static str {
        self.traits().name
    }

    /// Whether the type is pooled into the artifact bucket.
    pub const fn is_artifact(self) -> bool {
        self.traits().artifact
    }

    /// Whether credited claims of this type earn points.
    pub const fn is_scored(self) -> bool {
        self.traits().scored
    }

    /// Every artifact type in ordinal order.
    pub fn artifacts() -> impl Iterator<Item = Self> {
        Self::ALL.into_iter().filter(|t| t.is_artifact())
    }
}

impl core::fmt::Display for ItemType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

impl core::str::FromStr for ItemType {
    type Err = ParseAliasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.traits().aliases.contains(&wanted.as_str()))
            .ok_or_else(|| ParseAliasError {
                kind: "item type",
                alias: s.to_owned(),
            })
    }
}

// ---------------------------------------------------------------------------
// Scoring buckets
// ---------------------------------------------------------------------------

/// A leaderboard column: one item type, or the pooled artifact bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreBucket {
    /// A single non-artifact scored type.
    Item(ItemType),
    /// All artifact types pooled together.
    Artifact,
}

impl ScoreBucket {
    /// The bucket a claim of `item` is credited to, if the type is scored.
    pub const fn for_item(item: ItemType) -> Option<Self> {
        if !item.is_scored() {
            None
        } else if item.is_artifact() {
            Some(Self::Artifact)
        } else {
            Some(Self::Item(item))
        }
    }

    /// Every bucket in column order: scored non-artifact types, then artifacts.
    pub fn all() -> Vec<Self> {
        let mut buckets: Vec<Self> = ItemType::ALL
            .into_iter()
            .filter(|t| t.is_scored() && !t.is_artifact())
            .map(Self::Item)
            .collect();
        buckets.push(Self::Artifact);
        buckets
    }
}

impl core::fmt::Display for ScoreBucket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Item(item) => f.write_str(item.traits().short_alias),
            Self::Artifact => f.write_str("art"),
        }
    }
}

// ---------------------------------------------------------------------------
// Difficulty
// ---------------------------------------------------------------------------

/// Map difficulty. The numeric value doubles as the scoring weight.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    /// Not configured.
    Unknown,
    /// Weight 20.
    #[default]
    Easy,
    /// Weight 25.
    Normal,
    /// Weight 30.
    Hard,
}

impl Difficulty {
    /// Every difficulty.
    pub const ALL: [Self; 4] = [Self::Unknown, Self::Easy, Self::Normal, Self::Hard];

    /// Scoring weight.
    pub const fn weight(self) -> u64 {
        match self {
            Self::Unknown => 0,
            Self::Easy => 20,
            Self::Normal => 25,
            Self::Hard => 30,
        }
    }

    /// Durable representation.
    pub const fn value(self) -> i16 {
        match self {
            Self::Unknown => 0,
            Self::Easy => 20,
            Self::Normal => 25,
            Self::Hard => 30,
        }
    }

    /// Parse the durable representation.
    pub fn from_value(value: i16) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.value() == value)
    }
}

impl core::str::FromStr for Difficulty {
    type Err = ParseAliasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "easy" | "e" | "1" | "20" => Ok(Self::Easy),
            "normal" | "n" | "2" | "25" => Ok(Self::Normal),
            "hard" | "h" | "3" | "30" => Ok(Self::Hard),
            "unknown" => Ok(Self::Unknown),
            _ => Err(ParseAliasError {
                kind: "difficulty",
                alias: s.to_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// Participant role, ordered from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    /// May not post observations.
    Banned,
    /// Default role.
    Nobody,
    /// May manage other participants' claims.
    Admin,
    /// Bootstrap administrator.
    SuperAdmin,
}

impl UserRole {
    /// Every role in ascending privilege.
    pub const ALL: [Self; 4] = [Self::Banned, Self::Nobody, Self::Admin, Self::SuperAdmin];

    /// Durable representation.
    pub const fn value(self) -> i16 {
        match self {
            Self::Banned => 0,
            Self::Nobody => 1,
            Self::Admin => 2,
            Self::SuperAdmin => 3,
        }
    }

    /// Parse the durable representation.
    pub fn from_value(value: i16) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.value() == value)
    }

    /// One step up, saturating at the top role.
    pub const fn promoted(self) -> Self {
        match self {
            Self::Banned => Self::Nobody,
            Self::Nobody => Self::Admin,
            Self::Admin | Self::SuperAdmin => Self::SuperAdmin,
        }
    }

    /// One step down, saturating at the bottom role.
    pub const fn demoted(self) -> Self {
        match self {
            Self::Banned | Self::Nobody => Self::Banned,
            Self::Admin => Self::Nobody,
            Self::SuperAdmin => Self::Admin,
        }
    }
}
