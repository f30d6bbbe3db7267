//! Per-(difficulty, type) high-water marks.
//!
//! A mark records the largest number of cells ever seen holding a type at a
//! difficulty. Marks only grow. They are the scoring denominators: rare types
//! are worth more per claim.

use std::collections::BTreeMap;

use cavern_types::{Difficulty, ItemType, MaxCountRecord, ScoreBucket};

/// The working copy of every high-water mark.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaxCounts {
    marks: BTreeMap<(Difficulty, ItemType), u32>,
}

impl MaxCounts {
    /// No marks recorded.
    pub const fn new() -> Self {
        Self {
            marks: BTreeMap::new(),
        }
    }

    /// Load marks from persisted records. Later duplicates win.
    pub fn from_records(records: impl IntoIterator<Item = MaxCountRecord>) -> Self {
        Self {
            marks: records
                .into_iter()
                .map(|r| ((r.difficulty, r.item), r.max_count))
                .collect(),
        }
    }

    /// The mark for one type, zero when absent.
    pub fn get(&self, difficulty: Difficulty, item: ItemType) -> u32 {
        self.marks.get(&(difficulty, item)).copied().unwrap_or(0)
    }

    /// Raise the mark if `count` exceeds it.
    ///
    /// Returns the updated record when the mark moved, so the caller can
    /// mirror it.
    pub fn observe(
        &mut self,
        difficulty: Difficulty,
        item: ItemType,
        count: u32,
    ) -> Option<MaxCountRecord> {
        let mark = self.marks.entry((difficulty, item)).or_insert(0);
        if count <= *mark {
            return None;
        }
        *mark = count;
        Some(MaxCountRecord {
            difficulty,
            item,
            max_count: count,
        })
    }

    /// Scoring denominator for a bucket: the type's mark, or the sum of every
    /// artifact's mark for the artifact bucket. Never below one.
    pub fn denominator(&self, difficulty: Difficulty, bucket: ScoreBucket) -> u64 {
        let raw = match bucket {
            ScoreBucket::Item(item) => u64::from(self.get(difficulty, item)),
            ScoreBucket::Artifact => ItemType::artifacts()
                .map(|item| u64::from(self.get(difficulty, item)))
                .fold(0_u64, u64::saturating_add),
        };
        raw.max(1)
    }

    /// Every mark as a record, in key order.
    pub fn records(&self) -> Vec<MaxCountRecord> {
        self.marks
            .iter()
            .map(|(&(difficulty, item), &max_count)| MaxCountRecord {
                difficulty,
                item,
                max_count,
            })
            .collect()
    }
}
