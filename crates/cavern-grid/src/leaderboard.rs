//! First-claim leaderboard scoring.
//!
//! A claim is *aligned* when its type matches the coordinate's dominant type.
//! Per coordinate only the earliest aligned claim is credited; ties on time
//! go to the lower user id. Each credited claim is worth
//! `floor(weight^2 / denominator)` points, where the denominator is the
//! bucket's high-water mark (see [`MaxCounts::denominator`]).

use std::collections::BTreeMap;

use cavern_types::{Coord, Difficulty, Observation, ScoreBucket, UserId};

use crate::high_water::MaxCounts;
use crate::working::WorkingSet;

/// One participant's ranked result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderboardRow {
    /// The participant.
    pub user: UserId,
    /// Total points.
    pub score: u64,
    /// Credited claims per bucket.
    pub claims: BTreeMap<ScoreBucket, u32>,
}

/// A ranked leaderboard for one difficulty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaderboard {
    /// The difficulty whose weight was applied.
    pub difficulty: Difficulty,
    /// Points awarded per credited claim in each bucket (the header row).
    pub rewards: BTreeMap<ScoreBucket, u64>,
    /// Ranked rows, best first.
    pub rows: Vec<LeaderboardRow>,
}

/// The caller's claims whose type matches the dominant type of their cell.
pub fn aligned_claims(working: &WorkingSet, user: UserId) -> Vec<Observation> {
    working
        .observations()
        .list_by_user(user)
        .into_iter()
        .filter(|row| working.grid().dominant_type(row.coord) == row.item)
        .collect()
}

/// The credited claim of every coordinate that has one.
///
/// Only scored types participate. Ordered by coordinate.
pub fn first_claims(working: &WorkingSet) -> Vec<Observation> {
    let mut winners: BTreeMap<Coord, Observation> = BTreeMap::new();
    for row in working.observations().iter() {
        if !row.item.is_scored() || working.grid().dominant_type(row.coord) != row.item {
            continue;
        }
        winners
            .entry(row.coord)
            .and_modify(|best| {
                if (row.claimed_at, row.user) < (best.claimed_at, best.user) {
                    *best = *row;
                }
            })
            .or_insert(*row);
    }
    winners.into_values().collect()
}

/// Points for one credited claim in `bucket`.
pub fn reward(difficulty: Difficulty, bucket: ScoreBucket, marks: &MaxCounts) -> u64 {
    let weight = difficulty.weight();
    weight
        .saturating_mul(weight)
        .checked_div(marks.denominator(difficulty, bucket))
        .unwrap_or(0)
}

/// Rank every participant holding a credited claim.
///
/// Rows are sorted by score descending, then user id ascending, and cut to
/// `limit` when given.
pub fn rank(
    working: &WorkingSet,
    difficulty: Difficulty,
    marks: &MaxCounts,
    limit: Option<usize>,
) -> Leaderboard {
    let rewards: BTreeMap<ScoreBucket, u64> = ScoreBucket::all()
        .into_iter()
        .map(|bucket| (bucket, reward(difficulty, bucket, marks)))
        .collect();

    let mut by_user: BTreeMap<UserId, LeaderboardRow> = BTreeMap::new();
    for claim in first_claims(working) {
        let Some(bucket) = ScoreBucket::for_item(claim.item) else {
            continue;
        };
        let row = by_user.entry(claim.user).or_insert_with(|| LeaderboardRow {
            user: claim.user,
            score: 0,
            claims: BTreeMap::new(),
        });
        row.score = row
            .score
            .saturating_add(rewards.get(&bucket).copied().unwrap_or(0));
        let count = row.claims.entry(bucket).or_insert(0);
        *count = count.saturating_add(1);
    }

    let mut rows: Vec<LeaderboardRow> = by_user.into_values().collect();
    rows.sort_by(|a, b| b.score.cmp(&a.score).then(a.user.cmp(&b.user)));
    if let Some(limit) = limit {
        rows.truncate(limit);
    }

    Leaderboard {
        difficulty,
        rewards,
        rows,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use cavern_types::{ItemType, MaxCountRecord};
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::aggregate::{ChangeTokens, GridBounds};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    fn working() -> WorkingSet {
        WorkingSet::new(GridBounds::DEFAULT, ChangeTokens::default())
    }

    fn marks(difficulty: Difficulty, item: ItemType, max_count: u32) -> MaxCounts {
        MaxCounts::from_records([MaxCountRecord {
            difficulty,
            item,
            max_count,
        }])
    }

    #[test]
    fn reward_divides_squared_weight_by_mark() {
        let marks = marks(Difficulty::Normal, ItemType::Spider, 5);
        assert_eq!(
            reward(Difficulty::Normal, ScoreBucket::Item(ItemType::Spider), &marks),
            125
        );
        // Missing marks divide by one.
        assert_eq!(
            reward(Difficulty::Hard, ScoreBucket::Item(ItemType::Spider), &marks),
            900
        );
    }

    #[test]
    fn credited_score_for_aligned_claim() {
        let mut ws = working();
        ws.report(UserId(1), Coord::new(3, 3), ItemType::Spider, at(0))
            .unwrap();
        let board = rank(
            &ws,
            Difficulty::Normal,
            &marks(Difficulty::Normal, ItemType::Spider, 5),
            None,
        );
        assert_eq!(board.rows.len(), 1);
        assert_eq!(board.rows[0].score, 125);
        assert_eq!(
            board.rows[0].claims.get(&ScoreBucket::Item(ItemType::Spider)),
            Some(&1)
        );
        assert_eq!(board.rewards.len(), 8);
    }

    #[test]
    fn only_earliest_claim_is_credited() {
        let mut ws = working();
        let coord = Coord::new(6, 6);
        ws.report(UserId(2), coord, ItemType::Empty, at(10)).unwrap();
        ws.report(UserId(1), coord, ItemType::Empty, at(20)).unwrap();
        let before = ws.grid().counters(coord);

        let credited = first_claims(&ws);
        assert_eq!(credited.len(), 1);
        assert_eq!(credited[0].user, UserId(2));

        let board = rank(&ws, Difficulty::Easy, &MaxCounts::new(), None);
        assert_eq!(board.rows.len(), 1);
        assert_eq!(board.rows[0].user, UserId(2));
        assert_eq!(ws.grid().counters(coord), before);
    }

    #[test]
    fn simultaneous_claims_go_to_lower_user_id() {
        let mut ws = working();
        let coord = Coord::new(1, 5);
        ws.report(UserId(9), coord, ItemType::Spider, at(0)).unwrap();
        ws.report(UserId(4), coord, ItemType::Spider, at(0)).unwrap();
        assert_eq!(first_claims(&ws)[0].user, UserId(4));
    }

    #[test]
    fn misaligned_and_unscored_claims_earn_nothing() {
        let mut ws = working();
        let coord = Coord::new(2, 2);
        ws.report(UserId(1), coord, ItemType::Spider, at(0)).unwrap();
        ws.report(UserId(2), coord, ItemType::Spider, at(1)).unwrap();
        ws.report(UserId(3), coord, ItemType::DemonHead, at(2)).unwrap();
        ws.report(UserId(4), Coord::new(9, 9), ItemType::Unknown, at(3))
            .unwrap();

        assert!(aligned_claims(&ws, UserId(3)).is_empty());
        assert_eq!(aligned_claims(&ws, UserId(2)).len(), 1);
        assert_eq!(aligned_claims(&ws, UserId(4)).len(), 1);

        let board = rank(&ws, Difficulty::Easy, &MaxCounts::new(), None);
        let users: Vec<UserId> = board.rows.iter().map(|r| r.user).collect();
        assert_eq!(users, vec![UserId(1)]);
    }

    #[test]
    fn artifacts_pool_into_one_bucket() {
        let mut ws = working();
        ws.report(UserId(1), Coord::new(1, 1), ItemType::LuckyBones, at(0))
            .unwrap();
        ws.report(UserId(1), Coord::new(2, 1), ItemType::SpiralOfTime, at(1))
            .unwrap();
        let marks = MaxCounts::from_records([
            MaxCountRecord {
                difficulty: Difficulty::Easy,
                item: ItemType::LuckyBones,
                max_count: 1,
            },
            MaxCountRecord {
                difficulty: Difficulty::Easy,
                item: ItemType::SpiralOfTime,
                max_count: 1,
            },
        ]);
        let board = rank(&ws, Difficulty::Easy, &marks, None);
        assert_eq!(board.rows[0].claims.get(&ScoreBucket::Artifact), Some(&2));
        assert_eq!(board.rows[0].score, 400);
    }

    #[test]
    fn ranking_sorts_and_truncates() {
        let mut ws = working();
        ws.report(UserId(3), Coord::new(1, 1), ItemType::Spider, at(0)).unwrap();
        ws.report(UserId(3), Coord::new(2, 1), ItemType::Spider, at(0)).unwrap();
        ws.report(UserId(2), Coord::new(3, 1), ItemType::Spider, at(0)).unwrap();
        ws.report(UserId(1), Coord::new(4, 1), ItemType::Spider, at(0)).unwrap();

        let board = rank(&ws, Difficulty::Easy, &MaxCounts::new(), Some(2));
        let users: Vec<UserId> = board.rows.iter().map(|r| r.user).collect();
        assert_eq!(users, vec![UserId(3), UserId(1)]);
        assert_eq!(board.rows[0].score, 800);
    }
}
