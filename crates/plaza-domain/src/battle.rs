use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{GameKindId, HouseId, PlayerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerScore {
    pub player: PlayerId,
    pub score: i64,
}

/// One finished room as returned by the platform's battle read API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleRoom {
    pub room_id: String,
    pub house: HouseId,
    pub kind: GameKindId,
    pub base_score: i64,
    pub finished_at: DateTime<Utc>,
    pub players: Vec<PlayerScore>,
}

impl BattleRoom {
    /// Every room is zero-sum: what one player wins another loses.
    #[must_use]
    pub fn is_zero_sum(&self) -> bool {
        self.players
            .iter()
            .try_fold(0_i64, |acc, p| acc.checked_add(p.score))
            == Some(0)
    }

    #[must_use]
    pub fn max_score(&self) -> Option<i64> {
        self.players.iter().map(|p| p.score).max()
    }
}

/// Persisted per-player row of a finished room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleRecord {
    pub house: HouseId,
    pub group_name: String,
    pub room_id: String,
    pub kind: GameKindId,
    pub base_score: i64,
    pub player: PlayerId,
    pub score: i64,
    pub battle_at: DateTime<Utc>,
    pub win: bool,
}
