use serde::{Deserialize, Serialize};

use crate::ids::{GameKindId, MappedTableNum, PlayerId};

/// Metadata for one live table as reported in a room-list push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub mapped_num: MappedTableNum,
    pub kind: GameKindId,
    pub base_score: i64,
    pub group_id: i64,
}

impl TableInfo {
    /// Seat decisions need both the game kind and the base score.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.kind.0 > 0 && self.base_score > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatEvent {
    pub player: PlayerId,
    pub mapped_num: MappedTableNum,
    pub kind_hint: GameKindId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandEvent {
    pub player: PlayerId,
    pub mapped_num: MappedTableNum,
}
