use std::collections::BTreeMap;

use plaza_domain::{Amount, BattleRecord, BattleRoom, GameKindId, MoneyError, PlayerId, PlayerScore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Group assigned to players without an affiliation.
pub const UNAFFILIATED_GROUP: &str = "0";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettlementError {
    #[error("money error: {0}")]
    Money(#[from] MoneyError),
    #[error("total fee must not be negative, got {0}")]
    NegativeFee(Amount),
}

/// Fee charged for a finished room once its top score reaches `min_score`.
/// `game_kind == ANY` and `base_score == 0` act as wildcards; a rule with both
/// wildcarded is global.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRule {
    pub game_kind: GameKindId,
    pub base_score: i64,
    pub min_score: i64,
    pub fee: Amount,
}

impl FeeRule {
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.game_kind == GameKindId::ANY && self.base_score == 0
    }

    fn matches_table(&self, kind: GameKindId, base_score: i64) -> bool {
        (self.game_kind == GameKindId::ANY || self.game_kind == kind)
            && (self.base_score == 0 || self.base_score == base_score)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSettlement {
    pub group: String,
    pub is_winner: bool,
    pub total_fee: Amount,
    /// Positive when the group is owed, negative when it owes. Always zero
    /// unless fees are shared.
    pub transfer: Amount,
    pub player_fees: BTreeMap<PlayerId, Amount>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeDistribution {
    pub winners: Vec<PlayerId>,
    /// Ordered by group name.
    pub groups: Vec<GroupSettlement>,
}

impl FeeDistribution {
    #[must_use]
    pub fn group(&self, name: &str) -> Option<&GroupSettlement> {
        self.groups.iter().find(|g| g.group == name)
    }
}

/// Players holding the top score, ties included, in input order.
#[must_use]
pub fn find_winners(players: &[PlayerScore]) -> Vec<PlayerId> {
    let mut best: Option<i64> = None;
    let mut winners = Vec::new();
    for p in players {
        match best {
            Some(max) if p.score < max => {}
            Some(max) if p.score == max => winners.push(p.player),
            _ => {
                best = Some(p.score);
                winners.clear();
                winners.push(p.player);
            }
        }
    }
    winners
}

/// Picks the fee for a finished room. Global rules are tried first, in
/// declaration order; only when none applies are kind/base rules considered.
#[must_use]
pub fn calculate_fee(rules: &[FeeRule], battle: &BattleRoom) -> Amount {
    let Some(max_score) = battle.max_score() else {
        return Amount::ZERO;
    };
    let reaches = |rule: &&FeeRule| max_score >= rule.min_score;

    if let Some(rule) = rules.iter().filter(|r| r.is_global()).find(reaches) {
        return rule.fee;
    }
    rules
        .iter()
        .filter(|r| !r.is_global() && r.matches_table(battle.kind, battle.base_score))
        .find(reaches)
        .map_or(Amount::ZERO, |rule| rule.fee)
}

/// Splits `total_fee` across the groups present in one finished room.
///
/// Without sharing, winners split the fee evenly and each winner's group
/// spreads its accumulated amount over its own players. With sharing, every
/// group carries `total / groups` and the difference to what winners would
/// have owed is expressed as a transfer from losing to winning groups.
/// Integer division truncates and remainders are dropped.
pub fn calculate_fee_distribution<F>(
    players: &[PlayerScore],
    total_fee: Amount,
    share_fee: bool,
    resolve_group: F,
) -> Result<FeeDistribution, SettlementError>
where
    F: Fn(PlayerId) -> Option<String>,
{
    if total_fee < Amount::ZERO {
        return Err(SettlementError::NegativeFee(total_fee));
    }
    let winners = find_winners(players);

    let mut members: BTreeMap<String, Vec<PlayerId>> = BTreeMap::new();
    for p in players {
        let group = resolve_group(p.player)
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty())
            .unwrap_or_else(|| UNAFFILIATED_GROUP.to_string());
        members.entry(group).or_default().push(p.player);
    }

    let total = total_fee.as_i64();
    let (Some(per_winner), Some(equal_share)) = (
        divide(total, winners.len()),
        divide(total, members.len()),
    ) else {
        return Ok(FeeDistribution {
            winners,
            groups: Vec::new(),
        });
    };

    let mut groups = Vec::with_capacity(members.len());
    for (group, ids) in members {
        let winner_count = ids.iter().filter(|id| winners.contains(id)).count();
        let is_winner = winner_count > 0;
        let owed_as_winner = per_winner
            .checked_mul(winner_count as i64)
            .ok_or(MoneyError::Overflow)?;

        let (total_fee, transfer) = if share_fee {
            let transfer = if is_winner {
                owed_as_winner
                    .checked_sub(equal_share)
                    .ok_or(MoneyError::Underflow)?
            } else {
                -equal_share
            };
            (equal_share, transfer)
        } else {
            (owed_as_winner, 0)
        };

        let per_player = divide(total_fee, ids.len()).unwrap_or(0);
        let player_fees = ids
            .iter()
            .map(|id| (*id, Amount(per_player)))
            .collect();
        groups.push(GroupSettlement {
            group,
            is_winner,
            total_fee: Amount(total_fee),
            transfer: Amount(transfer),
            player_fees,
        });
    }

    debug!(
        total_fee = total,
        share_fee,
        winners = winners.len(),
        groups = groups.len(),
        "fee distribution calculated"
    );
    Ok(FeeDistribution { winners, groups })
}

/// Distribution over persisted rows of one room, using the group recorded
/// with each row.
pub fn calculate_fee_distribution_for_records(
    records: &[BattleRecord],
    total_fee: Amount,
    share_fee: bool,
) -> Result<FeeDistribution, SettlementError> {
    let players: Vec<PlayerScore> = records
        .iter()
        .map(|r| PlayerScore {
            player: r.player,
            score: r.score,
        })
        .collect();
    calculate_fee_distribution(&players, total_fee, share_fee, |player| {
        records
            .iter()
            .find(|r| r.player == player)
            .map(|r| r.group_name.clone())
    })
}

fn divide(total: i64, count: usize) -> Option<i64> {
    i64::try_from(count).ok().and_then(|c| total.checked_div(c))
}
