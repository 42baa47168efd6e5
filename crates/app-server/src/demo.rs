use std::time::Duration;

use admission_control::AdmissionControlHandler;
use battle_sync::InMemoryBattleFeed;
use chrono::Utc;
use ledger_store::{
    BattleRecordRepository, CreditLimitRule, CreditRuleRepository, MemberRepository,
};
use plaza_domain::{
    ActorId, Amount, BattleRecord, BattleRoom, GameKindId, HouseId, MappedTableNum, MemberRecord, PlayerId,
    PlayerScore, SeatEvent, TableInfo,
};
use plaza_session::{InMemoryPlaza, PlazaCommand, PlazaCredentials, PlazaEvent, SessionRegistry};
use settlement::{calculate_fee, calculate_fee_distribution_for_records, FeeRule};
use tracing::info;
use wallet::BalanceChange;

use crate::wiring::{Engines, Stores};

const HOUSE: HouseId = HouseId(8001);
const OWNER: ActorId = ActorId(1);
const TABLE: MappedTableNum = MappedTableNum(12);
const FUNDED: PlayerId = PlayerId(5001);
const SHORT: PlayerId = PlayerId(5002);

/// Walks one session through login, a deferred seat decision, battle sync
/// and fee distribution against the in-memory platform.
pub async fn run(
    registry: &SessionRegistry,
    plaza: &InMemoryPlaza,
    stores: &Stores,
    engines: &Engines,
    feed: &InMemoryBattleFeed,
) -> anyhow::Result<()> {
    seed(stores, engines).await?;

    // A game that finished shortly before the session came up; the first
    // pull's wider window picks it up.
    let room = BattleRoom {
        room_id: "demo-room-1".to_string(),
        house: HOUSE,
        kind: GameKindId(3),
        base_score: 10,
        finished_at: Utc::now() - chrono::Duration::minutes(2),
        players: vec![
            PlayerScore {
                player: FUNDED,
                score: 120,
            },
            PlayerScore {
                player: SHORT,
                score: -120,
            },
        ],
    };
    feed.push_room(room.clone())?;

    registry
        .start_session(
            OWNER,
            HOUSE,
            PlazaCredentials {
                account: "house-owner".to_string(),
                password: "demo".to_string(),
                platform_key: "demo-key".to_string(),
            },
            Box::new(AdmissionControlHandler::new(
                engines.admission_deps(stores),
            )),
        )
        .await?;
    registry
        .wait_online(OWNER, HOUSE, Duration::from_secs(5))
        .await?;

    // The seat arrives before any room list; the handler asks for one.
    plaza.set_tables(
        HOUSE,
        vec![TableInfo {
            mapped_num: TABLE,
            kind: GameKindId(3),
            base_score: 10,
            group_id: 0,
        }],
    )?;
    plaza
        .push(
            HOUSE,
            PlazaEvent::Seat(SeatEvent {
                player: SHORT,
                mapped_num: TABLE,
                kind_hint: GameKindId(3),
            }),
        )
        .await?;
    let dismissed = wait_for(|| {
        plaza.commands(HOUSE).map(|commands| {
            commands
                .iter()
                .any(|c| matches!(c, PlazaCommand::DismissTable { mapped_num, .. } if *mapped_num == TABLE))
        })
    })
    .await?;
    info!(house = %HOUSE, table = %TABLE, dismissed, "deferred seat resolved");

    let records = wait_for_records(stores, &room).await?;
    info!(house = %HOUSE, rows = records.len(), "battle rows persisted");

    let rules = [
        FeeRule {
            game_kind: GameKindId::ANY,
            base_score: 0,
            min_score: 500,
            fee: Amount(50),
        },
        FeeRule {
            game_kind: GameKindId(3),
            base_score: 10,
            min_score: 100,
            fee: Amount(20),
        },
    ];
    let fee = calculate_fee(&rules, &room);
    for share_fee in [false, true] {
        let distribution = calculate_fee_distribution_for_records(&records, fee, share_fee)?;
        for group in &distribution.groups {
            info!(
                share_fee,
                group = %group.group,
                is_winner = group.is_winner,
                total_fee = %group.total_fee,
                transfer = %group.transfer,
                "fee settlement"
            );
        }
    }

    let metrics = registry.metrics()?;
    info!(
        total = metrics.total,
        online = metrics.online,
        "session registry snapshot"
    );
    Ok(())
}

async fn seed(stores: &Stores, engines: &Engines) -> anyhow::Result<()> {
    for (player, group, balance) in [(FUNDED, "north", 1_000), (SHORT, "south", 30)] {
        stores
            .members
            .upsert_member(&MemberRecord {
                house: HOUSE,
                player,
                group_name: group.to_string(),
                credit_adjustment: Amount::ZERO,
                forbidden: false,
            })
            .await?;
        engines
            .wallets
            .deposit(BalanceChange {
                house: HOUSE,
                member: player,
                amount: Amount(balance),
                operator: OWNER,
                biz_no: format!("demo-seed-{player}"),
                reason: Some("demo seed".to_string()),
            })
            .await?;
    }
    stores
        .credit_rules
        .upsert_rule(&CreditLimitRule {
            house: HOUSE,
            group_name: String::new(),
            kind: GameKindId::ANY,
            base_score: 0,
            threshold: Amount(100),
        })
        .await?;
    Ok(())
}

async fn wait_for_records(stores: &Stores, room: &BattleRoom) -> anyhow::Result<Vec<BattleRecord>> {
    let since = room.finished_at - chrono::Duration::seconds(1);
    let mut records = Vec::new();
    for _ in 0..100 {
        records = stores
            .battles
            .list_records(HOUSE, since)
            .await?
            .into_iter()
            .filter(|r| r.room_id == room.room_id)
            .collect();
        if records.len() == room.players.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(records)
}

async fn wait_for<E>(mut check: impl FnMut() -> Result<bool, E>) -> anyhow::Result<bool>
where
    E: Into<anyhow::Error>,
{
    for _ in 0..100 {
        if check().map_err(Into::into)? {
            return Ok(true);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(false)
}
