use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use credit_policy::CreditResolver;
use ledger_store::MemberRepository;
use plaza_domain::{Amount, HouseId, MappedTableNum, PlayerId, SeatEvent, StandEvent, TableInfo};
use plaza_session::{PlazaEventHandler, SessionContext};
use serde::Serialize;
use tracing::{debug, info, warn};
use wallet::WalletService;

/// Why a table gets dismissed after a seat event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DismissReason {
    PlayerNotFound,
    InsufficientCredit { balance: Amount, required: Amount },
    /// Member or wallet could not be read; treated like an unknown player.
    LookupFailed,
}

impl DismissReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlayerNotFound => "player not found",
            Self::InsufficientCredit { .. } => "insufficient credit",
            Self::LookupFailed => "lookup failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdmissionDecision {
    Admit,
    Dismiss(DismissReason),
}

/// Collaborators shared by every session's handler.
#[derive(Clone)]
pub struct AdmissionDeps {
    pub members: Arc<dyn MemberRepository>,
    pub wallets: WalletService,
    pub credit: CreditResolver,
}

impl AdmissionDeps {
    /// Credit predicate for one player at one table whose metadata is known.
    pub async fn decide(&self, house: HouseId, player: PlayerId, table: &TableInfo) -> AdmissionDecision {
        let member = match self.members.get_member(house, player).await {
            Ok(Some(member)) => member,
            Ok(None) => return AdmissionDecision::Dismiss(DismissReason::PlayerNotFound),
            Err(err) => {
                warn!(house = %house, player = %player, error = %err, "member lookup failed");
                return AdmissionDecision::Dismiss(DismissReason::LookupFailed);
            }
        };
        let balance = match self.wallets.wallet(house, player).await {
            Ok(wallet) => wallet.balance,
            Err(err) => {
                warn!(house = %house, player = %player, error = %err, "wallet lookup failed");
                return AdmissionDecision::Dismiss(DismissReason::LookupFailed);
            }
        };
        let threshold = self
            .credit
            .resolve(house, &member.group_name, table.kind, table.base_score)
            .await;
        let required = Amount(threshold.0.saturating_add(member.credit_adjustment.0));

        if balance < required {
            AdmissionDecision::Dismiss(DismissReason::InsufficientCredit { balance, required })
        } else {
            AdmissionDecision::Admit
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub admitted: u64,
    pub dismissed: u64,
    pub deferred: u64,
}

/// Per-session reaction to seat events: dismisses tables whose seated player
/// cannot cover the credit threshold. Seat events that arrive before the
/// table's metadata are parked until the next room list explains the table.
pub struct AdmissionControlHandler {
    deps: AdmissionDeps,
    tables: HashMap<MappedTableNum, TableInfo>,
    pending: HashMap<MappedTableNum, PlayerId>,
    stats: AdmissionStats,
}

impl AdmissionControlHandler {
    #[must_use]
    pub fn new(deps: AdmissionDeps) -> Self {
        Self {
            deps,
            tables: HashMap::new(),
            pending: HashMap::new(),
            stats: AdmissionStats::default(),
        }
    }

    #[must_use]
    pub fn cached_tables(&self) -> BTreeMap<MappedTableNum, TableInfo> {
        self.tables
            .iter()
            .map(|(num, table)| (*num, table.clone()))
            .collect()
    }

    #[must_use]
    pub fn pending_seats(&self) -> BTreeMap<MappedTableNum, PlayerId> {
        self.pending.iter().map(|(num, p)| (*num, *p)).collect()
    }

    #[must_use]
    pub fn stats(&self) -> AdmissionStats {
        self.stats
    }

    async fn enforce(&mut self, ctx: &SessionContext, player: PlayerId, table: &TableInfo) {
        let house = ctx.key.house;
        match self.deps.decide(house, player, table).await {
            AdmissionDecision::Admit => {
                self.stats.admitted += 1;
                debug!(
                    house = %house,
                    player = %player,
                    table = %table.mapped_num,
                    "seat admitted"
                );
            }
            AdmissionDecision::Dismiss(reason) => {
                self.stats.dismissed += 1;
                match reason {
                    DismissReason::InsufficientCredit { balance, required } => info!(
                        house = %house,
                        player = %player,
                        table = %table.mapped_num,
                        kind = %table.kind,
                        base_score = table.base_score,
                        balance = %balance,
                        required = %required,
                        reason = reason.as_str(),
                        "dismissing table"
                    ),
                    _ => info!(
                        house = %house,
                        player = %player,
                        table = %table.mapped_num,
                        reason = reason.as_str(),
                        "dismissing table"
                    ),
                }
                if let Err(err) = ctx
                    .connection
                    .dismiss_table(table.kind, table.mapped_num)
                    .await
                {
                    warn!(
                        house = %house,
                        table = %table.mapped_num,
                        error = %err,
                        "dismiss command failed"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl PlazaEventHandler for AdmissionControlHandler {
    async fn on_room_list_updated(&mut self, ctx: &SessionContext, tables: &[TableInfo]) {
        self.tables = tables
            .iter()
            .map(|table| (table.mapped_num, table.clone()))
            .collect();
        let tables_now = &self.tables;
        self.pending.retain(|num, player| {
            let keep = tables_now.contains_key(num);
            if !keep {
                debug!(table = %num, player = %player, "pending seat dropped with its table");
            }
            keep
        });

        let mut ready: Vec<(PlayerId, TableInfo)> = Vec::new();
        for (num, table) in &self.tables {
            if !table.is_complete() {
                continue;
            }
            if let Some(player) = self.pending.remove(num) {
                ready.push((player, table.clone()));
            }
        }
        ready.sort_by_key(|(_, table)| table.mapped_num);
        for (player, table) in ready {
            debug!(table = %table.mapped_num, player = %player, "resolving deferred seat");
            self.enforce(ctx, player, &table).await;
        }
    }

    async fn on_seat(&mut self, ctx: &SessionContext, seat: SeatEvent) {
        let complete = self
            .tables
            .get(&seat.mapped_num)
            .filter(|table| table.is_complete())
            .cloned();
        match complete {
            Some(table) => self.enforce(ctx, seat.player, &table).await,
            None => {
                self.stats.deferred += 1;
                if let Some(previous) = self.pending.insert(seat.mapped_num, seat.player) {
                    debug!(
                        table = %seat.mapped_num,
                        superseded = %previous,
                        "pending seat superseded"
                    );
                }
                debug!(
                    house = %ctx.key.house,
                    player = %seat.player,
                    table = %seat.mapped_num,
                    kind_hint = %seat.kind_hint,
                    "table metadata unknown; seat deferred"
                );
                if let Err(err) = ctx.connection.list_tables().await {
                    warn!(house = %ctx.key.house, error = %err, "room list request failed");
                }
            }
        }
    }

    async fn on_stand(&mut self, _ctx: &SessionContext, stand: StandEvent) {
        if self.pending.get(&stand.mapped_num) == Some(&stand.player) {
            self.pending.remove(&stand.mapped_num);
            debug!(table = %stand.mapped_num, player = %stand.player, "pending seat cleared by stand");
        }
    }

    async fn on_table_dismissed(&mut self, _ctx: &SessionContext, table: MappedTableNum) {
        self.tables.remove(&table);
        self.pending.remove(&table);
    }
}
