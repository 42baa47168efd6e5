use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plaza_domain::{
    ActorId, Amount, BattleRecord, GameKindId, HouseId, MemberRecord, PlayerId,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

use crate::{
    BattleRecordRepository, CreditLimitRule, CreditRuleRepository, LedgerEntry, LedgerKind,
    LedgerStoreError, MemberRepository, Wallet, WalletStore, WalletTx,
};

/// Postgres-backed implementation of every store port. Schema lives in
/// `migrations/0001_plaza_gate.sql`.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(err: sqlx::Error) -> LedgerStoreError {
    LedgerStoreError::Database(err.to_string())
}

fn row_to_wallet(row: &PgRow) -> Result<Wallet, LedgerStoreError> {
    Ok(Wallet {
        house: HouseId(row.try_get("house_id").map_err(db_err)?),
        member: PlayerId(row.try_get("member_id").map_err(db_err)?),
        balance: Amount(row.try_get("balance").map_err(db_err)?),
        forbidden: row.try_get("forbidden").map_err(db_err)?,
        limit_min: Amount(row.try_get("limit_min").map_err(db_err)?),
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn row_to_ledger_entry(row: &PgRow) -> Result<LedgerEntry, LedgerStoreError> {
    let kind: String = row.try_get("kind").map_err(db_err)?;
    Ok(LedgerEntry {
        entry_id: row.try_get("entry_id").map_err(db_err)?,
        house: HouseId(row.try_get("house_id").map_err(db_err)?),
        member: PlayerId(row.try_get("member_id").map_err(db_err)?),
        kind: kind
            .parse::<LedgerKind>()
            .map_err(|e| LedgerStoreError::InvalidRecord(e.to_string()))?,
        change: Amount(row.try_get("change_amount").map_err(db_err)?),
        balance_before: Amount(row.try_get("balance_before").map_err(db_err)?),
        balance_after: Amount(row.try_get("balance_after").map_err(db_err)?),
        operator: ActorId(row.try_get("operator_id").map_err(db_err)?),
        biz_no: row.try_get("biz_no").map_err(db_err)?,
        reason: row.try_get("reason").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn row_to_credit_rule(row: &PgRow) -> Result<CreditLimitRule, LedgerStoreError> {
    Ok(CreditLimitRule {
        house: HouseId(row.try_get("house_id").map_err(db_err)?),
        group_name: row.try_get("group_name").map_err(db_err)?,
        kind: GameKindId(row.try_get("game_kind").map_err(db_err)?),
        base_score: row.try_get("base_score").map_err(db_err)?,
        threshold: Amount(row.try_get("threshold").map_err(db_err)?),
    })
}

fn row_to_battle_record(row: &PgRow) -> Result<BattleRecord, LedgerStoreError> {
    Ok(BattleRecord {
        house: HouseId(row.try_get("house_id").map_err(db_err)?),
        group_name: row.try_get("group_name").map_err(db_err)?,
        room_id: row.try_get("room_id").map_err(db_err)?,
        kind: GameKindId(row.try_get("game_kind").map_err(db_err)?),
        base_score: row.try_get("base_score").map_err(db_err)?,
        player: PlayerId(row.try_get("player_id").map_err(db_err)?),
        score: row.try_get("score").map_err(db_err)?,
        battle_at: row.try_get("battle_at").map_err(db_err)?,
        win: row.try_get("win").map_err(db_err)?,
    })
}

const LEDGER_COLUMNS: &str = "entry_id, house_id, member_id, kind, change_amount, balance_before, \
     balance_after, operator_id, biz_no, reason, created_at";

#[async_trait]
impl WalletStore for PostgresLedgerStore {
    async fn get_wallet(
        &self,
        house: HouseId,
        member: PlayerId,
    ) -> Result<Option<Wallet>, LedgerStoreError> {
        let row = sqlx::query(
            "SELECT * FROM plaza_wallets WHERE house_id = $1 AND member_id = $2 LIMIT 1",
        )
        .bind(house.0)
        .bind(member.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_wallet).transpose()
    }

    async fn find_ledger_entry(
        &self,
        house: HouseId,
        member: PlayerId,
        biz_no: &str,
    ) -> Result<Option<LedgerEntry>, LedgerStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {LEDGER_COLUMNS} FROM plaza_wallet_ledger \
             WHERE house_id = $1 AND member_id = $2 AND biz_no = $3 LIMIT 1"
        ))
        .bind(house.0)
        .bind(member.0)
        .bind(biz_no)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_ledger_entry).transpose()
    }

    async fn list_ledger_entries(
        &self,
        house: HouseId,
        member: PlayerId,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, LedgerStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LEDGER_COLUMNS} FROM plaza_wallet_ledger \
             WHERE house_id = $1 AND member_id = $2 \
             ORDER BY created_at DESC, entry_id DESC LIMIT $3"
        ))
        .bind(house.0)
        .bind(member.0)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_ledger_entry).collect()
    }

    async fn begin(&self) -> Result<Box<dyn WalletTx>, LedgerStoreError> {
        let tx = self.pool.begin().await.map_err(db_err)?;
        Ok(Box::new(PostgresWalletTx { tx: Some(tx) }))
    }
}

struct PostgresWalletTx {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PostgresWalletTx {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, LedgerStoreError> {
        self.tx.as_mut().ok_or(LedgerStoreError::TransactionClosed)
    }
}

#[async_trait]
impl WalletTx for PostgresWalletTx {
    async fn lock_wallet(
        &mut self,
        house: HouseId,
        member: PlayerId,
    ) -> Result<Option<Wallet>, LedgerStoreError> {
        let tx = self.tx()?;
        // `FOR UPDATE` locks nothing while the row is absent, so first-time
        // writers for one member serialize on an advisory key instead.
        sqlx::query(
            "SELECT pg_advisory_xact_lock(hashtextextended(format('plaza_wallet:%s:%s', $1::BIGINT, $2::BIGINT), 0))",
        )
        .bind(house.0)
        .bind(member.0)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        let row = sqlx::query(
            "SELECT * FROM plaza_wallets WHERE house_id = $1 AND member_id = $2 FOR UPDATE",
        )
        .bind(house.0)
        .bind(member.0)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_wallet).transpose()
    }

    async fn find_ledger_entry(
        &mut self,
        house: HouseId,
        member: PlayerId,
        biz_no: &str,
    ) -> Result<Option<LedgerEntry>, LedgerStoreError> {
        let tx = self.tx()?;
        let row = sqlx::query(&format!(
            "SELECT {LEDGER_COLUMNS} FROM plaza_wallet_ledger \
             WHERE house_id = $1 AND member_id = $2 AND biz_no = $3 LIMIT 1"
        ))
        .bind(house.0)
        .bind(member.0)
        .bind(biz_no)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_ledger_entry).transpose()
    }

    async fn upsert_wallet(&mut self, wallet: &Wallet) -> Result<(), LedgerStoreError> {
        let tx = self.tx()?;
        sqlx::query(
            r#"
            INSERT INTO plaza_wallets (house_id, member_id, balance, forbidden, limit_min, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (house_id, member_id) DO UPDATE SET
                balance = EXCLUDED.balance,
                forbidden = EXCLUDED.forbidden,
                limit_min = EXCLUDED.limit_min,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(wallet.house.0)
        .bind(wallet.member.0)
        .bind(wallet.balance.0)
        .bind(wallet.forbidden)
        .bind(wallet.limit_min.0)
        .bind(wallet.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn append_ledger_entry(&mut self, entry: &LedgerEntry) -> Result<(), LedgerStoreError> {
        let tx = self.tx()?;
        sqlx::query(
            r#"
            INSERT INTO plaza_wallet_ledger (
                entry_id, house_id, member_id, kind, change_amount, balance_before,
                balance_after, operator_id, biz_no, reason, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(entry.entry_id)
        .bind(entry.house.0)
        .bind(entry.member.0)
        .bind(entry.kind.as_str())
        .bind(entry.change.0)
        .bind(entry.balance_before.0)
        .bind(entry.balance_after.0)
        .bind(entry.operator.0)
        .bind(&entry.biz_no)
        .bind(&entry.reason)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                LedgerStoreError::DuplicateLedgerEntry {
                    biz_no: entry.biz_no.clone(),
                }
            }
            _ => db_err(err),
        })?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), LedgerStoreError> {
        let tx = self.tx.take().ok_or(LedgerStoreError::TransactionClosed)?;
        tx.commit().await.map_err(db_err)?;
        debug!("wallet transaction committed");
        Ok(())
    }
}

#[async_trait]
impl CreditRuleRepository for PostgresLedgerStore {
    async fn find_rule(
        &self,
        house: HouseId,
        group_name: &str,
        kind: GameKindId,
        base_score: i64,
    ) -> Result<Option<CreditLimitRule>, LedgerStoreError> {
        let row = sqlx::query(
            r#"
            SELECT house_id, group_name, game_kind, base_score, threshold
            FROM plaza_credit_limit_rules
            WHERE house_id = $1 AND group_name = $2 AND game_kind = $3 AND base_score = $4
            LIMIT 1
            "#,
        )
        .bind(house.0)
        .bind(group_name)
        .bind(kind.0)
        .bind(base_score)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_credit_rule).transpose()
    }

    async fn upsert_rule(&self, rule: &CreditLimitRule) -> Result<(), LedgerStoreError> {
        sqlx::query(
            r#"
            INSERT INTO plaza_credit_limit_rules (house_id, group_name, game_kind, base_score, threshold)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (house_id, group_name, game_kind, base_score) DO UPDATE SET
                threshold = EXCLUDED.threshold
            "#,
        )
        .bind(rule.house.0)
        .bind(&rule.group_name)
        .bind(rule.kind.0)
        .bind(rule.base_score)
        .bind(rule.threshold.0)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete_rule(
        &self,
        house: HouseId,
        group_name: &str,
        kind: GameKindId,
        base_score: i64,
    ) -> Result<bool, LedgerStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM plaza_credit_limit_rules
            WHERE house_id = $1 AND group_name = $2 AND game_kind = $3 AND base_score = $4
            "#,
        )
        .bind(house.0)
        .bind(group_name)
        .bind(kind.0)
        .bind(base_score)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_rules(&self, house: HouseId) -> Result<Vec<CreditLimitRule>, LedgerStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT house_id, group_name, game_kind, base_score, threshold
            FROM plaza_credit_limit_rules
            WHERE house_id = $1
            ORDER BY group_name, game_kind, base_score
            "#,
        )
        .bind(house.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_credit_rule).collect()
    }
}

#[async_trait]
impl MemberRepository for PostgresLedgerStore {
    async fn get_member(
        &self,
        house: HouseId,
        player: PlayerId,
    ) -> Result<Option<MemberRecord>, LedgerStoreError> {
        let row = sqlx::query(
            r#"
            SELECT house_id, player_id, group_name, credit_adjustment, forbidden
            FROM plaza_members
            WHERE house_id = $1 AND player_id = $2
            LIMIT 1
            "#,
        )
        .bind(house.0)
        .bind(player.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(MemberRecord {
            house: HouseId(row.try_get("house_id").map_err(db_err)?),
            player: PlayerId(row.try_get("player_id").map_err(db_err)?),
            group_name: row.try_get("group_name").map_err(db_err)?,
            credit_adjustment: Amount(row.try_get("credit_adjustment").map_err(db_err)?),
            forbidden: row.try_get("forbidden").map_err(db_err)?,
        }))
    }

    async fn upsert_member(&self, member: &MemberRecord) -> Result<(), LedgerStoreError> {
        sqlx::query(
            r#"
            INSERT INTO plaza_members (house_id, player_id, group_name, credit_adjustment, forbidden)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (house_id, player_id) DO UPDATE SET
                group_name = EXCLUDED.group_name,
                credit_adjustment = EXCLUDED.credit_adjustment,
                forbidden = EXCLUDED.forbidden
            "#,
        )
        .bind(member.house.0)
        .bind(member.player.0)
        .bind(&member.group_name)
        .bind(member.credit_adjustment.0)
        .bind(member.forbidden)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl BattleRecordRepository for PostgresLedgerStore {
    async fn record_exists(
        &self,
        house: HouseId,
        player: PlayerId,
        battle_at: DateTime<Utc>,
    ) -> Result<bool, LedgerStoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM plaza_battle_records
                WHERE battle_at = $1 AND player_id = $2 AND house_id = $3
            ) AS present
            "#,
        )
        .bind(battle_at)
        .bind(player.0)
        .bind(house.0)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row.try_get("present").map_err(db_err)
    }

    async fn insert_record(&self, record: &BattleRecord) -> Result<bool, LedgerStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO plaza_battle_records (
                house_id, group_name, room_id, game_kind, base_score, player_id, score, battle_at, win
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (battle_at, player_id, house_id) DO NOTHING
            "#,
        )
        .bind(record.house.0)
        .bind(&record.group_name)
        .bind(&record.room_id)
        .bind(record.kind.0)
        .bind(record.base_score)
        .bind(record.player.0)
        .bind(record.score)
        .bind(record.battle_at)
        .bind(record.win)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_records(
        &self,
        house: HouseId,
        since: DateTime<Utc>,
    ) -> Result<Vec<BattleRecord>, LedgerStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT house_id, group_name, room_id, game_kind, base_score, player_id, score, battle_at, win
            FROM plaza_battle_records
            WHERE house_id = $1 AND battle_at >= $2
            ORDER BY battle_at ASC, room_id ASC
            "#,
        )
        .bind(house.0)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_battle_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;

    async fn deposit_in_tx(
        store: Arc<PostgresLedgerStore>,
        house: HouseId,
        member: PlayerId,
        amount: i64,
        biz_no: &str,
    ) -> LedgerEntry {
        let mut tx = store.begin().await.expect("begin");
        let mut wallet = tx
            .lock_wallet(house, member)
            .await
            .expect("lock")
            .unwrap_or_else(|| Wallet::empty(house, member));
        // Widen the window between the read and the write.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let before = wallet.balance;
        wallet.balance = Amount(before.0 + amount);
        wallet.updated_at = Utc::now();
        tx.upsert_wallet(&wallet).await.expect("upsert");
        let entry = LedgerEntry {
            entry_id: Uuid::now_v7(),
            house,
            member,
            kind: LedgerKind::Deposit,
            change: Amount(amount),
            balance_before: before,
            balance_after: wallet.balance,
            operator: ActorId(1),
            biz_no: biz_no.to_string(),
            reason: None,
            created_at: Utc::now(),
        };
        tx.append_ledger_entry(&entry).await.expect("append");
        tx.commit().await.expect("commit");
        entry
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL pointing at a migrated postgres"]
    async fn concurrent_first_deposits_serialize_on_missing_wallet_row() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
        let pool = PgPool::connect(&url).await.expect("connect");
        let store = Arc::new(PostgresLedgerStore::new(pool));
        let house = HouseId(Utc::now().timestamp_micros());
        let member = PlayerId(7);

        let (first, second) = tokio::join!(
            deposit_in_tx(store.clone(), house, member, 100, "first"),
            deposit_in_tx(store.clone(), house, member, 50, "second"),
        );

        let wallet = store
            .get_wallet(house, member)
            .await
            .expect("get")
            .expect("wallet row");
        assert_eq!(wallet.balance, Amount(150));
        let mut befores = vec![first.balance_before, second.balance_before];
        befores.sort();
        assert_eq!(befores[0], Amount::ZERO);
        assert_ne!(befores[1], Amount::ZERO);
    }
}
