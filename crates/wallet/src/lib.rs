use std::sync::Arc;

use chrono::Utc;
use ledger_store::{LedgerEntry, LedgerKind, LedgerStoreError, Wallet, WalletStore};
use plaza_domain::{ActorId, Amount, HouseId, MoneyError, PlayerId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("amount must be positive, got {0}")]
    InvalidAmount(Amount),
    #[error("biz_no must not be empty")]
    MissingBizNo,
    #[error("wallet not found for member {member} in house {house}")]
    WalletNotFound { house: HouseId, member: PlayerId },
    #[error("wallet is forbidden")]
    Forbidden,
    #[error("withdrawal of {amount} would take balance {balance} below limit {limit_min}")]
    BelowLimit {
        balance: Amount,
        amount: Amount,
        limit_min: Amount,
    },
    #[error("limit update must change forbid flag or limit")]
    EmptyLimitUpdate,
    #[error("money error: {0}")]
    Money(#[from] MoneyError),
    #[error("ledger store error: {0}")]
    Store(#[from] LedgerStoreError),
}

impl WalletError {
    /// Validation failures are reported to the operator; everything else is
    /// an infrastructure fault.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidAmount(_)
                | Self::MissingBizNo
                | Self::WalletNotFound { .. }
                | Self::Forbidden
                | Self::BelowLimit { .. }
                | Self::EmptyLimitUpdate
                | Self::Money(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceChange {
    pub house: HouseId,
    pub member: PlayerId,
    pub amount: Amount,
    pub operator: ActorId,
    /// Idempotency key; one ledger entry per (house, member, biz_no).
    pub biz_no: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitUpdate {
    pub house: HouseId,
    pub member: PlayerId,
    pub forbidden: Option<bool>,
    pub limit_min: Option<Amount>,
    pub operator: ActorId,
    pub biz_no: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletOutcome {
    pub wallet: Wallet,
    pub entry: LedgerEntry,
    /// True when the biz_no had already been applied and nothing changed.
    pub replayed: bool,
}

struct LedgerDraft {
    kind: LedgerKind,
    change: Amount,
}

#[derive(Clone)]
pub struct WalletService {
    store: Arc<dyn WalletStore>,
}

impl WalletService {
    #[must_use]
    pub fn new(store: Arc<dyn WalletStore>) -> Self {
        Self { store }
    }

    pub async fn wallet(&self, house: HouseId, member: PlayerId) -> Result<Wallet, WalletError> {
        Ok(self
            .store
            .get_wallet(house, member)
            .await?
            .unwrap_or_else(|| Wallet::empty(house, member)))
    }

    pub async fn ledger(
        &self,
        house: HouseId,
        member: PlayerId,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, WalletError> {
        Ok(self
            .store
            .list_ledger_entries(house, member, limit)
            .await?)
    }

    pub async fn deposit(&self, change: BalanceChange) -> Result<WalletOutcome, WalletError> {
        let amount = change.amount;
        self.apply(
            change.house,
            change.member,
            change.operator,
            &change.biz_no,
            change.reason.clone(),
            true,
            move |mut wallet| {
                if !amount.is_positive() {
                    return Err(WalletError::InvalidAmount(amount));
                }
                wallet.balance = wallet.balance.checked_add(amount)?;
                Ok((
                    wallet,
                    LedgerDraft {
                        kind: LedgerKind::Deposit,
                        change: amount,
                    },
                ))
            },
        )
        .await
    }

    pub async fn withdraw(&self, change: BalanceChange) -> Result<WalletOutcome, WalletError> {
        self.withdraw_inner(change, false).await
    }

    /// Skips the forbid and limit checks; recorded as `force_withdraw`.
    pub async fn force_withdraw(&self, change: BalanceChange) -> Result<WalletOutcome, WalletError> {
        self.withdraw_inner(change, true).await
    }

    async fn withdraw_inner(
        &self,
        change: BalanceChange,
        force: bool,
    ) -> Result<WalletOutcome, WalletError> {
        let amount = change.amount;
        self.apply(
            change.house,
            change.member,
            change.operator,
            &change.biz_no,
            change.reason.clone(),
            false,
            move |mut wallet| {
                if !amount.is_positive() {
                    return Err(WalletError::InvalidAmount(amount));
                }
                let next = wallet.balance.checked_sub(amount)?;
                if !force {
                    if wallet.forbidden {
                        return Err(WalletError::Forbidden);
                    }
                    if next < wallet.limit_min {
                        return Err(WalletError::BelowLimit {
                            balance: wallet.balance,
                            amount,
                            limit_min: wallet.limit_min,
                        });
                    }
                }
                wallet.balance = next;
                let change = Amount(0).checked_sub(amount)?;
                Ok((
                    wallet,
                    LedgerDraft {
                        kind: if force {
                            LedgerKind::ForceWithdraw
                        } else {
                            LedgerKind::Withdraw
                        },
                        change,
                    },
                ))
            },
        )
        .await
    }

    /// Changes the forbid flag and/or limit floor and records a zero-amount
    /// `adjust` entry.
    pub async fn update_limit(&self, update: LimitUpdate) -> Result<WalletOutcome, WalletError> {
        if update.forbidden.is_none() && update.limit_min.is_none() {
            return Err(WalletError::EmptyLimitUpdate);
        }
        let (forbidden, limit_min) = (update.forbidden, update.limit_min);
        self.apply(
            update.house,
            update.member,
            update.operator,
            &update.biz_no,
            update.reason.clone(),
            true,
            move |mut wallet| {
                if let Some(forbidden) = forbidden {
                    wallet.forbidden = forbidden;
                }
                if let Some(limit_min) = limit_min {
                    wallet.limit_min = limit_min;
                }
                Ok((
                    wallet,
                    LedgerDraft {
                        kind: LedgerKind::Adjust,
                        change: Amount::ZERO,
                    },
                ))
            },
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply<F>(
        &self,
        house: HouseId,
        member: PlayerId,
        operator: ActorId,
        biz_no: &str,
        reason: Option<String>,
        create_if_missing: bool,
        mutate: F,
    ) -> Result<WalletOutcome, WalletError>
    where
        F: FnOnce(Wallet) -> Result<(Wallet, LedgerDraft), WalletError> + Send,
    {
        let biz_no = biz_no.trim();
        if biz_no.is_empty() {
            return Err(WalletError::MissingBizNo);
        }
        if let Some(entry) = self.store.find_ledger_entry(house, member, biz_no).await? {
            return self.replay(entry).await;
        }

        let mut tx = self.store.begin().await?;
        let current = match tx.lock_wallet(house, member).await? {
            Some(wallet) => wallet,
            None if create_if_missing => Wallet::empty(house, member),
            None => return Err(WalletError::WalletNotFound { house, member }),
        };
        // A concurrent attempt with the same key may have committed while we
        // waited for the row lock.
        if let Some(entry) = tx.find_ledger_entry(house, member, biz_no).await? {
            drop(tx);
            return self.replay(entry).await;
        }

        let balance_before = current.balance;
        let (mut next, draft) = mutate(current)?;
        let now = Utc::now();
        next.updated_at = now;
        let entry = LedgerEntry {
            entry_id: Uuid::now_v7(),
            house,
            member,
            kind: draft.kind,
            change: draft.change,
            balance_before,
            balance_after: next.balance,
            operator,
            biz_no: biz_no.to_string(),
            reason,
            created_at: now,
        };

        let written = async {
            tx.upsert_wallet(&next).await?;
            tx.append_ledger_entry(&entry).await?;
            tx.commit().await
        }
        .await;
        match written {
            Ok(()) => {}
            Err(LedgerStoreError::DuplicateLedgerEntry { .. }) => {
                drop(tx);
                let Some(prior) = self.store.find_ledger_entry(house, member, biz_no).await?
                else {
                    return Err(WalletError::Store(LedgerStoreError::DuplicateLedgerEntry {
                        biz_no: biz_no.to_string(),
                    }));
                };
                return self.replay(prior).await;
            }
            Err(err) => return Err(err.into()),
        }

        info!(
            house = %house,
            member = %member,
            kind = entry.kind.as_str(),
            change = %entry.change,
            balance_before = %entry.balance_before,
            balance_after = %entry.balance_after,
            operator = %operator,
            biz_no,
            "wallet ledger entry applied"
        );
        Ok(WalletOutcome {
            wallet: next,
            entry,
            replayed: false,
        })
    }

    async fn replay(&self, entry: LedgerEntry) -> Result<WalletOutcome, WalletError> {
        let wallet = self.wallet(entry.house, entry.member).await?;
        debug!(
            house = %entry.house,
            member = %entry.member,
            biz_no = %entry.biz_no,
            "wallet operation replayed"
        );
        Ok(WalletOutcome {
            wallet,
            entry,
            replayed: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_store::InMemoryWalletStore;

    const HOUSE: HouseId = HouseId(1);
    const MEMBER: PlayerId = PlayerId(1001);

    fn service() -> (WalletService, InMemoryWalletStore) {
        let store = InMemoryWalletStore::new();
        (WalletService::new(Arc::new(store.clone())), store)
    }

    fn change(amount: i64, biz_no: &str) -> BalanceChange {
        BalanceChange {
            house: HOUSE,
            member: MEMBER,
            amount: Amount(amount),
            operator: ActorId(7),
            biz_no: biz_no.to_string(),
            reason: Some("test".to_string()),
        }
    }

    fn limit(limit_min: Option<i64>, forbidden: Option<bool>, biz_no: &str) -> LimitUpdate {
        LimitUpdate {
            house: HOUSE,
            member: MEMBER,
            forbidden,
            limit_min: limit_min.map(Amount),
            operator: ActorId(7),
            biz_no: biz_no.to_string(),
            reason: None,
        }
    }

    #[tokio::test]
    async fn deposit_creates_wallet_and_ledger_entry() {
        let (svc, store) = service();
        let out = svc.deposit(change(100, "d1")).await.expect("deposit");
        assert!(!out.replayed);
        assert_eq!(out.wallet.balance, Amount(100));
        assert_eq!(out.entry.kind, LedgerKind::Deposit);
        assert_eq!(out.entry.balance_before, Amount::ZERO);
        assert_eq!(out.entry.balance_after, Amount(100));
        assert_eq!(store.ledger_len(), 1);
    }

    #[tokio::test]
    async fn retries_with_same_biz_no_apply_once() {
        let (svc, store) = service();
        let first = svc.deposit(change(100, "d1")).await.expect("deposit");
        let second = svc.deposit(change(100, "d1")).await.expect("replay");
        assert!(second.replayed);
        assert_eq!(second.wallet.balance, first.wallet.balance);
        assert_eq!(second.entry.entry_id, first.entry.entry_id);

        let w1 = svc.withdraw(change(30, "w1")).await.expect("withdraw");
        let w2 = svc.withdraw(change(30, "w1")).await.expect("replay");
        let w3 = svc.force_withdraw(change(30, "w1")).await.expect("replay");
        assert_eq!(w1.wallet.balance, Amount(70));
        assert_eq!(w2.wallet.balance, Amount(70));
        assert_eq!(w3.wallet.balance, Amount(70));
        assert!(w2.replayed && w3.replayed);
        assert_eq!(store.ledger_len(), 2);
    }

    #[tokio::test]
    async fn concurrent_attempts_with_one_biz_no_produce_one_entry() {
        let (svc, store) = service();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let svc = svc.clone();
            handles.push(tokio::spawn(async move {
                svc.deposit(change(5, "same")).await
            }));
        }
        let mut fresh = 0;
        for handle in handles {
            let out = handle.await.expect("join").expect("deposit");
            if !out.replayed {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 1);
        assert_eq!(store.ledger_len(), 1);
        assert_eq!(svc.wallet(HOUSE, MEMBER).await.expect("wallet").balance, Amount(5));
    }

    #[tokio::test]
    async fn concurrent_distinct_operations_on_one_member_serialize() {
        let (svc, store) = service();
        let mut handles = Vec::new();
        for i in 0..20 {
            let svc = svc.clone();
            handles.push(tokio::spawn(async move {
                svc.deposit(change(10, &format!("d{i}"))).await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("deposit");
        }
        assert_eq!(store.ledger_len(), 20);
        assert_eq!(
            svc.wallet(HOUSE, MEMBER).await.expect("wallet").balance,
            Amount(200)
        );
    }

    #[tokio::test]
    async fn non_positive_amounts_are_rejected() {
        let (svc, store) = service();
        let err = svc.deposit(change(0, "d0")).await.expect_err("zero deposit");
        assert!(matches!(err, WalletError::InvalidAmount(Amount(0))));
        assert!(err.is_validation());
        svc.deposit(change(10, "d1")).await.expect("deposit");
        let err = svc.withdraw(change(-5, "w1")).await.expect_err("negative");
        assert!(matches!(err, WalletError::InvalidAmount(_)));
        assert_eq!(store.ledger_len(), 1);
    }

    #[tokio::test]
    async fn withdraw_from_missing_wallet_fails() {
        let (svc, _) = service();
        let err = svc.withdraw(change(5, "w1")).await.expect_err("missing");
        assert!(matches!(err, WalletError::WalletNotFound { .. }));
        let err = svc
            .force_withdraw(change(5, "w2"))
            .await
            .expect_err("missing");
        assert!(matches!(err, WalletError::WalletNotFound { .. }));
    }

    #[tokio::test]
    async fn withdraw_below_limit_fails_without_mutation_but_force_succeeds() {
        let (svc, store) = service();
        svc.deposit(change(50, "d1")).await.expect("deposit");
        svc.update_limit(limit(Some(20), None, "l1"))
            .await
            .expect("limit");

        let err = svc.withdraw(change(40, "w1")).await.expect_err("below limit");
        assert!(matches!(
            err,
            WalletError::BelowLimit {
                balance: Amount(50),
                amount: Amount(40),
                limit_min: Amount(20)
            }
        ));
        assert_eq!(
            svc.wallet(HOUSE, MEMBER).await.expect("wallet").balance,
            Amount(50)
        );
        assert_eq!(store.ledger_len(), 2);

        let forced = svc
            .force_withdraw(change(40, "w1"))
            .await
            .expect("force withdraw");
        assert!(!forced.replayed);
        assert_eq!(forced.wallet.balance, Amount(10));
        assert_eq!(forced.entry.kind, LedgerKind::ForceWithdraw);
        assert_eq!(forced.entry.change, Amount(-40));
        assert_eq!(store.ledger_len(), 3);
    }

    #[tokio::test]
    async fn withdraw_exactly_to_limit_is_allowed() {
        let (svc, _) = service();
        svc.deposit(change(50, "d1")).await.expect("deposit");
        svc.update_limit(limit(Some(20), None, "l1"))
            .await
            .expect("limit");
        let out = svc.withdraw(change(30, "w1")).await.expect("withdraw");
        assert_eq!(out.wallet.balance, Amount(20));
    }

    #[tokio::test]
    async fn negative_limit_grants_credit_line() {
        let (svc, _) = service();
        svc.update_limit(limit(Some(-100), None, "l1"))
            .await
            .expect("limit");
        let out = svc.withdraw(change(60, "w1")).await.expect("withdraw");
        assert_eq!(out.wallet.balance, Amount(-60));
    }

    #[tokio::test]
    async fn forbidden_wallet_blocks_withdraw_only() {
        let (svc, _) = service();
        svc.deposit(change(50, "d1")).await.expect("deposit");
        let out = svc
            .update_limit(limit(None, Some(true), "l1"))
            .await
            .expect("forbid");
        assert!(out.wallet.forbidden);
        assert_eq!(out.entry.kind, LedgerKind::Adjust);
        assert_eq!(out.entry.change, Amount::ZERO);
        assert_eq!(out.wallet.limit_min, Amount::ZERO);

        let err = svc.withdraw(change(10, "w1")).await.expect_err("forbidden");
        assert!(matches!(err, WalletError::Forbidden));
        svc.deposit(change(10, "d2")).await.expect("deposit still allowed");
        let forced = svc
            .force_withdraw(change(10, "w1"))
            .await
            .expect("force");
        assert_eq!(forced.wallet.balance, Amount(50));
    }

    #[tokio::test]
    async fn empty_limit_update_and_blank_biz_no_are_rejected() {
        let (svc, store) = service();
        let err = svc
            .update_limit(limit(None, None, "l1"))
            .await
            .expect_err("empty");
        assert!(matches!(err, WalletError::EmptyLimitUpdate));
        let err = svc.deposit(change(10, "  ")).await.expect_err("blank");
        assert!(matches!(err, WalletError::MissingBizNo));
        assert_eq!(store.ledger_len(), 0);
    }

    #[tokio::test]
    async fn ledger_lists_newest_first() {
        let (svc, _) = service();
        svc.deposit(change(10, "d1")).await.expect("deposit");
        svc.deposit(change(20, "d2")).await.expect("deposit");
        let entries = svc.ledger(HOUSE, MEMBER, 10).await.expect("ledger");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].biz_no, "d2");
        assert_eq!(entries[0].balance_after, Amount(30));
    }
}
