use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plaza_domain::{ActorId, Amount, DomainError, HouseId, PlayerId};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::LedgerStoreError;

/// Current balance projection for one member of one house.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub house: HouseId,
    pub member: PlayerId,
    pub balance: Amount,
    pub forbidden: bool,
    /// Withdrawals may not take the balance below this floor.
    pub limit_min: Amount,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    #[must_use]
    pub fn empty(house: HouseId, member: PlayerId) -> Self {
        Self {
            house,
            member,
            balance: Amount::ZERO,
            forbidden: false,
            limit_min: Amount::ZERO,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    Deposit,
    Withdraw,
    ForceWithdraw,
    Adjust,
}

impl LedgerKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdraw => "withdraw",
            Self::ForceWithdraw => "force_withdraw",
            Self::Adjust => "adjust",
        }
    }
}

impl FromStr for LedgerKind {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "deposit" => Ok(Self::Deposit),
            "withdraw" => Ok(Self::Withdraw),
            "force_withdraw" => Ok(Self::ForceWithdraw),
            "adjust" => Ok(Self::Adjust),
            other => Err(DomainError::InvalidLedgerKind(other.to_string())),
        }
    }
}

/// Append-only ledger row. `(house, member, biz_no)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: Uuid,
    pub house: HouseId,
    pub member: PlayerId,
    pub kind: LedgerKind,
    pub change: Amount,
    pub balance_before: Amount,
    pub balance_after: Amount,
    pub operator: ActorId,
    pub biz_no: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn get_wallet(
        &self,
        house: HouseId,
        member: PlayerId,
    ) -> Result<Option<Wallet>, LedgerStoreError>;

    async fn find_ledger_entry(
        &self,
        house: HouseId,
        member: PlayerId,
        biz_no: &str,
    ) -> Result<Option<LedgerEntry>, LedgerStoreError>;

    /// Newest first.
    async fn list_ledger_entries(
        &self,
        house: HouseId,
        member: PlayerId,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, LedgerStoreError>;

    async fn begin(&self) -> Result<Box<dyn WalletTx>, LedgerStoreError>;
}

/// One exclusive wallet transaction. Nothing written through it is visible
/// until `commit`; dropping it without committing rolls everything back.
#[async_trait]
pub trait WalletTx: Send {
    /// Reads the wallet row and holds its lock until the transaction ends.
    async fn lock_wallet(
        &mut self,
        house: HouseId,
        member: PlayerId,
    ) -> Result<Option<Wallet>, LedgerStoreError>;

    async fn find_ledger_entry(
        &mut self,
        house: HouseId,
        member: PlayerId,
        biz_no: &str,
    ) -> Result<Option<LedgerEntry>, LedgerStoreError>;

    async fn upsert_wallet(&mut self, wallet: &Wallet) -> Result<(), LedgerStoreError>;

    async fn append_ledger_entry(&mut self, entry: &LedgerEntry) -> Result<(), LedgerStoreError>;

    async fn commit(&mut self) -> Result<(), LedgerStoreError>;
}

type WalletKey = (HouseId, PlayerId);

#[derive(Debug, Default)]
struct InMemoryWalletState {
    wallets: Mutex<HashMap<WalletKey, Wallet>>,
    ledger: Mutex<Vec<LedgerEntry>>,
    row_locks: Mutex<HashMap<WalletKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl InMemoryWalletState {
    fn row_lock(&self, key: WalletKey) -> Result<Arc<tokio::sync::Mutex<()>>, LedgerStoreError> {
        let mut locks = self
            .row_locks
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?;
        Ok(locks.entry(key).or_default().clone())
    }

    fn find_entry(
        &self,
        house: HouseId,
        member: PlayerId,
        biz_no: &str,
    ) -> Result<Option<LedgerEntry>, LedgerStoreError> {
        let ledger = self
            .ledger
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?;
        Ok(ledger
            .iter()
            .find(|e| e.house == house && e.member == member && e.biz_no == biz_no)
            .cloned())
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryWalletStore {
    state: Arc<InMemoryWalletState>,
}

impl InMemoryWalletStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ledger_len(&self) -> usize {
        self.state.ledger.lock().map(|l| l.len()).unwrap_or_default()
    }
}

#[async_trait]
impl WalletStore for InMemoryWalletStore {
    async fn get_wallet(
        &self,
        house: HouseId,
        member: PlayerId,
    ) -> Result<Option<Wallet>, LedgerStoreError> {
        let wallets = self
            .state
            .wallets
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?;
        Ok(wallets.get(&(house, member)).cloned())
    }

    async fn find_ledger_entry(
        &self,
        house: HouseId,
        member: PlayerId,
        biz_no: &str,
    ) -> Result<Option<LedgerEntry>, LedgerStoreError> {
        self.state.find_entry(house, member, biz_no)
    }

    async fn list_ledger_entries(
        &self,
        house: HouseId,
        member: PlayerId,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, LedgerStoreError> {
        let ledger = self
            .state
            .ledger
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?;
        Ok(ledger
            .iter()
            .rev()
            .filter(|e| e.house == house && e.member == member)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn begin(&self) -> Result<Box<dyn WalletTx>, LedgerStoreError> {
        Ok(Box::new(InMemoryWalletTx {
            state: self.state.clone(),
            row_guards: HashMap::new(),
            staged_wallets: Vec::new(),
            staged_entries: Vec::new(),
            closed: false,
        }))
    }
}

struct InMemoryWalletTx {
    state: Arc<InMemoryWalletState>,
    row_guards: HashMap<WalletKey, OwnedMutexGuard<()>>,
    staged_wallets: Vec<Wallet>,
    staged_entries: Vec<LedgerEntry>,
    closed: bool,
}

impl InMemoryWalletTx {
    fn ensure_open(&self) -> Result<(), LedgerStoreError> {
        if self.closed {
            return Err(LedgerStoreError::TransactionClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl WalletTx for InMemoryWalletTx {
    async fn lock_wallet(
        &mut self,
        house: HouseId,
        member: PlayerId,
    ) -> Result<Option<Wallet>, LedgerStoreError> {
        self.ensure_open()?;
        let key = (house, member);
        if !self.row_guards.contains_key(&key) {
            let lock = self.state.row_lock(key)?;
            let guard = lock.lock_owned().await;
            self.row_guards.insert(key, guard);
        }
        if let Some(staged) = self
            .staged_wallets
            .iter()
            .rev()
            .find(|w| w.house == house && w.member == member)
        {
            return Ok(Some(staged.clone()));
        }
        let wallets = self
            .state
            .wallets
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?;
        Ok(wallets.get(&key).cloned())
    }

    async fn find_ledger_entry(
        &mut self,
        house: HouseId,
        member: PlayerId,
        biz_no: &str,
    ) -> Result<Option<LedgerEntry>, LedgerStoreError> {
        self.ensure_open()?;
        if let Some(staged) = self
            .staged_entries
            .iter()
            .find(|e| e.house == house && e.member == member && e.biz_no == biz_no)
        {
            return Ok(Some(staged.clone()));
        }
        self.state.find_entry(house, member, biz_no)
    }

    async fn upsert_wallet(&mut self, wallet: &Wallet) -> Result<(), LedgerStoreError> {
        self.ensure_open()?;
        self.staged_wallets.push(wallet.clone());
        Ok(())
    }

    async fn append_ledger_entry(&mut self, entry: &LedgerEntry) -> Result<(), LedgerStoreError> {
        self.ensure_open()?;
        self.staged_entries.push(entry.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), LedgerStoreError> {
        self.ensure_open()?;
        self.closed = true;
        {
            let mut ledger = self
                .state
                .ledger
                .lock()
                .map_err(|_| LedgerStoreError::LockPoisoned)?;
            let mut wallets = self
                .state
                .wallets
                .lock()
                .map_err(|_| LedgerStoreError::LockPoisoned)?;
            for entry in &self.staged_entries {
                if ledger.iter().any(|e| {
                    e.house == entry.house && e.member == entry.member && e.biz_no == entry.biz_no
                }) {
                    return Err(LedgerStoreError::DuplicateLedgerEntry {
                        biz_no: entry.biz_no.clone(),
                    });
                }
            }
            for wallet in self.staged_wallets.drain(..) {
                wallets.insert((wallet.house, wallet.member), wallet);
            }
            ledger.append(&mut self.staged_entries);
        }
        self.row_guards.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(biz_no: &str) -> LedgerEntry {
        LedgerEntry {
            entry_id: Uuid::now_v7(),
            house: HouseId(1),
            member: PlayerId(2),
            kind: LedgerKind::Deposit,
            change: Amount(10),
            balance_before: Amount::ZERO,
            balance_after: Amount(10),
            operator: ActorId(99),
            biz_no: biz_no.to_string(),
            reason: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn uncommitted_transaction_is_rolled_back_on_drop() {
        let store = InMemoryWalletStore::new();
        {
            let mut tx = store.begin().await.expect("begin");
            tx.lock_wallet(HouseId(1), PlayerId(2)).await.expect("lock");
            let mut wallet = Wallet::empty(HouseId(1), PlayerId(2));
            wallet.balance = Amount(10);
            tx.upsert_wallet(&wallet).await.expect("upsert");
            tx.append_ledger_entry(&entry("b1")).await.expect("append");
        }
        assert!(store
            .get_wallet(HouseId(1), PlayerId(2))
            .await
            .expect("get")
            .is_none());
        assert_eq!(store.ledger_len(), 0);

        // The row lock was released by the drop.
        let mut tx = store.begin().await.expect("begin");
        assert!(tx
            .lock_wallet(HouseId(1), PlayerId(2))
            .await
            .expect("lock")
            .is_none());
    }

    #[tokio::test]
    async fn commit_rejects_duplicate_biz_no_without_partial_writes() {
        let store = InMemoryWalletStore::new();
        let mut tx = store.begin().await.expect("begin");
        tx.append_ledger_entry(&entry("dup")).await.expect("append");
        tx.commit().await.expect("commit");

        let mut tx = store.begin().await.expect("begin");
        let mut wallet = Wallet::empty(HouseId(1), PlayerId(2));
        wallet.balance = Amount(500);
        tx.upsert_wallet(&wallet).await.expect("upsert");
        tx.append_ledger_entry(&entry("dup")).await.expect("append");
        let err = tx.commit().await.expect_err("duplicate");
        assert!(matches!(err, LedgerStoreError::DuplicateLedgerEntry { .. }));
        assert!(store
            .get_wallet(HouseId(1), PlayerId(2))
            .await
            .expect("get")
            .is_none());
        assert_eq!(store.ledger_len(), 1);
    }

    #[test]
    fn ledger_kind_round_trips_through_str() {
        for kind in [
            LedgerKind::Deposit,
            LedgerKind::Withdraw,
            LedgerKind::ForceWithdraw,
            LedgerKind::Adjust,
        ] {
            assert_eq!(kind.as_str().parse::<LedgerKind>().expect("parse"), kind);
        }
        assert!("refund".parse::<LedgerKind>().is_err());
    }
}
