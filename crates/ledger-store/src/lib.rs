mod battles;
mod credit_rules;
mod members;
mod postgres;
mod wallet;

use thiserror::Error;

pub use battles::{BattleRecordRepository, InMemoryBattleRecordRepository};
pub use credit_rules::{CreditLimitRule, CreditRuleRepository, InMemoryCreditRuleRepository};
pub use members::{InMemoryMemberRepository, MemberRepository};
pub use postgres::PostgresLedgerStore;
pub use wallet::{
    InMemoryWalletStore, LedgerEntry, LedgerKind, Wallet, WalletStore, WalletTx,
};

#[derive(Debug, Error)]
pub enum LedgerStoreError {
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error("database error: {0}")]
    Database(String),
    #[error("duplicate ledger entry for biz_no {biz_no}")]
    DuplicateLedgerEntry { biz_no: String },
    #[error("transaction already closed")]
    TransactionClosed,
    #[error("invalid stored record: {0}")]
    InvalidRecord(String),
}
