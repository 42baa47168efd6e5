mod feed;
mod poller;

use ledger_store::LedgerStoreError;
use thiserror::Error;

pub use feed::{BattleBatch, BattleFeed, InMemoryBattleFeed, ReqwestBattleFeed};
pub use poller::{BattleSyncConfig, BattleSyncPoller, BattleSyncTaskFactory, SyncReport};

#[derive(Debug, Error)]
pub enum BattleSyncError {
    #[error("battle feed http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("battle feed unavailable: {0}")]
    Feed(String),
    #[error("battle store error: {0}")]
    Store(#[from] LedgerStoreError),
}
