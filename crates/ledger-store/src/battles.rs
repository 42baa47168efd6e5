use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plaza_domain::{BattleRecord, HouseId, PlayerId};

use crate::LedgerStoreError;

#[async_trait]
pub trait BattleRecordRepository: Send + Sync {
    async fn record_exists(
        &self,
        house: HouseId,
        player: PlayerId,
        battle_at: DateTime<Utc>,
    ) -> Result<bool, LedgerStoreError>;

    /// Returns `false` when a row with the same (battle_at, player, house)
    /// already exists; the existing row is left untouched.
    async fn insert_record(&self, record: &BattleRecord) -> Result<bool, LedgerStoreError>;

    async fn list_records(
        &self,
        house: HouseId,
        since: DateTime<Utc>,
    ) -> Result<Vec<BattleRecord>, LedgerStoreError>;
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryBattleRecordRepository {
    records: Arc<Mutex<Vec<BattleRecord>>>,
}

impl InMemoryBattleRecordRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BattleRecordRepository for InMemoryBattleRecordRepository {
    async fn record_exists(
        &self,
        house: HouseId,
        player: PlayerId,
        battle_at: DateTime<Utc>,
    ) -> Result<bool, LedgerStoreError> {
        let records = self
            .records
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?;
        Ok(records
            .iter()
            .any(|r| r.house == house && r.player == player && r.battle_at == battle_at))
    }

    async fn insert_record(&self, record: &BattleRecord) -> Result<bool, LedgerStoreError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?;
        if records.iter().any(|r| {
            r.house == record.house && r.player == record.player && r.battle_at == record.battle_at
        }) {
            return Ok(false);
        }
        records.push(record.clone());
        Ok(true)
    }

    async fn list_records(
        &self,
        house: HouseId,
        since: DateTime<Utc>,
    ) -> Result<Vec<BattleRecord>, LedgerStoreError> {
        let records = self
            .records
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?;
        Ok(records
            .iter()
            .filter(|r| r.house == house && r.battle_at >= since)
            .cloned()
            .collect())
    }
}
