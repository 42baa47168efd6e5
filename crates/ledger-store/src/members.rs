use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use plaza_domain::{HouseId, MemberRecord, PlayerId};

use crate::LedgerStoreError;

#[async_trait]
pub trait MemberRepository: Send + Sync {
    async fn get_member(
        &self,
        house: HouseId,
        player: PlayerId,
    ) -> Result<Option<MemberRecord>, LedgerStoreError>;

    async fn upsert_member(&self, member: &MemberRecord) -> Result<(), LedgerStoreError>;
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryMemberRepository {
    members: Arc<Mutex<HashMap<(HouseId, PlayerId), MemberRecord>>>,
}

impl InMemoryMemberRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemberRepository for InMemoryMemberRepository {
    async fn get_member(
        &self,
        house: HouseId,
        player: PlayerId,
    ) -> Result<Option<MemberRecord>, LedgerStoreError> {
        Ok(self
            .members
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?
            .get(&(house, player))
            .cloned())
    }

    async fn upsert_member(&self, member: &MemberRecord) -> Result<(), LedgerStoreError> {
        self.members
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?
            .insert((member.house, member.player), member.clone());
        Ok(())
    }
}
