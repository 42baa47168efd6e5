use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use plaza_domain::{Amount, GameKindId, HouseId};
use serde::{Deserialize, Serialize};

use crate::LedgerStoreError;

/// Minimum balance to stay seated. An empty `group_name`, a zero `kind` and a
/// zero `base_score` act as wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditLimitRule {
    pub house: HouseId,
    pub group_name: String,
    pub kind: GameKindId,
    pub base_score: i64,
    pub threshold: Amount,
}

#[async_trait]
pub trait CreditRuleRepository: Send + Sync {
    /// Exact-key lookup; wildcard fallback is the caller's business.
    async fn find_rule(
        &self,
        house: HouseId,
        group_name: &str,
        kind: GameKindId,
        base_score: i64,
    ) -> Result<Option<CreditLimitRule>, LedgerStoreError>;

    async fn upsert_rule(&self, rule: &CreditLimitRule) -> Result<(), LedgerStoreError>;

    async fn delete_rule(
        &self,
        house: HouseId,
        group_name: &str,
        kind: GameKindId,
        base_score: i64,
    ) -> Result<bool, LedgerStoreError>;

    async fn list_rules(&self, house: HouseId) -> Result<Vec<CreditLimitRule>, LedgerStoreError>;
}

type RuleKey = (HouseId, String, GameKindId, i64);

#[derive(Debug, Default, Clone)]
pub struct InMemoryCreditRuleRepository {
    rules: Arc<Mutex<HashMap<RuleKey, CreditLimitRule>>>,
}

impl InMemoryCreditRuleRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CreditRuleRepository for InMemoryCreditRuleRepository {
    async fn find_rule(
        &self,
        house: HouseId,
        group_name: &str,
        kind: GameKindId,
        base_score: i64,
    ) -> Result<Option<CreditLimitRule>, LedgerStoreError> {
        let rules = self
            .rules
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?;
        Ok(rules
            .get(&(house, group_name.to_string(), kind, base_score))
            .cloned())
    }

    async fn upsert_rule(&self, rule: &CreditLimitRule) -> Result<(), LedgerStoreError> {
        self.rules
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?
            .insert(
                (rule.house, rule.group_name.clone(), rule.kind, rule.base_score),
                rule.clone(),
            );
        Ok(())
    }

    async fn delete_rule(
        &self,
        house: HouseId,
        group_name: &str,
        kind: GameKindId,
        base_score: i64,
    ) -> Result<bool, LedgerStoreError> {
        Ok(self
            .rules
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?
            .remove(&(house, group_name.to_string(), kind, base_score))
            .is_some())
    }

    async fn list_rules(&self, house: HouseId) -> Result<Vec<CreditLimitRule>, LedgerStoreError> {
        let rules = self
            .rules
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?;
        let mut out: Vec<_> = rules.values().filter(|r| r.house == house).cloned().collect();
        out.sort_by(|a, b| {
            (&a.group_name, a.kind, a.base_score).cmp(&(&b.group_name, b.kind, b.base_score))
        });
        Ok(out)
    }
}
