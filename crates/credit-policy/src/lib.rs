use std::sync::Arc;

use ledger_store::CreditRuleRepository;
use plaza_domain::{Amount, GameKindId, HouseId};
use tracing::{debug, warn};

/// Threshold used when a house has no applicable rule at all. High enough
/// that nobody stays seated without explicit configuration.
pub const UNCONFIGURED_CREDIT_CEILING: Amount = Amount(99_999_999);

/// Which tier produced a resolved threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditTier {
    GroupKindBase,
    GroupDefault,
    GlobalKindBase,
    GlobalDefault,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedCredit {
    pub threshold: Amount,
    pub tier: CreditTier,
}

#[derive(Clone)]
pub struct CreditResolver {
    rules: Arc<dyn CreditRuleRepository>,
    fallback: Amount,
}

impl CreditResolver {
    #[must_use]
    pub fn new(rules: Arc<dyn CreditRuleRepository>) -> Self {
        Self {
            rules,
            fallback: UNCONFIGURED_CREDIT_CEILING,
        }
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: Amount) -> Self {
        self.fallback = fallback;
        self
    }

    /// Minimum balance for `(house, group, kind, base_score)`; never fails.
    pub async fn resolve(
        &self,
        house: HouseId,
        group_name: &str,
        kind: GameKindId,
        base_score: i64,
    ) -> Amount {
        self.resolve_detailed(house, group_name, kind, base_score)
            .await
            .threshold
    }

    pub async fn resolve_detailed(
        &self,
        house: HouseId,
        group_name: &str,
        kind: GameKindId,
        base_score: i64,
    ) -> ResolvedCredit {
        let group_name = group_name.trim();
        let mut tiers: Vec<(&str, GameKindId, i64, CreditTier)> = Vec::with_capacity(4);
        if !group_name.is_empty() {
            tiers.push((group_name, kind, base_score, CreditTier::GroupKindBase));
            tiers.push((group_name, GameKindId::ANY, 0, CreditTier::GroupDefault));
        }
        tiers.push(("", kind, base_score, CreditTier::GlobalKindBase));
        tiers.push(("", GameKindId::ANY, 0, CreditTier::GlobalDefault));

        for (group, kind, base, tier) in tiers {
            match self.rules.find_rule(house, group, kind, base).await {
                Ok(Some(rule)) => {
                    debug!(
                        house = %house,
                        group,
                        kind = %kind,
                        base,
                        threshold = %rule.threshold,
                        ?tier,
                        "credit rule matched"
                    );
                    return ResolvedCredit {
                        threshold: rule.threshold,
                        tier,
                    };
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(house = %house, group, error = %err, "credit rule lookup failed");
                }
            }
        }

        ResolvedCredit {
            threshold: self.fallback,
            tier: CreditTier::Fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_store::{CreditLimitRule, InMemoryCreditRuleRepository};

    const HOUSE: HouseId = HouseId(10);

    fn rule(group: &str, kind: i32, base: i64, threshold: i64) -> CreditLimitRule {
        CreditLimitRule {
            house: HOUSE,
            group_name: group.to_string(),
            kind: GameKindId(kind),
            base_score: base,
            threshold: Amount(threshold),
        }
    }

    async fn resolver_with(rules: &[CreditLimitRule]) -> CreditResolver {
        let repo = InMemoryCreditRuleRepository::new();
        for r in rules {
            repo.upsert_rule(r).await.expect("upsert");
        }
        CreditResolver::new(Arc::new(repo))
    }

    #[tokio::test]
    async fn unconfigured_house_returns_fallback_ceiling() {
        let resolver = resolver_with(&[]).await;
        let resolved = resolver
            .resolve_detailed(HOUSE, "vip", GameKindId(3), 5)
            .await;
        assert_eq!(resolved.threshold, UNCONFIGURED_CREDIT_CEILING);
        assert_eq!(resolved.tier, CreditTier::Fallback);
    }

    #[tokio::test]
    async fn global_default_beats_fallback() {
        let resolver = resolver_with(&[rule("", 0, 0, 100)]).await;
        assert_eq!(
            resolver.resolve(HOUSE, "vip", GameKindId(3), 5).await,
            Amount(100)
        );
    }

    #[tokio::test]
    async fn each_more_specific_tier_overrides_the_broader_one() {
        let mut rules = vec![rule("", 0, 0, 100)];
        let resolver = resolver_with(&rules).await;
        assert_eq!(
            resolver
                .resolve_detailed(HOUSE, "vip", GameKindId(3), 5)
                .await
                .tier,
            CreditTier::GlobalDefault
        );

        rules.push(rule("", 3, 5, 200));
        let resolver = resolver_with(&rules).await;
        assert_eq!(
            resolver.resolve(HOUSE, "vip", GameKindId(3), 5).await,
            Amount(200)
        );

        rules.push(rule("vip", 0, 0, 300));
        let resolver = resolver_with(&rules).await;
        assert_eq!(
            resolver.resolve(HOUSE, "vip", GameKindId(3), 5).await,
            Amount(300)
        );

        rules.push(rule("vip", 3, 5, 400));
        let resolver = resolver_with(&rules).await;
        let resolved = resolver
            .resolve_detailed(HOUSE, "vip", GameKindId(3), 5)
            .await;
        assert_eq!(resolved.threshold, Amount(400));
        assert_eq!(resolved.tier, CreditTier::GroupKindBase);
    }

    #[tokio::test]
    async fn group_rules_are_skipped_for_unaffiliated_members() {
        let resolver = resolver_with(&[rule("vip", 0, 0, 300), rule("", 3, 5, 200)]).await;
        assert_eq!(
            resolver.resolve(HOUSE, "", GameKindId(3), 5).await,
            Amount(200)
        );
        assert_eq!(
            resolver.resolve(HOUSE, "", GameKindId(4), 5).await,
            UNCONFIGURED_CREDIT_CEILING
        );
    }

    #[tokio::test]
    async fn configured_fallback_is_used() {
        let resolver = resolver_with(&[]).await.with_fallback(Amount(42));
        assert_eq!(
            resolver.resolve(HOUSE, "", GameKindId(1), 1).await,
            Amount(42)
        );
    }
}
