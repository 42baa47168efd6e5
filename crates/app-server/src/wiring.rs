use std::sync::Arc;
use std::time::Duration;

use admission_control::AdmissionDeps;
use battle_sync::{
    BattleFeed, BattleSyncConfig, BattleSyncTaskFactory, InMemoryBattleFeed, ReqwestBattleFeed,
};
use credit_policy::CreditResolver;
use ledger_store::{
    BattleRecordRepository, CreditRuleRepository, InMemoryBattleRecordRepository,
    InMemoryCreditRuleRepository, InMemoryMemberRepository, InMemoryWalletStore,
    MemberRepository, PostgresLedgerStore, WalletStore,
};
use platform_core::AppConfig;
use plaza_domain::{Amount, HouseId};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use wallet::WalletService;

#[derive(Clone)]
pub struct Stores {
    pub wallets: Arc<dyn WalletStore>,
    pub credit_rules: Arc<dyn CreditRuleRepository>,
    pub members: Arc<dyn MemberRepository>,
    pub battles: Arc<dyn BattleRecordRepository>,
    pub persistent: bool,
}

impl Stores {
    pub async fn connect(config: &AppConfig) -> anyhow::Result<Self> {
        let Some(url) = config.database.url.as_deref() else {
            info!("no database url configured; using in-memory stores");
            return Ok(Self::in_memory());
        };
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect(url)
            .await?;
        info!(
            max_connections = config.database.max_connections,
            "connected to postgres"
        );
        let store = Arc::new(PostgresLedgerStore::new(pool));
        Ok(Self {
            wallets: store.clone(),
            credit_rules: store.clone(),
            members: store.clone(),
            battles: store,
            persistent: true,
        })
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            wallets: Arc::new(InMemoryWalletStore::new()),
            credit_rules: Arc::new(InMemoryCreditRuleRepository::new()),
            members: Arc::new(InMemoryMemberRepository::new()),
            battles: Arc::new(InMemoryBattleRecordRepository::new()),
            persistent: false,
        }
    }
}

#[derive(Clone)]
pub struct Engines {
    pub wallets: WalletService,
    pub credit: CreditResolver,
}

impl Engines {
    #[must_use]
    pub fn new(config: &AppConfig, stores: &Stores) -> Self {
        Self {
            wallets: WalletService::new(stores.wallets.clone()),
            credit: CreditResolver::new(stores.credit_rules.clone())
                .with_fallback(Amount(config.credit.fallback_ceiling)),
        }
    }

    #[must_use]
    pub fn admission_deps(&self, stores: &Stores) -> AdmissionDeps {
        AdmissionDeps {
            members: stores.members.clone(),
            wallets: self.wallets.clone(),
            credit: self.credit.clone(),
        }
    }
}

/// HTTP feed against the platform when persistent, otherwise a local feed the
/// demonstration can fill.
pub fn battle_feed(
    config: &AppConfig,
    stores: &Stores,
) -> anyhow::Result<(Arc<dyn BattleFeed>, Option<InMemoryBattleFeed>)> {
    if stores.persistent {
        let feed = ReqwestBattleFeed::new(
            config.battle_sync.endpoint.clone(),
            Duration::from_millis(config.battle_sync.request_timeout_ms),
        )?;
        info!(endpoint = %config.battle_sync.endpoint, "battle feed configured");
        return Ok((Arc::new(feed), None));
    }
    let feed = InMemoryBattleFeed::new();
    Ok((Arc::new(feed.clone()), Some(feed)))
}

#[must_use]
pub fn battle_sync_factory(
    config: &AppConfig,
    stores: &Stores,
    feed: Arc<dyn BattleFeed>,
) -> BattleSyncTaskFactory {
    BattleSyncTaskFactory::new(
        feed,
        stores.battles.clone(),
        stores.members.clone(),
        BattleSyncConfig::from(&config.battle_sync),
    )
}

/// Maps a house to the controlling account that owns its session, so a
/// reconnect failure can be reported against that account.
pub fn owner_lookup(
    owners: Vec<(HouseId, plaza_domain::ActorId)>,
) -> plaza_session::ReconnectFailedCallback {
    Arc::new(move |house, retry_count| {
        let owner = owners
            .iter()
            .find(|(h, _)| *h == house)
            .map(|(_, actor)| *actor);
        tracing::warn!(
            house = %house,
            retry_count,
            owner = ?owner,
            "deactivating controlling account after reconnect failure"
        );
        owner
    })
}
