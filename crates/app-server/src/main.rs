mod demo;
mod wiring;

use std::sync::Arc;

use anyhow::Result;
use observability::init_tracing;
use platform_core::AppConfig;
use plaza_domain::{ActorId, HouseId};
use plaza_session::{InMemoryPlaza, RegistryConfig, SessionRegistry};
use tracing::{info, warn};
use wiring::{battle_feed, battle_sync_factory, owner_lookup, Engines, Stores};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config.app.service_name, &config.observability.log_filter);
    info!(
        env = config.app.env.as_str(),
        service = %config.app.service_name,
        "configuration loaded"
    );

    let stores = Stores::connect(&config).await?;
    let engines = Engines::new(&config, &stores);

    // The live platform transport plugs in through `PlazaConnector`; this
    // binary ships with the in-memory platform only.
    let plaza = InMemoryPlaza::new();
    let registry = SessionRegistry::new(
        Arc::new(plaza.clone()),
        RegistryConfig::from(&config.plaza),
    );
    registry.set_reconnect_failed_callback(owner_lookup(vec![(HouseId(8001), ActorId(1))]))?;

    let (feed, local_feed) = battle_feed(&config, &stores)?;
    if config.battle_sync.enabled {
        registry.register_task_factory(Arc::new(battle_sync_factory(&config, &stores, feed)))?;
    } else {
        info!("battle sync disabled");
    }

    match local_feed {
        Some(local_feed) => {
            if let Err(err) = demo::run(&registry, &plaza, &stores, &engines, &local_feed).await {
                warn!(error = %err, "demonstration flow failed");
            }
        }
        None => {
            info!("plaza gate running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
        }
    }

    let health = registry.health()?;
    info!(
        healthy = health.healthy,
        sessions = health.metrics.total,
        "shutting down"
    );
    registry.stop_all().await?;
    info!("plaza gate stopped");
    Ok(())
}
