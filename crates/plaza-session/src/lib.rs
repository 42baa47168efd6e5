mod bookkeeping;
mod connection;
mod handler;
mod memory;
mod reconnect;
mod registry;
mod session;

use plaza_domain::SessionKey;
use thiserror::Error;

pub use bookkeeping::{ReconnectFailedCallback, SessionBookkeeping};
pub use connection::{
    ConnectParams, PlazaConnection, PlazaConnector, PlazaCredentials, PlazaEvent, PlazaLink,
};
pub use handler::{dispatch_event, NoopEventHandler, PlazaEventHandler, SessionContext};
pub use memory::{InMemoryConnection, InMemoryPlaza, PlazaCommand};
pub use reconnect::ReconnectPolicy;
pub use registry::{
    RegistryConfig, RegistryHealth, RegistryMetrics, SessionRegistry, SessionTaskFactory,
};
pub use session::{Session, SessionSnapshot};

/// Failures reported by a platform connection.
#[derive(Debug, Error)]
pub enum PlazaError {
    #[error("connection closed")]
    Closed,
    #[error("not connected")]
    NotConnected,
    #[error("platform rejected request: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection state lock poisoned")]
    LockPoisoned,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session registry lock poisoned")]
    LockPoisoned,
    #[error("platform error: {0}")]
    Plaza(#[from] PlazaError),
    #[error("session {key} not online after {timeout_ms}ms")]
    WaitOnlineTimeout { key: SessionKey, timeout_ms: u64 },
    #[error("login rejected: {0}")]
    LoginRejected(String),
    #[error("no login result within {timeout_ms}ms")]
    ProbeTimeout { timeout_ms: u64 },
    #[error("platform event stream closed")]
    EventStreamClosed,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use plaza_domain::{ActorId, GameKindId, HouseId, MappedTableNum, PlayerId, SeatEvent};
    use tokio::task::JoinHandle;

    use super::*;

    const HOUSE: HouseId = HouseId(10);
    const ACTOR: ActorId = ActorId(1);

    fn config() -> RegistryConfig {
        RegistryConfig {
            keepalive: Duration::from_secs(5),
            reconnect: ReconnectPolicy {
                max_retries: 3,
                base_backoff_ms: 1,
                max_backoff_ms: 2,
                ..ReconnectPolicy::default()
            },
            wait_online_poll: Duration::from_millis(5),
            probe_login_timeout: Duration::from_millis(200),
        }
    }

    fn credentials(account: &str) -> PlazaCredentials {
        PlazaCredentials {
            account: account.to_string(),
            password: "secret".to_string(),
            platform_key: "key".to_string(),
        }
    }

    fn setup() -> (SessionRegistry, InMemoryPlaza) {
        let plaza = InMemoryPlaza::new();
        let registry = SessionRegistry::new(Arc::new(plaza.clone()), config());
        (registry, plaza)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Recorder {
        fn seen(&self) -> Vec<String> {
            self.0.lock().expect("recorder lock").clone()
        }
    }

    #[async_trait]
    impl PlazaEventHandler for Recorder {
        async fn on_login_done(
            &mut self,
            _ctx: &SessionContext,
            success: bool,
            _message: &str,
            _info: Option<&plaza_domain::LoginInfo>,
        ) {
            self.0.lock().expect("lock").push(format!("login:{success}"));
        }

        async fn on_session_restarted(&mut self, _ctx: &SessionContext) {
            self.0.lock().expect("lock").push("restarted".to_string());
        }

        async fn on_seat(&mut self, _ctx: &SessionContext, seat: SeatEvent) {
            self.0
                .lock()
                .expect("lock")
                .push(format!("seat:{}:{}", seat.player, seat.mapped_num));
        }

        async fn on_reconnect_failed(
            &mut self,
            _ctx: &SessionContext,
            house: HouseId,
            retry_count: u32,
        ) {
            self.0
                .lock()
                .expect("lock")
                .push(format!("reconnect_failed:{house}:{retry_count}"));
        }
    }

    #[tokio::test]
    async fn start_session_goes_online_and_primes_member_list() {
        let (registry, plaza) = setup();
        let recorder = Recorder::default();
        registry
            .start_session(ACTOR, HOUSE, credentials("owner"), Box::new(recorder.clone()))
            .await
            .expect("start");
        registry
            .wait_online(ACTOR, HOUSE, Duration::from_secs(2))
            .await
            .expect("online");

        eventually(|| {
            plaza
                .commands(HOUSE)
                .expect("commands")
                .contains(&PlazaCommand::GetGroupMembers)
        })
        .await;
        let commands = plaza.commands(HOUSE).expect("commands");
        assert_eq!(commands[0], PlazaCommand::Login);
        assert_eq!(recorder.seen(), vec!["login:true".to_string()]);
        let session = registry.get(ACTOR, HOUSE).expect("get").expect("session");
        assert_eq!(
            session.login_info().expect("info").expect("present").houses,
            vec![HOUSE]
        );
    }

    #[tokio::test]
    async fn events_reach_business_handler_unchanged() {
        let (registry, plaza) = setup();
        let recorder = Recorder::default();
        registry
            .start_session(ACTOR, HOUSE, credentials("owner"), Box::new(recorder.clone()))
            .await
            .expect("start");
        plaza
            .push(
                HOUSE,
                PlazaEvent::Seat(SeatEvent {
                    player: PlayerId(77),
                    mapped_num: MappedTableNum(3),
                    kind_hint: GameKindId(1),
                }),
            )
            .await
            .expect("push");
        eventually(|| recorder.seen().contains(&"seat:77:3".to_string())).await;
    }

    #[tokio::test]
    async fn restart_reinstalls_connection_and_keeps_online_state() {
        let (registry, plaza) = setup();
        let recorder = Recorder::default();
        let session = registry
            .start_session(ACTOR, HOUSE, credentials("owner"), Box::new(recorder.clone()))
            .await
            .expect("start");
        registry
            .wait_online(ACTOR, HOUSE, Duration::from_secs(2))
            .await
            .expect("online");
        let before = plaza.connection(HOUSE).expect("conn").expect("present");

        plaza.set_failing_reconnects(1).expect("configure");
        assert!(plaza.simulate_disconnect(HOUSE).await.expect("disconnect"));
        eventually(|| session.restart_count() == 1).await;
        eventually(|| recorder.seen().contains(&"restarted".to_string())).await;

        let after = plaza.connection(HOUSE).expect("conn").expect("present");
        assert_ne!(before.id(), after.id());
        assert!(session.is_online());
        assert!(session.last_restart().expect("restart time").is_some());
        eventually(|| {
            after
                .commands()
                .expect("commands")
                .contains(&PlazaCommand::GetGroupMembers)
        })
        .await;
        let metrics = registry.metrics().expect("metrics");
        assert_eq!(metrics.restarts.get("1:10"), Some(&1));
    }

    #[tokio::test]
    async fn exhausted_reconnect_invokes_callback_and_goes_offline() {
        let (registry, plaza) = setup();
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = reported.clone();
        registry
            .set_reconnect_failed_callback(Arc::new(move |house, retries| {
                sink.lock().expect("lock").push((house, retries));
                Some(ActorId(1))
            }))
            .expect("callback");
        let recorder = Recorder::default();
        let session = registry
            .start_session(ACTOR, HOUSE, credentials("owner"), Box::new(recorder.clone()))
            .await
            .expect("start");
        registry
            .wait_online(ACTOR, HOUSE, Duration::from_secs(2))
            .await
            .expect("online");

        plaza.set_failing_reconnects(10).expect("configure");
        assert!(!plaza.simulate_disconnect(HOUSE).await.expect("disconnect"));
        eventually(|| !session.is_online()).await;
        eventually(|| !reported.lock().expect("lock").is_empty()).await;
        assert_eq!(reported.lock().expect("lock")[0], (HOUSE, 3));
        eventually(|| recorder.seen().contains(&"reconnect_failed:10:3".to_string())).await;
    }

    #[tokio::test]
    async fn starting_twice_tears_down_the_previous_session() {
        let (registry, plaza) = setup();
        let first = registry
            .start_session(ACTOR, HOUSE, credentials("owner"), Box::new(NoopEventHandler))
            .await
            .expect("first start");
        let second = registry
            .start_session(ACTOR, HOUSE, credentials("owner"), Box::new(NoopEventHandler))
            .await
            .expect("second start");

        assert!(first.is_stopping());
        assert!(!first.is_online());
        assert!(!second.is_stopping());
        assert_eq!(plaza.connect_count().expect("count"), 2);
        assert_eq!(plaza.open_connections(HOUSE).expect("open"), 1);
        assert_eq!(registry.sessions().expect("sessions").len(), 1);
    }

    #[tokio::test]
    async fn concurrent_starts_leave_one_live_session() {
        let (registry, plaza) = setup();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .start_session(ACTOR, HOUSE, credentials("owner"), Box::new(NoopEventHandler))
                    .await
                    .map(|_| ())
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("start");
        }
        assert_eq!(plaza.open_connections(HOUSE).expect("open"), 1);
        assert_eq!(registry.sessions().expect("sessions").len(), 1);
    }

    #[tokio::test]
    async fn wait_online_times_out_without_login_result() {
        let (registry, plaza) = setup();
        plaza.set_silent_login(true).expect("configure");
        registry
            .start_session(ACTOR, HOUSE, credentials("owner"), Box::new(NoopEventHandler))
            .await
            .expect("start");
        let err = registry
            .wait_online(ACTOR, HOUSE, Duration::from_millis(30))
            .await
            .expect_err("timeout");
        assert!(matches!(err, SessionError::WaitOnlineTimeout { timeout_ms: 30, .. }));
        assert!(!registry.is_online(ACTOR, HOUSE).expect("online"));
    }

    struct FlagTask {
        finished: Arc<AtomicBool>,
    }

    impl SessionTaskFactory for FlagTask {
        fn name(&self) -> &'static str {
            "flag"
        }

        fn spawn(&self, session: Arc<Session>) -> Option<JoinHandle<()>> {
            let finished = self.finished.clone();
            let mut shutdown = session.shutdown_signal();
            Some(tokio::spawn(async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
                // Simulates a cycle finishing after the signal.
                tokio::time::sleep(Duration::from_millis(20)).await;
                finished.store(true, Ordering::Release);
            }))
        }
    }

    #[tokio::test]
    async fn stop_session_waits_for_session_tasks() {
        let (registry, plaza) = setup();
        let finished = Arc::new(AtomicBool::new(false));
        registry
            .register_task_factory(Arc::new(FlagTask {
                finished: finished.clone(),
            }))
            .expect("factory");
        registry
            .start_session(ACTOR, HOUSE, credentials("owner"), Box::new(NoopEventHandler))
            .await
            .expect("start");
        assert!(!finished.load(Ordering::Acquire));

        registry.stop_session(ACTOR, HOUSE).await.expect("stop");
        assert!(finished.load(Ordering::Acquire));
        assert!(registry.get(ACTOR, HOUSE).expect("get").is_none());
        assert_eq!(plaza.open_connections(HOUSE).expect("open"), 0);

        assert_eq!(registry.tracked_lifecycle_locks(), 0);

        // Stopping again is a no-op.
        registry.stop_session(ACTOR, HOUSE).await.expect("stop again");
        assert_eq!(registry.tracked_lifecycle_locks(), 0);
    }

    #[tokio::test]
    async fn health_reflects_online_ratio_and_stop_all_drains() {
        let (registry, plaza) = setup();
        plaza.reject_account("bad").expect("configure");
        registry
            .start_session(ActorId(1), HouseId(1), credentials("good"), Box::new(NoopEventHandler))
            .await
            .expect("start");
        registry
            .start_session(ActorId(2), HouseId(2), credentials("bad"), Box::new(NoopEventHandler))
            .await
            .expect("start");
        registry
            .wait_online(ActorId(1), HouseId(1), Duration::from_secs(2))
            .await
            .expect("online");

        let health = registry.health().expect("health");
        assert!(health.healthy);
        assert_eq!(health.metrics.total, 2);
        assert_eq!(health.metrics.online, 1);

        registry
            .start_session(ActorId(3), HouseId(3), credentials("bad"), Box::new(NoopEventHandler))
            .await
            .expect("start");
        assert!(!registry.health().expect("health").healthy);

        assert_eq!(registry.tracked_lifecycle_locks(), 3);
        registry.stop_all().await.expect("stop all");
        assert!(registry.sessions().expect("sessions").is_empty());
        assert_eq!(registry.tracked_lifecycle_locks(), 0);
        assert!(registry.health().expect("health").healthy);
    }

    #[tokio::test]
    async fn lookups_by_house_and_user() {
        let (registry, _plaza) = setup();
        registry
            .start_session(ActorId(1), HouseId(5), credentials("a"), Box::new(NoopEventHandler))
            .await
            .expect("start");
        registry
            .start_session(ActorId(2), HouseId(6), credentials("b"), Box::new(NoopEventHandler))
            .await
            .expect("start");

        let any = registry
            .get_any_by_house(HouseId(5))
            .expect("lookup")
            .expect("present");
        assert_eq!(any.key().actor, ActorId(1));
        assert!(registry.get(ActorId(2), HouseId(5)).expect("get").is_none());
        let by_user = registry
            .get_by_user(ActorId(2))
            .expect("lookup")
            .expect("present");
        assert_eq!(by_user.key().house, HouseId(6));
        assert!(registry.get_by_user(ActorId(9)).expect("lookup").is_none());
    }

    #[tokio::test]
    async fn probe_login_does_not_register_a_session() {
        let (registry, plaza) = setup();
        plaza.reject_account("bad").expect("configure");
        assert!(registry
            .probe_login(HOUSE, credentials("good"))
            .await
            .expect("probe"));
        assert!(!registry
            .probe_login(HOUSE, credentials("bad"))
            .await
            .expect("probe"));
        let info = registry
            .probe_login_with_info(HOUSE, credentials("good"))
            .await
            .expect("probe");
        assert_eq!(info.nickname, "good");
        assert!(registry.sessions().expect("sessions").is_empty());
        assert_eq!(plaza.open_connections(HOUSE).expect("open"), 0);

        plaza.set_silent_login(true).expect("configure");
        let err = registry
            .probe_login(HOUSE, credentials("good"))
            .await
            .expect_err("timeout");
        assert!(matches!(err, SessionError::ProbeTimeout { timeout_ms: 200 }));
    }
}
