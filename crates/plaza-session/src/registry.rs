use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use platform_core::PlazaSection;
use plaza_domain::{ActorId, HouseId, LoginInfo, SessionKey};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bookkeeping::{CallbackSlot, ReconnectFailedCallback, SessionBookkeeping};
use crate::connection::{
    ConnectParams, PlazaConnection, PlazaConnector, PlazaCredentials, PlazaEvent, PlazaLink,
};
use crate::handler::{dispatch_event, PlazaEventHandler, SessionContext};
use crate::reconnect::ReconnectPolicy;
use crate::session::{Session, SessionSnapshot};
use crate::SessionError;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub keepalive: Duration,
    pub reconnect: ReconnectPolicy,
    pub wait_online_poll: Duration,
    pub probe_login_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            wait_online_poll: Duration::from_millis(100),
            probe_login_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&PlazaSection> for RegistryConfig {
    fn from(section: &PlazaSection) -> Self {
        Self {
            keepalive: section.keepalive(),
            reconnect: ReconnectPolicy::from(&section.reconnect),
            wait_online_poll: section.wait_online_poll(),
            probe_login_timeout: section.probe_login_timeout(),
        }
    }
}

/// Background work bound to one session's lifetime. The returned task must
/// exit once `session.shutdown_signal()` fires; stopping the session awaits it.
pub trait SessionTaskFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn spawn(&self, session: Arc<Session>) -> Option<JoinHandle<()>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryMetrics {
    pub total: usize,
    pub online: usize,
    pub restarts: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryHealth {
    pub healthy: bool,
    pub metrics: RegistryMetrics,
}

struct RegistryInner {
    connector: Arc<dyn PlazaConnector>,
    config: RegistryConfig,
    sessions: RwLock<HashMap<SessionKey, Arc<Session>>>,
    lifecycle: Mutex<HashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>>,
    reconnect_failed: Arc<CallbackSlot>,
    task_factories: RwLock<Vec<Arc<dyn SessionTaskFactory>>>,
}

/// Owns every live platform session, at most one per (actor, house).
/// Construct once at startup and call [`SessionRegistry::stop_all`] on
/// shutdown.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(connector: Arc<dyn PlazaConnector>, config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connector,
                config,
                sessions: RwLock::default(),
                lifecycle: Mutex::default(),
                reconnect_failed: Arc::default(),
                task_factories: RwLock::default(),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn set_reconnect_failed_callback(
        &self,
        callback: ReconnectFailedCallback,
    ) -> Result<(), SessionError> {
        if self.inner.reconnect_failed.set(callback) {
            Ok(())
        } else {
            Err(SessionError::LockPoisoned)
        }
    }

    /// Attaches a background task to every session started afterwards.
    pub fn register_task_factory(
        &self,
        factory: Arc<dyn SessionTaskFactory>,
    ) -> Result<(), SessionError> {
        let mut factories = self
            .inner
            .task_factories
            .write()
            .map_err(|_| SessionError::LockPoisoned)?;
        info!(task = factory.name(), "session task factory registered");
        factories.push(factory);
        Ok(())
    }

    /// Opens a session for `(actor, house)`, tearing down any existing one
    /// first. Returns once login has been requested; the session turns
    /// online when the platform confirms.
    pub async fn start_session(
        &self,
        actor: ActorId,
        house: HouseId,
        credentials: PlazaCredentials,
        handler: Box<dyn PlazaEventHandler>,
    ) -> Result<Arc<Session>, SessionError> {
        let key = SessionKey::new(actor, house);
        let lifecycle = self.lifecycle_lock(key)?;
        let _guard = lifecycle.lock().await;

        if let Some(previous) = self.remove(key)? {
            info!(key = %key, "replacing existing platform session");
            previous.shut_down().await?;
        }

        let PlazaLink { connection, events } = self
            .inner
            .connector
            .connect(ConnectParams {
                house,
                credentials,
                keepalive: self.inner.config.keepalive,
                reconnect: self.inner.config.reconnect,
            })
            .await?;

        let session = Arc::new(Session::new(key, connection.clone()));
        let wrapped = SessionBookkeeping::new(
            session.clone(),
            self.inner.reconnect_failed.clone(),
            handler,
        );
        let ctx = SessionContext {
            key,
            connection: connection.clone(),
        };
        let dispatcher = tokio::spawn(run_dispatch(
            Box::new(wrapped),
            ctx,
            events,
            session.shutdown_signal(),
        ));
        session.attach_task(dispatcher)?;

        if let Err(err) = connection.login().await {
            warn!(key = %key, error = %err, "platform login request failed");
            session.shut_down().await?;
            return Err(err.into());
        }

        for factory in self.task_factories()? {
            if let Some(task) = factory.spawn(session.clone()) {
                debug!(key = %key, task = factory.name(), "session task started");
                session.attach_task(task)?;
            }
        }

        self.inner
            .sessions
            .write()
            .map_err(|_| SessionError::LockPoisoned)?
            .insert(key, session.clone());
        info!(key = %key, "platform session started");
        Ok(session)
    }

    /// Stops the session for `(actor, house)` and waits for its tasks. A
    /// missing session is not an error.
    pub async fn stop_session(&self, actor: ActorId, house: HouseId) -> Result<(), SessionError> {
        let key = SessionKey::new(actor, house);
        let lifecycle = self.lifecycle_lock(key)?;
        let guard = lifecycle.lock().await;
        let outcome = match self.remove(key)? {
            Some(session) => {
                let outcome = session.shut_down().await;
                if outcome.is_ok() {
                    info!(key = %key, "platform session stopped");
                }
                outcome
            }
            None => {
                debug!(key = %key, "stop requested for unknown session");
                Ok(())
            }
        };
        drop(guard);
        self.release_lifecycle_lock(key, &lifecycle)?;
        outcome
    }

    pub async fn stop_all(&self) -> Result<(), SessionError> {
        let keys = self.sessions()?;
        info!(sessions = keys.len(), "stopping all platform sessions");
        for key in keys {
            self.stop_session(key.actor, key.house).await?;
        }
        Ok(())
    }

    pub fn get(&self, actor: ActorId, house: HouseId) -> Result<Option<Arc<Session>>, SessionError> {
        Ok(self
            .read_sessions()?
            .get(&SessionKey::new(actor, house))
            .cloned())
    }

    /// Any live session for the house, preferring online ones. Platform
    /// snapshots are scoped to the house, so this is good enough for
    /// read-only listings.
    pub fn get_any_by_house(&self, house: HouseId) -> Result<Option<Arc<Session>>, SessionError> {
        Ok(self
            .read_sessions()?
            .values()
            .filter(|s| s.key().house == house)
            .max_by_key(|s| (s.is_online(), std::cmp::Reverse(s.key())))
            .cloned())
    }

    pub fn get_by_user(&self, actor: ActorId) -> Result<Option<Arc<Session>>, SessionError> {
        Ok(self
            .read_sessions()?
            .values()
            .filter(|s| s.key().actor == actor)
            .min_by_key(|s| s.key())
            .cloned())
    }

    pub fn sessions(&self) -> Result<Vec<SessionKey>, SessionError> {
        let mut keys: Vec<SessionKey> = self.read_sessions()?.keys().copied().collect();
        keys.sort_unstable();
        Ok(keys)
    }

    pub fn is_online(&self, actor: ActorId, house: HouseId) -> Result<bool, SessionError> {
        Ok(self
            .get(actor, house)?
            .is_some_and(|session| session.is_online()))
    }

    /// Polls until the session reports online or `timeout` passes.
    pub async fn wait_online(
        &self,
        actor: ActorId,
        house: HouseId,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let started = Instant::now();
        loop {
            if self.is_online(actor, house)? {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(SessionError::WaitOnlineTimeout {
                    key: SessionKey::new(actor, house),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.inner.config.wait_online_poll).await;
        }
    }

    pub fn snapshots(&self) -> Result<Vec<SessionSnapshot>, SessionError> {
        let mut snapshots = self
            .read_sessions()?
            .values()
            .map(|s| s.snapshot())
            .collect::<Result<Vec<_>, _>>()?;
        snapshots.sort_by_key(|s| s.key);
        Ok(snapshots)
    }

    pub fn metrics(&self) -> Result<RegistryMetrics, SessionError> {
        let sessions = self.read_sessions()?;
        Ok(RegistryMetrics {
            total: sessions.len(),
            online: sessions.values().filter(|s| s.is_online()).count(),
            restarts: sessions
                .iter()
                .map(|(key, s)| (key.to_string(), s.restart_count()))
                .collect(),
        })
    }

    /// Unhealthy once fewer than half of the sessions are online.
    pub fn health(&self) -> Result<RegistryHealth, SessionError> {
        let metrics = self.metrics()?;
        let healthy = metrics.total == 0 || metrics.online * 2 >= metrics.total;
        Ok(RegistryHealth { healthy, metrics })
    }

    /// Validates credentials without registering a session.
    pub async fn probe_login(
        &self,
        house: HouseId,
        credentials: PlazaCredentials,
    ) -> Result<bool, SessionError> {
        match self.probe_login_with_info(house, credentials).await {
            Ok(_) => Ok(true),
            Err(SessionError::LoginRejected(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Like [`Self::probe_login`] but returns the account details reported
    /// by the platform.
    pub async fn probe_login_with_info(
        &self,
        house: HouseId,
        credentials: PlazaCredentials,
    ) -> Result<LoginInfo, SessionError> {
        let account = credentials.account.clone();
        let PlazaLink {
            connection,
            mut events,
        } = self
            .inner
            .connector
            .connect(ConnectParams {
                house,
                credentials,
                keepalive: self.inner.config.keepalive,
                reconnect: self.inner.config.reconnect,
            })
            .await?;

        let outcome = probe_once(
            connection.as_ref(),
            &mut events,
            self.inner.config.probe_login_timeout,
        )
        .await;
        connection.close().await;

        match &outcome {
            Ok(_) => info!(house = %house, account = %account, "probe login succeeded"),
            Err(err) => warn!(house = %house, account = %account, error = %err, "probe login failed"),
        }
        outcome
    }

    fn lifecycle_lock(&self, key: SessionKey) -> Result<Arc<tokio::sync::Mutex<()>>, SessionError> {
        let mut locks = self
            .inner
            .lifecycle
            .lock()
            .map_err(|_| SessionError::LockPoisoned)?;
        Ok(locks.entry(key).or_default().clone())
    }

    /// Forgets the lock for `key` once only the map and the caller hold it.
    fn release_lifecycle_lock(
        &self,
        key: SessionKey,
        lifecycle: &Arc<tokio::sync::Mutex<()>>,
    ) -> Result<(), SessionError> {
        let mut locks = self
            .inner
            .lifecycle
            .lock()
            .map_err(|_| SessionError::LockPoisoned)?;
        if Arc::strong_count(lifecycle) == 2 {
            locks.remove(&key);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn tracked_lifecycle_locks(&self) -> usize {
        self.inner.lifecycle.lock().map(|l| l.len()).unwrap_or_default()
    }

    fn remove(&self, key: SessionKey) -> Result<Option<Arc<Session>>, SessionError> {
        Ok(self
            .inner
            .sessions
            .write()
            .map_err(|_| SessionError::LockPoisoned)?
            .remove(&key))
    }

    fn read_sessions(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<SessionKey, Arc<Session>>>, SessionError>
    {
        self.inner
            .sessions
            .read()
            .map_err(|_| SessionError::LockPoisoned)
    }

    fn task_factories(&self) -> Result<Vec<Arc<dyn SessionTaskFactory>>, SessionError> {
        Ok(self
            .inner
            .task_factories
            .read()
            .map_err(|_| SessionError::LockPoisoned)?
            .clone())
    }
}

async fn probe_once(
    connection: &dyn PlazaConnection,
    events: &mut mpsc::Receiver<PlazaEvent>,
    timeout: Duration,
) -> Result<LoginInfo, SessionError> {
    connection.login().await?;
    match tokio::time::timeout(timeout, wait_login_done(events)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(SessionError::ProbeTimeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

async fn wait_login_done(
    events: &mut mpsc::Receiver<PlazaEvent>,
) -> Result<LoginInfo, SessionError> {
    while let Some(event) = events.recv().await {
        if let PlazaEvent::LoginDone {
            success,
            message,
            info,
        } = event
        {
            return if success {
                Ok(info.unwrap_or_default())
            } else {
                Err(SessionError::LoginRejected(message))
            };
        }
    }
    Err(SessionError::EventStreamClosed)
}

async fn run_dispatch(
    mut handler: Box<dyn PlazaEventHandler>,
    mut ctx: SessionContext,
    mut events: mpsc::Receiver<PlazaEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = events.recv() => match event {
                Some(event) => {
                    debug!(key = %ctx.key, event = event.name(), "dispatching platform event");
                    dispatch_event(handler.as_mut(), &mut ctx, event).await;
                }
                None => {
                    debug!(key = %ctx.key, "platform event stream closed");
                    break;
                }
            },
        }
    }
}
