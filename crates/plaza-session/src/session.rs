use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use plaza_domain::{LoginInfo, SessionKey};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::connection::PlazaConnection;
use crate::SessionError;

/// One live platform session. Owned by the registry; handed out as
/// `Arc<Session>` for read-only use.
#[derive(Debug)]
pub struct Session {
    key: SessionKey,
    started_at: DateTime<Utc>,
    online: AtomicBool,
    restart_count: AtomicU64,
    last_restart: Mutex<Option<DateTime<Utc>>>,
    connection: RwLock<Arc<dyn PlazaConnection>>,
    login_info: Mutex<Option<LoginInfo>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub key: SessionKey,
    pub online: bool,
    pub restart_count: u64,
    pub started_at: DateTime<Utc>,
    pub last_restart: Option<DateTime<Utc>>,
}

impl Session {
    pub(crate) fn new(key: SessionKey, connection: Arc<dyn PlazaConnection>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            key,
            started_at: Utc::now(),
            online: AtomicBool::new(false),
            restart_count: AtomicU64::new(0),
            last_restart: Mutex::new(None),
            connection: RwLock::new(connection),
            login_info: Mutex::new(None),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn key(&self) -> SessionKey {
        self.key
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn restart_count(&self) -> u64 {
        self.restart_count.load(Ordering::Acquire)
    }

    pub fn last_restart(&self) -> Result<Option<DateTime<Utc>>, SessionError> {
        Ok(*self
            .last_restart
            .lock()
            .map_err(|_| SessionError::LockPoisoned)?)
    }

    /// The connection currently serving this session. Replaced on every
    /// transport reconnect.
    pub fn connection(&self) -> Result<Arc<dyn PlazaConnection>, SessionError> {
        Ok(self
            .connection
            .read()
            .map_err(|_| SessionError::LockPoisoned)?
            .clone())
    }

    pub fn login_info(&self) -> Result<Option<LoginInfo>, SessionError> {
        Ok(self
            .login_info
            .lock()
            .map_err(|_| SessionError::LockPoisoned)?
            .clone())
    }

    /// Resolves once the session is being stopped.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        Ok(SessionSnapshot {
            key: self.key,
            online: self.is_online(),
            restart_count: self.restart_count(),
            started_at: self.started_at,
            last_restart: self.last_restart()?,
        })
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    pub(crate) fn set_login_info(&self, info: Option<LoginInfo>) -> Result<(), SessionError> {
        *self
            .login_info
            .lock()
            .map_err(|_| SessionError::LockPoisoned)? = info;
        Ok(())
    }

    pub(crate) fn record_restart(
        &self,
        connection: Arc<dyn PlazaConnection>,
    ) -> Result<u64, SessionError> {
        *self
            .connection
            .write()
            .map_err(|_| SessionError::LockPoisoned)? = connection;
        *self
            .last_restart
            .lock()
            .map_err(|_| SessionError::LockPoisoned)? = Some(Utc::now());
        Ok(self.restart_count.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub(crate) fn attach_task(&self, handle: JoinHandle<()>) -> Result<(), SessionError> {
        self.tasks
            .lock()
            .map_err(|_| SessionError::LockPoisoned)?
            .push(handle);
        Ok(())
    }

    /// Signals every attached task, closes the connection and waits for the
    /// tasks to finish their current iteration.
    pub(crate) async fn shut_down(&self) -> Result<(), SessionError> {
        self.shutdown.send_replace(true);
        let connection = self.connection()?;
        connection.close().await;
        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .map_err(|_| SessionError::LockPoisoned)?,
        );
        for task in tasks {
            // A task that panicked is already gone; nothing left to wait for.
            let _ = task.await;
        }
        self.set_online(false);
        Ok(())
    }
}
