use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use plaza_domain::{GameKindId, HouseId, LoginInfo, MappedTableNum, MemberInfo, PlayerId, TableInfo};
use tokio::sync::mpsc;
use tracing::debug;

use crate::connection::{ConnectParams, PlazaConnection, PlazaConnector, PlazaEvent, PlazaLink};
use crate::PlazaError;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlazaCommand {
    Login,
    GetGroupMembers,
    ListTables,
    QueryTable(MappedTableNum),
    DismissTable {
        kind: GameKindId,
        mapped_num: MappedTableNum,
    },
    ForbidMembers {
        key: String,
        members: Vec<PlayerId>,
        forbid: bool,
    },
    KickMember(PlayerId),
    GetDiamond,
}

#[derive(Debug, Default)]
struct PlazaState {
    connections: Vec<Arc<InMemoryConnection>>,
    tables: HashMap<HouseId, Vec<TableInfo>>,
    members: HashMap<HouseId, Vec<MemberInfo>>,
    rejected_accounts: HashSet<String>,
    diamonds: HashMap<HouseId, i64>,
    /// Reconnect attempts that fail before one succeeds.
    failing_reconnects: u32,
    silent_login: bool,
}

/// Scriptable stand-in for the platform. Answers listing requests from its
/// configured tables and members, accepts logins unless the account was
/// rejected, and lets tests push arbitrary events or simulate reconnects.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPlaza {
    state: Arc<Mutex<PlazaState>>,
    next_id: Arc<AtomicU64>,
}

#[derive(Debug)]
pub struct InMemoryConnection {
    id: u64,
    house: HouseId,
    account: String,
    params: ConnectParams,
    events: mpsc::Sender<PlazaEvent>,
    state: Arc<Mutex<PlazaState>>,
    commands: Mutex<Vec<PlazaCommand>>,
    closed: AtomicBool,
}

impl InMemoryPlaza {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tables(&self, house: HouseId, tables: Vec<TableInfo>) -> Result<(), PlazaError> {
        self.with_state(|state| {
            state.tables.insert(house, tables);
        })
    }

    pub fn set_members(&self, house: HouseId, members: Vec<MemberInfo>) -> Result<(), PlazaError> {
        self.with_state(|state| {
            state.members.insert(house, members);
        })
    }

    pub fn set_diamond(&self, house: HouseId, diamonds: i64) -> Result<(), PlazaError> {
        self.with_state(|state| {
            state.diamonds.insert(house, diamonds);
        })
    }

    pub fn reject_account(&self, account: impl Into<String>) -> Result<(), PlazaError> {
        let account = account.into();
        self.with_state(|state| {
            state.rejected_accounts.insert(account);
        })
    }

    /// Logins are accepted but never answered while set.
    pub fn set_silent_login(&self, silent: bool) -> Result<(), PlazaError> {
        self.with_state(|state| state.silent_login = silent)
    }

    pub fn set_failing_reconnects(&self, attempts: u32) -> Result<(), PlazaError> {
        self.with_state(|state| state.failing_reconnects = attempts)
    }

    /// Latest connection opened for the house.
    pub fn connection(&self, house: HouseId) -> Result<Option<Arc<InMemoryConnection>>, PlazaError> {
        self.with_state(|state| {
            state
                .connections
                .iter()
                .rev()
                .find(|c| c.house == house)
                .cloned()
        })
    }

    pub fn connect_count(&self) -> Result<usize, PlazaError> {
        self.with_state(|state| state.connections.len())
    }

    pub fn open_connections(&self, house: HouseId) -> Result<usize, PlazaError> {
        self.with_state(|state| {
            state
                .connections
                .iter()
                .filter(|c| c.house == house && !c.is_closed())
                .count()
        })
    }

    /// Every command sent on any connection for the house, oldest first.
    pub fn commands(&self, house: HouseId) -> Result<Vec<PlazaCommand>, PlazaError> {
        let connections = self.with_state(|state| {
            state
                .connections
                .iter()
                .filter(|c| c.house == house)
                .cloned()
                .collect::<Vec<_>>()
        })?;
        let mut commands = Vec::new();
        for connection in connections {
            commands.extend(connection.commands()?);
        }
        Ok(commands)
    }

    /// Delivers `event` on the stream of the latest connection for the house.
    pub async fn push(&self, house: HouseId, event: PlazaEvent) -> Result<(), PlazaError> {
        let connection = self.connection(house)?.ok_or(PlazaError::NotConnected)?;
        connection.emit(event).await
    }

    /// Drops the latest connection for the house and reconnects under its
    /// reconnect policy. Success pushes `SessionRestarted`; exhaustion pushes
    /// `ReconnectFailed`.
    pub async fn simulate_disconnect(&self, house: HouseId) -> Result<bool, PlazaError> {
        let previous = self.connection(house)?.ok_or(PlazaError::NotConnected)?;
        previous.closed.store(true, Ordering::Release);
        let policy = previous.params.reconnect;

        let outcome = policy
            .retry(|_| async move {
                let fail = self.with_state(|state| {
                    if state.failing_reconnects > 0 {
                        state.failing_reconnects -= 1;
                        true
                    } else {
                        false
                    }
                });
                match fail {
                    Ok(true) => Err(PlazaError::Transport("connection refused".to_string())),
                    Ok(false) => Ok(()),
                    Err(err) => Err(err),
                }
            })
            .await;

        match outcome {
            Ok(()) => {
                let (connection, _) =
                    self.open(previous.params.clone(), Some(previous.events.clone()))?;
                previous
                    .emit(PlazaEvent::SessionRestarted { connection })
                    .await?;
                Ok(true)
            }
            Err(retry_count) => {
                previous
                    .emit(PlazaEvent::ReconnectFailed { house, retry_count })
                    .await?;
                Ok(false)
            }
        }
    }

    fn open(
        &self,
        params: ConnectParams,
        events: Option<mpsc::Sender<PlazaEvent>>,
    ) -> Result<(Arc<InMemoryConnection>, Option<mpsc::Receiver<PlazaEvent>>), PlazaError> {
        let (sender, receiver) = match events {
            Some(sender) => (sender, None),
            None => {
                let (tx, rx) = mpsc::channel(EVENT_BUFFER);
                (tx, Some(rx))
            }
        };
        let connection = Arc::new(InMemoryConnection {
            id: self.next_id.fetch_add(1, Ordering::AcqRel) + 1,
            house: params.house,
            account: params.credentials.account.clone(),
            params,
            events: sender,
            state: self.state.clone(),
            commands: Mutex::default(),
            closed: AtomicBool::new(false),
        });
        self.with_state(|state| state.connections.push(connection.clone()))?;
        debug!(house = %connection.house, connection = connection.id, "in-memory connection opened");
        Ok((connection, receiver))
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut PlazaState) -> T) -> Result<T, PlazaError> {
        let mut state = self.state.lock().map_err(|_| PlazaError::LockPoisoned)?;
        Ok(f(&mut state))
    }
}

#[async_trait]
impl PlazaConnector for InMemoryPlaza {
    async fn connect(&self, params: ConnectParams) -> Result<PlazaLink, PlazaError> {
        let (connection, events) = self.open(params, None)?;
        let events = events.ok_or(PlazaError::NotConnected)?;
        Ok(PlazaLink { connection, events })
    }
}

impl InMemoryConnection {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn commands(&self) -> Result<Vec<PlazaCommand>, PlazaError> {
        Ok(self
            .commands
            .lock()
            .map_err(|_| PlazaError::LockPoisoned)?
            .clone())
    }

    fn record(&self, command: PlazaCommand) -> Result<(), PlazaError> {
        if self.is_closed() {
            return Err(PlazaError::Closed);
        }
        self.commands
            .lock()
            .map_err(|_| PlazaError::LockPoisoned)?
            .push(command);
        Ok(())
    }

    fn read_state<T>(&self, f: impl FnOnce(&PlazaState) -> T) -> Result<T, PlazaError> {
        let state = self.state.lock().map_err(|_| PlazaError::LockPoisoned)?;
        Ok(f(&state))
    }

    async fn emit(&self, event: PlazaEvent) -> Result<(), PlazaError> {
        self.events
            .send(event)
            .await
            .map_err(|_| PlazaError::Closed)
    }
}

#[async_trait]
impl PlazaConnection for InMemoryConnection {
    async fn login(&self) -> Result<(), PlazaError> {
        self.record(PlazaCommand::Login)?;
        let (silent, rejected) = self.read_state(|state| {
            (
                state.silent_login,
                state.rejected_accounts.contains(&self.account),
            )
        })?;
        if silent {
            return Ok(());
        }
        let event = if rejected {
            PlazaEvent::LoginDone {
                success: false,
                message: "invalid credentials".to_string(),
                info: None,
            }
        } else {
            PlazaEvent::LoginDone {
                success: true,
                message: String::new(),
                info: Some(LoginInfo {
                    user_id: self.id as i64,
                    nickname: self.account.clone(),
                    houses: vec![self.house],
                }),
            }
        };
        self.emit(event).await
    }

    async fn get_group_members(&self) -> Result<(), PlazaError> {
        self.record(PlazaCommand::GetGroupMembers)?;
        let members = self.read_state(|state| {
            state.members.get(&self.house).cloned().unwrap_or_default()
        })?;
        self.emit(PlazaEvent::MemberListUpdated { members }).await
    }

    async fn list_tables(&self) -> Result<(), PlazaError> {
        self.record(PlazaCommand::ListTables)?;
        let tables = self.read_state(|state| {
            state.tables.get(&self.house).cloned().unwrap_or_default()
        })?;
        self.emit(PlazaEvent::RoomListUpdated { tables }).await
    }

    async fn query_table(&self, table: MappedTableNum) -> Result<(), PlazaError> {
        self.record(PlazaCommand::QueryTable(table))?;
        let found = self.read_state(|state| {
            state
                .tables
                .get(&self.house)
                .and_then(|tables| tables.iter().find(|t| t.mapped_num == table).cloned())
        })?;
        match found {
            Some(info) => self.emit(PlazaEvent::TableRenew(info)).await,
            None => Ok(()),
        }
    }

    async fn dismiss_table(
        &self,
        kind: GameKindId,
        table: MappedTableNum,
    ) -> Result<(), PlazaError> {
        self.record(PlazaCommand::DismissTable {
            kind,
            mapped_num: table,
        })
    }

    async fn forbid_members(
        &self,
        key: &str,
        members: &[PlayerId],
        forbid: bool,
    ) -> Result<(), PlazaError> {
        self.record(PlazaCommand::ForbidMembers {
            key: key.to_string(),
            members: members.to_vec(),
            forbid,
        })
    }

    async fn kick_member(&self, member: PlayerId) -> Result<(), PlazaError> {
        self.record(PlazaCommand::KickMember(member))
    }

    async fn get_diamond(&self) -> Result<i64, PlazaError> {
        self.record(PlazaCommand::GetDiamond)?;
        self.read_state(|state| state.diamonds.get(&self.house).copied().unwrap_or_default())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(house = %self.house, connection = self.id, "in-memory connection closed");
        }
    }
}
