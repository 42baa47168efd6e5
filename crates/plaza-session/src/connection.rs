use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use plaza_domain::{
    GameKindId, HouseApplication, HouseId, LoginInfo, MappedTableNum, MemberInfo, PlayerId,
    SeatEvent, StandEvent, TableInfo,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::reconnect::ReconnectPolicy;
use crate::PlazaError;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlazaCredentials {
    pub account: String,
    pub password: String,
    pub platform_key: String,
}

impl fmt::Debug for PlazaCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlazaCredentials")
            .field("account", &self.account)
            .field("password", &"<redacted>")
            .field("platform_key", &self.platform_key)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub house: HouseId,
    pub credentials: PlazaCredentials,
    pub keepalive: Duration,
    pub reconnect: ReconnectPolicy,
}

/// Commands sent to the platform over one live connection. Listing requests
/// are answered asynchronously through the event stream.
#[async_trait]
pub trait PlazaConnection: Send + Sync + fmt::Debug {
    async fn login(&self) -> Result<(), PlazaError>;

    /// Answered by `MemberListUpdated`, and after a reconnect also by a
    /// fresh room list.
    async fn get_group_members(&self) -> Result<(), PlazaError>;

    /// Answered by `RoomListUpdated`.
    async fn list_tables(&self) -> Result<(), PlazaError>;

    async fn query_table(&self, table: MappedTableNum) -> Result<(), PlazaError>;

    async fn dismiss_table(&self, kind: GameKindId, table: MappedTableNum)
        -> Result<(), PlazaError>;

    async fn forbid_members(
        &self,
        key: &str,
        members: &[PlayerId],
        forbid: bool,
    ) -> Result<(), PlazaError>;

    async fn kick_member(&self, member: PlayerId) -> Result<(), PlazaError>;

    async fn get_diamond(&self) -> Result<i64, PlazaError>;

    async fn close(&self);
}

/// A freshly opened connection and the push stream that belongs to it. The
/// stream outlives transport-level reconnects.
#[derive(Debug)]
pub struct PlazaLink {
    pub connection: Arc<dyn PlazaConnection>,
    pub events: mpsc::Receiver<PlazaEvent>,
}

#[async_trait]
pub trait PlazaConnector: Send + Sync {
    async fn connect(&self, params: ConnectParams) -> Result<PlazaLink, PlazaError>;
}

#[derive(Debug, Clone)]
pub enum PlazaEvent {
    LoginDone {
        success: bool,
        message: String,
        info: Option<LoginInfo>,
    },
    /// The transport reconnected on its own and now talks through `connection`.
    SessionRestarted {
        connection: Arc<dyn PlazaConnection>,
    },
    RoomListUpdated {
        tables: Vec<TableInfo>,
    },
    MemberListUpdated {
        members: Vec<MemberInfo>,
    },
    MemberInserted(MemberInfo),
    MemberDeleted {
        player: PlayerId,
    },
    MemberRightUpdated {
        player: PlayerId,
        right: i32,
    },
    Seat(SeatEvent),
    Stand(StandEvent),
    TableRenew(TableInfo),
    TableDismissed {
        mapped_num: MappedTableNum,
    },
    ReconnectFailed {
        house: HouseId,
        retry_count: u32,
    },
    AppliesForHouse(Vec<HouseApplication>),
}

impl PlazaEvent {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::LoginDone { .. } => "login_done",
            Self::SessionRestarted { .. } => "session_restarted",
            Self::RoomListUpdated { .. } => "room_list_updated",
            Self::MemberListUpdated { .. } => "member_list_updated",
            Self::MemberInserted(_) => "member_inserted",
            Self::MemberDeleted { .. } => "member_deleted",
            Self::MemberRightUpdated { .. } => "member_right_updated",
            Self::Seat(_) => "seat",
            Self::Stand(_) => "stand",
            Self::TableRenew(_) => "table_renew",
            Self::TableDismissed { .. } => "table_dismissed",
            Self::ReconnectFailed { .. } => "reconnect_failed",
            Self::AppliesForHouse(_) => "applies_for_house",
        }
    }
}
