use std::sync::Arc;

use async_trait::async_trait;
use plaza_domain::{
    HouseApplication, HouseId, LoginInfo, MappedTableNum, MemberInfo, PlayerId, SeatEvent,
    SessionKey, StandEvent, TableInfo,
};

use crate::connection::{PlazaConnection, PlazaEvent};

/// What a handler sees of its session while reacting to one event.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub key: SessionKey,
    pub connection: Arc<dyn PlazaConnection>,
}

/// Business reaction to platform pushes. Every method defaults to doing
/// nothing. One session dispatches its events sequentially, so implementors
/// may keep plain mutable state.
#[async_trait]
pub trait PlazaEventHandler: Send {
    async fn on_login_done(
        &mut self,
        _ctx: &SessionContext,
        _success: bool,
        _message: &str,
        _info: Option<&LoginInfo>,
    ) {
    }

    async fn on_session_restarted(&mut self, _ctx: &SessionContext) {}

    async fn on_room_list_updated(&mut self, _ctx: &SessionContext, _tables: &[TableInfo]) {}

    async fn on_member_list_updated(&mut self, _ctx: &SessionContext, _members: &[MemberInfo]) {}

    async fn on_member_inserted(&mut self, _ctx: &SessionContext, _member: &MemberInfo) {}

    async fn on_member_deleted(&mut self, _ctx: &SessionContext, _player: PlayerId) {}

    async fn on_member_right_updated(
        &mut self,
        _ctx: &SessionContext,
        _player: PlayerId,
        _right: i32,
    ) {
    }

    async fn on_seat(&mut self, _ctx: &SessionContext, _seat: SeatEvent) {}

    async fn on_stand(&mut self, _ctx: &SessionContext, _stand: StandEvent) {}

    async fn on_table_renew(&mut self, _ctx: &SessionContext, _table: &TableInfo) {}

    async fn on_table_dismissed(&mut self, _ctx: &SessionContext, _table: MappedTableNum) {}

    async fn on_reconnect_failed(
        &mut self,
        _ctx: &SessionContext,
        _house: HouseId,
        _retry_count: u32,
    ) {
    }

    async fn on_applies_for_house(
        &mut self,
        _ctx: &SessionContext,
        _applications: &[HouseApplication],
    ) {
    }
}

/// Routes one event to the matching handler method. A restart swaps the
/// context's connection before the handler runs.
pub async fn dispatch_event(
    handler: &mut dyn PlazaEventHandler,
    ctx: &mut SessionContext,
    event: PlazaEvent,
) {
    match event {
        PlazaEvent::LoginDone {
            success,
            message,
            info,
        } => {
            handler
                .on_login_done(ctx, success, &message, info.as_ref())
                .await;
        }
        PlazaEvent::SessionRestarted { connection } => {
            ctx.connection = connection;
            handler.on_session_restarted(ctx).await;
        }
        PlazaEvent::RoomListUpdated { tables } => handler.on_room_list_updated(ctx, &tables).await,
        PlazaEvent::MemberListUpdated { members } => {
            handler.on_member_list_updated(ctx, &members).await;
        }
        PlazaEvent::MemberInserted(member) => handler.on_member_inserted(ctx, &member).await,
        PlazaEvent::MemberDeleted { player } => handler.on_member_deleted(ctx, player).await,
        PlazaEvent::MemberRightUpdated { player, right } => {
            handler.on_member_right_updated(ctx, player, right).await;
        }
        PlazaEvent::Seat(seat) => handler.on_seat(ctx, seat).await,
        PlazaEvent::Stand(stand) => handler.on_stand(ctx, stand).await,
        PlazaEvent::TableRenew(table) => handler.on_table_renew(ctx, &table).await,
        PlazaEvent::TableDismissed { mapped_num } => {
            handler.on_table_dismissed(ctx, mapped_num).await;
        }
        PlazaEvent::ReconnectFailed { house, retry_count } => {
            handler.on_reconnect_failed(ctx, house, retry_count).await;
        }
        PlazaEvent::AppliesForHouse(applications) => {
            handler.on_applies_for_house(ctx, &applications).await;
        }
    }
}

/// Handler that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventHandler;

#[async_trait]
impl PlazaEventHandler for NoopEventHandler {}
