use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use plaza_domain::{
    ActorId, HouseApplication, HouseId, LoginInfo, MappedTableNum, MemberInfo, PlayerId,
    SeatEvent, StandEvent, TableInfo,
};
use tracing::{debug, info, warn};

use crate::handler::{PlazaEventHandler, SessionContext};
use crate::session::Session;

/// Invoked with `(house, retry_count)` once the transport gives up
/// reconnecting; returns the controlling account to deactivate, if known.
pub type ReconnectFailedCallback = Arc<dyn Fn(HouseId, u32) -> Option<ActorId> + Send + Sync>;

#[derive(Default)]
pub(crate) struct CallbackSlot(RwLock<Option<ReconnectFailedCallback>>);

impl CallbackSlot {
    pub(crate) fn set(&self, callback: ReconnectFailedCallback) -> bool {
        match self.0.write() {
            Ok(mut slot) => {
                *slot = Some(callback);
                true
            }
            Err(_) => false,
        }
    }

    fn get(&self) -> Option<ReconnectFailedCallback> {
        self.0.read().ok().and_then(|slot| slot.clone())
    }
}

/// Decorator that keeps session bookkeeping in step with the event stream
/// and then forwards every event, unchanged, to the business handler.
pub struct SessionBookkeeping {
    session: Arc<Session>,
    callback: Arc<CallbackSlot>,
    inner: Box<dyn PlazaEventHandler>,
}

impl SessionBookkeeping {
    pub(crate) fn new(
        session: Arc<Session>,
        callback: Arc<CallbackSlot>,
        inner: Box<dyn PlazaEventHandler>,
    ) -> Self {
        Self {
            session,
            callback,
            inner,
        }
    }
}

async fn request_member_list(ctx: &SessionContext, reason: &'static str) {
    if let Err(err) = ctx.connection.get_group_members().await {
        warn!(key = %ctx.key, reason, error = %err, "member list request failed");
    }
}

#[async_trait]
impl PlazaEventHandler for SessionBookkeeping {
    async fn on_login_done(
        &mut self,
        ctx: &SessionContext,
        success: bool,
        message: &str,
        info: Option<&LoginInfo>,
    ) {
        self.session.set_online(success);
        if let Err(err) = self.session.set_login_info(info.cloned()) {
            warn!(key = %ctx.key, error = %err, "failed to store login info");
        }
        if success {
            info!(key = %ctx.key, "platform login confirmed");
            request_member_list(ctx, "login").await;
        } else {
            warn!(key = %ctx.key, reason = message, "platform login rejected");
        }
        self.inner.on_login_done(ctx, success, message, info).await;
    }

    async fn on_session_restarted(&mut self, ctx: &SessionContext) {
        match self.session.record_restart(ctx.connection.clone()) {
            Ok(restarts) => info!(key = %ctx.key, restarts, "platform session restarted"),
            Err(err) => warn!(key = %ctx.key, error = %err, "failed to record restart"),
        }
        // After a reconnect the platform only re-pushes room data in answer
        // to a member list request.
        request_member_list(ctx, "restart").await;
        self.inner.on_session_restarted(ctx).await;
    }

    async fn on_room_list_updated(&mut self, ctx: &SessionContext, tables: &[TableInfo]) {
        debug!(key = %ctx.key, tables = tables.len(), "room list updated");
        self.inner.on_room_list_updated(ctx, tables).await;
    }

    async fn on_member_list_updated(&mut self, ctx: &SessionContext, members: &[MemberInfo]) {
        debug!(key = %ctx.key, members = members.len(), "member list updated");
        self.inner.on_member_list_updated(ctx, members).await;
    }

    async fn on_member_inserted(&mut self, ctx: &SessionContext, member: &MemberInfo) {
        self.inner.on_member_inserted(ctx, member).await;
    }

    async fn on_member_deleted(&mut self, ctx: &SessionContext, player: PlayerId) {
        self.inner.on_member_deleted(ctx, player).await;
    }

    async fn on_member_right_updated(&mut self, ctx: &SessionContext, player: PlayerId, right: i32) {
        self.inner.on_member_right_updated(ctx, player, right).await;
    }

    async fn on_seat(&mut self, ctx: &SessionContext, seat: SeatEvent) {
        self.inner.on_seat(ctx, seat).await;
    }

    async fn on_stand(&mut self, ctx: &SessionContext, stand: StandEvent) {
        self.inner.on_stand(ctx, stand).await;
    }

    async fn on_table_renew(&mut self, ctx: &SessionContext, table: &TableInfo) {
        self.inner.on_table_renew(ctx, table).await;
    }

    async fn on_table_dismissed(&mut self, ctx: &SessionContext, table: MappedTableNum) {
        self.inner.on_table_dismissed(ctx, table).await;
    }

    async fn on_reconnect_failed(&mut self, ctx: &SessionContext, house: HouseId, retry_count: u32) {
        self.session.set_online(false);
        match self.callback.get() {
            Some(callback) => match callback(house, retry_count) {
                Some(actor) => warn!(
                    key = %ctx.key,
                    house = %house,
                    retry_count,
                    deactivate = %actor,
                    "reconnect failed; controlling account reported for deactivation"
                ),
                None => warn!(
                    key = %ctx.key,
                    house = %house,
                    retry_count,
                    "reconnect failed; no controlling account resolved"
                ),
            },
            None => warn!(
                key = %ctx.key,
                house = %house,
                retry_count,
                "reconnect failed; no callback registered"
            ),
        }
        self.inner.on_reconnect_failed(ctx, house, retry_count).await;
    }

    async fn on_applies_for_house(
        &mut self,
        ctx: &SessionContext,
        applications: &[HouseApplication],
    ) {
        self.inner.on_applies_for_house(ctx, applications).await;
    }
}
