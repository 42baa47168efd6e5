use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ledger_store::{BattleRecordRepository, MemberRepository};
use platform_core::BattleSyncSection;
use plaza_domain::{BattleRecord, BattleRoom, HouseId};
use plaza_session::{Session, SessionTaskFactory};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::feed::BattleFeed;
use crate::BattleSyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BattleSyncConfig {
    pub poll_interval: Duration,
    /// Window of the first pull after start, so cold starts and reconnects
    /// do not skip history.
    pub initial_lookback: Duration,
    pub lookback: Duration,
}

impl Default for BattleSyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            initial_lookback: Duration::from_secs(3600),
            lookback: Duration::from_secs(300),
        }
    }
}

impl From<&BattleSyncSection> for BattleSyncConfig {
    fn from(section: &BattleSyncSection) -> Self {
        Self {
            poll_interval: Duration::from_secs(section.poll_interval_secs.max(1)),
            initial_lookback: Duration::from_secs(section.initial_lookback_secs),
            lookback: Duration::from_secs(section.lookback_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub rooms_seen: usize,
    pub rooms_discarded: usize,
    pub rows_inserted: usize,
    pub rows_skipped: usize,
}

/// Pulls finished rooms for one house and persists one row per player.
pub struct BattleSyncPoller {
    house: HouseId,
    feed: Arc<dyn BattleFeed>,
    records: Arc<dyn BattleRecordRepository>,
    members: Arc<dyn MemberRepository>,
    config: BattleSyncConfig,
    synced_once: bool,
}

impl BattleSyncPoller {
    #[must_use]
    pub fn new(
        house: HouseId,
        feed: Arc<dyn BattleFeed>,
        records: Arc<dyn BattleRecordRepository>,
        members: Arc<dyn MemberRepository>,
        config: BattleSyncConfig,
    ) -> Self {
        Self {
            house,
            feed,
            records,
            members,
            config,
            synced_once: false,
        }
    }

    fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let lookback = if self.synced_once {
            self.config.lookback
        } else {
            self.config.initial_lookback
        };
        chrono::Duration::from_std(lookback)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// One pull-validate-persist cycle. The wide first window is kept until a
    /// pull succeeds.
    pub async fn sync_once(&mut self) -> Result<SyncReport, BattleSyncError> {
        let since = self.window_start(Utc::now());
        let batch = self.feed.fetch_battles(self.house, since).await?;
        self.synced_once = true;

        let mut report = SyncReport {
            rooms_seen: batch.malformed,
            rooms_discarded: batch.malformed,
            ..SyncReport::default()
        };
        for room in batch.rooms {
            report.rooms_seen += 1;
            if room.house != self.house {
                debug!(house = %self.house, room_house = %room.house, room = %room.room_id, "room for another house ignored");
                report.rooms_discarded += 1;
                continue;
            }
            if !room.is_zero_sum() {
                warn!(
                    house = %self.house,
                    room = %room.room_id,
                    players = room.players.len(),
                    "battle room scores do not sum to zero; discarding"
                );
                report.rooms_discarded += 1;
                continue;
            }
            self.persist_room(&room, &mut report).await?;
        }

        if report.rows_inserted > 0 || report.rooms_discarded > 0 {
            info!(
                house = %self.house,
                rooms_seen = report.rooms_seen,
                rooms_discarded = report.rooms_discarded,
                rows_inserted = report.rows_inserted,
                rows_skipped = report.rows_skipped,
                "battle sync cycle finished"
            );
        } else {
            debug!(house = %self.house, rooms_seen = report.rooms_seen, "battle sync cycle idle");
        }
        Ok(report)
    }

    async fn persist_room(
        &self,
        room: &BattleRoom,
        report: &mut SyncReport,
    ) -> Result<(), BattleSyncError> {
        for score in &room.players {
            if self
                .records
                .record_exists(self.house, score.player, room.finished_at)
                .await?
            {
                report.rows_skipped += 1;
                continue;
            }
            let group_name = match self.members.get_member(self.house, score.player).await {
                Ok(member) => member.map(|m| m.group_name).unwrap_or_default(),
                Err(err) => {
                    warn!(house = %self.house, player = %score.player, error = %err, "group lookup failed; recording without group");
                    String::new()
                }
            };
            let record = BattleRecord {
                house: self.house,
                group_name,
                room_id: room.room_id.clone(),
                kind: room.kind,
                base_score: room.base_score,
                player: score.player,
                score: score.score,
                battle_at: room.finished_at,
                win: score.score > 0,
            };
            // A concurrent poller may have won the race since the check.
            if self.records.insert_record(&record).await? {
                report.rows_inserted += 1;
            } else {
                report.rows_skipped += 1;
            }
        }
        Ok(())
    }

    /// Pulls immediately, then on every interval tick until `shutdown` fires.
    /// A cycle in progress always completes before the task exits.
    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = self.sync_once().await {
                            warn!(house = %self.house, error = %err, "battle sync cycle failed");
                        }
                    }
                }
            }
            debug!(house = %self.house, "battle sync poller stopped");
        })
    }
}

/// Attaches one poller to every session the registry starts.
#[derive(Clone)]
pub struct BattleSyncTaskFactory {
    feed: Arc<dyn BattleFeed>,
    records: Arc<dyn BattleRecordRepository>,
    members: Arc<dyn MemberRepository>,
    config: BattleSyncConfig,
}

impl BattleSyncTaskFactory {
    #[must_use]
    pub fn new(
        feed: Arc<dyn BattleFeed>,
        records: Arc<dyn BattleRecordRepository>,
        members: Arc<dyn MemberRepository>,
        config: BattleSyncConfig,
    ) -> Self {
        Self {
            feed,
            records,
            members,
            config,
        }
    }
}

impl SessionTaskFactory for BattleSyncTaskFactory {
    fn name(&self) -> &'static str {
        "battle_sync"
    }

    fn spawn(&self, session: Arc<Session>) -> Option<JoinHandle<()>> {
        let poller = BattleSyncPoller::new(
            session.key().house,
            self.feed.clone(),
            self.records.clone(),
            self.members.clone(),
            self.config,
        );
        Some(poller.spawn(session.shutdown_signal()))
    }
}
