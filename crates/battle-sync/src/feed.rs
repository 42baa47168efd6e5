use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plaza_domain::{BattleRoom, DomainError, GameKindId, HouseId, PlayerId, PlayerScore};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::BattleSyncError;

/// One pull's worth of rooms. Rooms the feed could not decode are dropped
/// individually and only counted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BattleBatch {
    pub rooms: Vec<BattleRoom>,
    pub malformed: usize,
}

/// Read side of the platform's finished-game API.
#[async_trait]
pub trait BattleFeed: Send + Sync {
    /// Rooms of `house` that finished at or after `since`.
    async fn fetch_battles(
        &self,
        house: HouseId,
        since: DateTime<Utc>,
    ) -> Result<BattleBatch, BattleSyncError>;
}

#[derive(Debug, Deserialize)]
struct BattleFeedResponse {
    #[serde(default)]
    battles: Vec<WireBattle>,
}

#[derive(Debug, Deserialize)]
struct WireBattle {
    room_id: String,
    kind_id: i32,
    base_score: i64,
    /// Unix seconds.
    finished_at: i64,
    players: Vec<WirePlayer>,
}

#[derive(Debug, Deserialize)]
struct WirePlayer {
    player_id: i64,
    score: i64,
}

impl WireBattle {
    fn into_room(self, house: HouseId) -> Result<BattleRoom, DomainError> {
        let finished_at = DateTime::<Utc>::from_timestamp(self.finished_at, 0).ok_or_else(|| {
            DomainError::InvalidBattlePayload(format!(
                "room {} has invalid finished_at {}",
                self.room_id, self.finished_at
            ))
        })?;
        if self.room_id.trim().is_empty() {
            return Err(DomainError::InvalidBattlePayload(
                "room_id must not be empty".to_string(),
            ));
        }
        Ok(BattleRoom {
            room_id: self.room_id,
            house,
            kind: GameKindId(self.kind_id),
            base_score: self.base_score,
            finished_at,
            players: self
                .players
                .into_iter()
                .map(|p| PlayerScore {
                    player: PlayerId(p.player_id),
                    score: p.score,
                })
                .collect(),
        })
    }
}

fn parse_battles(response: BattleFeedResponse, house: HouseId) -> BattleBatch {
    let mut batch = BattleBatch::default();
    for battle in response.battles {
        match battle.into_room(house) {
            Ok(room) => batch.rooms.push(room),
            Err(err) => {
                warn!(house = %house, error = %err, "malformed battle room; discarding");
                batch.malformed += 1;
            }
        }
    }
    batch
}

/// `GET {endpoint}?house_id=..&since=..` returning `{"battles": [...]}`.
#[derive(Debug, Clone)]
pub struct ReqwestBattleFeed {
    endpoint: String,
    client: reqwest::Client,
}

impl ReqwestBattleFeed {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, BattleSyncError> {
        Ok(Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl BattleFeed for ReqwestBattleFeed {
    async fn fetch_battles(
        &self,
        house: HouseId,
        since: DateTime<Utc>,
    ) -> Result<BattleBatch, BattleSyncError> {
        let response: BattleFeedResponse = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("house_id", house.get().to_string()),
                ("since", since.timestamp().to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let batch = parse_battles(response, house);
        debug!(
            house = %house,
            rooms = batch.rooms.len(),
            malformed = batch.malformed,
            "battle feed fetched"
        );
        Ok(batch)
    }
}

/// Serves a fixed set of rooms and records every request window.
#[derive(Debug, Default, Clone)]
pub struct InMemoryBattleFeed {
    rooms: Arc<Mutex<Vec<BattleRoom>>>,
    requests: Arc<Mutex<Vec<(HouseId, DateTime<Utc>)>>>,
    unavailable: Arc<Mutex<bool>>,
    malformed: Arc<Mutex<usize>>,
}

impl InMemoryBattleFeed {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_room(&self, room: BattleRoom) -> Result<(), BattleSyncError> {
        self.rooms
            .lock()
            .map_err(|_| BattleSyncError::Feed("feed lock poisoned".to_string()))?
            .push(room);
        Ok(())
    }

    /// Reports `count` undecodable rooms alongside every batch.
    pub fn set_malformed(&self, count: usize) -> Result<(), BattleSyncError> {
        *self
            .malformed
            .lock()
            .map_err(|_| BattleSyncError::Feed("feed lock poisoned".to_string()))? = count;
        Ok(())
    }

    pub fn set_unavailable(&self, unavailable: bool) -> Result<(), BattleSyncError> {
        *self
            .unavailable
            .lock()
            .map_err(|_| BattleSyncError::Feed("feed lock poisoned".to_string()))? = unavailable;
        Ok(())
    }

    pub fn requests(&self) -> Vec<(HouseId, DateTime<Utc>)> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl BattleFeed for InMemoryBattleFeed {
    async fn fetch_battles(
        &self,
        house: HouseId,
        since: DateTime<Utc>,
    ) -> Result<BattleBatch, BattleSyncError> {
        let poisoned = || BattleSyncError::Feed("feed lock poisoned".to_string());
        self.requests
            .lock()
            .map_err(|_| poisoned())?
            .push((house, since));
        if *self.unavailable.lock().map_err(|_| poisoned())? {
            return Err(BattleSyncError::Feed("feed offline".to_string()));
        }
        let rooms = self
            .rooms
            .lock()
            .map_err(|_| poisoned())?
            .iter()
            .filter(|room| room.house == house && room.finished_at >= since)
            .cloned()
            .collect();
        Ok(BattleBatch {
            rooms,
            malformed: *self.malformed.lock().map_err(|_| poisoned())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_payload() {
        let response: BattleFeedResponse = serde_json::from_value(serde_json::json!({
            "battles": [{
                "room_id": "r-1",
                "kind_id": 3,
                "base_score": 10,
                "finished_at": 1_700_000_000,
                "players": [
                    {"player_id": 1, "score": 20},
                    {"player_id": 2, "score": -20}
                ]
            }]
        }))
        .expect("decode");
        let batch = parse_battles(response, HouseId(7));
        assert_eq!(batch.malformed, 0);
        let rooms = batch.rooms;
        assert_eq!(rooms.len(), 1);
        let room = &rooms[0];
        assert_eq!(room.house, HouseId(7));
        assert_eq!(room.kind, GameKindId(3));
        assert_eq!(room.finished_at.timestamp(), 1_700_000_000);
        assert_eq!(room.players[1].player, PlayerId(2));
        assert!(room.is_zero_sum());
    }

    #[test]
    fn empty_response_yields_empty_batch() {
        let response: BattleFeedResponse =
            serde_json::from_value(serde_json::json!({})).expect("decode");
        assert_eq!(parse_battles(response, HouseId(1)), BattleBatch::default());
    }

    #[test]
    fn malformed_rooms_are_dropped_without_losing_valid_ones() {
        let response: BattleFeedResponse = serde_json::from_value(serde_json::json!({
            "battles": [
                {
                    "room_id": "good",
                    "kind_id": 1,
                    "base_score": 1,
                    "finished_at": 1_700_000_000,
                    "players": [
                        {"player_id": 1, "score": 5},
                        {"player_id": 2, "score": -5}
                    ]
                },
                {
                    "room_id": "",
                    "kind_id": 1,
                    "base_score": 1,
                    "finished_at": 1_700_000_000,
                    "players": []
                },
                {
                    "room_id": "far-future",
                    "kind_id": 1,
                    "base_score": 1,
                    "finished_at": i64::MAX,
                    "players": []
                }
            ]
        }))
        .expect("decode");
        let batch = parse_battles(response, HouseId(1));
        assert_eq!(batch.malformed, 2);
        assert_eq!(batch.rooms.len(), 1);
        assert_eq!(batch.rooms[0].room_id, "good");
    }
}
