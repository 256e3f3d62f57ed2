use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use blokus_core::block::Block;
use blokus_core::board::Position;
use blokus_core::error::GameError;
use blokus_core::ledger::{Move, SkipCause};
use blokus_core::room::RoomRecord;
use blokus_core::slot::Slot;
use blokus_core::time::timestamp_millis;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("write conflict on {0}")]
    Conflict(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<StoreError> for GameError {
    fn from(e: StoreError) -> Self {
        GameError::Persistence(e.to_string())
    }
}

/// One resolved move as the Move Store keeps it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRecord {
    pub id: Uuid,
    pub game_id: Uuid,
    pub slot: Slot,
    pub turn: u32,
    /// JSON block descriptor; absent for skips.
    pub block: Option<String>,
    pub position: Option<Position>,
    pub timeout: bool,
    pub exhausted: bool,
    pub created_at: u64,
}

impl MoveRecord {
    pub fn from_move(game_id: Uuid, mv: &Move) -> Result<Self, StoreError> {
        let mut record = Self {
            id: Uuid::new_v4(),
            game_id,
            slot: mv.slot(),
            turn: mv.turn(),
            block: None,
            position: None,
            timeout: false,
            exhausted: false,
            created_at: timestamp_millis(),
        };
        match mv {
            Move::Regular {
                block, position, ..
            } => {
                let descriptor =
                    serde_json::to_string(block).map_err(|e| StoreError::Corrupt(e.to_string()))?;
                record.block = Some(descriptor);
                record.position = Some(*position);
            },
            Move::Skip { cause, .. } => {
                record.timeout = *cause == SkipCause::Timeout;
                record.exhausted = *cause == SkipCause::Exhausted;
            },
        }
        Ok(record)
    }

    pub fn to_move(&self) -> Result<Move, StoreError> {
        match (&self.block, self.position) {
            (Some(descriptor), Some(position)) => {
                let block: Block = serde_json::from_str(descriptor).map_err(|e| {
                    StoreError::Corrupt(format!("move {} block descriptor: {e}", self.id))
                })?;
                Ok(Move::Regular {
                    block,
                    position,
                    slot: self.slot,
                    turn: self.turn,
                })
            },
            (None, None) => Ok(Move::Skip {
                slot: self.slot,
                turn: self.turn,
                cause: if self.exhausted {
                    SkipCause::Exhausted
                } else {
                    SkipCause::Timeout
                },
            }),
            _ => Err(StoreError::Corrupt(format!(
                "move {} has a block without a position or the reverse",
                self.id
            ))),
        }
    }
}

/// Durable, append-only move history.
#[async_trait]
pub trait MoveStore: Send + Sync {
    /// Append one record. `(game_id, turn)` is unique.
    async fn append(&self, record: MoveRecord) -> Result<(), StoreError>;

    /// Every record of a game in turn order.
    async fn moves_for_game(&self, game_id: Uuid) -> Result<Vec<MoveRecord>, StoreError>;
}

/// A value together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Shared room records with optimistic concurrency.
#[async_trait]
pub trait RoomCache: Send + Sync {
    async fn get(&self, room_id: &str) -> Result<Option<Versioned<RoomRecord>>, StoreError>;

    /// Write `record` only if the stored version is still `expected`
    /// (`None` meaning absent). Returns the new version, or
    /// [`StoreError::Conflict`] when someone else wrote first.
    async fn compare_and_swap(
        &self,
        room_id: &str,
        expected: Option<u64>,
        record: RoomRecord,
    ) -> Result<u64, StoreError>;
}

/// Read-modify-write a room record under compare-and-swap, retrying on
/// conflict. A missing record starts as an empty lobby. When `mutate` fails
/// nothing is written.
pub async fn update_room<T>(
    cache: &dyn RoomCache,
    room_id: &str,
    max_attempts: u32,
    mut mutate: impl FnMut(&mut RoomRecord) -> Result<T, GameError> + Send,
) -> Result<(RoomRecord, T), GameError> {
    for attempt in 1..=max_attempts {
        let current = cache.get(room_id).await?;
        let (expected, mut record) = match current {
            Some(Versioned { version, value }) => (Some(version), value),
            None => (None, RoomRecord::new(room_id)),
        };
        let out = mutate(&mut record)?;
        match cache
            .compare_and_swap(room_id, expected, record.clone())
            .await
        {
            Ok(_) => return Ok((record, out)),
            Err(StoreError::Conflict(_)) => {
                tracing::debug!(room_id, attempt, "Room record changed underneath, retrying");
            },
            Err(e) => return Err(e.into()),
        }
    }
    Err(StoreError::Conflict(format!("room {room_id} after {max_attempts} attempts")).into())
}

/// Move Store held in process memory. Clone the `Arc` to share it between
/// server instances.
#[derive(Default)]
pub struct InMemoryMoveStore {
    games: RwLock<HashMap<Uuid, Vec<MoveRecord>>>,
}

impl InMemoryMoveStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MoveStore for InMemoryMoveStore {
    async fn append(&self, record: MoveRecord) -> Result<(), StoreError> {
        let mut games = self.games.write().await;
        let moves = games.entry(record.game_id).or_default();
        if moves.iter().any(|m| m.turn == record.turn) {
            return Err(StoreError::Conflict(format!(
                "game {} turn {}",
                record.game_id, record.turn
            )));
        }
        moves.push(record);
        moves.sort_by_key(|m| m.turn);
        Ok(())
    }

    async fn moves_for_game(&self, game_id: Uuid) -> Result<Vec<MoveRecord>, StoreError> {
        let games = self.games.read().await;
        Ok(games.get(&game_id).cloned().unwrap_or_default())
    }
}

/// Room Cache held in process memory.
#[derive(Default)]
pub struct InMemoryRoomCache {
    rooms: RwLock<HashMap<String, Versioned<RoomRecord>>>,
}

impl InMemoryRoomCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoomCache for InMemoryRoomCache {
    async fn get(&self, room_id: &str) -> Result<Option<Versioned<RoomRecord>>, StoreError> {
        Ok(self.rooms.read().await.get(room_id).cloned())
    }

    async fn compare_and_swap(
        &self,
        room_id: &str,
        expected: Option<u64>,
        record: RoomRecord,
    ) -> Result<u64, StoreError> {
        let mut rooms = self.rooms.write().await;
        let current = rooms.get(room_id).map(|v| v.version);
        if current != expected {
            return Err(StoreError::Conflict(room_id.to_string()));
        }
        let version = current.map_or(1, |v| v + 1);
        rooms.insert(
            room_id.to_string(),
            Versioned {
                version,
                value: record,
            },
        );
        Ok(version)
    }
}
