use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use blokus_core::error::GameError;
use blokus_core::net::messages::ServerMessage;
use blokus_core::room::RoomRecord;
use blokus_core::session::GameSession;

use crate::config::ServerConfig;
use crate::game_loop::{GameCommand, RoomContext, spawn_room_actor};
use crate::relay::{EventRelay, RoomRequest};
use crate::store::{MoveRecord, MoveStore, RoomCache, StoreError, update_room};

const FORWARD_RETRY_DELAY: Duration = Duration::from_millis(25);

fn owner_unreachable() -> GameError {
    GameError::Persistence("room owner unreachable".into())
}

/// A room actor running in this process.
struct RoomHandle {
    tx: mpsc::UnboundedSender<GameCommand>,
    task: JoinHandle<()>,
}

/// Routes requests to room actors. Each room has exactly one actor across
/// all processes; whoever wins the `owner` compare-and-swap runs it.
pub struct RoomManager {
    relay: Arc<EventRelay>,
    moves: Arc<dyn MoveStore>,
    cache: Arc<dyn RoomCache>,
    config: Arc<ServerConfig>,
    actors: Mutex<HashMap<String, RoomHandle>>,
}

impl RoomManager {
    pub fn new(
        relay: Arc<EventRelay>,
        moves: Arc<dyn MoveStore>,
        cache: Arc<dyn RoomCache>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            relay,
            moves,
            cache,
            config,
            actors: Mutex::new(HashMap::new()),
        }
    }

    /// Deliver a request from a local connection.
    pub async fn dispatch(&self, room_id: &str, request: RoomRequest) {
        self.route(room_id, request, false).await;
    }

    /// Consume requests other processes forwarded over the bus.
    pub fn spawn_command_listener(
        self: &Arc<Self>,
        mut commands: mpsc::UnboundedReceiver<(String, RoomRequest)>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some((room_id, request)) = commands.recv().await {
                manager.route(&room_id, request, true).await;
            }
            tracing::debug!("Forwarded command stream closed");
        })
    }

    async fn route(&self, room_id: &str, request: RoomRequest, forwarded: bool) {
        let mut actors = self.actors.lock().await;

        let request = match actors.get(room_id) {
            Some(handle) => match handle.tx.send(GameCommand::Request(request)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(cmd)) => {
                    actors.remove(room_id);
                    match cmd {
                        GameCommand::Request(request) => request,
                        GameCommand::Stop => return,
                    }
                },
            },
            None => request,
        };

        if forwarded && self.relay.local_connections(room_id).await == 0 {
            // Queued before this process let go of the room; nobody else saw it.
            drop(actors);
            tracing::warn!(room_id, connection = %request.connection, "Forwarded request reached a released room");
            self.reply_error(room_id, &request, owner_unreachable()).await;
            return;
        }

        match self.claim(room_id).await {
            Ok(Some(handle)) => {
                let _ = handle.tx.send(GameCommand::Request(request));
                actors.insert(room_id.to_string(), handle);
            },
            Ok(None) if forwarded => {
                tracing::debug!(room_id, "Ignoring command for a room owned elsewhere");
            },
            Ok(None) => {
                drop(actors);
                self.forward(room_id, request).await;
            },
            Err(e) => {
                tracing::error!(room_id, error = %e, "Failed to take over room");
                drop(actors);
                self.reply_error(room_id, &request, e).await;
            },
        }
    }

    /// Hand a request to the owner on another process. While the recorded
    /// owner has no subscription left, keep trying to take the room over.
    async fn forward(&self, room_id: &str, request: RoomRequest) {
        for attempt in 1..=self.config.cache.max_update_attempts {
            match self.relay.forward_command(room_id, request.clone()).await {
                Ok(true) => return,
                Ok(false) => {
                    tracing::debug!(room_id, attempt, "Room owner is not subscribed");
                },
                Err(e) => {
                    tracing::error!(room_id, error = %e, "Failed to forward request to room owner");
                    self.reply_error(room_id, &request, GameError::Persistence(e.to_string()))
                        .await;
                    return;
                },
            }

            tokio::time::sleep(FORWARD_RETRY_DELAY).await;
            let mut actors = self.actors.lock().await;
            if let Some(handle) = actors.get(room_id)
                && handle.tx.send(GameCommand::Request(request.clone())).is_ok()
            {
                return;
            }
            match self.claim(room_id).await {
                Ok(Some(handle)) => {
                    let _ = handle.tx.send(GameCommand::Request(request));
                    actors.insert(room_id.to_string(), handle);
                    return;
                },
                Ok(None) => {},
                Err(e) => {
                    drop(actors);
                    tracing::error!(room_id, error = %e, "Failed to take over room");
                    self.reply_error(room_id, &request, e).await;
                    return;
                },
            }
        }

        tracing::warn!(room_id, connection = %request.connection, "Room owner unreachable");
        self.reply_error(room_id, &request, owner_unreachable()).await;
    }

    /// Become the room's owner if nobody else is, restoring its session from
    /// the stores. `None` when another process owns the room.
    async fn claim(&self, room_id: &str) -> Result<Option<RoomHandle>, GameError> {
        let me = self.relay.instance_id().to_string();
        if let Some(current) = self.cache.get(room_id).await?
            && current.value.owner.as_deref().is_some_and(|owner| owner != me)
        {
            return Ok(None);
        }

        let (record, claimed) = update_room(
            self.cache.as_ref(),
            room_id,
            self.config.cache.max_update_attempts,
            |room| {
                if room.owner.as_deref().is_some_and(|owner| owner != me) {
                    return Ok(false);
                }
                room.owner = Some(me.clone());
                Ok(true)
            },
        )
        .await?;
        if !claimed {
            return Ok(None);
        }

        let session = match self.restore_session(&record).await {
            Ok(session) => session,
            Err(e) => {
                self.release(room_id).await;
                return Err(e);
            },
        };
        tracing::info!(
            room_id,
            instance = %me,
            phase = ?session.phase(),
            turn = session.turn(),
            "Took ownership of room"
        );

        let ctx = RoomContext {
            room_id: room_id.to_string(),
            relay: Arc::clone(&self.relay),
            moves: Arc::clone(&self.moves),
            cache: Arc::clone(&self.cache),
            config: Arc::clone(&self.config),
        };
        let (tx, task) = spawn_room_actor(ctx, session, record);
        Ok(Some(RoomHandle { tx, task }))
    }

    /// Session for a record: a fresh lobby, or the running game replayed from
    /// the Move Store.
    async fn restore_session(&self, record: &RoomRecord) -> Result<GameSession, GameError> {
        let Some(game_id) = record.game_id.filter(|_| record.started) else {
            return Ok(GameSession::new());
        };
        let player_count = record.player_count().ok_or_else(|| {
            StoreError::Corrupt(format!(
                "room {} started with {} seated users",
                record.id,
                record.seated_count()
            ))
        })?;
        let moves = self
            .moves
            .moves_for_game(game_id)
            .await?
            .iter()
            .map(MoveRecord::to_move)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(GameSession::restore(
            game_id,
            player_count,
            moves,
            record.exhausted,
        )?)
    }

    /// Detach a closed connection. When the room has no local connections
    /// left, its actor stops and ownership is released.
    pub async fn connection_closed(&self, room_id: &str, connection: Uuid) {
        let remaining = self.relay.unregister(room_id, connection).await;
        if remaining > 0 {
            return;
        }

        let mut actors = self.actors.lock().await;
        if self.relay.local_connections(room_id).await > 0 {
            return;
        }
        let Some(handle) = actors.remove(room_id) else {
            return;
        };
        let _ = handle.tx.send(GameCommand::Stop);
        if let Err(e) = handle.task.await {
            tracing::error!(room_id, error = %e, "Room actor panicked");
        }
        self.release(room_id).await;
        tracing::info!(room_id, "Released room ownership");
    }

    async fn release(&self, room_id: &str) {
        let me = self.relay.instance_id();
        let result = update_room(
            self.cache.as_ref(),
            room_id,
            self.config.cache.max_update_attempts,
            |room| {
                if room.owner.as_deref() == Some(me) {
                    room.owner = None;
                }
                Ok(())
            },
        )
        .await;
        if let Err(e) = result {
            tracing::warn!(room_id, error = %e, "Failed to release room ownership");
        }
    }

    async fn reply_error(&self, room_id: &str, request: &RoomRequest, error: GameError) {
        let msg = ServerMessage::Error {
            message: error.client_message(),
            request: Some(request.message.request_ref()),
        };
        if let Err(e) = self.relay.send_to(room_id, request.connection, &msg).await {
            tracing::warn!(room_id, error = %e, "Failed to report routing failure");
        }
    }

    /// Number of room actors running in this process.
    pub async fn active_rooms(&self) -> usize {
        self.actors.lock().await.len()
    }
}
