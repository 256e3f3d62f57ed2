use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::Utf8Bytes;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use uuid::Uuid;

use blokus_core::net::messages::{ClientMessage, ServerMessage};
use blokus_core::net::protocol::encode_server_message;

/// Per-connection sender for outbound WebSocket text frames.
/// Bounded so a slow client cannot exhaust memory.
pub type ConnectionSender = mpsc::Sender<Utf8Bytes>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("envelope encode failed: {0}")]
    Encode(String),
    #[error("envelope decode failed: {0}")]
    Decode(String),
    #[error("publish failed: {0}")]
    Publish(String),
}

/// A client request on its way to the room's single writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRequest {
    pub connection: Uuid,
    pub user_id: String,
    pub username: String,
    pub message: ClientMessage,
}

/// What travels on a room's bus channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub room_id: String,
    /// Instance that published the envelope.
    pub origin: String,
    pub body: EnvelopeBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeBody {
    /// Encoded server message for every connection in the room.
    Broadcast { payload: String },
    /// Encoded server message for one connection, wherever it lives.
    Direct { connection: Uuid, payload: String },
    /// Request forwarded to whichever instance owns the room.
    Command(RoomRequest),
}

impl Envelope {
    pub fn encode(&self) -> Result<Bytes, RelayError> {
        rmp_serde::to_vec_named(self)
            .map(Bytes::from)
            .map_err(|e| RelayError::Encode(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, RelayError> {
        rmp_serde::from_slice(data).map_err(|e| RelayError::Decode(e.to_string()))
    }
}

/// Publish/subscribe channel keyed by room, shared by every server process.
#[async_trait]
pub trait RoomBus: Send + Sync {
    /// Returns how many subscribers the payload reached.
    async fn publish(&self, room_id: &str, payload: Bytes) -> Result<usize, RelayError>;

    async fn subscribe(&self, room_id: &str) -> Result<broadcast::Receiver<Bytes>, RelayError>;
}

/// In-process bus. Share one `Arc<LocalBus>` between server instances to
/// run several of them in a single process.
pub struct LocalBus {
    channels: RwLock<HashMap<String, broadcast::Sender<Bytes>>>,
    capacity: usize,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }
}

#[async_trait]
impl RoomBus for LocalBus {
    async fn publish(&self, room_id: &str, payload: Bytes) -> Result<usize, RelayError> {
        let delivered = match self.channels.read().await.get(room_id) {
            Some(tx) => tx.send(payload).unwrap_or(0),
            None => return Ok(0),
        };
        if delivered == 0 {
            // Nobody serves the room any more.
            let mut channels = self.channels.write().await;
            if channels.get(room_id).is_some_and(|tx| tx.receiver_count() == 0) {
                channels.remove(room_id);
            }
        }
        Ok(delivered)
    }

    async fn subscribe(&self, room_id: &str) -> Result<broadcast::Receiver<Bytes>, RelayError> {
        let mut channels = self.channels.write().await;
        let tx = channels
            .entry(room_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(tx.subscribe())
    }
}

type Connections = Arc<RwLock<HashMap<Uuid, ConnectionSender>>>;

/// Local connections of one room plus the task draining its bus channel.
struct LocalRoom {
    connections: Connections,
    forwarder: JoinHandle<()>,
}

/// Per-process registry of live connections, fanning bus traffic out to them.
pub struct EventRelay {
    instance_id: String,
    bus: Arc<dyn RoomBus>,
    rooms: Mutex<HashMap<String, LocalRoom>>,
    command_tx: mpsc::UnboundedSender<(String, RoomRequest)>,
}

impl EventRelay {
    /// Returns the relay and the stream of forwarded commands seen on the
    /// bus for rooms this process serves.
    pub fn new(
        instance_id: String,
        bus: Arc<dyn RoomBus>,
    ) -> (Self, mpsc::UnboundedReceiver<(String, RoomRequest)>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let relay = Self {
            instance_id,
            bus,
            rooms: Mutex::new(HashMap::new()),
            command_tx,
        };
        (relay, command_rx)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Attach a connection to a room. The first local connection of a room
    /// subscribes this process to the room's bus channel.
    pub async fn register(
        &self,
        room_id: &str,
        connection: Uuid,
        sender: ConnectionSender,
    ) -> Result<(), RelayError> {
        let mut rooms = self.rooms.lock().await;
        if let Some(room) = rooms.get(room_id) {
            room.connections.write().await.insert(connection, sender);
            return Ok(());
        }

        let rx = self.bus.subscribe(room_id).await?;
        let connections: Connections = Arc::new(RwLock::new(HashMap::new()));
        connections.write().await.insert(connection, sender);
        let forwarder = tokio::spawn(forward_room(
            room_id.to_string(),
            self.instance_id.clone(),
            rx,
            Arc::clone(&connections),
            self.command_tx.clone(),
        ));
        rooms.insert(
            room_id.to_string(),
            LocalRoom {
                connections,
                forwarder,
            },
        );
        tracing::debug!(room_id, instance = %self.instance_id, "Subscribed to room channel");
        Ok(())
    }

    /// Detach a connection. Returns how many local connections the room has
    /// left; at zero the process unsubscribes.
    pub async fn unregister(&self, room_id: &str, connection: Uuid) -> usize {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.get(room_id) else {
            return 0;
        };
        let remaining = {
            let mut connections = room.connections.write().await;
            connections.remove(&connection);
            connections.len()
        };
        if remaining == 0
            && let Some(room) = rooms.remove(room_id)
        {
            room.forwarder.abort();
            tracing::debug!(room_id, instance = %self.instance_id, "Unsubscribed from room channel");
        }
        remaining
    }

    /// Local connection count for a room.
    pub async fn local_connections(&self, room_id: &str) -> usize {
        let rooms = self.rooms.lock().await;
        match rooms.get(room_id) {
            Some(room) => room.connections.read().await.len(),
            None => 0,
        }
    }

    /// Send a message to every connection in the room on every process.
    pub async fn broadcast(&self, room_id: &str, msg: &ServerMessage) -> Result<(), RelayError> {
        let payload = encode_server_message(msg).map_err(|e| RelayError::Encode(e.to_string()))?;
        self.publish(room_id, EnvelopeBody::Broadcast { payload })
            .await
            .map(drop)
    }

    /// Send a message to one connection. Goes through the bus so it stays
    /// ordered with the room's broadcasts.
    pub async fn send_to(
        &self,
        room_id: &str,
        connection: Uuid,
        msg: &ServerMessage,
    ) -> Result<(), RelayError> {
        let payload = encode_server_message(msg).map_err(|e| RelayError::Encode(e.to_string()))?;
        self.publish(
            room_id,
            EnvelopeBody::Direct {
                connection,
                payload,
            },
        )
        .await
        .map(drop)
    }

    /// Hand a request to the room's owner on another process. `false` when
    /// no other process is subscribed to the room.
    pub async fn forward_command(&self, room_id: &str, request: RoomRequest) -> Result<bool, RelayError> {
        let own = usize::from(self.rooms.lock().await.contains_key(room_id));
        let delivered = self.publish(room_id, EnvelopeBody::Command(request)).await?;
        Ok(delivered > own)
    }

    /// (rooms served, local connections).
    pub async fn stats(&self) -> (usize, usize) {
        let rooms = self.rooms.lock().await;
        let mut connections = 0;
        for room in rooms.values() {
            connections += room.connections.read().await.len();
        }
        (rooms.len(), connections)
    }

    async fn publish(&self, room_id: &str, body: EnvelopeBody) -> Result<usize, RelayError> {
        let envelope = Envelope {
            room_id: room_id.to_string(),
            origin: self.instance_id.clone(),
            body,
        };
        self.bus.publish(room_id, envelope.encode()?).await
    }
}

async fn forward_room(
    room_id: String,
    instance_id: String,
    rx: broadcast::Receiver<Bytes>,
    connections: Connections,
    command_tx: mpsc::UnboundedSender<(String, RoomRequest)>,
) {
    let mut stream = BroadcastStream::new(rx);
    while let Some(item) = stream.next().await {
        let data = match item {
            Ok(data) => data,
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                tracing::warn!(room_id, skipped = n, "Room channel lagged");
                continue;
            },
        };
        let envelope = match Envelope::decode(&data) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(room_id, error = %e, "Dropping undecodable envelope");
                continue;
            },
        };
        match envelope.body {
            // Forwarded by this process, which does not own the room.
            EnvelopeBody::Command(_) if envelope.origin == instance_id => {},
            EnvelopeBody::Broadcast { payload } => {
                let frame = Utf8Bytes::from(payload);
                let connections = connections.read().await;
                for (id, tx) in connections.iter() {
                    if tx.try_send(frame.clone()).is_err() {
                        tracing::warn!(room_id, connection = %id, "Outbound buffer full, frame dropped");
                    }
                }
            },
            EnvelopeBody::Direct {
                connection,
                payload,
            } => {
                let connections = connections.read().await;
                if let Some(tx) = connections.get(&connection)
                    && tx.try_send(Utf8Bytes::from(payload)).is_err()
                {
                    tracing::warn!(room_id, %connection, "Outbound buffer full, frame dropped");
                }
            },
            EnvelopeBody::Command(request) => {
                if command_tx.send((room_id.clone(), request)).is_err() {
                    break;
                }
            },
        }
    }
}
