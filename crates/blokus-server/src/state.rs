use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::relay::{EventRelay, LocalBus, RoomBus, RoomRequest};
use crate::room_manager::RoomManager;
use crate::store::{InMemoryMoveStore, InMemoryRoomCache, MoveStore, RoomCache};

/// Shared infrastructure a server instance plugs into. Several instances
/// built from clones of the same `Collaborators` behave as one cluster.
#[derive(Clone)]
pub struct Collaborators {
    pub bus: Arc<dyn RoomBus>,
    pub moves: Arc<dyn MoveStore>,
    pub cache: Arc<dyn RoomCache>,
}

impl Collaborators {
    pub fn in_memory(channel_capacity: usize) -> Self {
        Self {
            bus: Arc::new(LocalBus::new(channel_capacity)),
            moves: Arc::new(InMemoryMoveStore::new()),
            cache: Arc::new(InMemoryRoomCache::new()),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub rooms: Arc<RoomManager>,
    pub relay: Arc<EventRelay>,
    pub moves: Arc<dyn MoveStore>,
    pub cache: Arc<dyn RoomCache>,
    pub config: Arc<ServerConfig>,
    pub ws_connection_count: Arc<AtomicUsize>,
}

impl AppState {
    /// Also returns the stream of commands forwarded to this instance, which
    /// the caller hands to [`RoomManager::spawn_command_listener`].
    pub fn new(
        config: ServerConfig,
        collaborators: Collaborators,
    ) -> (Self, mpsc::UnboundedReceiver<(String, RoomRequest)>) {
        let config = Arc::new(config);
        let (relay, commands) = EventRelay::new(config.instance_id.clone(), collaborators.bus);
        let relay = Arc::new(relay);
        let rooms = Arc::new(RoomManager::new(
            Arc::clone(&relay),
            Arc::clone(&collaborators.moves),
            Arc::clone(&collaborators.cache),
            Arc::clone(&config),
        ));
        let state = Self {
            rooms,
            relay,
            moves: collaborators.moves,
            cache: collaborators.cache,
            config,
            ws_connection_count: Arc::new(AtomicUsize::new(0)),
        };
        (state, commands)
    }
}

/// Counts a live WebSocket connection for as long as it is held.
pub struct ConnectionGuard {
    count: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    pub fn new(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::Relaxed);
        Self { count }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }
}
