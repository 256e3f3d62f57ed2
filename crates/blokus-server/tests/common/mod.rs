use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use blokus_core::block::{Block, ShapeKind};
use blokus_core::board::Position;
use blokus_core::net::messages::{ClientMessage, MessageKind, ServerMessage};
use blokus_core::net::protocol::{decode_server_message, encode_client_message};
use blokus_core::slot::Slot;

use blokus_server::build_app_with;
use blokus_server::config::ServerConfig;
use blokus_server::state::{AppState, Collaborators};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    _shutdown: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Start a server with its own in-memory stores and bus.
    pub async fn new() -> Self {
        let config = ServerConfig::default();
        let collaborators = Collaborators::in_memory(config.relay.channel_capacity);
        Self::from_parts(config, collaborators).await
    }

    /// Start a server sharing stores and bus with other test servers.
    pub async fn with_collaborators(instance_id: &str, collaborators: Collaborators) -> Self {
        let config = ServerConfig {
            instance_id: instance_id.to_string(),
            ..ServerConfig::default()
        };
        Self::from_parts(config, collaborators).await
    }

    pub async fn from_parts(config: ServerConfig, collaborators: Collaborators) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (app, state) = build_app_with(config, collaborators);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Give the server a moment to start accepting
        tokio::time::sleep(Duration::from_millis(20)).await;

        Self {
            addr,
            state,
            _shutdown: handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

/// Connect a WebSocket client to the given URL.
pub async fn ws_connect(url: &str) -> WsStream {
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

pub async fn ws_send(stream: &mut WsStream, msg: &ClientMessage) {
    let text = encode_client_message(msg).unwrap();
    stream.send(Message::Text(text.into())).await.unwrap();
}

pub fn hello(room_id: &str, user_id: &str) -> ClientMessage {
    ClientMessage::Connected {
        room_id: room_id.to_string(),
        user_id: user_id.to_string(),
        username: user_id.to_uppercase(),
    }
}

/// Open a connection for `user_id` and wait for its own CONNECTED.
pub async fn connect_user(ws_url: &str, room_id: &str, user_id: &str) -> WsStream {
    let mut stream = ws_connect(ws_url).await;
    ws_send(&mut stream, &hello(room_id, user_id)).await;
    ws_read_until(&mut stream, |msg| {
        matches!(msg, ServerMessage::Connected { user_id: u, .. } if u == user_id)
    })
    .await;
    stream
}

/// Read the next server message (5s timeout).
pub async fn ws_read_server_msg(stream: &mut WsStream) -> ServerMessage {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return decode_server_message(text.as_str()).unwrap(),
                Some(Ok(Message::Close(_))) => panic!("WebSocket closed unexpectedly"),
                Some(Err(e)) => panic!("WebSocket error: {e}"),
                None => panic!("WebSocket stream ended"),
                _ => continue,
            }
        }
    })
    .await
    .expect("Timed out waiting for server message")
}

/// Skip messages until one matches.
pub async fn ws_read_until(
    stream: &mut WsStream,
    mut pred: impl FnMut(&ServerMessage) -> bool,
) -> ServerMessage {
    loop {
        let msg = ws_read_server_msg(stream).await;
        if pred(&msg) {
            return msg;
        }
    }
}

pub async fn ws_read_kind(stream: &mut WsStream, kind: MessageKind) -> ServerMessage {
    ws_read_until(stream, |msg| msg.kind() == kind).await
}

/// True once the socket closes without delivering another message.
pub async fn ws_closed(stream: &mut WsStream) -> bool {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return true,
                Some(Ok(Message::Text(_))) => return false,
                _ => continue,
            }
        }
    })
    .await
    .unwrap_or(false)
}

/// Seat `a` and `b` (already connected), ready both and start. Returns the
/// START seen by `a`.
pub async fn start_two(a: &mut WsStream, b: &mut WsStream) -> ServerMessage {
    ws_send(a, &ClientMessage::Ready).await;
    ws_send(b, &ClientMessage::Ready).await;
    ws_read_until(a, |msg| {
        matches!(msg, ServerMessage::Ready { user_id, .. } if user_id == "b")
    })
    .await;
    ws_send(a, &ClientMessage::Start).await;
    ws_read_kind(b, MessageKind::Start).await;
    ws_read_kind(a, MessageKind::Start).await
}

/// Monomino on `slot`'s own corner.
pub fn corner_move(slot: u8, turn: u32) -> ClientMessage {
    let slot = Slot::ALL[slot as usize];
    let (row, col) = slot.corner();
    ClientMessage::Move {
        block: Block::upright(ShapeKind::I1),
        position: Position::new(row as i32, col as i32),
        slot,
        turn,
    }
}
