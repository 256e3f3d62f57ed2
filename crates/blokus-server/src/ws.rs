use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use blokus_core::net::messages::{ClientMessage, ServerMessage};
use blokus_core::net::protocol::{ProtocolError, decode_client_message, encode_server_message};
use blokus_core::room::is_valid_room_id;

use crate::relay::RoomRequest;
use crate::state::{AppState, ConnectionGuard};

pub async fn ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<Response, StatusCode> {
    let max_ws = state.config.limits.max_ws_connections;
    let current = state.ws_connection_count.load(Ordering::Relaxed);
    if current >= max_ws {
        tracing::warn!(current, max = max_ws, "WS connection limit reached");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state))
        .into_response())
}

/// Who a connection speaks for, fixed by its CONNECTED handshake.
struct Identity {
    room_id: String,
    user_id: String,
    username: String,
    connection: Uuid,
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let _guard = ConnectionGuard::new(Arc::clone(&state.ws_connection_count));
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // The first frame must be a CONNECTED naming the room and user.
    let first = match ws_receiver.next().await {
        Some(Ok(Message::Text(text))) => text,
        _ => return,
    };
    let hello = match decode_client_message(first.as_str()) {
        Ok(msg @ ClientMessage::Connected { .. }) => msg,
        Ok(other) => {
            tracing::warn!(kind = ?other.kind(), "First message was not CONNECTED");
            send_bad_req(&mut ws_sender, "expected CONNECTED").await;
            return;
        },
        Err(e) => {
            tracing::warn!(error = %e, "Undecodable handshake");
            send_bad_req(&mut ws_sender, &e.to_string()).await;
            return;
        },
    };
    let ClientMessage::Connected {
        room_id,
        user_id,
        username,
    } = hello.clone()
    else {
        return;
    };
    if !is_valid_room_id(&room_id) || user_id.trim().is_empty() {
        send_bad_req(&mut ws_sender, "invalid room or user id").await;
        return;
    }

    let identity = Identity {
        room_id,
        user_id,
        username,
        connection: Uuid::new_v4(),
    };
    let (tx, rx) = mpsc::channel::<Utf8Bytes>(state.config.limits.connection_buffer);
    if let Err(e) = state
        .relay
        .register(&identity.room_id, identity.connection, tx)
        .await
    {
        tracing::error!(room_id = %identity.room_id, error = %e, "Failed to subscribe connection");
        return;
    }
    let writer = spawn_writer(ws_sender, rx);

    tracing::info!(
        room_id = %identity.room_id,
        user_id = %identity.user_id,
        connection = %identity.connection,
        "Client connected"
    );
    state
        .rooms
        .dispatch(&identity.room_id, request(&identity, hello))
        .await;

    read_loop(&mut ws_receiver, &state, &identity).await;

    // A dropped socket is not a LEAVE: the seat stays for reconnection.
    state
        .rooms
        .connection_closed(&identity.room_id, identity.connection)
        .await;
    writer.abort();

    tracing::info!(
        room_id = %identity.room_id,
        user_id = %identity.user_id,
        "Client disconnected"
    );
}

fn request(identity: &Identity, message: ClientMessage) -> RoomRequest {
    RoomRequest {
        connection: identity.connection,
        user_id: identity.user_id.clone(),
        username: identity.username.clone(),
        message,
    }
}

async fn send_bad_req(ws_sender: &mut SplitSink<WebSocket, Message>, message: &str) {
    let msg = ServerMessage::BadReq {
        message: message.to_string(),
        request: None,
    };
    if let Ok(text) = encode_server_message(&msg)
        && let Err(e) = ws_sender.send(Message::Text(text.into())).await
    {
        tracing::warn!(error = %e, "Failed to send handshake rejection");
    }
}

fn spawn_writer(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Utf8Bytes>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    })
}

/// Per-connection rate limiter (token bucket).
struct RateLimiter {
    tokens: f64,
    last_refill: tokio::time::Instant,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
}

impl RateLimiter {
    fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            last_refill: tokio::time::Instant::now(),
            max_tokens,
            refill_rate,
        }
    }

    /// Returns true if the message is allowed; false if rate-limited.
    fn allow(&mut self) -> bool {
        let now = tokio::time::Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

async fn read_loop(
    ws_receiver: &mut SplitStream<WebSocket>,
    state: &AppState,
    identity: &Identity,
) {
    let rate = state.config.limits.ws_rate_limit_per_sec;
    let mut rate_limiter = RateLimiter::new(rate, rate);
    let max_size = state.config.limits.max_message_size;
    let room_id = identity.room_id.as_str();
    let user_id = identity.user_id.as_str();

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        if !rate_limiter.allow() {
            tracing::warn!(room_id, user_id, "Rate limited");
            continue;
        }

        // Protocol errors are logged and the connection is kept.
        if text.len() > max_size {
            let e = ProtocolError::PayloadTooLarge(text.len());
            tracing::warn!(room_id, user_id, error = %e, "Dropping message");
            continue;
        }
        let message = match decode_client_message(text.as_str()) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(room_id, user_id, error = %e, "Dropping message");
                continue;
            },
        };
        if matches!(message, ClientMessage::Connected { .. }) {
            tracing::debug!(room_id, user_id, "Ignoring repeated CONNECTED");
            continue;
        }

        state
            .rooms
            .dispatch(room_id, request(identity, message))
            .await;
    }
}
