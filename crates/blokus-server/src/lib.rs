pub mod api;
pub mod config;
pub mod error;
pub mod game_loop;
pub mod health;
pub mod relay;
pub mod room_manager;
pub mod state;
pub mod store;
pub mod ws;

use axum::Router;
use axum::routing::get;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use config::ServerConfig;
use state::{AppState, Collaborators};

/// Build the Axum router and application state from a config, with
/// in-memory stores and bus. Must be called inside a Tokio runtime.
pub fn build_app(config: ServerConfig) -> (Router<()>, AppState) {
    let collaborators = Collaborators::in_memory(config.relay.channel_capacity);
    build_app_with(config, collaborators)
}

/// Build an instance plugged into existing stores and bus, so several
/// instances can serve the same rooms.
pub fn build_app_with(config: ServerConfig, collaborators: Collaborators) -> (Router<()>, AppState) {
    let (state, commands) = AppState::new(config, collaborators);
    state.rooms.spawn_command_listener(commands);

    let api_routes = Router::new().route("/rooms/{room_id}/restore", get(api::restore_snapshot));

    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health::health_check))
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    (app, state)
}
