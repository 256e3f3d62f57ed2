use axum::extract::{Path, State};
use axum::response::Json;

use blokus_core::ledger::MoveLedger;
use blokus_core::net::messages::RestoreSnapshot;
use blokus_core::room::{RoomRecord, is_valid_room_id};
use blokus_core::session::GamePhase;

use crate::error::AppError;
use crate::state::AppState;
use crate::store::{MoveRecord, MoveStore, StoreError};

/// GET /api/v1/rooms/{room_id}/restore: state a reconnecting client
/// rebuilds from. Read from the stores, never from a room actor.
pub async fn restore_snapshot(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<RestoreSnapshot>, AppError> {
    if !is_valid_room_id(&room_id) {
        return Err(AppError::BadRequest("invalid room id".to_string()));
    }
    let record = state
        .cache
        .get(&room_id)
        .await?
        .ok_or_else(|| AppError::NotFound("room not found".to_string()))?
        .value;
    let snapshot = build_snapshot(state.moves.as_ref(), &record).await?;
    Ok(Json(snapshot))
}

async fn build_snapshot(
    moves: &dyn MoveStore,
    record: &RoomRecord,
) -> Result<RestoreSnapshot, StoreError> {
    let Some(game_id) = record.game_id.filter(|_| record.started) else {
        return Ok(RestoreSnapshot {
            game_id: None,
            phase: GamePhase::NotStarted,
            turn: 0,
            player_count: None,
            moves: Vec::new(),
            exhausted_slots: [false; 4],
        });
    };

    let stored = moves
        .moves_for_game(game_id)
        .await?
        .iter()
        .map(MoveRecord::to_move)
        .collect::<Result<Vec<_>, _>>()?;
    let ledger = MoveLedger::from_moves(stored)
        .map_err(|e| StoreError::Corrupt(format!("game {game_id}: {e}")))?;

    let phase = if record.exhausted.iter().all(|e| *e) {
        GamePhase::ConfirmingScore
    } else {
        GamePhase::InProgress
    };
    Ok(RestoreSnapshot {
        game_id: Some(game_id),
        phase,
        turn: ledger.len() as u32,
        player_count: record.player_count(),
        moves: ledger.all().to_vec(),
        exhausted_slots: record.exhausted,
    })
}
