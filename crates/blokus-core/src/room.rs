use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LobbyError;
use crate::net::messages::SeatView;
use crate::slot::{PlayerCount, Slot};

/// Number of seats in a room; seat `n` is participant `n` once a game starts.
pub const SEAT_COUNT: usize = 4;

/// Longest room id accepted from clients.
pub const MAX_ROOM_ID_LEN: usize = 64;

/// Room ids are 1-64 ASCII letters, digits, `-` or `_`.
pub fn is_valid_room_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ROOM_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// One occupied seat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatRecord {
    pub user_id: String,
    pub username: String,
    pub ready: bool,
}

/// Shared per-room record kept in the Room Cache.
///
/// `owner` names the server instance currently running the room's actor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub id: String,
    pub seats: [Option<SeatRecord>; SEAT_COUNT],
    pub exhausted: [bool; Slot::COUNT],
    pub turn: u32,
    pub started: bool,
    pub game_id: Option<Uuid>,
    pub owner: Option<String>,
}

impl RoomRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn seat_of(&self, user_id: &str) -> Option<u8> {
        self.seats
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.user_id == user_id))
            .map(|i| i as u8)
    }

    /// Seat a user, or return their existing seat on reconnect.
    pub fn seat_user(&mut self, user_id: &str, username: &str) -> Result<u8, LobbyError> {
        if let Some(seat) = self.seat_of(user_id) {
            return Ok(seat);
        }
        if self.started {
            return Err(LobbyError::GameInProgress);
        }
        let free = self
            .seats
            .iter()
            .position(Option::is_none)
            .ok_or(LobbyError::RoomFull)?;
        self.seats[free] = Some(SeatRecord {
            user_id: user_id.to_string(),
            username: username.to_string(),
            ready: false,
        });
        Ok(free as u8)
    }

    /// Free a seat and shift later seats down so seated users stay contiguous.
    pub fn vacate(&mut self, user_id: &str) -> Result<(), LobbyError> {
        let seat = self.seat_of(user_id).ok_or(LobbyError::NotSeated)? as usize;
        self.seats[seat..].rotate_left(1);
        self.seats[SEAT_COUNT - 1] = None;
        Ok(())
    }

    pub fn set_ready(&mut self, user_id: &str, ready: bool) -> Result<(), LobbyError> {
        if self.started {
            return Err(LobbyError::GameInProgress);
        }
        let seat = self.seat_of(user_id).ok_or(LobbyError::NotSeated)? as usize;
        if let Some(record) = self.seats[seat].as_mut() {
            record.ready = ready;
        }
        Ok(())
    }

    pub fn seated_count(&self) -> usize {
        self.seats.iter().flatten().count()
    }

    pub fn all_ready(&self) -> bool {
        self.seats.iter().flatten().all(|s| s.ready)
    }

    /// Player count a game would start with, if the lobby allows starting.
    pub fn check_startable(&self) -> Result<PlayerCount, LobbyError> {
        if self.started {
            return Err(LobbyError::GameInProgress);
        }
        let count = PlayerCount::try_from(self.seated_count() as u8)
            .map_err(|_| LobbyError::NotEnoughPlayers)?;
        if !self.all_ready() {
            return Err(LobbyError::PlayersNotReady);
        }
        Ok(count)
    }

    pub fn begin_game(&mut self, game_id: Uuid) {
        self.started = true;
        self.game_id = Some(game_id);
        self.turn = 0;
        self.exhausted = [false; Slot::COUNT];
    }

    /// Back to the lobby. Seats are kept, readiness is cleared.
    pub fn end_game(&mut self) {
        self.started = false;
        self.game_id = None;
        self.turn = 0;
        self.exhausted = [false; Slot::COUNT];
        for seat in self.seats.iter_mut().flatten() {
            seat.ready = false;
        }
    }

    pub fn player_count(&self) -> Option<PlayerCount> {
        PlayerCount::try_from(self.seated_count() as u8).ok()
    }

    pub fn seat_views(&self) -> Vec<Option<SeatView>> {
        self.seats
            .iter()
            .map(|seat| {
                seat.as_ref().map(|s| SeatView {
                    user_id: s.user_id.clone(),
                    username: s.username.clone(),
                    ready: s.ready,
                })
            })
            .collect()
    }
}
