use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::block::Block;
use crate::board::{Board, Position, Score};
use crate::ledger::{Move, SkipCause};
use crate::session::GamePhase;
use crate::slot::{PlayerCount, Slot};

/// Wire `type` discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    // Client -> Server (echoed back)
    Connected,
    Leave,
    Ready,
    CancelReady,
    Start,
    Move,
    SkipTurn,
    Exhausted,
    ScoreConfirm,

    // Server -> Client only
    BadReq,
    Error,
    Mediate,
    GameEnd,
}

impl MessageKind {
    /// Kinds a client may send.
    pub fn is_inbound(self) -> bool {
        !matches!(
            self,
            Self::BadReq | Self::Error | Self::Mediate | Self::GameEnd
        )
    }
}

/// Client -> Server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    Connected {
        room_id: String,
        user_id: String,
        username: String,
    },
    Leave,
    Ready,
    CancelReady,
    Start,
    Move {
        block: Block,
        position: Position,
        slot: Slot,
        turn: u32,
    },
    SkipTurn {
        slot: Slot,
        turn: u32,
        #[serde(default)]
        timeout: bool,
        #[serde(default)]
        exhausted: bool,
    },
    Exhausted {
        slot: Slot,
    },
    ScoreConfirm {
        score: Score,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Connected { .. } => MessageKind::Connected,
            Self::Leave => MessageKind::Leave,
            Self::Ready => MessageKind::Ready,
            Self::CancelReady => MessageKind::CancelReady,
            Self::Start => MessageKind::Start,
            Self::Move { .. } => MessageKind::Move,
            Self::SkipTurn { .. } => MessageKind::SkipTurn,
            Self::Exhausted { .. } => MessageKind::Exhausted,
            Self::ScoreConfirm { .. } => MessageKind::ScoreConfirm,
        }
    }

    /// Correlation key for replies to this request.
    pub fn request_ref(&self) -> RequestRef {
        let turn = match self {
            Self::Move { turn, .. } | Self::SkipTurn { turn, .. } => Some(*turn),
            _ => None,
        };
        RequestRef {
            kind: self.kind(),
            turn,
        }
    }

    /// Skip cause carried by a SKIP_TURN. Exhaustion wins when both flags are set.
    ///
    /// A SKIP_TURN with neither flag set is treated as a timeout.
    pub fn skip_cause(exhausted: bool) -> SkipCause {
        if exhausted {
            SkipCause::Exhausted
        } else {
            SkipCause::Timeout
        }
    }
}

/// Which request a BAD_REQ or ERROR answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRef {
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn: Option<u32>,
}

/// Public view of an occupied seat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatView {
    pub user_id: String,
    pub username: String,
    pub ready: bool,
}

/// Server -> Client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Seat table after someone (re)connected. `seat` is the newcomer's seat.
    Connected {
        room_id: String,
        user_id: String,
        seat: u8,
        seats: Vec<Option<SeatView>>,
    },
    Leave {
        user_id: String,
        seats: Vec<Option<SeatView>>,
    },
    Ready {
        user_id: String,
        seats: Vec<Option<SeatView>>,
    },
    CancelReady {
        user_id: String,
        seats: Vec<Option<SeatView>>,
    },
    Start {
        game_id: Uuid,
        player_count: PlayerCount,
        seats: Vec<Option<SeatView>>,
    },
    Move {
        block: Block,
        position: Position,
        slot: Slot,
        turn: u32,
    },
    SkipTurn {
        slot: Slot,
        turn: u32,
        timeout: bool,
        exhausted: bool,
    },
    Exhausted {
        slot: Slot,
        turn: u32,
    },
    ScoreConfirm {
        score: Score,
    },
    BadReq {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request: Option<RequestRef>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request: Option<RequestRef>,
    },
    /// Resync aid: the authoritative board and turn.
    Mediate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        board: Option<Board>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turn: Option<u32>,
    },
    /// `score` is absent when the game was aborted.
    GameEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        score: Option<Score>,
        #[serde(default)]
        participant_scores: Vec<u32>,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Connected { .. } => MessageKind::Connected,
            Self::Leave { .. } => MessageKind::Leave,
            Self::Ready { .. } => MessageKind::Ready,
            Self::CancelReady { .. } => MessageKind::CancelReady,
            Self::Start { .. } => MessageKind::Start,
            Self::Move { .. } => MessageKind::Move,
            Self::SkipTurn { .. } => MessageKind::SkipTurn,
            Self::Exhausted { .. } => MessageKind::Exhausted,
            Self::ScoreConfirm { .. } => MessageKind::ScoreConfirm,
            Self::BadReq { .. } => MessageKind::BadReq,
            Self::Error { .. } => MessageKind::Error,
            Self::Mediate { .. } => MessageKind::Mediate,
            Self::GameEnd { .. } => MessageKind::GameEnd,
        }
    }

    /// Echo of a resolved move, as broadcast to the room.
    pub fn from_move(mv: &Move) -> Self {
        match *mv {
            Move::Regular {
                block,
                position,
                slot,
                turn,
            } => Self::Move {
                block,
                position,
                slot,
                turn,
            },
            Move::Skip { slot, turn, cause } => Self::SkipTurn {
                slot,
                turn,
                timeout: cause == SkipCause::Timeout,
                exhausted: cause == SkipCause::Exhausted,
            },
        }
    }
}

/// Everything a client needs to rebuild its local state after reconnecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSnapshot {
    pub game_id: Option<Uuid>,
    pub phase: GamePhase,
    pub turn: u32,
    /// Absent while the room is still a lobby.
    pub player_count: Option<PlayerCount>,
    pub moves: Vec<Move>,
    pub exhausted_slots: [bool; Slot::COUNT],
}
