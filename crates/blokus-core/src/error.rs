use thiserror::Error;

use crate::block::ShapeKind;
use crate::slot::Slot;

/// Why a placement is illegal. `Display` is the reason string clients see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PlacementError {
    #[error("bound")]
    OutOfBounds,
    #[error("invalid first move")]
    InvalidFirstMove,
    #[error("no connection")]
    NoCornerConnection,
    #[error("connected with other block")]
    EdgeContact,
    #[error("overlapped")]
    Overlap,
    #[error("block already used")]
    BlockAlreadyUsed(ShapeKind),
}

/// The submission does not fit the session's current phase, turn or slot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("game is not started")]
    NotStarted,
    #[error("invalid turn")]
    InvalidTurn { expected: u32, submitted: u32 },
    #[error("gameId is missing")]
    MissingGameId,
    #[error("wrong turn: try make move of your other slot")]
    WrongSlot { expected: Slot, submitted: Slot },
    #[error("not your turn")]
    NotYourTurn,
    #[error("game already started")]
    AlreadyStarted,
    #[error("score is not being confirmed")]
    NotConfirming,
    #[error("slot is not exhausted")]
    SlotNotExhausted(Slot),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("move for turn {submitted} appended at position {expected}")]
    OutOfOrder { expected: u32, submitted: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LobbyError {
    #[error("room is full")]
    RoomFull,
    #[error("game already started")]
    GameInProgress,
    #[error("not seated in this room")]
    NotSeated,
    #[error("need 2 to 4 seated players")]
    NotEnoughPlayers,
    #[error("players not ready")]
    PlayersNotReady,
}

/// Every way a client request can fail once it reached the room.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GameError {
    #[error(transparent)]
    Validation(#[from] PlacementError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("turn {submitted} already resolved, current turn is {current}")]
    Concurrency { submitted: u32, current: u32 },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Lobby(#[from] LobbyError),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl GameError {
    /// Text safe to show the submitting client. Storage causes stay server-side.
    pub fn client_message(&self) -> String {
        match self {
            Self::Persistence(_) | Self::Ledger(_) => "temporary failure, please retry".to_string(),
            Self::Concurrency { .. } => ContextError::InvalidTurn {
                expected: 0,
                submitted: 0,
            }
            .to_string(),
            other => other.to_string(),
        }
    }

    /// Persistence failures surface as ERROR, everything else as BAD_REQ.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Ledger(_))
    }
}
