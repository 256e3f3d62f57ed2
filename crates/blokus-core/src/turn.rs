use serde::{Deserialize, Serialize};

use crate::block::{Block, UsedBlocks};
use crate::board::{Board, Position, check_placement, has_any_legal_placement};
use crate::error::{ContextError, GameError, PlacementError};
use crate::ledger::{Move, SkipCause};
use crate::session::GameSession;
use crate::slot::{PlayerCount, Slot};

/// Who acts on a given turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnOwner {
    pub participant: u8,
    pub slot: Slot,
}

/// `(participant, slot)` for turns 0..12 of a three-player game. The shared
/// slot 3 is played by participants 0, 1, 2 in rotation, one round each.
pub const THREE_PLAYER_CYCLE: [(u8, u8); 12] = [
    (0, 0),
    (1, 1),
    (2, 2),
    (0, 3),
    (0, 0),
    (1, 1),
    (2, 2),
    (1, 3),
    (0, 0),
    (1, 1),
    (2, 2),
    (2, 3),
];

/// Slot and acting participant for `turn`. Slots always cycle 0..=3.
pub fn turn_owner(turn: u32, count: PlayerCount) -> TurnOwner {
    let (participant, slot) = match count {
        PlayerCount::Two => ((turn % 2) as u8, (turn % 4) as u8),
        PlayerCount::Three => THREE_PLAYER_CYCLE[(turn % 12) as usize],
        PlayerCount::Four => ((turn % 4) as u8, (turn % 4) as u8),
    };
    TurnOwner {
        participant,
        slot: Slot::ALL[slot as usize],
    }
}

/// Local view of one slot's turn, resolving races between the countdown
/// and the network by state rather than by timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SlotTurnState {
    #[default]
    NotSlotTurn,
    SlotTurn,
    MoveProcessing,
    TurnEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDisposition {
    /// Validate locally, apply provisionally and submit.
    Accept,
    /// Hold the move until this slot's turn comes round.
    Reserve,
    /// Duplicate or delayed; drop it.
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutDisposition {
    /// Submit a timeout skip; the turn is over.
    SkipAndEndTurn,
    /// Submit a timeout skip but leave the in-flight move pending.
    SkipKeepInFlight,
    Ignore,
}

impl SlotTurnState {
    pub fn for_turn(is_slot_turn: bool) -> Self {
        if is_slot_turn {
            Self::SlotTurn
        } else {
            Self::NotSlotTurn
        }
    }

    pub fn on_move(self) -> MoveDisposition {
        match self {
            Self::NotSlotTurn => MoveDisposition::Reserve,
            Self::SlotTurn => MoveDisposition::Accept,
            Self::MoveProcessing | Self::TurnEnded => MoveDisposition::Ignore,
        }
    }

    pub fn on_timeout(&mut self) -> TimeoutDisposition {
        match self {
            Self::SlotTurn => {
                *self = Self::TurnEnded;
                TimeoutDisposition::SkipAndEndTurn
            },
            Self::MoveProcessing => TimeoutDisposition::SkipKeepInFlight,
            Self::NotSlotTurn | Self::TurnEnded => TimeoutDisposition::Ignore,
        }
    }

    /// A locally valid move was applied provisionally and sent.
    pub fn on_submitted(&mut self) {
        if *self == Self::SlotTurn {
            *self = Self::MoveProcessing;
        }
    }

    /// The server echoed our move for this turn.
    pub fn on_confirmed(&mut self) {
        *self = Self::NotSlotTurn;
    }

    /// The server refused our move; the turn is still ours.
    pub fn on_rejected(&mut self) {
        if *self == Self::MoveProcessing {
            *self = Self::SlotTurn;
        }
    }
}

/// Check a placement request against session context, turn ownership,
/// the used-block set and the board rules. Returns the move to persist.
///
/// `participant` is `None` for server-originated requests.
pub fn validate_move(
    session: &GameSession,
    participant: Option<u8>,
    block: Block,
    position: Position,
    slot: Slot,
    turn: u32,
) -> Result<Move, GameError> {
    check_context(session, participant, slot, turn)?;
    if session.used_blocks().is_used(slot, block.shape) {
        return Err(PlacementError::BlockAlreadyUsed(block.shape).into());
    }
    check_placement(
        session.board(),
        &block,
        position,
        slot,
        session.has_slot_moved(slot),
    )?;
    Ok(Move::Regular {
        block,
        position,
        slot,
        turn,
    })
}

/// Check a skip request. Exhaustion skips are accepted only for slots the
/// session already knows to be exhausted.
pub fn validate_skip(
    session: &GameSession,
    participant: Option<u8>,
    slot: Slot,
    turn: u32,
    cause: SkipCause,
) -> Result<Move, GameError> {
    check_context(session, participant, slot, turn)?;
    if cause == SkipCause::Exhausted && !session.is_exhausted(slot) {
        return Err(ContextError::SlotNotExhausted(slot).into());
    }
    Ok(Move::Skip { slot, turn, cause })
}

fn check_context(
    session: &GameSession,
    participant: Option<u8>,
    slot: Slot,
    turn: u32,
) -> Result<(), GameError> {
    match session.verify_move_context(turn, slot) {
        Ok(_) => {},
        Err(ContextError::InvalidTurn {
            expected,
            submitted,
        }) if submitted < expected => {
            return Err(GameError::Concurrency {
                submitted,
                current: expected,
            });
        },
        Err(e) => return Err(e.into()),
    }
    if let Some(participant) = participant
        && session.current_owner().participant != participant
    {
        return Err(ContextError::NotYourTurn.into());
    }
    Ok(())
}

/// Exhaustion state computed against a specific turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExhaustionScan {
    pub turn: u32,
    pub exhausted: [bool; Slot::COUNT],
}

/// Result of offering a scan to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// A later turn was accepted since the scan started; recompute.
    Stale,
    /// Slots that became exhausted with this scan.
    Applied(Vec<Slot>),
}

/// No unused shape of `slot` fits anywhere on `board`.
pub fn slot_exhausted(board: &Board, used: &UsedBlocks, slot: Slot) -> bool {
    !used
        .unused(slot)
        .any(|shape| has_any_legal_placement(board, slot, shape))
}

/// Exhaustion of every slot. Pure, so it may run on a blocking worker.
pub fn scan_exhaustion(turn: u32, board: &Board, used: &UsedBlocks) -> ExhaustionScan {
    let mut exhausted = [false; Slot::COUNT];
    for slot in Slot::ALL {
        exhausted[slot.index()] = slot_exhausted(board, used, slot);
    }
    ExhaustionScan { turn, exhausted }
}
