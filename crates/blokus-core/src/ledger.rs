use serde::{Deserialize, Serialize};

use crate::block::{Block, UsedBlocks};
use crate::board::{Board, Position, apply_placement};
use crate::error::LedgerError;
use crate::slot::Slot;

/// Why a turn passed without a placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkipCause {
    Timeout,
    Exhausted,
}

/// A resolved turn. Immutable once appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Move {
    Regular {
        block: Block,
        position: Position,
        slot: Slot,
        turn: u32,
    },
    Skip {
        slot: Slot,
        turn: u32,
        cause: SkipCause,
    },
}

impl Move {
    pub fn turn(&self) -> u32 {
        match self {
            Self::Regular { turn, .. } | Self::Skip { turn, .. } => *turn,
        }
    }

    pub fn slot(&self) -> Slot {
        match self {
            Self::Regular { slot, .. } | Self::Skip { slot, .. } => *slot,
        }
    }
}

/// Append-only, turn-ordered record of resolved moves. Entry `n` is turn `n`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MoveLedger {
    moves: Vec<Move>,
}

impl MoveLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from stored moves, which must already be in turn order
    /// starting at turn 0.
    pub fn from_moves(moves: impl IntoIterator<Item = Move>) -> Result<Self, LedgerError> {
        let mut ledger = Self::new();
        for mv in moves {
            ledger.append(mv)?;
        }
        Ok(ledger)
    }

    pub fn append(&mut self, mv: Move) -> Result<(), LedgerError> {
        let expected = self.moves.len() as u32;
        if mv.turn() != expected {
            return Err(LedgerError::OutOfOrder {
                expected,
                submitted: mv.turn(),
            });
        }
        self.moves.push(mv);
        Ok(())
    }

    pub fn all(&self) -> &[Move] {
        &self.moves
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Fresh board with every Regular move applied in turn order.
    pub fn replay(&self) -> Board {
        let mut board = Board::new();
        for mv in &self.moves {
            if let Move::Regular {
                block,
                position,
                slot,
                ..
            } = mv
            {
                apply_placement(&mut board, block, *position, *slot);
            }
        }
        board
    }

    /// Shapes each slot has placed so far.
    pub fn used_blocks(&self) -> UsedBlocks {
        let mut used = UsedBlocks::default();
        for mv in &self.moves {
            if let Move::Regular { block, slot, .. } = mv {
                used.mark(*slot, block.shape);
            }
        }
        used
    }
}
