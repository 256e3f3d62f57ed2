use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::block::UsedBlocks;
use crate::board::{self, Board, Score, apply_placement};
use crate::error::{ContextError, GameError, LedgerError};
use crate::ledger::{Move, MoveLedger};
use crate::net::messages::RestoreSnapshot;
use crate::slot::{PlayerCount, Slot};
use crate::turn::{ExhaustionScan, ScanOutcome, TurnOwner, turn_owner};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GamePhase {
    #[default]
    NotStarted,
    InProgress,
    ConfirmingScore,
    Ended,
}

/// Result of marking a slot exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionOutcome {
    NewlyExhausted,
    AlreadyExhausted,
}

/// One room's game: phase, turn counter, ledger and its board projection.
///
/// The board and used-block set are always derivable from the ledger;
/// they are cached here so validation does not replay on every request.
#[derive(Debug, Clone)]
pub struct GameSession {
    game_id: Option<Uuid>,
    phase: GamePhase,
    turn: u32,
    player_count: PlayerCount,
    exhausted: [bool; Slot::COUNT],
    final_score: Option<Score>,
    board: Board,
    ledger: MoveLedger,
    used: UsedBlocks,
}

impl Default for GameSession {
    fn default() -> Self {
        Self::new()
    }
}

impl GameSession {
    pub fn new() -> Self {
        Self {
            game_id: None,
            phase: GamePhase::NotStarted,
            turn: 0,
            player_count: PlayerCount::Four,
            exhausted: [false; Slot::COUNT],
            final_score: None,
            board: Board::new(),
            ledger: MoveLedger::new(),
            used: UsedBlocks::default(),
        }
    }

    /// NOT_STARTED → IN_PROGRESS with an empty board.
    pub fn initialize(&mut self, game_id: Uuid, player_count: PlayerCount) -> Result<(), ContextError> {
        if self.phase != GamePhase::NotStarted {
            return Err(ContextError::AlreadyStarted);
        }
        *self = Self {
            game_id: Some(game_id),
            phase: GamePhase::InProgress,
            player_count,
            ..Self::new()
        };
        Ok(())
    }

    /// Rebuild an in-progress session from stored moves. The turn counter
    /// and board are derived from the ledger, never taken from a cache.
    pub fn restore(
        game_id: Uuid,
        player_count: PlayerCount,
        moves: impl IntoIterator<Item = Move>,
        exhausted: [bool; Slot::COUNT],
    ) -> Result<Self, LedgerError> {
        let ledger = MoveLedger::from_moves(moves)?;
        Ok(Self {
            game_id: Some(game_id),
            phase: GamePhase::InProgress,
            turn: ledger.len() as u32,
            player_count,
            exhausted,
            final_score: None,
            board: ledger.replay(),
            used: ledger.used_blocks(),
            ledger,
        })
    }

    pub fn game_id(&self) -> Option<Uuid> {
        self.game_id
    }

    pub fn phase(&self) -> GamePhase {
        self.phase
    }

    pub fn turn(&self) -> u32 {
        self.turn
    }

    pub fn player_count(&self) -> PlayerCount {
        self.player_count
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn ledger(&self) -> &MoveLedger {
        &self.ledger
    }

    pub fn used_blocks(&self) -> &UsedBlocks {
        &self.used
    }

    pub fn exhausted(&self) -> [bool; Slot::COUNT] {
        self.exhausted
    }

    pub fn is_exhausted(&self, slot: Slot) -> bool {
        self.exhausted[slot.index()]
    }

    pub fn all_exhausted(&self) -> bool {
        self.exhausted.iter().all(|e| *e)
    }

    pub fn final_score(&self) -> Option<Score> {
        self.final_score
    }

    pub fn current_owner(&self) -> TurnOwner {
        turn_owner(self.turn, self.player_count)
    }

    pub fn has_slot_moved(&self, slot: Slot) -> bool {
        board::has_slot_moved(&self.board, slot)
    }

    /// Checks, in order: phase, turn, game id, slot of the current turn.
    pub fn verify_move_context(&self, turn: u32, slot: Slot) -> Result<Uuid, ContextError> {
        if self.phase != GamePhase::InProgress {
            return Err(ContextError::NotStarted);
        }
        if turn != self.turn {
            return Err(ContextError::InvalidTurn {
                expected: self.turn,
                submitted: turn,
            });
        }
        let game_id = self.game_id.ok_or(ContextError::MissingGameId)?;
        let expected = self.current_owner().slot;
        if slot != expected {
            return Err(ContextError::WrongSlot {
                expected,
                submitted: slot,
            });
        }
        Ok(game_id)
    }

    /// Next turn number, or `None` without effect outside IN_PROGRESS.
    pub fn advance_turn(&mut self) -> Option<u32> {
        if self.phase != GamePhase::InProgress {
            return None;
        }
        self.turn += 1;
        Some(self.turn)
    }

    /// Record an already-validated, already-persisted move and advance.
    /// Nothing changes when the ledger refuses the move.
    pub fn commit(&mut self, mv: Move) -> Result<u32, GameError> {
        if self.phase != GamePhase::InProgress {
            return Err(ContextError::NotStarted.into());
        }
        if mv.turn() != self.turn {
            return Err(GameError::Concurrency {
                submitted: mv.turn(),
                current: self.turn,
            });
        }
        self.ledger.append(mv)?;
        if let Move::Regular {
            block,
            position,
            slot,
            ..
        } = mv
        {
            apply_placement(&mut self.board, &block, position, slot);
            self.used.mark(slot, block.shape);
        }
        Ok(self.advance_turn().unwrap_or(self.turn))
    }

    pub fn mark_exhausted(&mut self, slot: Slot) -> ExhaustionOutcome {
        if self.exhausted[slot.index()] {
            ExhaustionOutcome::AlreadyExhausted
        } else {
            self.exhausted[slot.index()] = true;
            ExhaustionOutcome::NewlyExhausted
        }
    }

    /// Apply a background scan if it was computed against the current turn.
    pub fn apply_exhaustion_scan(&mut self, scan: &ExhaustionScan) -> ScanOutcome {
        if scan.turn != self.turn || self.phase != GamePhase::InProgress {
            tracing::debug!(
                scan_turn = scan.turn,
                turn = self.turn,
                phase = ?self.phase,
                "Discarding stale exhaustion scan"
            );
            return ScanOutcome::Stale;
        }
        let newly = Slot::ALL
            .into_iter()
            .filter(|slot| scan.exhausted[slot.index()])
            .filter(|&slot| self.mark_exhausted(slot) == ExhaustionOutcome::NewlyExhausted)
            .collect();
        ScanOutcome::Applied(newly)
    }

    /// IN_PROGRESS → CONFIRMING_SCORE. The score is replayed from the ledger.
    pub fn initiate_score_confirmation(&mut self) -> Result<Score, ContextError> {
        if self.phase != GamePhase::InProgress {
            return Err(ContextError::NotStarted);
        }
        let score = self.ledger.replay().score();
        self.final_score = Some(score);
        self.phase = GamePhase::ConfirmingScore;
        Ok(score)
    }

    /// CONFIRMING_SCORE → ENDED.
    pub fn end(&mut self) -> Result<Score, ContextError> {
        if self.phase != GamePhase::ConfirmingScore {
            return Err(ContextError::NotConfirming);
        }
        let score = self.final_score.unwrap_or_else(|| self.ledger.replay().score());
        self.phase = GamePhase::Ended;
        Ok(score)
    }

    /// Back to NOT_STARTED from any phase.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn snapshot(&self) -> RestoreSnapshot {
        RestoreSnapshot {
            game_id: self.game_id,
            phase: self.phase,
            turn: self.turn,
            player_count: self.game_id.map(|_| self.player_count),
            moves: self.ledger.all().to_vec(),
            exhausted_slots: self.exhausted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, ShapeKind};
    use crate::board::Position;
    use crate::ledger::SkipCause;
    use crate::test_helpers::{opening_move, started_session};

    #[test]
    fn fresh_session_rejects_moves() {
        let session = GameSession::new();
        assert_eq!(
            session.verify_move_context(0, Slot::ALL[0]),
            Err(ContextError::NotStarted)
        );
    }

    #[test]
    fn initialize_twice_is_refused() {
        let mut session = started_session(PlayerCount::Two);
        assert_eq!(
            session.initialize(Uuid::new_v4(), PlayerCount::Two),
            Err(ContextError::AlreadyStarted)
        );
    }

    // Scenario E
    #[test]
    fn move_one_turn_behind_is_a_context_error() {
        let mut session = started_session(PlayerCount::Four);
        session.commit(opening_move(Slot::ALL[0], 0)).unwrap();
        session.commit(opening_move(Slot::ALL[1], 1)).unwrap();
        let err = session.verify_move_context(1, Slot::ALL[1]).unwrap_err();
        assert_eq!(
            err,
            ContextError::InvalidTurn {
                expected: 2,
                submitted: 1
            }
        );
        assert_eq!(err.to_string(), "invalid turn");
        assert_eq!(session.turn(), 2);
    }

    #[test]
    fn wrong_slot_for_the_turn() {
        let session = started_session(PlayerCount::Two);
        assert_eq!(
            session.verify_move_context(0, Slot::ALL[2]).unwrap_err().to_string(),
            "wrong turn: try make move of your other slot"
        );
    }

    #[test]
    fn turn_advances_by_one_per_move_and_freezes_outside_play() {
        let mut session = started_session(PlayerCount::Four);
        assert_eq!(session.commit(opening_move(Slot::ALL[0], 0)), Ok(1));
        let skip = Move::Skip {
            slot: Slot::ALL[1],
            turn: 1,
            cause: SkipCause::Timeout,
        };
        assert_eq!(session.commit(skip), Ok(2));
        session.initiate_score_confirmation().unwrap();
        assert_eq!(session.advance_turn(), None);
        assert_eq!(session.turn(), 2);

        let mut fresh = GameSession::new();
        assert_eq!(fresh.advance_turn(), None);
        assert_eq!(fresh.turn(), 0);
    }

    #[test]
    fn out_of_turn_commit_leaves_session_untouched() {
        let mut session = started_session(PlayerCount::Four);
        let before = session.board().clone();
        let err = session.commit(opening_move(Slot::ALL[1], 1)).unwrap_err();
        assert_eq!(
            err,
            GameError::Concurrency {
                submitted: 1,
                current: 0
            }
        );
        assert_eq!(session.board(), &before);
        assert!(session.ledger().is_empty());
    }

    #[test]
    fn mark_exhausted_is_idempotent() {
        let mut session = started_session(PlayerCount::Three);
        assert_eq!(
            session.mark_exhausted(Slot::ALL[3]),
            ExhaustionOutcome::NewlyExhausted
        );
        assert_eq!(
            session.mark_exhausted(Slot::ALL[3]),
            ExhaustionOutcome::AlreadyExhausted
        );
        assert!(session.is_exhausted(Slot::ALL[3]));
    }

    #[test]
    fn stale_scan_is_not_applied() {
        let mut session = started_session(PlayerCount::Four);
        let scan = ExhaustionScan {
            turn: 0,
            exhausted: [false, true, false, false],
        };
        session.commit(opening_move(Slot::ALL[0], 0)).unwrap();
        assert_eq!(session.apply_exhaustion_scan(&scan), ScanOutcome::Stale);
        assert!(!session.is_exhausted(Slot::ALL[1]));

        let fresh = ExhaustionScan { turn: 1, ..scan };
        assert_eq!(
            session.apply_exhaustion_scan(&fresh),
            ScanOutcome::Applied(vec![Slot::ALL[1]])
        );
        assert_eq!(
            session.apply_exhaustion_scan(&fresh),
            ScanOutcome::Applied(vec![])
        );
    }

    #[test]
    fn restore_replays_the_ledger() {
        let mut live = started_session(PlayerCount::Four);
        for s in 0..4 {
            live.commit(opening_move(Slot::ALL[s], s as u32)).unwrap();
        }
        live.commit(Move::Regular {
            block: Block::upright(ShapeKind::I2),
            position: Position::new(1, 1),
            slot: Slot::ALL[0],
            turn: 4,
        })
        .unwrap();

        let game_id = live.game_id().unwrap();
        let restored = GameSession::restore(
            game_id,
            PlayerCount::Four,
            live.ledger().all().iter().copied(),
            [false; 4],
        )
        .unwrap();
        assert_eq!(restored.turn(), 5);
        assert_eq!(restored.board(), live.board());
        assert_eq!(restored.used_blocks(), live.used_blocks());
        assert_eq!(restored.phase(), GamePhase::InProgress);
    }

    #[test]
    fn score_flow_ends_the_game() {
        let mut session = started_session(PlayerCount::Two);
        session.commit(opening_move(Slot::ALL[0], 0)).unwrap();
        assert_eq!(session.end(), Err(ContextError::NotConfirming));
        let score = session.initiate_score_confirmation().unwrap();
        assert_eq!(score.slots, [1, 0, 0, 0]);
        assert_eq!(session.phase(), GamePhase::ConfirmingScore);
        assert_eq!(session.end(), Ok(score));
        assert_eq!(session.phase(), GamePhase::Ended);
        session.reset();
        assert_eq!(session.phase(), GamePhase::NotStarted);
        assert_eq!(session.turn(), 0);
    }

    #[test]
    fn snapshot_carries_the_ledger() {
        let mut session = started_session(PlayerCount::Three);
        session.commit(opening_move(Slot::ALL[0], 0)).unwrap();
        session.mark_exhausted(Slot::ALL[2]);
        let snapshot = session.snapshot();
        assert_eq!(snapshot.turn, 1);
        assert_eq!(snapshot.moves.len(), 1);
        assert_eq!(snapshot.exhausted_slots, [false, false, true, false]);
        assert_eq!(snapshot.phase, GamePhase::InProgress);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn turn_only_moves_forward(skips in proptest::collection::vec(proptest::bool::ANY, 1..40)) {
                let mut session = started_session(PlayerCount::Four);
                let mut last = session.turn();
                for stale in skips {
                    let turn = session.turn();
                    let owner = session.current_owner();
                    let submitted = if stale { turn.saturating_sub(1) } else { turn };
                    let mv = Move::Skip { slot: owner.slot, turn: submitted, cause: SkipCause::Timeout };
                    let _ = session.commit(mv);
                    prop_assert!(session.turn() == last || session.turn() == last + 1);
                    prop_assert!(session.turn() >= last);
                    last = session.turn();
                }
                prop_assert_eq!(session.turn() as usize, session.ledger().len());
            }
        }
    }
}
