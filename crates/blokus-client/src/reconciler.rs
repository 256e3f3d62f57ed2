use blokus_core::block::Block;
use blokus_core::board::{Board, Position, apply_placement, rollback_placement};
use blokus_core::error::{ContextError, GameError, LedgerError};
use blokus_core::ledger::{Move, SkipCause};
use blokus_core::net::messages::{
    ClientMessage, MessageKind, RequestRef, RestoreSnapshot, SeatView, ServerMessage,
};
use blokus_core::session::{GamePhase, GameSession};
use blokus_core::slot::Slot;
use blokus_core::turn::{
    MoveDisposition, SlotTurnState, TimeoutDisposition, scan_exhaustion, validate_move,
};

/// A placement chosen before its slot's turn came round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedMove {
    pub block: Block,
    pub position: Position,
    pub slot: Slot,
}

/// What happened to a locally submitted placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Applied provisionally; send this to the server.
    Sent(ClientMessage),
    /// Held until the slot's turn.
    Reserved,
    /// Duplicate or late; nothing to do.
    Ignored,
}

/// Client-side mirror of a room's game.
///
/// `session` only ever holds server-confirmed moves. `display` is that board
/// plus the one provisional placement awaiting its echo, if any.
#[derive(Debug)]
pub struct ClientReconciler {
    user_id: String,
    seat: Option<u8>,
    session: GameSession,
    display: Board,
    slot_states: [SlotTurnState; Slot::COUNT],
    pending: Option<Move>,
    reserved: Option<PlannedMove>,
    needs_resync: bool,
}

impl ClientReconciler {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            seat: None,
            session: GameSession::new(),
            display: Board::new(),
            slot_states: [SlotTurnState::default(); Slot::COUNT],
            pending: None,
            reserved: None,
            needs_resync: false,
        }
    }

    pub fn seat(&self) -> Option<u8> {
        self.seat
    }

    pub fn set_seat(&mut self, seat: Option<u8>) {
        self.seat = seat;
        self.sync_slot_states();
    }

    pub fn session(&self) -> &GameSession {
        &self.session
    }

    /// Board to render: confirmed moves plus any provisional one.
    pub fn board(&self) -> &Board {
        &self.display
    }

    pub fn slot_state(&self, slot: Slot) -> SlotTurnState {
        self.slot_states[slot.index()]
    }

    pub fn pending(&self) -> Option<&Move> {
        self.pending.as_ref()
    }

    pub fn reserved(&self) -> Option<&PlannedMove> {
        self.reserved.as_ref()
    }

    /// Set when the local mirror can no longer be trusted; fetch a restore
    /// snapshot and call [`ClientReconciler::restore`].
    pub fn needs_resync(&self) -> bool {
        self.needs_resync
    }

    /// Slots this client may act for in the current game.
    pub fn my_slots(&self) -> Vec<Slot> {
        match (self.seat, self.session.game_id()) {
            (Some(seat), Some(_)) => self.session.player_count().slots_of(seat),
            _ => Vec::new(),
        }
    }

    /// A placement picked by the user for `slot`.
    pub fn submit_move(
        &mut self,
        block: Block,
        position: Position,
        slot: Slot,
    ) -> Result<SubmitOutcome, GameError> {
        if !self.my_slots().contains(&slot) {
            return Err(ContextError::NotYourTurn.into());
        }
        match self.slot_states[slot.index()].on_move() {
            MoveDisposition::Reserve => {
                tracing::debug!(%slot, "Reserving move until the slot's turn");
                self.reserved = Some(PlannedMove {
                    block,
                    position,
                    slot,
                });
                Ok(SubmitOutcome::Reserved)
            },
            MoveDisposition::Ignore => {
                tracing::debug!(%slot, state = ?self.slot_states[slot.index()], "Ignoring move");
                Ok(SubmitOutcome::Ignored)
            },
            MoveDisposition::Accept => {
                let turn = self.session.turn();
                let mv = validate_move(&self.session, self.seat, block, position, slot, turn)?;
                apply_placement(&mut self.display, &block, position, slot);
                self.pending = Some(mv);
                self.slot_states[slot.index()].on_submitted();
                Ok(SubmitOutcome::Sent(ClientMessage::Move {
                    block,
                    position,
                    slot,
                    turn,
                }))
            },
        }
    }

    /// The local countdown for `turn` ran out.
    pub fn on_timeout(&mut self, turn: u32, slot: Slot) -> Option<ClientMessage> {
        if turn != self.session.turn() {
            tracing::debug!(turn, current = self.session.turn(), "Ignoring stale turn timer");
            return None;
        }
        match self.slot_states[slot.index()].on_timeout() {
            TimeoutDisposition::SkipAndEndTurn => {},
            TimeoutDisposition::SkipKeepInFlight => {
                tracing::info!(turn, %slot, "Turn timed out with a move in flight");
            },
            TimeoutDisposition::Ignore => return None,
        }
        Some(ClientMessage::SkipTurn {
            slot,
            turn,
            timeout: true,
            exhausted: false,
        })
    }

    /// Fold one server message into the mirror. Returns messages to send back.
    pub fn on_server_message(&mut self, msg: &ServerMessage) -> Vec<ClientMessage> {
        match msg {
            ServerMessage::Connected { user_id, seat, .. } => {
                if *user_id == self.user_id {
                    self.set_seat(Some(*seat));
                }
                Vec::new()
            },
            ServerMessage::Leave { seats, .. } => {
                let seat = seat_in(seats, &self.user_id);
                self.set_seat(seat);
                Vec::new()
            },
            ServerMessage::Start {
                game_id,
                player_count,
                seats,
            } => {
                self.clear_transient();
                self.seat = seat_in(seats, &self.user_id);
                self.session.reset();
                if let Err(e) = self.session.initialize(*game_id, *player_count) {
                    tracing::warn!(error = %e, "Could not start local session");
                    self.needs_resync = true;
                }
                self.display = self.session.board().clone();
                self.sync_slot_states();
                Vec::new()
            },
            ServerMessage::Move {
                block,
                position,
                slot,
                turn,
            } => self.on_echo(Move::Regular {
                block: *block,
                position: *position,
                slot: *slot,
                turn: *turn,
            }),
            ServerMessage::SkipTurn {
                slot,
                turn,
                exhausted,
                ..
            } => self.on_echo(Move::Skip {
                slot: *slot,
                turn: *turn,
                cause: if *exhausted {
                    SkipCause::Exhausted
                } else {
                    SkipCause::Timeout
                },
            }),
            ServerMessage::Exhausted { slot, .. } => {
                self.session.mark_exhausted(*slot);
                self.sync_slot_states();
                Vec::new()
            },
            ServerMessage::BadReq { message, request } | ServerMessage::Error { message, request } => {
                self.on_rejection(message, *request);
                Vec::new()
            },
            ServerMessage::Mediate { board, turn } => {
                let board_differs = board.as_ref().is_some_and(|b| b != self.session.board());
                let turn_differs = turn.is_some_and(|t| t != self.session.turn());
                if board_differs || turn_differs {
                    tracing::warn!(board_differs, turn_differs, "Server state differs from mirror");
                    self.needs_resync = true;
                }
                Vec::new()
            },
            ServerMessage::ScoreConfirm { score } => {
                let local = self.session.ledger().replay().score();
                if local != *score {
                    tracing::warn!(local = ?local.slots, server = ?score.slots, "Score disagrees with local replay");
                }
                if self.session.phase() == GamePhase::InProgress
                    && let Err(e) = self.session.initiate_score_confirmation()
                {
                    tracing::warn!(error = %e, "Could not enter score confirmation");
                }
                self.clear_transient();
                self.sync_slot_states();
                vec![ClientMessage::ScoreConfirm { score: local }]
            },
            ServerMessage::GameEnd { score, .. } => {
                match score {
                    Some(_) if self.session.phase() == GamePhase::ConfirmingScore => {
                        if let Err(e) = self.session.end() {
                            tracing::warn!(error = %e, "Could not end local session");
                        }
                    },
                    _ => self.session.reset(),
                }
                self.clear_transient();
                self.display = self.session.board().clone();
                self.sync_slot_states();
                Vec::new()
            },
            ServerMessage::Ready { .. } | ServerMessage::CancelReady { .. } => Vec::new(),
        }
    }

    fn on_echo(&mut self, mv: Move) -> Vec<ClientMessage> {
        let current = self.session.turn();
        if mv.turn() < current {
            tracing::debug!(turn = mv.turn(), current, "Ignoring duplicate echo");
            return Vec::new();
        }
        if mv.turn() > current {
            tracing::warn!(turn = mv.turn(), current, "Missed echoes, resync needed");
            self.needs_resync = true;
            return Vec::new();
        }

        if let Some(pending) = self.pending.take()
            && pending != mv
        {
            tracing::info!(turn = current, "Server resolved the turn differently, dropping provisional move");
        }
        if let Err(e) = self.session.commit(mv) {
            tracing::warn!(turn = current, error = %e, "Echo did not apply to mirror");
            self.needs_resync = true;
            return Vec::new();
        }
        self.display = self.session.board().clone();
        self.slot_states[mv.slot().index()].on_confirmed();
        self.sync_slot_states();
        self.try_reserved()
    }

    fn on_rejection(&mut self, message: &str, request: Option<RequestRef>) {
        let Some(RequestRef {
            kind: MessageKind::Move,
            turn: Some(turn),
        }) = request
        else {
            tracing::debug!(reason = message, ?request, "Server rejected a request");
            return;
        };
        let Some(Move::Regular {
            block,
            position,
            slot,
            turn: pending_turn,
        }) = self.pending
        else {
            return;
        };
        if pending_turn != turn {
            return;
        }
        tracing::info!(turn, %slot, reason = message, "Move rejected, rolling back");
        rollback_placement(&mut self.display, &block, position, slot);
        self.pending = None;
        self.slot_states[slot.index()].on_rejected();
    }

    /// Submit a reserved move once its slot's turn arrives.
    fn try_reserved(&mut self) -> Vec<ClientMessage> {
        let Some(planned) = self.reserved else {
            return Vec::new();
        };
        if self.slot_states[planned.slot.index()] != SlotTurnState::SlotTurn {
            return Vec::new();
        }
        self.reserved = None;
        match self.submit_move(planned.block, planned.position, planned.slot) {
            Ok(SubmitOutcome::Sent(msg)) => vec![msg],
            Ok(_) => Vec::new(),
            Err(e) => {
                tracing::info!(slot = %planned.slot, error = %e, "Reserved move no longer legal");
                Vec::new()
            },
        }
    }

    /// Rebuild everything from a restore snapshot. The board is replayed from
    /// the ledger and exhaustion re-derived; nothing cached is trusted.
    pub fn restore(&mut self, snapshot: &RestoreSnapshot) -> Result<(), LedgerError> {
        self.clear_transient();
        self.needs_resync = false;

        self.session = match (snapshot.game_id, snapshot.player_count) {
            (Some(game_id), Some(player_count))
                if matches!(
                    snapshot.phase,
                    GamePhase::InProgress | GamePhase::ConfirmingScore
                ) =>
            {
                let mut session = GameSession::restore(
                    game_id,
                    player_count,
                    snapshot.moves.iter().copied(),
                    snapshot.exhausted_slots,
                )?;
                if session.turn() != snapshot.turn {
                    tracing::warn!(
                        ledger = session.turn(),
                        reported = snapshot.turn,
                        "Snapshot turn disagrees with its ledger, using the ledger"
                    );
                }
                let scan = scan_exhaustion(session.turn(), session.board(), session.used_blocks());
                session.apply_exhaustion_scan(&scan);
                if snapshot.phase == GamePhase::ConfirmingScore
                    && let Err(e) = session.initiate_score_confirmation()
                {
                    tracing::warn!(error = %e, "Could not restore score confirmation");
                }
                session
            },
            _ => GameSession::new(),
        };

        self.display = self.session.board().clone();
        self.sync_slot_states();
        Ok(())
    }

    fn clear_transient(&mut self) {
        self.pending = None;
        self.reserved = None;
        self.slot_states = [SlotTurnState::default(); Slot::COUNT];
    }

    /// Recompute every slot's state for the current turn, keeping an
    /// in-flight move or an ended turn for the slot that is up.
    fn sync_slot_states(&mut self) {
        let owner = self.session.current_owner();
        let in_play = self.session.phase() == GamePhase::InProgress;
        for slot in Slot::ALL {
            let mine = in_play
                && owner.slot == slot
                && self.seat == Some(owner.participant)
                && !self.session.is_exhausted(slot);
            let state = &mut self.slot_states[slot.index()];
            let keep = mine
                && matches!(
                    state,
                    SlotTurnState::MoveProcessing | SlotTurnState::TurnEnded
                );
            if !keep {
                *state = SlotTurnState::for_turn(mine);
            }
        }
    }
}

fn seat_in(seats: &[Option<SeatView>], user_id: &str) -> Option<u8> {
    seats
        .iter()
        .position(|s| s.as_ref().is_some_and(|s| s.user_id == user_id))
        .map(|i| i as u8)
}
