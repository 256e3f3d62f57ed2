use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use uuid::Uuid;

use blokus_core::block::Block;
use blokus_core::board::{Position, Score};
use blokus_core::error::{ContextError, GameError, LobbyError};
use blokus_core::ledger::{Move, SkipCause};
use blokus_core::net::messages::{ClientMessage, RequestRef, ServerMessage};
use blokus_core::room::RoomRecord;
use blokus_core::session::{ExhaustionOutcome, GamePhase, GameSession};
use blokus_core::slot::Slot;
use blokus_core::turn::{
    ExhaustionScan, ScanOutcome, scan_exhaustion, slot_exhausted, validate_move, validate_skip,
};

use crate::config::ServerConfig;
use crate::relay::{EventRelay, RoomRequest};
use crate::store::{MoveRecord, MoveStore, RoomCache, update_room};

/// Commands sent to a room actor.
#[derive(Debug)]
pub enum GameCommand {
    Request(RoomRequest),
    Stop,
}

/// Everything a room actor talks to.
#[derive(Clone)]
pub struct RoomContext {
    pub room_id: String,
    pub relay: Arc<EventRelay>,
    pub moves: Arc<dyn MoveStore>,
    pub cache: Arc<dyn RoomCache>,
    pub config: Arc<ServerConfig>,
}

/// Spawn the single writer for a room. `session` and `record` are the state
/// the actor starts from (fresh lobby or a restored game).
pub fn spawn_room_actor(
    ctx: RoomContext,
    session: GameSession,
    record: RoomRecord,
) -> (mpsc::UnboundedSender<GameCommand>, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let actor = RoomActor {
        ctx,
        session,
        record,
        confirmed: HashSet::new(),
        turn_deadline: None,
        confirm_deadline: None,
        scans: JoinSet::new(),
    };
    let handle = tokio::spawn(actor.run(cmd_rx));
    (cmd_tx, handle)
}

struct RoomActor {
    ctx: RoomContext,
    session: GameSession,
    /// Last Room Cache record this actor wrote or read.
    record: RoomRecord,
    /// Participants whose score matched during confirmation.
    confirmed: HashSet<u8>,
    turn_deadline: Option<Instant>,
    confirm_deadline: Option<Instant>,
    scans: JoinSet<ExhaustionScan>,
}

impl RoomActor {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<GameCommand>) {
        if self.session.phase() == GamePhase::InProgress {
            tracing::info!(
                room_id = %self.ctx.room_id,
                turn = self.session.turn(),
                "Resuming restored game"
            );
            self.arm_turn_deadline();
            self.spawn_scan();
        }

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(GameCommand::Request(request)) => self.handle_request(request).await,
                    Some(GameCommand::Stop) | None => break,
                },
                Some(joined) = self.scans.join_next(), if !self.scans.is_empty() => match joined {
                    Ok(scan) => self.on_scan(scan).await,
                    Err(e) => tracing::error!(room_id = %self.ctx.room_id, error = %e, "Exhaustion scan failed"),
                },
                () = sleep_until(deadline) => self.on_deadline().await,
            }
        }

        tracing::debug!(room_id = %self.ctx.room_id, "Room actor stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.turn_deadline, self.confirm_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn handle_request(&mut self, request: RoomRequest) {
        let request_ref = request.message.request_ref();
        let result = match request.message.clone() {
            ClientMessage::Connected { .. } => self.on_connected(&request).await,
            ClientMessage::Leave => self.on_leave(&request).await,
            ClientMessage::Ready => self.on_ready(&request, true).await,
            ClientMessage::CancelReady => self.on_ready(&request, false).await,
            ClientMessage::Start => self.on_start(&request).await,
            ClientMessage::Move {
                block,
                position,
                slot,
                turn,
            } => self.on_move(&request, block, position, slot, turn).await,
            ClientMessage::SkipTurn {
                slot,
                turn,
                exhausted,
                ..
            } => self.on_skip(&request, slot, turn, exhausted).await,
            ClientMessage::Exhausted { slot } => self.on_exhaustion_report(slot).await,
            ClientMessage::ScoreConfirm { score } => self.on_score_confirm(&request, score).await,
        };

        if let Err(e) = result {
            self.reject(&request, request_ref, e).await;
        }
    }

    fn participant_of(&self, user_id: &str) -> Result<u8, GameError> {
        self.record
            .seat_of(user_id)
            .ok_or(GameError::Lobby(LobbyError::NotSeated))
    }

    async fn on_connected(&mut self, request: &RoomRequest) -> Result<(), GameError> {
        let user_id = request.user_id.clone();
        let username = request.username.clone();
        let seat = self
            .update_record(|room| Ok(room.seat_user(&user_id, &username)?))
            .await?;
        tracing::info!(room_id = %self.ctx.room_id, user_id = %user_id, seat, "User seated");

        self.broadcast(ServerMessage::Connected {
            room_id: self.ctx.room_id.clone(),
            user_id: request.user_id.clone(),
            seat,
            seats: self.record.seat_views(),
        })
        .await;

        if matches!(
            self.session.phase(),
            GamePhase::InProgress | GamePhase::ConfirmingScore
        ) {
            self.send_to(
                request.connection,
                ServerMessage::Mediate {
                    board: Some(self.session.board().clone()),
                    turn: Some(self.session.turn()),
                },
            )
            .await;
        }
        Ok(())
    }

    async fn on_leave(&mut self, request: &RoomRequest) -> Result<(), GameError> {
        let user_id = request.user_id.clone();
        let in_game = matches!(
            self.session.phase(),
            GamePhase::InProgress | GamePhase::ConfirmingScore
        );

        if in_game {
            self.update_record(|room| {
                room.end_game();
                Ok(room.vacate(&user_id)?)
            })
            .await?;
            self.session.reset();
            self.turn_deadline = None;
            self.confirm_deadline = None;
            self.confirmed.clear();
            tracing::info!(room_id = %self.ctx.room_id, user_id = %user_id, "Game aborted by leaving player");
            self.broadcast(ServerMessage::GameEnd {
                score: None,
                participant_scores: Vec::new(),
            })
            .await;
        } else {
            self.update_record(|room| Ok(room.vacate(&user_id)?))
                .await?;
        }

        self.broadcast(ServerMessage::Leave {
            user_id: request.user_id.clone(),
            seats: self.record.seat_views(),
        })
        .await;
        Ok(())
    }

    async fn on_ready(&mut self, request: &RoomRequest, ready: bool) -> Result<(), GameError> {
        let user_id = request.user_id.clone();
        self.update_record(|room| Ok(room.set_ready(&user_id, ready)?))
            .await?;
        let seats = self.record.seat_views();
        let msg = if ready {
            ServerMessage::Ready {
                user_id: request.user_id.clone(),
                seats,
            }
        } else {
            ServerMessage::CancelReady {
                user_id: request.user_id.clone(),
                seats,
            }
        };
        self.broadcast(msg).await;
        Ok(())
    }

    async fn on_start(&mut self, request: &RoomRequest) -> Result<(), GameError> {
        match self.session.phase() {
            GamePhase::InProgress | GamePhase::ConfirmingScore => {
                return Err(ContextError::AlreadyStarted.into());
            },
            GamePhase::Ended => self.session.reset(),
            GamePhase::NotStarted => {},
        }

        let user_id = request.user_id.clone();
        let game_id = Uuid::new_v4();
        let player_count = self
            .update_record(|room| {
                room.seat_of(&user_id).ok_or(LobbyError::NotSeated)?;
                let count = room.check_startable()?;
                room.begin_game(game_id);
                Ok(count)
            })
            .await?;
        self.session.initialize(game_id, player_count)?;
        self.confirmed.clear();
        self.arm_turn_deadline();

        tracing::info!(
            room_id = %self.ctx.room_id,
            %game_id,
            players = player_count.get(),
            "Game started"
        );
        self.broadcast(ServerMessage::Start {
            game_id,
            player_count,
            seats: self.record.seat_views(),
        })
        .await;
        Ok(())
    }

    async fn on_move(
        &mut self,
        request: &RoomRequest,
        block: Block,
        position: Position,
        slot: Slot,
        turn: u32,
    ) -> Result<(), GameError> {
        let participant = self.participant_of(&request.user_id)?;
        let mv = validate_move(&self.session, Some(participant), block, position, slot, turn)?;
        self.resolve_and_settle(mv).await
    }

    async fn on_skip(
        &mut self,
        request: &RoomRequest,
        slot: Slot,
        turn: u32,
        exhausted: bool,
    ) -> Result<(), GameError> {
        let participant = self.participant_of(&request.user_id)?;
        let cause = ClientMessage::skip_cause(exhausted);
        let mv = validate_skip(&self.session, Some(participant), slot, turn, cause)?;
        self.resolve_and_settle(mv).await
    }

    async fn resolve_and_settle(&mut self, mv: Move) -> Result<(), GameError> {
        self.resolve(mv).await?;
        self.settle().await;
        Ok(())
    }

    /// Persist then commit one validated move. The store append comes first
    /// so a storage failure leaves board and ledger untouched.
    async fn resolve(&mut self, mv: Move) -> Result<(), GameError> {
        let game_id = self.session.game_id().ok_or(ContextError::MissingGameId)?;
        let record = MoveRecord::from_move(game_id, &mv)?;
        self.ctx.moves.append(record).await?;
        let turn = self.session.commit(mv)?;

        tracing::info!(
            room_id = %self.ctx.room_id,
            turn = mv.turn(),
            slot = %mv.slot(),
            skip = matches!(mv, Move::Skip { .. }),
            "Move resolved"
        );
        self.broadcast(ServerMessage::from_move(&mv)).await;

        if let Err(e) = self
            .update_record(|room| {
                room.turn = turn;
                Ok(())
            })
            .await
        {
            tracing::warn!(room_id = %self.ctx.room_id, turn, error = %e, "Failed to record turn in room cache");
        }

        self.arm_turn_deadline();
        self.spawn_scan();
        Ok(())
    }

    /// Skip every exhausted slot that is up, and move to score confirmation
    /// once nobody can place anything.
    async fn settle(&mut self) {
        while self.session.phase() == GamePhase::InProgress {
            if self.session.all_exhausted() {
                self.enter_confirmation().await;
                return;
            }
            let owner = self.session.current_owner();
            if !self.session.is_exhausted(owner.slot) {
                return;
            }
            let skip = Move::Skip {
                slot: owner.slot,
                turn: self.session.turn(),
                cause: SkipCause::Exhausted,
            };
            if let Err(e) = self.resolve(skip).await {
                tracing::warn!(
                    room_id = %self.ctx.room_id,
                    slot = %owner.slot,
                    error = %e,
                    "Automatic exhausted skip failed, waiting for the turn deadline"
                );
                return;
            }
        }
    }

    fn spawn_scan(&mut self) {
        let turn = self.session.turn();
        let board = self.session.board().clone();
        let used = *self.session.used_blocks();
        self.scans
            .spawn_blocking(move || scan_exhaustion(turn, &board, &used));
    }

    async fn on_scan(&mut self, scan: ExhaustionScan) {
        let newly = match self.session.apply_exhaustion_scan(&scan) {
            ScanOutcome::Stale => return,
            ScanOutcome::Applied(newly) => newly,
        };
        if !newly.is_empty() {
            self.record_exhaustion().await;
            for slot in newly {
                tracing::info!(room_id = %self.ctx.room_id, %slot, turn = scan.turn, "Slot exhausted");
                self.broadcast(ServerMessage::Exhausted {
                    slot,
                    turn: scan.turn,
                })
                .await;
            }
        }
        self.settle().await;
    }

    /// A client claims one of the slots can no longer place anything.
    async fn on_exhaustion_report(&mut self, slot: Slot) -> Result<(), GameError> {
        if self.session.phase() != GamePhase::InProgress {
            return Err(ContextError::NotStarted.into());
        }
        if !slot_exhausted(self.session.board(), self.session.used_blocks(), slot) {
            tracing::warn!(room_id = %self.ctx.room_id, %slot, "Rejected unconfirmed exhaustion report");
            return Err(ContextError::SlotNotExhausted(slot).into());
        }
        if self.session.mark_exhausted(slot) == ExhaustionOutcome::NewlyExhausted {
            self.record_exhaustion().await;
            self.broadcast(ServerMessage::Exhausted {
                slot,
                turn: self.session.turn(),
            })
            .await;
            self.settle().await;
        }
        Ok(())
    }

    async fn record_exhaustion(&mut self) {
        let exhausted = self.session.exhausted();
        if let Err(e) = self
            .update_record(|room| {
                room.exhausted = exhausted;
                Ok(())
            })
            .await
        {
            tracing::warn!(room_id = %self.ctx.room_id, error = %e, "Failed to record exhaustion in room cache");
        }
    }

    async fn enter_confirmation(&mut self) {
        match self.session.initiate_score_confirmation() {
            Ok(score) => {
                self.turn_deadline = None;
                self.confirm_deadline =
                    Some(Instant::now() + self.ctx.config.turns.score_confirm_window());
                self.confirmed.clear();
                tracing::info!(room_id = %self.ctx.room_id, score = ?score.slots, "All slots exhausted, confirming score");
                self.broadcast(ServerMessage::ScoreConfirm { score }).await;
            },
            Err(e) => {
                tracing::warn!(room_id = %self.ctx.room_id, error = %e, "Could not enter score confirmation");
            },
        }
    }

    async fn on_score_confirm(
        &mut self,
        request: &RoomRequest,
        score: Score,
    ) -> Result<(), GameError> {
        if self.session.phase() != GamePhase::ConfirmingScore {
            return Err(ContextError::NotConfirming.into());
        }
        let participant = self.participant_of(&request.user_id)?;
        if self.session.final_score() != Some(score) {
            tracing::info!(
                room_id = %self.ctx.room_id,
                participant,
                "Score mismatch, sending authoritative board"
            );
            self.send_to(
                request.connection,
                ServerMessage::Mediate {
                    board: Some(self.session.board().clone()),
                    turn: Some(self.session.turn()),
                },
            )
            .await;
            return Ok(());
        }

        self.confirmed.insert(participant);
        if self.confirmed.len() >= self.session.player_count().get() as usize {
            self.finish().await;
        }
        Ok(())
    }

    async fn finish(&mut self) {
        self.confirm_deadline = None;
        let score = match self.session.end() {
            Ok(score) => score,
            Err(e) => {
                tracing::warn!(room_id = %self.ctx.room_id, error = %e, "Could not end game");
                return;
            },
        };
        let participant_scores = score.participant_totals(self.session.player_count());

        if let Err(e) = self
            .update_record(|room| {
                room.end_game();
                Ok(())
            })
            .await
        {
            tracing::error!(room_id = %self.ctx.room_id, error = %e, "Failed to reopen lobby after game end");
        }

        tracing::info!(
            room_id = %self.ctx.room_id,
            scores = ?participant_scores,
            confirmed = self.confirmed.len(),
            "Game ended"
        );
        self.broadcast(ServerMessage::GameEnd {
            score: Some(score),
            participant_scores,
        })
        .await;
    }

    async fn on_deadline(&mut self) {
        let now = Instant::now();
        if let Some(deadline) = self.confirm_deadline
            && deadline <= now
        {
            tracing::info!(room_id = %self.ctx.room_id, "Score confirmation window closed");
            self.finish().await;
            return;
        }

        if let Some(deadline) = self.turn_deadline
            && deadline <= now
        {
            self.turn_deadline = None;
            if self.session.phase() != GamePhase::InProgress {
                return;
            }
            let owner = self.session.current_owner();
            let skip = Move::Skip {
                slot: owner.slot,
                turn: self.session.turn(),
                cause: SkipCause::Timeout,
            };
            tracing::info!(
                room_id = %self.ctx.room_id,
                turn = self.session.turn(),
                slot = %owner.slot,
                "Turn deadline passed, skipping"
            );
            match self.resolve(skip).await {
                Ok(()) => self.settle().await,
                Err(e) => {
                    tracing::warn!(room_id = %self.ctx.room_id, error = %e, "Timeout skip failed, retrying next deadline");
                    self.arm_turn_deadline();
                },
            }
        }
    }

    fn arm_turn_deadline(&mut self) {
        self.turn_deadline = Some(Instant::now() + self.ctx.config.turns.turn_deadline());
    }

    async fn reject(&self, request: &RoomRequest, request_ref: RequestRef, error: GameError) {
        let message = error.client_message();
        if matches!(error, GameError::Concurrency { .. }) {
            tracing::debug!(room_id = %self.ctx.room_id, user_id = %request.user_id, error = %error, "Stale submission rejected");
        } else {
            tracing::warn!(
                room_id = %self.ctx.room_id,
                user_id = %request.user_id,
                kind = ?request_ref.kind,
                error = %error,
                "Request rejected"
            );
        }
        let reply = if error.is_retryable() {
            ServerMessage::Error {
                message,
                request: Some(request_ref),
            }
        } else {
            ServerMessage::BadReq {
                message,
                request: Some(request_ref),
            }
        };
        self.send_to(request.connection, reply).await;
    }

    async fn update_record<T: Send>(
        &mut self,
        mutate: impl FnMut(&mut RoomRecord) -> Result<T, GameError> + Send,
    ) -> Result<T, GameError> {
        let (record, out) = update_room(
            self.ctx.cache.as_ref(),
            &self.ctx.room_id,
            self.ctx.config.cache.max_update_attempts,
            mutate,
        )
        .await?;
        self.record = record;
        Ok(out)
    }

    async fn broadcast(&self, msg: ServerMessage) {
        if let Err(e) = self.ctx.relay.broadcast(&self.ctx.room_id, &msg).await {
            tracing::error!(room_id = %self.ctx.room_id, kind = ?msg.kind(), error = %e, "Failed to broadcast");
        }
    }

    async fn send_to(&self, connection: Uuid, msg: ServerMessage) {
        if let Err(e) = self
            .ctx
            .relay
            .send_to(&self.ctx.room_id, connection, &msg)
            .await
        {
            tracing::error!(room_id = %self.ctx.room_id, %connection, kind = ?msg.kind(), error = %e, "Failed to send");
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::extract::ws::Utf8Bytes;
    use blokus_core::block::ShapeKind;
    use blokus_core::net::messages::MessageKind;
    use blokus_core::net::protocol::decode_server_message;
    use blokus_core::slot::PlayerCount;
    use blokus_core::test_helpers::{opening_round, ready_room};

    use super::*;
    use crate::config::TurnsConfig;
    use crate::relay::{LocalBus, RoomBus};
    use crate::store::{InMemoryMoveStore, InMemoryRoomCache, StoreError};

    const ROOM: &str = "room";

    struct Harness {
        tx: mpsc::UnboundedSender<GameCommand>,
        frames: mpsc::Receiver<Utf8Bytes>,
        connection: Uuid,
        moves: Arc<dyn MoveStore>,
        cache: Arc<InMemoryRoomCache>,
        _commands: mpsc::UnboundedReceiver<(String, RoomRequest)>,
    }

    impl Harness {
        async fn new(turns: TurnsConfig) -> Self {
            Self::with_state(
                turns,
                Arc::new(InMemoryMoveStore::new()),
                GameSession::new(),
                RoomRecord::new(ROOM),
            )
            .await
        }

        /// Actor resuming a game already under way: `users` seated in order,
        /// `moves` played and the given slots flagged exhausted.
        async fn restored(
            turns: TurnsConfig,
            users: &[&str],
            moves: Vec<Move>,
            exhausted: [bool; Slot::COUNT],
        ) -> Self {
            let game_id = Uuid::new_v4();
            let mut record = ready_room(ROOM, users);
            let count = record.check_startable().unwrap();
            record.begin_game(game_id);
            record.turn = moves.len() as u32;
            record.exhausted = exhausted;

            let store = Arc::new(InMemoryMoveStore::new());
            for mv in &moves {
                store
                    .append(MoveRecord::from_move(game_id, mv).unwrap())
                    .await
                    .unwrap();
            }
            let session = GameSession::restore(game_id, count, moves, exhausted).unwrap();
            Self::with_state(turns, store, session, record).await
        }

        async fn with_state(
            turns: TurnsConfig,
            moves: Arc<dyn MoveStore>,
            session: GameSession,
            record: RoomRecord,
        ) -> Self {
            let bus: Arc<dyn RoomBus> = Arc::new(LocalBus::new(64));
            let (relay, commands) = EventRelay::new("test".into(), bus);
            let relay = Arc::new(relay);
            let connection = Uuid::new_v4();
            let (frame_tx, frames) = mpsc::channel(64);
            relay.register(ROOM, connection, frame_tx).await.unwrap();

            let cache = Arc::new(InMemoryRoomCache::new());
            cache.compare_and_swap(ROOM, None, record.clone()).await.unwrap();
            let ctx = RoomContext {
                room_id: ROOM.into(),
                relay,
                moves: Arc::clone(&moves),
                cache: Arc::clone(&cache) as Arc<dyn RoomCache>,
                config: Arc::new(ServerConfig {
                    turns,
                    ..ServerConfig::default()
                }),
            };
            let (tx, _task) = spawn_room_actor(ctx, session, record);
            Self {
                tx,
                frames,
                connection,
                moves,
                cache,
                _commands: commands,
            }
        }

        fn send(&self, user: &str, message: ClientMessage) {
            self.tx
                .send(GameCommand::Request(RoomRequest {
                    connection: self.connection,
                    user_id: user.into(),
                    username: user.into(),
                    message,
                }))
                .unwrap();
        }

        async fn next(&mut self) -> ServerMessage {
            let frame = tokio::time::timeout(Duration::from_secs(120), self.frames.recv())
                .await
                .expect("frame within timeout")
                .expect("relay open");
            decode_server_message(frame.as_str()).unwrap()
        }

        async fn next_of(&mut self, kind: MessageKind) -> ServerMessage {
            loop {
                let msg = self.next().await;
                if msg.kind() == kind {
                    return msg;
                }
            }
        }

        /// Seat two ready players and start.
        async fn start_two(&mut self) -> Uuid {
            for user in ["a", "b"] {
                self.send(
                    user,
                    ClientMessage::Connected {
                        room_id: ROOM.into(),
                        user_id: user.into(),
                        username: user.into(),
                    },
                );
                self.send(user, ClientMessage::Ready);
            }
            self.send("a", ClientMessage::Start);
            match self.next_of(MessageKind::Start).await {
                ServerMessage::Start {
                    game_id,
                    player_count,
                    ..
                } => {
                    assert_eq!(player_count, PlayerCount::Two);
                    game_id
                },
                other => panic!("expected START, got {other:?}"),
            }
        }
    }

    /// Move store that is down for writes.
    struct FailingStore;

    #[async_trait]
    impl MoveStore for FailingStore {
        async fn append(&self, _record: MoveRecord) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn moves_for_game(&self, _game_id: Uuid) -> Result<Vec<MoveRecord>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn quick_turns() -> TurnsConfig {
        TurnsConfig {
            timeout_secs: 60,
            grace_ms: 0,
            score_confirm_secs: 5,
        }
    }

    fn corner_move(slot: u8, turn: u32) -> ClientMessage {
        let slot = Slot::ALL[slot as usize];
        let (row, col) = slot.corner();
        ClientMessage::Move {
            block: Block::upright(ShapeKind::I1),
            position: Position::new(row as i32, col as i32),
            slot,
            turn,
        }
    }

    #[tokio::test]
    async fn lobby_flow_seats_and_starts() {
        let mut h = Harness::new(quick_turns()).await;
        let game_id = h.start_two().await;
        let record = h.cache.get(ROOM).await.unwrap().unwrap().value;
        assert!(record.started);
        assert_eq!(record.game_id, Some(game_id));
    }

    #[tokio::test]
    async fn start_without_ready_players_is_a_bad_request() {
        let mut h = Harness::new(quick_turns()).await;
        h.send(
            "a",
            ClientMessage::Connected {
                room_id: ROOM.into(),
                user_id: "a".into(),
                username: "a".into(),
            },
        );
        h.send("a", ClientMessage::Start);
        match h.next_of(MessageKind::BadReq).await {
            ServerMessage::BadReq { message, request } => {
                assert_eq!(message, "need 2 to 4 seated players");
                assert_eq!(request.unwrap().kind, MessageKind::Start);
            },
            other => panic!("expected BAD_REQ, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn valid_move_is_persisted_and_echoed() {
        let mut h = Harness::new(quick_turns()).await;
        let game_id = h.start_two().await;
        h.send("a", corner_move(0, 0));
        match h.next_of(MessageKind::Move).await {
            ServerMessage::Move { turn, slot, .. } => {
                assert_eq!(turn, 0);
                assert_eq!(slot, Slot::ALL[0]);
            },
            other => panic!("expected MOVE, got {other:?}"),
        }
        let stored = h.moves.moves_for_game(game_id).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn out_of_turn_and_illegal_moves_are_rejected() {
        let mut h = Harness::new(quick_turns()).await;
        h.start_two().await;

        // Seat 1 owns slots 1 and 3, not slot 0.
        h.send("b", corner_move(0, 0));
        match h.next_of(MessageKind::BadReq).await {
            ServerMessage::BadReq { message, .. } => assert_eq!(message, "not your turn"),
            other => panic!("expected BAD_REQ, got {other:?}"),
        }

        h.send(
            "a",
            ClientMessage::Move {
                block: Block::upright(ShapeKind::I1),
                position: Position::new(5, 5),
                slot: Slot::ALL[0],
                turn: 0,
            },
        );
        match h.next_of(MessageKind::BadReq).await {
            ServerMessage::BadReq { message, request } => {
                assert_eq!(message, "invalid first move");
                assert_eq!(request.unwrap().turn, Some(0));
            },
            other => panic!("expected BAD_REQ, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_submission_loses_on_the_turn_gate() {
        let mut h = Harness::new(quick_turns()).await;
        h.start_two().await;
        h.send("a", corner_move(0, 0));
        h.send("a", corner_move(0, 0));
        h.next_of(MessageKind::Move).await;
        match h.next_of(MessageKind::BadReq).await {
            ServerMessage::BadReq { message, .. } => assert_eq!(message, "invalid turn"),
            other => panic!("expected BAD_REQ, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_turn_is_skipped_by_the_server() {
        let mut h = Harness::new(TurnsConfig {
            timeout_secs: 1,
            grace_ms: 0,
            score_confirm_secs: 5,
        })
        .await;
        h.start_two().await;
        match h.next_of(MessageKind::SkipTurn).await {
            ServerMessage::SkipTurn {
                slot,
                turn,
                timeout,
                exhausted,
            } => {
                assert_eq!((slot, turn), (Slot::ALL[0], 0));
                assert!(timeout && !exhausted);
            },
            other => panic!("expected SKIP_TURN, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhaustion_report_is_verified() {
        let mut h = Harness::new(quick_turns()).await;
        h.start_two().await;
        h.send("a", ClientMessage::Exhausted { slot: Slot::ALL[1] });
        match h.next_of(MessageKind::BadReq).await {
            ServerMessage::BadReq { message, .. } => assert_eq!(message, "slot is not exhausted"),
            other => panic!("expected BAD_REQ, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn leaving_mid_game_aborts_it() {
        let mut h = Harness::new(quick_turns()).await;
        h.start_two().await;
        h.send("b", ClientMessage::Leave);
        match h.next_of(MessageKind::GameEnd).await {
            ServerMessage::GameEnd { score, .. } => assert!(score.is_none()),
            other => panic!("expected GAME_END, got {other:?}"),
        }
        h.next_of(MessageKind::Leave).await;
        let record = h.cache.get(ROOM).await.unwrap().unwrap().value;
        assert!(!record.started);
        assert_eq!(record.seated_count(), 1);
    }

    #[tokio::test]
    async fn store_failure_leaves_the_game_untouched() {
        let mut h = Harness::with_state(
            quick_turns(),
            Arc::new(FailingStore),
            GameSession::new(),
            RoomRecord::new(ROOM),
        )
        .await;
        h.start_two().await;

        h.send("a", corner_move(0, 0));
        match h.next_of(MessageKind::Error).await {
            ServerMessage::Error { message, request } => {
                assert_eq!(message, "temporary failure, please retry");
                assert_eq!(
                    request,
                    Some(RequestRef {
                        kind: MessageKind::Move,
                        turn: Some(0),
                    })
                );
            },
            other => panic!("expected ERROR, got {other:?}"),
        }

        // Reconnecting shows the authoritative state: nothing was committed.
        h.send(
            "a",
            ClientMessage::Connected {
                room_id: ROOM.into(),
                user_id: "a".into(),
                username: "a".into(),
            },
        );
        match h.next_of(MessageKind::Mediate).await {
            ServerMessage::Mediate { board, turn } => {
                assert!(board.unwrap().is_empty());
                assert_eq!(turn, Some(0));
            },
            other => panic!("expected MEDIATE, got {other:?}"),
        }
        let record = h.cache.get(ROOM).await.unwrap().unwrap().value;
        assert_eq!(record.turn, 0);
    }

    #[tokio::test]
    async fn exhausted_slots_are_skipped_automatically() {
        let mut h = Harness::restored(
            quick_turns(),
            &["a", "b"],
            Vec::new(),
            [true, true, true, false],
        )
        .await;

        for expected in 0..3u32 {
            match h.next_of(MessageKind::SkipTurn).await {
                ServerMessage::SkipTurn {
                    slot,
                    turn,
                    timeout,
                    exhausted,
                } => {
                    assert_eq!((slot, turn), (Slot::ALL[expected as usize], expected));
                    assert!(exhausted && !timeout);
                },
                other => panic!("expected SKIP_TURN, got {other:?}"),
            }
        }

        // Slot 3 can still place, so its owner gets the turn.
        h.send("b", corner_move(3, 3));
        match h.next_of(MessageKind::Move).await {
            ServerMessage::Move { slot, turn, .. } => assert_eq!((slot, turn), (Slot::ALL[3], 3)),
            other => panic!("expected MOVE, got {other:?}"),
        }
        let game_id = h.cache.get(ROOM).await.unwrap().unwrap().value.game_id.unwrap();
        assert_eq!(h.moves.moves_for_game(game_id).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn score_confirmation_mediates_mismatches_and_ends_the_game() {
        let mut h = Harness::restored(quick_turns(), &["a", "b", "c"], opening_round(), [true; 4]).await;

        let score = match h.next_of(MessageKind::ScoreConfirm).await {
            ServerMessage::ScoreConfirm { score } => score,
            other => panic!("expected SCORE_CONFIRM, got {other:?}"),
        };
        assert_eq!(score.slots, [1, 1, 1, 1]);

        h.send("a", ClientMessage::ScoreConfirm { score: Score::default() });
        match h.next_of(MessageKind::Mediate).await {
            ServerMessage::Mediate { board, turn } => {
                assert_eq!(board.unwrap().score(), score);
                assert_eq!(turn, Some(4));
            },
            other => panic!("expected MEDIATE, got {other:?}"),
        }

        for user in ["a", "b", "c"] {
            h.send(user, ClientMessage::ScoreConfirm { score });
        }
        match h.next_of(MessageKind::GameEnd).await {
            ServerMessage::GameEnd {
                score: final_score,
                participant_scores,
            } => {
                assert_eq!(final_score, Some(score));
                assert_eq!(participant_scores, vec![1, 1, 1]);
            },
            other => panic!("expected GAME_END, got {other:?}"),
        }
        let record = h.cache.get(ROOM).await.unwrap().unwrap().value;
        assert!(!record.started);
        assert_eq!(record.seated_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_score_ends_the_game_when_the_window_closes() {
        let mut h = Harness::restored(quick_turns(), &["a", "b"], opening_round(), [true; 4]).await;

        h.next_of(MessageKind::ScoreConfirm).await;
        let opened = Instant::now();
        match h.next_of(MessageKind::GameEnd).await {
            ServerMessage::GameEnd {
                score,
                participant_scores,
            } => {
                assert_eq!(score.map(|s| s.slots), Some([1, 1, 1, 1]));
                assert_eq!(participant_scores, vec![2, 2]);
            },
            other => panic!("expected GAME_END, got {other:?}"),
        }
        assert!(opened.elapsed() >= Duration::from_secs(5));
    }
}
