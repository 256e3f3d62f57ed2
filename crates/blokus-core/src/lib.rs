pub mod block;
pub mod board;
pub mod error;
pub mod ledger;
pub mod net;
pub mod room;
pub mod session;
pub mod slot;
pub mod time;
pub mod turn;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers {
    use uuid::Uuid;

    use crate::block::{Block, ShapeKind};
    use crate::board::Position;
    use crate::ledger::Move;
    use crate::room::RoomRecord;
    use crate::session::GameSession;
    use crate::slot::{PlayerCount, Slot};

    /// In-progress session with a fresh game id and an empty board.
    pub fn started_session(count: PlayerCount) -> GameSession {
        let mut session = GameSession::new();
        session
            .initialize(Uuid::new_v4(), count)
            .expect("fresh session initializes");
        session
    }

    /// Monomino on `slot`'s own corner: always a legal opening.
    pub fn opening_move(slot: Slot, turn: u32) -> Move {
        let (row, col) = slot.corner();
        Move::Regular {
            block: Block::upright(ShapeKind::I1),
            position: Position::new(row as i32, col as i32),
            slot,
            turn,
        }
    }

    /// Room record with `users` seated in order, all ready.
    pub fn ready_room(id: &str, users: &[&str]) -> RoomRecord {
        let mut room = RoomRecord::new(id);
        for user in users {
            room.seat_user(user, user).expect("seat available");
            room.set_ready(user, true).expect("user seated");
        }
        room
    }

    /// Opening moves for turns 0..4 so every slot has left its corner.
    pub fn opening_round() -> Vec<Move> {
        Slot::ALL
            .into_iter()
            .enumerate()
            .map(|(turn, slot)| opening_move(slot, turn as u32))
            .collect()
    }
}
