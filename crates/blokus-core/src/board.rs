use serde::{Deserialize, Serialize};

use crate::block::{Block, ShapeKind};
use crate::error::PlacementError;
use crate::slot::{PlayerCount, Slot};

/// Side length of the square board.
pub const BOARD_SIZE: usize = 20;

const ORTHOGONALS: [(i32, i32); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];
const DIAGONALS: [(i32, i32); 4] = [(-1, -1), (-1, 1), (1, -1), (1, 1)];

/// Board coordinate of the top-left cell of a block's bounding box.
/// Signed so that out-of-range submissions reach the bounds check intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub row: i32,
    pub col: i32,
}

impl Position {
    pub const fn new(row: i32, col: i32) -> Self {
        Self { row, col }
    }
}

/// 20×20 grid of owning slots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Board {
    cells: [[Option<Slot>; BOARD_SIZE]; BOARD_SIZE],
}

impl Default for Board {
    fn default() -> Self {
        Self::new()
    }
}

impl Board {
    pub const fn new() -> Self {
        Self {
            cells: [[None; BOARD_SIZE]; BOARD_SIZE],
        }
    }

    /// Owner of a cell; anything off the board reads as empty.
    pub fn owner_at(&self, row: i32, col: i32) -> Option<Slot> {
        if in_bounds(row, col) {
            self.cells[row as usize][col as usize]
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cells.iter().flatten().all(Option::is_none)
    }

    /// Marks a single cell. Intended for fixtures and replay tooling; game
    /// code goes through [`apply_placement`].
    pub fn set(&mut self, row: usize, col: usize, owner: Option<Slot>) {
        self.cells[row][col] = owner;
    }

    /// Per-slot cell counts.
    pub fn score(&self) -> Score {
        let mut slots = [0u32; Slot::COUNT];
        for owner in self.cells.iter().flatten().flatten() {
            slots[owner.index()] += 1;
        }
        Score { slots }
    }
}

fn in_bounds(row: i32, col: i32) -> bool {
    (0..BOARD_SIZE as i32).contains(&row) && (0..BOARD_SIZE as i32).contains(&col)
}

/// Cell counts per slot, derived from a board.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Score {
    pub slots: [u32; Slot::COUNT],
}

impl Score {
    /// Totals per participant. The communal slot of a three-player game
    /// belongs to nobody and is not counted.
    pub fn participant_totals(&self, count: PlayerCount) -> Vec<u32> {
        let mut totals = vec![0; count.get() as usize];
        for slot in Slot::ALL {
            if let Some(owner) = count.slot_owner(slot) {
                totals[owner as usize] += self.slots[slot.index()];
            }
        }
        totals
    }
}

/// Whether `slot` has placed anything, judged by its corner cell.
///
/// Only sound because a legal first move always covers that exact cell.
pub fn has_slot_moved(board: &Board, slot: Slot) -> bool {
    let (row, col) = slot.corner();
    board.cells[row][col] == Some(slot)
}

/// Validate a single placement without touching the board.
///
/// Checks run in a fixed order and the first failure is reported:
/// bounds, first-move corner or corner contact, edge contact, overlap.
pub fn check_placement(
    board: &Board,
    block: &Block,
    position: Position,
    slot: Slot,
    has_moved_before: bool,
) -> Result<(), PlacementError> {
    let shape = block.matrix();

    let out_of_bounds = shape
        .filled_cells()
        .any(|(r, c)| !in_bounds(position.row + r, position.col + c));
    if out_of_bounds {
        return Err(PlacementError::OutOfBounds);
    }

    if has_moved_before {
        if !touches_corner(board, block, position, slot) {
            return Err(PlacementError::NoCornerConnection);
        }
    } else if !covers_start_corner(block, position, slot) {
        return Err(PlacementError::InvalidFirstMove);
    }

    let edge_contact = shape.filled_cells().any(|(r, c)| {
        ORTHOGONALS.iter().any(|(dr, dc)| {
            board.owner_at(position.row + r + dr, position.col + c + dc) == Some(slot)
        })
    });
    if edge_contact {
        return Err(PlacementError::EdgeContact);
    }

    let overlap = shape
        .filled_cells()
        .any(|(r, c)| board.owner_at(position.row + r, position.col + c).is_some());
    if overlap {
        return Err(PlacementError::Overlap);
    }

    Ok(())
}

/// The bounding-box corner matching the slot's board corner must be filled
/// and must sit exactly on that board corner.
fn covers_start_corner(block: &Block, position: Position, slot: Slot) -> bool {
    let shape = block.matrix();
    let last_row = shape.height() as i32 - 1;
    let last_col = shape.width() as i32 - 1;
    let (local_row, local_col) = match slot.index() {
        0 => (0, 0),
        1 => (0, last_col),
        2 => (last_row, last_col),
        _ => (last_row, 0),
    };
    let (corner_row, corner_col) = slot.corner();
    shape.is_filled(local_row, local_col)
        && position.row + local_row == corner_row as i32
        && position.col + local_col == corner_col as i32
}

/// At least one diagonal neighbour is owned by `slot`. Diagonal directions
/// that pass alongside another cell of the same block are not examined.
fn touches_corner(board: &Board, block: &Block, position: Position, slot: Slot) -> bool {
    let shape = block.matrix();
    shape.filled_cells().any(|(r, c)| {
        DIAGONALS.iter().any(|&(dr, dc)| {
            if shape.is_filled(r + dr, c) || shape.is_filled(r, c + dc) {
                return false;
            }
            board.owner_at(position.row + r + dr, position.col + c + dc) == Some(slot)
        })
    })
}

/// Write the block's cells for `slot`. Unchecked: call [`check_placement`] first.
pub fn apply_placement(board: &mut Board, block: &Block, position: Position, slot: Slot) {
    for (r, c) in block.matrix().filled_cells() {
        let (row, col) = (position.row + r, position.col + c);
        debug_assert!(in_bounds(row, col), "apply_placement outside the board");
        if in_bounds(row, col) {
            board.cells[row as usize][col as usize] = Some(slot);
        }
    }
}

/// Clear exactly the cells [`apply_placement`] would have set for `slot`.
pub fn rollback_placement(board: &mut Board, block: &Block, position: Position, slot: Slot) {
    for (r, c) in block.matrix().filled_cells() {
        let (row, col) = (position.row + r, position.col + c);
        if in_bounds(row, col) && board.cells[row as usize][col as usize] == Some(slot) {
            board.cells[row as usize][col as usize] = None;
        }
    }
}

/// Whether any orientation of `shape` fits anywhere for `slot`.
pub fn has_any_legal_placement(board: &Board, slot: Slot, shape: ShapeKind) -> bool {
    find_legal_placement(board, slot, shape).is_some()
}

/// First legal (block, position) for `shape`, scanning rotations, flips and
/// then positions row-major.
pub fn find_legal_placement(board: &Board, slot: Slot, shape: ShapeKind) -> Option<(Block, Position)> {
    let moved = has_slot_moved(board, slot);
    for block in Block::orientations(shape) {
        let matrix = block.matrix();
        let max_row = (BOARD_SIZE - matrix.height()) as i32;
        let max_col = (BOARD_SIZE - matrix.width()) as i32;
        for row in 0..=max_row {
            for col in 0..=max_col {
                let position = Position::new(row, col);
                if check_placement(board, &block, position, slot, moved).is_ok() {
                    return Some((block, position));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Rotation;

    fn slot(i: u8) -> Slot {
        Slot::ALL[i as usize]
    }

    fn mono() -> Block {
        Block::upright(ShapeKind::I1)
    }

    // Scenario A
    #[test]
    fn single_cell_first_move_on_own_corner_is_legal() {
        let board = Board::new();
        assert_eq!(
            check_placement(&board, &mono(), Position::new(0, 0), slot(0), false),
            Ok(())
        );
    }

    // Scenario B
    #[test]
    fn first_move_away_from_corner_is_rejected() {
        let board = Board::new();
        let err = check_placement(&board, &mono(), Position::new(10, 10), slot(1), false);
        assert_eq!(err, Err(PlacementError::InvalidFirstMove));
        assert_eq!(err.unwrap_err().to_string(), "invalid first move");
    }

    #[test]
    fn first_move_on_another_slots_corner_is_rejected() {
        let board = Board::new();
        let err = check_placement(&board, &mono(), Position::new(0, 0), slot(2), false);
        assert_eq!(err, Err(PlacementError::InvalidFirstMove));
    }

    #[test]
    fn first_move_needs_the_matching_bounding_box_corner_filled() {
        let board = Board::new();
        // V3 upright is "#." / "##": top-right cell is empty.
        let v3 = Block::upright(ShapeKind::V3);
        assert_eq!(
            check_placement(&board, &v3, Position::new(0, 18), slot(1), false),
            Err(PlacementError::InvalidFirstMove)
        );
        // Bottom-left is filled, so it may open slot 3's corner.
        assert_eq!(
            check_placement(&board, &v3, Position::new(18, 0), slot(3), false),
            Ok(())
        );
    }

    #[test]
    fn out_of_range_cells_fail_bounds_first() {
        let board = Board::new();
        let i5 = Block::upright(ShapeKind::I5);
        assert_eq!(
            check_placement(&board, &i5, Position::new(0, 17), slot(0), false),
            Err(PlacementError::OutOfBounds)
        );
        assert_eq!(
            check_placement(&board, &mono(), Position::new(-1, 0), slot(0), true),
            Err(PlacementError::OutOfBounds)
        );
        assert_eq!(PlacementError::OutOfBounds.to_string(), "bound");
    }

    // Scenario C
    #[test]
    fn orthogonal_contact_with_own_block_is_rejected() {
        let mut board = Board::new();
        board.set(5, 5, Some(slot(0)));
        // A diagonal anchor so the corner-contact rule passes and the edge
        // rule is what rejects the placement.
        board.set(4, 7, Some(slot(0)));
        let err = check_placement(&board, &mono(), Position::new(5, 6), slot(0), true);
        assert_eq!(err, Err(PlacementError::EdgeContact));
        assert_eq!(err.unwrap_err().to_string(), "connected with other block");
    }

    #[test]
    fn diagonal_only_contact_is_legal() {
        let mut board = Board::new();
        board.set(5, 5, Some(slot(0)));
        assert_eq!(
            check_placement(&board, &mono(), Position::new(6, 6), slot(0), true),
            Ok(())
        );
    }

    #[test]
    fn corner_contact_is_checked_before_edge_contact() {
        let mut board = Board::new();
        board.set(5, 5, Some(slot(0)));
        assert_eq!(
            check_placement(&board, &mono(), Position::new(5, 6), slot(0), true),
            Err(PlacementError::NoCornerConnection)
        );
    }

    #[test]
    fn diagonals_along_the_block_itself_do_not_count() {
        let mut board = Board::new();
        board.set(5, 5, Some(slot(0)));
        // Vertical domino at (5,6)-(6,6): (6,6) sees (5,5) diagonally, but
        // only past its own cell (5,6), so there is no genuine connection.
        let domino = Block::new(ShapeKind::I2, Rotation::new(1).unwrap(), false);
        assert_eq!(
            check_placement(&board, &domino, Position::new(5, 6), slot(0), true),
            Err(PlacementError::NoCornerConnection)
        );
    }

    #[test]
    fn other_slots_may_touch_edges_but_not_overlap() {
        let mut board = Board::new();
        board.set(5, 5, Some(slot(1)));
        board.set(4, 7, Some(slot(0)));
        assert_eq!(
            check_placement(&board, &mono(), Position::new(5, 6), slot(0), true),
            Ok(())
        );
        board.set(3, 8, Some(slot(2)));
        assert_eq!(
            check_placement(&board, &mono(), Position::new(3, 8), slot(0), true),
            Err(PlacementError::Overlap)
        );
    }

    #[test]
    fn rollback_clears_exactly_the_placed_cells() {
        let mut board = Board::new();
        board.set(1, 2, Some(slot(1)));
        let before = board.clone();
        let l5 = Block::upright(ShapeKind::L5);
        apply_placement(&mut board, &l5, Position::new(0, 0), slot(0));
        assert_eq!(board.score().slots[0], 5);
        rollback_placement(&mut board, &l5, Position::new(0, 0), slot(0));
        assert_eq!(board, before);
    }

    #[test]
    fn has_moved_reads_the_corner_cell() {
        let mut board = Board::new();
        assert!(!has_slot_moved(&board, slot(2)));
        apply_placement(&mut board, &mono(), Position::new(19, 19), slot(2));
        assert!(has_slot_moved(&board, slot(2)));
        assert!(!has_slot_moved(&board, slot(0)));
    }

    #[test]
    fn empty_board_offers_every_shape_to_every_slot() {
        let board = Board::new();
        for s in Slot::ALL {
            for shape in ShapeKind::ALL {
                assert!(has_any_legal_placement(&board, s, shape), "{shape} for {s}");
            }
        }
    }

    #[test]
    fn boxed_in_slot_has_no_placement() {
        let mut board = Board::new();
        // Slot 0 owns its corner, slot 1 seals every diagonal exit.
        board.set(0, 0, Some(slot(0)));
        board.set(1, 1, Some(slot(1)));
        board.set(0, 1, Some(slot(1)));
        board.set(1, 0, Some(slot(1)));
        assert!(!has_any_legal_placement(&board, slot(0), ShapeKind::I1));
        assert!(find_legal_placement(&board, slot(0), ShapeKind::X5).is_none());
    }

    #[test]
    fn score_counts_cells_per_slot_and_participant() {
        let mut board = Board::new();
        apply_placement(&mut board, &Block::upright(ShapeKind::I3), Position::new(0, 0), slot(0));
        apply_placement(&mut board, &mono(), Position::new(0, 19), slot(1));
        apply_placement(&mut board, &mono(), Position::new(19, 19), slot(2));
        apply_placement(&mut board, &Block::upright(ShapeKind::I2), Position::new(19, 0), slot(3));
        let score = board.score();
        assert_eq!(score.slots, [3, 1, 1, 2]);
        assert_eq!(score.participant_totals(PlayerCount::Two), vec![4, 3]);
        assert_eq!(score.participant_totals(PlayerCount::Three), vec![3, 1, 1]);
        assert_eq!(score.participant_totals(PlayerCount::Four), vec![3, 1, 1, 2]);
    }

    #[test]
    fn board_serializes_as_rows_of_nullable_slots() {
        let mut board = Board::new();
        board.set(0, 1, Some(slot(3)));
        let json = serde_json::to_value(&board).unwrap();
        assert_eq!(json[0][1], 3);
        assert!(json[0][0].is_null());
        let back: Board = serde_json::from_value(json).unwrap();
        assert_eq!(back, board);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn any_block() -> impl Strategy<Value = Block> {
            (0..ShapeKind::COUNT, 0u8..4, proptest::bool::ANY).prop_map(|(i, r, flip)| {
                Block::new(ShapeKind::ALL[i], Rotation::new(r).unwrap(), flip)
            })
        }

        fn placed_board() -> impl Strategy<Value = Board> {
            proptest::collection::vec((0usize..20, 0usize..20, 0u8..4), 0..60).prop_map(
                |cells| {
                    let mut board = Board::new();
                    for (r, c, s) in cells {
                        board.set(r, c, Some(Slot::ALL[s as usize]));
                    }
                    board
                },
            )
        }

        proptest! {
            #[test]
            fn legal_first_moves_cover_the_slot_corner(
                block in any_block(),
                row in -4i32..24,
                col in -4i32..24,
                s in 0u8..4,
            ) {
                let board = Board::new();
                let slot = Slot::ALL[s as usize];
                if check_placement(&board, &block, Position::new(row, col), slot, false).is_ok() {
                    let mut after = board.clone();
                    apply_placement(&mut after, &block, Position::new(row, col), slot);
                    prop_assert!(has_slot_moved(&after, slot));
                }
            }

            #[test]
            fn legal_later_moves_touch_corners_only(
                board in placed_board(),
                block in any_block(),
                row in 0i32..20,
                col in 0i32..20,
                s in 0u8..4,
            ) {
                let slot = Slot::ALL[s as usize];
                let position = Position::new(row, col);
                if check_placement(&board, &block, position, slot, true).is_ok() {
                    let cells: Vec<_> = block
                        .matrix()
                        .filled_cells()
                        .map(|(r, c)| (row + r, col + c))
                        .collect();
                    let diagonal = cells.iter().any(|&(r, c)| {
                        DIAGONALS.iter().any(|(dr, dc)| board.owner_at(r + dr, c + dc) == Some(slot))
                    });
                    let orthogonal = cells.iter().any(|&(r, c)| {
                        ORTHOGONALS.iter().any(|(dr, dc)| board.owner_at(r + dr, c + dc) == Some(slot))
                    });
                    prop_assert!(diagonal);
                    prop_assert!(!orthogonal);
                }
            }

            #[test]
            fn apply_then_rollback_restores_board(
                board in placed_board(),
                block in any_block(),
                row in 0i32..16,
                col in 0i32..16,
                s in 0u8..4,
            ) {
                let slot = Slot::ALL[s as usize];
                let position = Position::new(row, col);
                prop_assume!(check_placement(&board, &block, position, slot, true).is_ok());
                let mut scratch = board.clone();
                apply_placement(&mut scratch, &block, position, slot);
                rollback_placement(&mut scratch, &block, position, slot);
                prop_assert_eq!(scratch, board);
            }
        }
    }
}
