use std::fmt;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::slot::Slot;

/// The 21 fixed polyomino shapes every slot receives once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ShapeKind {
    I1,
    I2,
    I3,
    V3,
    I4,
    L4,
    T4,
    O4,
    S4,
    I5,
    L5,
    Y5,
    N5,
    P5,
    U5,
    V5,
    T5,
    Z5,
    F5,
    W5,
    X5,
}

impl ShapeKind {
    pub const COUNT: usize = 21;

    pub const ALL: [ShapeKind; Self::COUNT] = [
        Self::I1,
        Self::I2,
        Self::I3,
        Self::V3,
        Self::I4,
        Self::L4,
        Self::T4,
        Self::O4,
        Self::S4,
        Self::I5,
        Self::L5,
        Self::Y5,
        Self::N5,
        Self::P5,
        Self::U5,
        Self::V5,
        Self::T5,
        Self::Z5,
        Self::F5,
        Self::W5,
        Self::X5,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    /// Canonical drawing, one string per row, `#` for a filled cell.
    const fn rows(self) -> &'static [&'static str] {
        match self {
            Self::I1 => &["#"],
            Self::I2 => &["##"],
            Self::I3 => &["###"],
            Self::V3 => &["#.", "##"],
            Self::I4 => &["####"],
            Self::L4 => &["#..", "###"],
            Self::T4 => &["###", ".#."],
            Self::O4 => &["##", "##"],
            Self::S4 => &[".##", "##."],
            Self::I5 => &["#####"],
            Self::L5 => &["#...", "####"],
            Self::Y5 => &[".#..", "####"],
            Self::N5 => &["##..", ".###"],
            Self::P5 => &["##", "##", "#."],
            Self::U5 => &["#.#", "###"],
            Self::V5 => &["#..", "#..", "###"],
            Self::T5 => &["###", ".#.", ".#."],
            Self::Z5 => &["##.", ".#.", ".##"],
            Self::F5 => &[".##", "##.", ".#."],
            Self::W5 => &["#..", "##.", ".##"],
            Self::X5 => &[".#.", "###", ".#."],
        }
    }
}

impl fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Boolean matrix of a block, tight to its bounding box.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    height: usize,
    width: usize,
    cells: Vec<bool>,
}

impl Shape {
    fn from_rows(rows: &[&str]) -> Self {
        let height = rows.len();
        let width = rows.first().map_or(0, |r| r.len());
        let cells = rows
            .iter()
            .flat_map(|row| row.bytes().map(|b| b == b'#'))
            .collect();
        Self {
            height,
            width,
            cells,
        }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Block-local lookup; anything outside the bounding box is empty.
    pub fn is_filled(&self, row: i32, col: i32) -> bool {
        if row < 0 || col < 0 {
            return false;
        }
        let (row, col) = (row as usize, col as usize);
        row < self.height && col < self.width && self.cells[row * self.width + col]
    }

    /// Filled cells as block-local `(row, col)` pairs, row-major.
    pub fn filled_cells(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, filled)| **filled)
            .map(|(i, _)| ((i / self.width) as i32, (i % self.width) as i32))
    }

    pub fn cell_count(&self) -> usize {
        self.cells.iter().filter(|c| **c).count()
    }

    /// Quarter turn clockwise: `new[r][c] = old[h - 1 - c][r]`.
    pub fn rotated_clockwise(&self) -> Shape {
        let (h, w) = (self.height, self.width);
        let mut cells = Vec::with_capacity(self.cells.len());
        for r in 0..w {
            for c in 0..h {
                cells.push(self.cells[(h - 1 - c) * w + r]);
            }
        }
        Shape {
            height: w,
            width: h,
            cells,
        }
    }

    /// Vertical mirror: row order reversed.
    pub fn flipped(&self) -> Shape {
        let cells = self
            .cells
            .chunks(self.width)
            .rev()
            .flatten()
            .copied()
            .collect();
        Shape {
            height: self.height,
            width: self.width,
            cells,
        }
    }
}

static CATALOG: LazyLock<Vec<Shape>> = LazyLock::new(|| {
    ShapeKind::ALL
        .iter()
        .map(|kind| Shape::from_rows(kind.rows()))
        .collect()
});

/// Every (rotation, flip) orientation per shape, indexed `rotation * 2 + flip`.
static ORIENTATIONS: LazyLock<Vec<[Shape; 8]>> = LazyLock::new(|| {
    ShapeKind::ALL
        .iter()
        .map(|&kind| {
            std::array::from_fn(|i| {
                let rotation = Rotation((i / 2) as u8);
                transform(shape_of(kind), rotation, i % 2 == 1)
            })
        })
        .collect()
});

/// Canonical (unrotated, unflipped) matrix of a shape.
pub fn shape_of(kind: ShapeKind) -> &'static Shape {
    &CATALOG[kind.index()]
}

/// Rotate clockwise `rotation` times, then mirror vertically when `flip` is set.
pub fn transform(shape: &Shape, rotation: Rotation, flip: bool) -> Shape {
    let mut out = shape.clone();
    for _ in 0..rotation.get() {
        out = out.rotated_clockwise();
    }
    if flip { out.flipped() } else { out }
}

/// Number of clockwise quarter turns, 0..=3.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Rotation(u8);

impl Rotation {
    pub const ALL: [Rotation; 4] = [Rotation(0), Rotation(1), Rotation(2), Rotation(3)];

    pub const fn new(turns: u8) -> Option<Self> {
        if turns < 4 { Some(Self(turns)) } else { None }
    }

    pub const fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Rotation {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Rotation::new(value).ok_or_else(|| format!("rotation out of range: {value}"))
    }
}

impl From<Rotation> for u8 {
    fn from(rotation: Rotation) -> Self {
        rotation.0
    }
}

/// A concrete block: catalog shape plus orientation. This is also the wire
/// and storage descriptor of a placed piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Block {
    pub shape: ShapeKind,
    pub rotation: Rotation,
    pub flip: bool,
}

impl Block {
    pub const fn new(shape: ShapeKind, rotation: Rotation, flip: bool) -> Self {
        Self {
            shape,
            rotation,
            flip,
        }
    }

    /// Canonical orientation of `shape`.
    pub const fn upright(shape: ShapeKind) -> Self {
        Self::new(shape, Rotation(0), false)
    }

    /// The oriented matrix, served from the precomputed table.
    pub fn matrix(&self) -> &'static Shape {
        let i = self.rotation.get() as usize * 2 + usize::from(self.flip);
        &ORIENTATIONS[self.shape.index()][i]
    }

    /// All eight orientations of `shape` (some may coincide for symmetric shapes).
    pub fn orientations(shape: ShapeKind) -> impl Iterator<Item = Block> {
        Rotation::ALL
            .into_iter()
            .flat_map(move |rotation| [false, true].map(|flip| Block::new(shape, rotation, flip)))
    }
}

/// Per-slot record of which shapes have already been placed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsedBlocks {
    masks: [u32; Slot::COUNT],
}

impl UsedBlocks {
    pub fn is_used(&self, slot: Slot, shape: ShapeKind) -> bool {
        self.masks[slot.index()] & (1 << shape.index()) != 0
    }

    pub fn mark(&mut self, slot: Slot, shape: ShapeKind) {
        self.masks[slot.index()] |= 1 << shape.index();
    }

    pub fn unused(&self, slot: Slot) -> impl Iterator<Item = ShapeKind> + '_ {
        ShapeKind::ALL
            .into_iter()
            .filter(move |&shape| !self.is_used(slot, shape))
    }

    pub fn used_count(&self, slot: Slot) -> u32 {
        self.masks[slot.index()].count_ones()
    }
}
