use std::fmt;

use serde::{Deserialize, Serialize};

use crate::board::BOARD_SIZE;

/// One of the four board colours. Slots own territory; participants own slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Slot(u8);

impl Slot {
    pub const COUNT: usize = 4;

    pub const ALL: [Slot; Self::COUNT] = [Slot(0), Slot(1), Slot(2), Slot(3)];

    /// Returns `None` for anything outside 0..=3.
    pub const fn new(index: u8) -> Option<Self> {
        if (index as usize) < Self::COUNT {
            Some(Self(index))
        } else {
            None
        }
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Board corner `(row, col)` this slot must cover with its first block.
    pub const fn corner(self) -> (usize, usize) {
        const LAST: usize = BOARD_SIZE - 1;
        match self.0 {
            0 => (0, 0),
            1 => (0, LAST),
            2 => (LAST, LAST),
            _ => (LAST, 0),
        }
    }
}

impl TryFrom<u8> for Slot {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Slot::new(value).ok_or_else(|| format!("slot out of range: {value}"))
    }
}

impl From<Slot> for u8 {
    fn from(slot: Slot) -> Self {
        slot.0
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Number of human participants in a session. Fixes the slot ownership layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PlayerCount {
    Two,
    Three,
    Four,
}

impl PlayerCount {
    pub const fn get(self) -> u8 {
        match self {
            Self::Two => 2,
            Self::Three => 3,
            Self::Four => 4,
        }
    }

    /// Participant that owns `slot` outright, or `None` for the communal
    /// slot of a three-player session.
    pub const fn slot_owner(self, slot: Slot) -> Option<u8> {
        match self {
            Self::Two => Some(slot.0 % 2),
            Self::Three if slot.0 == 3 => None,
            Self::Three | Self::Four => Some(slot.0),
        }
    }

    /// Slots a participant may ever act for, including the communal slot.
    pub fn slots_of(self, participant: u8) -> Vec<Slot> {
        Slot::ALL
            .into_iter()
            .filter(|&slot| match self.slot_owner(slot) {
                Some(owner) => owner == participant,
                None => participant < self.get(),
            })
            .collect()
    }
}

impl TryFrom<u8> for PlayerCount {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(Self::Two),
            3 => Ok(Self::Three),
            4 => Ok(Self::Four),
            other => Err(format!("unsupported player count: {other}")),
        }
    }
}

impl From<PlayerCount> for u8 {
    fn from(count: PlayerCount) -> Self {
        count.get()
    }
}
