//! Client side of a Blokus room: a mirror of the confirmed game that applies
//! the player's own moves optimistically and reconciles them with the
//! server's echoes, plus the turn countdown and the restore fetch used after
//! a reconnect.

pub mod reconciler;
pub mod restore;
pub mod timer;

pub use reconciler::{ClientReconciler, PlannedMove, SubmitOutcome};
pub use restore::{RestoreError, fetch_snapshot};
pub use timer::{TurnExpired, TurnTimer};
