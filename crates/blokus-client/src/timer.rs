use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use blokus_core::slot::Slot;

/// The local countdown for a slot's turn ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnExpired {
    pub turn: u32,
    pub slot: Slot,
}

/// One countdown at a time; starting a new one cancels the previous.
/// Expiries are delivered on the receiver returned by [`TurnTimer::new`]
/// and fed to `ClientReconciler::on_timeout`.
pub struct TurnTimer {
    timeout: Duration,
    events: mpsc::UnboundedSender<TurnExpired>,
    shutdown: CancellationToken,
    current: Option<CancellationToken>,
}

impl TurnTimer {
    pub fn new(timeout: Duration) -> (Self, mpsc::UnboundedReceiver<TurnExpired>) {
        let (events, rx) = mpsc::unbounded_channel();
        let timer = Self {
            timeout,
            events,
            shutdown: CancellationToken::new(),
            current: None,
        };
        (timer, rx)
    }

    /// Start counting down `slot`'s turn. Must be called inside a Tokio runtime.
    pub fn start(&mut self, turn: u32, slot: Slot) {
        self.cancel();
        let token = self.shutdown.child_token();
        let events = self.events.clone();
        let timeout = self.timeout;
        let task_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => {},
                _ = tokio::time::sleep(timeout) => {
                    tracing::debug!(turn, %slot, "Turn timer expired");
                    let _ = events.send(TurnExpired { turn, slot });
                },
            }
        });
        self.current = Some(token);
    }

    pub fn cancel(&mut self) {
        if let Some(token) = self.current.take() {
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.current.as_ref().is_some_and(|t| !t.is_cancelled())
    }
}

impl Drop for TurnTimer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
