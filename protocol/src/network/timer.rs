//! Single-slot round timer.
//!
//! The consensus engine arms exactly one proposal timeout at a time, keyed
//! by `(number, round)`. Arming is monotonic: a key strictly below the
//! currently armed one is ignored, a newer key cancels and replaces the
//! slot. Together with the key check in the timeout handler this makes
//! stale fires harmless — a timer for a round the engine already left
//! either never fires or is ignored on arrival.
//!
//! Two modes:
//!
//! - **live** — arming spawns a tokio sleep task that delivers the key
//!   over an mpsc channel when it elapses; cancelling aborts the task.
//! - **manual** — arming only records the key. Tests drive
//!   `handle_timeout` directly and assert on the armed slot.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Identity of one armed proposal timeout.
///
/// The derived ordering (number first, then round) is exactly the
/// supersession order of the scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeoutKey {
    /// Height being decided when the timer was armed.
    pub number: u64,
    /// Round within that height.
    pub round: u64,
}

struct ArmedSlot {
    key: TimeoutKey,
    task: Option<JoinHandle<()>>,
}

/// The one-slot timer service.
pub struct RoundTimer {
    fire_tx: Option<mpsc::UnboundedSender<TimeoutKey>>,
    armed: Option<ArmedSlot>,
}

impl RoundTimer {
    /// Live timer delivering fired keys over `fire_tx`.
    ///
    /// Must be armed from within a tokio runtime.
    pub fn live(fire_tx: mpsc::UnboundedSender<TimeoutKey>) -> Self {
        Self {
            fire_tx: Some(fire_tx),
            armed: None,
        }
    }

    /// Manual timer for synchronous tests: records the armed key, fires
    /// nothing.
    pub fn manual() -> Self {
        Self {
            fire_tx: None,
            armed: None,
        }
    }

    /// Arm the slot for `key`, firing after `after`.
    ///
    /// Returns `false` (and changes nothing) when `key` is strictly below
    /// the currently armed key.
    pub fn arm(&mut self, key: TimeoutKey, after: Duration) -> bool {
        if let Some(slot) = &self.armed {
            if key < slot.key {
                trace!(?key, armed = ?slot.key, "ignoring stale timer arm");
                return false;
            }
        }
        self.cancel();
        let task = self.fire_tx.as_ref().map(|tx| {
            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                // The receiver being gone just means the runner stopped.
                let _ = tx.send(key);
            })
        });
        trace!(?key, ?after, "proposal timer armed");
        self.armed = Some(ArmedSlot { key, task });
        true
    }

    /// Cancel the armed timer, if any.
    pub fn cancel(&mut self) {
        if let Some(slot) = self.armed.take() {
            if let Some(task) = slot.task {
                task.abort();
            }
            trace!(key = ?slot.key, "proposal timer cancelled");
        }
    }

    /// The key currently occupying the slot.
    pub fn armed_key(&self) -> Option<TimeoutKey> {
        self.armed.as_ref().map(|slot| slot.key)
    }
}

impl Drop for RoundTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
