//! Single-slot future for the live connection id.
//!
//! Requests that ask for live delivery must carry the id of the connection
//! that will deliver it. The slot holds exactly one settleable value at a
//! time: `reset` arms it for a new attempt, `resolve` and `reject` settle
//! it, and `get` waits for the outcome.

use thiserror::Error;
use tokio::sync::watch;

/// Connection id errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionIdError {
    /// No connect was ever started.
    #[error("connect has not been called; establish a connection first")]
    NotInitiated,

    /// The attempt the caller was waiting on failed.
    #[error("connection failed: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SlotState {
    Unset,
    Pending,
    Resolved(String),
    Rejected(String),
}

#[derive(Debug, Clone)]
struct Slot {
    attempt: u64,
    state: SlotState,
    // Last rejection and the attempt it settled; survives a re-arm so
    // callers parked on that attempt still observe it.
    rejected: Option<(u64, String)>,
}

/// Settleable holder of the current connection id.
#[derive(Debug)]
pub struct ConnectionIdSlot {
    tx: watch::Sender<Slot>,
}

impl Default for ConnectionIdSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionIdSlot {
    /// Create an unset slot.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Slot {
            attempt: 0,
            state: SlotState::Unset,
            rejected: None,
        });
        Self { tx }
    }

    /// Arm the slot for a new connection attempt.
    ///
    /// A slot that is already pending stays on its current attempt.
    pub fn reset(&self) {
        self.tx.send_if_modified(|slot| {
            if slot.state == SlotState::Pending {
                return false;
            }
            slot.attempt += 1;
            slot.state = SlotState::Pending;
            true
        });
    }

    /// Settle with the server-assigned id.
    pub fn resolve(&self, connection_id: impl Into<String>) {
        let id = connection_id.into();
        self.tx.send_modify(|slot| slot.state = SlotState::Resolved(id));
    }

    /// Settle with a failure; callers waiting on this attempt receive it.
    pub fn reject(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_modify(|slot| {
            slot.rejected = Some((slot.attempt, reason.clone()));
            slot.state = SlotState::Rejected(reason);
        });
    }

    /// Return to the never-connected state.
    pub fn clear(&self) {
        self.tx.send_modify(|slot| slot.state = SlotState::Unset);
    }

    /// The resolved id, if any, without waiting.
    pub fn current(&self) -> Option<String> {
        match &self.tx.borrow().state {
            SlotState::Resolved(id) => Some(id.clone()),
            _ => None,
        }
    }

    /// Whether an attempt is in flight.
    pub fn is_pending(&self) -> bool {
        self.tx.borrow().state == SlotState::Pending
    }

    /// Wait for the connection id.
    ///
    /// Resolves immediately if an id is held, waits while an attempt is in
    /// flight, and fails immediately if no connect was ever started. A
    /// caller waiting on an attempt that fails gets the rejection, even if
    /// the slot was re-armed for a reconnect before it woke up.
    pub async fn get(&self) -> Result<String, ConnectionIdError> {
        let mut rx = self.tx.subscribe();
        let mut waiting_on = None;
        loop {
            let slot = rx.borrow_and_update().clone();
            if let (Some(attempt), Some((failed, reason))) = (waiting_on, &slot.rejected) {
                if *failed == attempt {
                    return Err(ConnectionIdError::Rejected(reason.clone()));
                }
            }
            match slot.state {
                SlotState::Unset => return Err(ConnectionIdError::NotInitiated),
                SlotState::Resolved(id) => return Ok(id),
                SlotState::Rejected(reason) => return Err(ConnectionIdError::Rejected(reason)),
                SlotState::Pending => {
                    waiting_on.get_or_insert(slot.attempt);
                }
            }
            if rx.changed().await.is_err() {
                return Err(ConnectionIdError::NotInitiated);
            }
        }
    }
}
