//! Events fanned out to client listeners.

use serde::{Deserialize, Serialize};

use crate::WsEvent;

/// Listener key that matches every event.
pub const ALL_EVENTS: &str = "*";

/// `error_type` of the aggregate reconnection failure.
pub const RECONNECTION_RECONCILIATION: &str = "reconnection-reconciliation";

/// One entity that could not be resynchronized after a reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationFailure {
    /// The entity (fid or poll id)
    pub entity_id: String,
    /// Why resynchronization failed
    pub reason: String,
}

/// Locally emitted `errors.unhandled` event.
///
/// Never sent over the wire; one instance carries every failure of a
/// single recovery pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "errors.unhandled")]
pub struct UnhandledErrorEvent {
    /// Failure category
    pub error_type: String,
    /// Every entity that failed
    pub failures: Vec<ReconciliationFailure>,
}

impl UnhandledErrorEvent {
    /// Aggregate failure of a reconnection recovery pass.
    pub fn reconciliation(failures: Vec<ReconciliationFailure>) -> Self {
        Self {
            error_type: RECONNECTION_RECONCILIATION.to_string(),
            failures,
        }
    }
}

/// Everything the client dispatches to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// An event received from the server
    Ws(WsEvent),
    /// Connection health flipped
    ConnectionChanged {
        /// New health
        online: bool,
    },
    /// A reconnection recovery pass finished
    ConnectionRecovered,
    /// A failure with no caller to report it to
    UnhandledError(UnhandledErrorEvent),
}

impl ClientEvent {
    /// Listener key for this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Ws(event) => event.event_type(),
            Self::ConnectionChanged { .. } => "connection.changed",
            Self::ConnectionRecovered => "connection.recovered",
            Self::UnhandledError(_) => "errors.unhandled",
        }
    }
}
