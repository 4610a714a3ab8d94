//! Connection state machine for the feed socket.
//!
//! This module provides a pure, side-effect-free state machine for managing
//! connection lifecycle. The state machine takes events as input and produces
//! a new state plus a list of actions to execute.
//!
//! The actual I/O (opening sockets, sending frames, arming timers) is
//! performed by feed-client, not by this module. This enables instant unit
//! testing without network mocks.
//!
//! Every socket-scoped event carries the epoch of the [`Session`] that
//! produced it. Events from any other epoch are ignored, so a slow-closing
//! old socket can never affect the current one.

use feed_types::{TOKEN_EXPIRED_CODE, WS_CLOSED_SUCCESS};
use rand::Rng;
use std::time::{Duration, Instant};

/// Ceiling for any reconnect delay, in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 5000;

/// One physical connection attempt.
///
/// Sessions are replaced, never mutated in place: every transition that
/// changes a field produces a new value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Session {
    /// Monotonic attempt counter.
    pub epoch: u64,
    /// Failures since the last successful handshake.
    pub consecutive_failures: u32,
    /// Failures over the lifetime of this logical connection.
    pub total_failures: u32,
    /// Whether any earlier session of this logical connection became healthy.
    pub ever_connected: bool,
    /// When the last frame arrived on this session.
    pub last_event_at: Option<Instant>,
}

impl Session {
    /// First session of a new logical connection.
    fn restart(&self) -> Self {
        Self {
            epoch: self.epoch + 1,
            ..Self::default()
        }
    }

    /// Next attempt of the same logical connection.
    fn next(&self) -> Self {
        Self {
            epoch: self.epoch + 1,
            last_event_at: None,
            ..*self
        }
    }

    fn failed(&self) -> Self {
        Self {
            consecutive_failures: self.consecutive_failures.saturating_add(1),
            total_failures: self.total_failures.saturating_add(1),
            ..*self
        }
    }

    fn confirmed(&self) -> Self {
        Self {
            consecutive_failures: 0,
            ever_connected: true,
            ..*self
        }
    }

    fn seen(&self, at: Instant) -> Self {
        Self {
            last_event_at: Some(at),
            ..*self
        }
    }
}

/// Connection state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection requested, or the last one was refused.
    Idle {
        /// Most recent session.
        session: Session,
    },
    /// Socket is opening.
    Connecting {
        /// Current session.
        session: Session,
    },
    /// Socket is open, waiting for the server's answer to the handshake.
    AwaitingHandshake {
        /// Current session.
        session: Session,
    },
    /// Handshake confirmed and liveness checks passing.
    Healthy {
        /// Current session.
        session: Session,
        /// Server-assigned connection id.
        connection_id: String,
    },
    /// Connection lost; a reconnect is scheduled unless offline.
    Unhealthy {
        /// Session that failed.
        session: Session,
        /// Host reported it is offline; reconnects wait for it to come back.
        offline: bool,
    },
    /// Caller disconnected. Terminal until the next connect request.
    Closed {
        /// Session reserved past the last used epoch.
        session: Session,
    },
}

impl ConnectionState {
    /// Create a new state machine in the Idle state.
    pub fn new() -> Self {
        Self::Idle {
            session: Session::default(),
        }
    }

    /// The current session.
    pub fn session(&self) -> &Session {
        match self {
            Self::Idle { session }
            | Self::Connecting { session }
            | Self::AwaitingHandshake { session }
            | Self::Healthy { session, .. }
            | Self::Unhealthy { session, .. }
            | Self::Closed { session } => session,
        }
    }

    /// Epoch of the current session.
    pub fn epoch(&self) -> u64 {
        self.session().epoch
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (feed-client)
    /// is responsible for executing the returned actions.
    pub fn on_event(self, event: Event) -> (Self, Vec<Action>) {
        if let Some(epoch) = event.epoch() {
            if epoch != self.epoch() {
                return (self, vec![]);
            }
        }

        match (self, event) {
            // Connect requests
            (Self::Idle { session } | Self::Closed { session }, Event::ConnectRequested) => {
                let session = session.restart();
                (
                    Self::Connecting { session },
                    vec![
                        Action::ResetConnectionId,
                        Action::OpenSocket {
                            epoch: session.epoch,
                        },
                    ],
                )
            }
            (Self::Unhealthy { session, .. }, Event::ConnectRequested) => {
                let session = session.next();
                (
                    Self::Connecting { session },
                    vec![
                        Action::CancelReconnect,
                        Action::ResetConnectionId,
                        Action::OpenSocket {
                            epoch: session.epoch,
                        },
                    ],
                )
            }

            // From Connecting
            (Self::Connecting { session }, Event::SocketOpened { epoch, at }) => (
                Self::AwaitingHandshake {
                    session: session.seen(at),
                },
                vec![Action::SendHandshake { epoch }],
            ),
            (
                Self::Connecting { session },
                Event::SocketOpenFailed {
                    error, retryable, ..
                },
            ) => {
                if retryable {
                    fail(session, false, error)
                } else {
                    (
                        Self::Idle { session },
                        vec![
                            Action::RejectConnectionId {
                                reason: error.clone(),
                            },
                            Action::FailConnect {
                                failure: ConnectFailure::Refused(error),
                            },
                        ],
                    )
                }
            }

            // Handshake outcome
            (
                Self::AwaitingHandshake { session },
                Event::HandshakeConfirmed { epoch, connection_id },
            ) => {
                let mut actions = vec![
                    Action::ResolveConnectionId {
                        connection_id: connection_id.clone(),
                    },
                    Action::HealthChanged { healthy: true },
                    Action::CompleteConnect,
                    Action::StartHealthCheck { epoch },
                ];
                if session.ever_connected {
                    actions.push(Action::Recover);
                }
                (
                    Self::Healthy {
                        session: session.confirmed(),
                        connection_id,
                    },
                    actions,
                )
            }
            (
                Self::AwaitingHandshake { session },
                Event::ConnectionErrorReceived {
                    code,
                    status,
                    message,
                    token_refreshable,
                    ..
                },
            ) => {
                if code == TOKEN_EXPIRED_CODE && token_refreshable {
                    refresh_token(session, false)
                } else {
                    (
                        Self::Idle { session },
                        vec![
                            Action::CloseSocket,
                            Action::RejectConnectionId {
                                reason: message.clone(),
                            },
                            Action::FailConnect {
                                failure: ConnectFailure::Rejected {
                                    code,
                                    status,
                                    message,
                                },
                            },
                        ],
                    )
                }
            }
            (
                state @ Self::Healthy { .. },
                Event::ConnectionErrorReceived {
                    code,
                    token_refreshable,
                    ..
                },
            ) => {
                if code == TOKEN_EXPIRED_CODE && token_refreshable {
                    refresh_token(*state.session(), true)
                } else {
                    (state, vec![])
                }
            }

            // Traffic on a live session
            (
                Self::AwaitingHandshake { session },
                Event::MessageReceived { at, .. },
            ) => (
                Self::AwaitingHandshake {
                    session: session.seen(at),
                },
                vec![],
            ),
            (
                Self::Healthy {
                    session,
                    connection_id,
                },
                Event::MessageReceived { at, .. },
            ) => (
                Self::Healthy {
                    session: session.seen(at),
                    connection_id,
                },
                vec![],
            ),
            (state @ Self::Healthy { .. }, Event::HealthCheckReceived { epoch }) => {
                (state, vec![Action::StartHealthCheck { epoch }])
            }

            // Liveness
            (
                state @ (Self::AwaitingHandshake { .. } | Self::Healthy { .. }),
                Event::LivenessCheck { now, window, .. },
            ) => {
                let session = *state.session();
                let stale = session
                    .last_event_at
                    .map(|last| now.saturating_duration_since(last) > window)
                    .unwrap_or(true);
                if stale {
                    let was_healthy = state.is_healthy();
                    fail(session, was_healthy, "health check timed out".to_string())
                } else {
                    (state, vec![])
                }
            }

            // Socket loss
            (
                state @ (Self::Connecting { .. }
                | Self::AwaitingHandshake { .. }
                | Self::Healthy { .. }),
                Event::SocketClosed { code, reason, .. },
            ) => {
                let session = *state.session();
                let was_healthy = state.is_healthy();
                if code == Some(WS_CLOSED_SUCCESS) {
                    let mut actions = vec![
                        Action::StopHealthCheck,
                        Action::RejectConnectionId {
                            reason: "connection closed by server".to_string(),
                        },
                        Action::FailConnect {
                            failure: ConnectFailure::ClosedByPeer,
                        },
                    ];
                    if was_healthy {
                        actions.push(Action::HealthChanged { healthy: false });
                    }
                    (Self::Idle { session }, actions)
                } else {
                    fail(session, was_healthy, reason)
                }
            }
            (
                state @ (Self::Connecting { .. }
                | Self::AwaitingHandshake { .. }
                | Self::Healthy { .. }),
                Event::SocketErrored { error, .. },
            ) => {
                let was_healthy = state.is_healthy();
                fail(*state.session(), was_healthy, error)
            }

            // Reconnect timer
            (
                Self::Unhealthy {
                    session,
                    offline: false,
                },
                Event::ReconnectTimerFired { .. },
            ) => {
                let session = session.next();
                (
                    Self::Connecting { session },
                    vec![
                        Action::ResetConnectionId,
                        Action::OpenSocket {
                            epoch: session.epoch,
                        },
                    ],
                )
            }

            // Network status
            (
                state @ (Self::Connecting { .. }
                | Self::AwaitingHandshake { .. }
                | Self::Healthy { .. }
                | Self::Unhealthy { .. }),
                Event::NetworkOffline,
            ) => {
                let session = *state.session();
                let mut actions = vec![
                    Action::StopHealthCheck,
                    Action::CancelReconnect,
                    Action::CloseSocket,
                    Action::RejectConnectionId {
                        reason: "network offline".to_string(),
                    },
                    Action::ResetConnectionId,
                ];
                if state.is_healthy() {
                    actions.push(Action::HealthChanged { healthy: false });
                }
                (
                    Self::Unhealthy {
                        session,
                        offline: true,
                    },
                    actions,
                )
            }
            (Self::Unhealthy { session, .. }, Event::NetworkOnline { delay }) => (
                Self::Unhealthy {
                    session,
                    offline: false,
                },
                vec![
                    Action::CancelReconnect,
                    Action::ScheduleReconnect {
                        epoch: session.epoch,
                        delay,
                    },
                ],
            ),

            // Disconnect
            (state @ Self::Closed { .. }, Event::DisconnectRequested) => (state, vec![]),
            (state, Event::DisconnectRequested) => {
                let mut actions = vec![
                    Action::CancelReconnect,
                    Action::StopHealthCheck,
                    Action::CloseSocket,
                    Action::RejectConnectionId {
                        reason: "disconnected".to_string(),
                    },
                    Action::FailConnect {
                        failure: ConnectFailure::Disconnected,
                    },
                ];
                if state.is_healthy() {
                    actions.push(Action::HealthChanged { healthy: false });
                }
                (
                    Self::Closed {
                        session: state.session().next(),
                    },
                    actions,
                )
            }

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if the handshake is confirmed.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy { .. })
    }

    /// Check if a connection attempt is in flight.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting { .. } | Self::AwaitingHandshake { .. })
    }

    /// Check if the caller disconnected.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    /// Connection id of the healthy session, if any.
    pub fn connection_id(&self) -> Option<&str> {
        match self {
            Self::Healthy { connection_id, .. } => Some(connection_id),
            _ => None,
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Transient failure: schedule a reconnect with backoff.
///
/// The connection id is rejected for whoever waited on the failed attempt
/// and re-armed at once, so new callers wait for the reconnect.
fn fail(session: Session, was_healthy: bool, reason: String) -> (ConnectionState, Vec<Action>) {
    let session = session.failed();
    let mut actions = vec![
        Action::StopHealthCheck,
        Action::CloseSocket,
        Action::RejectConnectionId { reason },
        Action::ResetConnectionId,
    ];
    if was_healthy {
        actions.push(Action::HealthChanged { healthy: false });
    }
    actions.push(Action::ScheduleReconnect {
        epoch: session.epoch,
        delay: calculate_backoff(session.consecutive_failures),
    });
    (
        ConnectionState::Unhealthy {
            session,
            offline: false,
        },
        actions,
    )
}

/// Expired provider token: reload it, then reconnect.
fn refresh_token(session: Session, was_healthy: bool) -> (ConnectionState, Vec<Action>) {
    let (state, mut actions) = fail(session, was_healthy, "token expired".to_string());
    let at = actions
        .iter()
        .position(|a| matches!(a, Action::ScheduleReconnect { .. }))
        .unwrap_or(actions.len());
    actions.insert(at, Action::ReloadToken);
    (state, actions)
}

/// Events that can occur in the connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Caller asked to connect.
    ConnectRequested,
    /// The socket reported open.
    SocketOpened {
        /// Session the socket belongs to.
        epoch: u64,
        /// When it opened.
        at: Instant,
    },
    /// The socket could not be opened.
    SocketOpenFailed {
        /// Session the attempt belongs to.
        epoch: u64,
        /// Error description.
        error: String,
        /// Transient (transport) failure rather than a refusal.
        retryable: bool,
    },
    /// Server accepted the handshake.
    HandshakeConfirmed {
        /// Session the confirmation arrived on.
        epoch: u64,
        /// Server-assigned connection id.
        connection_id: String,
    },
    /// Server sent `connection.error`.
    ConnectionErrorReceived {
        /// Session the error arrived on.
        epoch: u64,
        /// Application error code.
        code: u32,
        /// HTTP-equivalent status.
        status: u16,
        /// Error message.
        message: String,
        /// Token comes from a provider and can be reloaded.
        token_refreshable: bool,
    },
    /// Any frame arrived.
    MessageReceived {
        /// Session the frame arrived on.
        epoch: u64,
        /// Arrival time.
        at: Instant,
    },
    /// Server sent `health.check`.
    HealthCheckReceived {
        /// Session the check arrived on.
        epoch: u64,
    },
    /// Periodic liveness evaluation.
    LivenessCheck {
        /// Session being checked.
        epoch: u64,
        /// Current time.
        now: Instant,
        /// Maximum allowed silence.
        window: Duration,
    },
    /// The socket closed.
    SocketClosed {
        /// Session the socket belongs to.
        epoch: u64,
        /// Close code, if the peer sent one.
        code: Option<u16>,
        /// Close reason.
        reason: String,
    },
    /// The socket failed.
    SocketErrored {
        /// Session the socket belongs to.
        epoch: u64,
        /// Error description.
        error: String,
    },
    /// Reconnect delay elapsed.
    ReconnectTimerFired {
        /// Session the timer was armed for.
        epoch: u64,
    },
    /// Host went offline.
    NetworkOffline,
    /// Host came back online.
    NetworkOnline {
        /// Delay before the accelerated reconnect.
        delay: Duration,
    },
    /// Caller asked to disconnect.
    DisconnectRequested,
}

impl Event {
    /// Epoch of the session that produced this event, for socket events.
    pub fn epoch(&self) -> Option<u64> {
        match self {
            Self::SocketOpened { epoch, .. }
            | Self::SocketOpenFailed { epoch, .. }
            | Self::HandshakeConfirmed { epoch, .. }
            | Self::ConnectionErrorReceived { epoch, .. }
            | Self::MessageReceived { epoch, .. }
            | Self::HealthCheckReceived { epoch }
            | Self::LivenessCheck { epoch, .. }
            | Self::SocketClosed { epoch, .. }
            | Self::SocketErrored { epoch, .. }
            | Self::ReconnectTimerFired { epoch } => Some(*epoch),
            Self::ConnectRequested
            | Self::NetworkOffline
            | Self::NetworkOnline { .. }
            | Self::DisconnectRequested => None,
        }
    }
}

/// Why a pending connect call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    /// Server refused the handshake.
    Rejected {
        /// Application error code.
        code: u32,
        /// HTTP-equivalent status.
        status: u16,
        /// Error message.
        message: String,
    },
    /// The attempt could not start (e.g. no token).
    Refused(String),
    /// Server closed the socket with the success code.
    ClosedByPeer,
    /// Caller disconnected while the connect was pending.
    Disconnected,
}

/// Actions to be executed by feed-client.
///
/// These are instructions, not side effects. The feed-client interprets
/// these and performs the actual I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Fetch a token and open a socket for this session.
    OpenSocket {
        /// Session to open.
        epoch: u64,
    },
    /// Send the auth handshake.
    SendHandshake {
        /// Session to send on.
        epoch: u64,
    },
    /// Close the current socket and detach its reader.
    CloseSocket,
    /// Arm the connection-id slot for a new attempt.
    ResetConnectionId,
    /// Settle the connection-id slot with a value.
    ResolveConnectionId {
        /// Server-assigned id.
        connection_id: String,
    },
    /// Settle the connection-id slot with an error.
    RejectConnectionId {
        /// Failure description.
        reason: String,
    },
    /// Answer a pending connect call with success.
    CompleteConnect,
    /// Answer a pending connect call with failure.
    FailConnect {
        /// Why it failed.
        failure: ConnectFailure,
    },
    /// (Re)arm the ping and liveness timers.
    StartHealthCheck {
        /// Session to check.
        epoch: u64,
    },
    /// Disarm the ping and liveness timers.
    StopHealthCheck,
    /// Arm the reconnect timer.
    ScheduleReconnect {
        /// Session the timer belongs to.
        epoch: u64,
        /// Delay before reconnecting.
        delay: Duration,
    },
    /// Disarm the reconnect timer.
    CancelReconnect,
    /// Drop the cached token so the next open reloads it.
    ReloadToken,
    /// Publish a health flip.
    HealthChanged {
        /// New health.
        healthy: bool,
    },
    /// Resynchronize every active entity.
    Recover,
}

/// Bounds of the reconnect delay after `failures` consecutive failures,
/// as `(floor, ceiling)` in milliseconds.
pub fn backoff_bounds(failures: u32) -> (u64, u64) {
    let n = u64::from(failures);
    let ceiling = n.saturating_mul(2000).saturating_add(500).min(MAX_BACKOFF_MS);
    let floor = n
        .saturating_sub(1)
        .saturating_mul(2000)
        .max(250)
        .min(MAX_BACKOFF_MS);
    (floor, ceiling)
}

/// Reconnect delay with jitter, uniform within [`backoff_bounds`].
pub fn calculate_backoff(failures: u32) -> Duration {
    let (floor, ceiling) = backoff_bounds(failures);
    Duration::from_millis(rand::thread_rng().gen_range(floor..=ceiling))
}
