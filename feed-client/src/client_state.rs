//! Client-wide state: connected user, connection id and health.

use feed_types::UserData;

/// Snapshot of the client's connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientState {
    /// User of the current session, once connected.
    pub user: Option<UserData>,
    /// Id of the live connection, while healthy.
    pub connection_id: Option<String>,
    /// Whether the connection is healthy.
    pub is_healthy: bool,
}
