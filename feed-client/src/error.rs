//! Client error type.

use feed_core::ConnectFailure;
use feed_types::TypesError;
use std::time::Duration;
use thiserror::Error;

use crate::api::ApiError;
use crate::config::ConfigError;
use crate::connection_id::ConnectionIdError;
use crate::token::TokenError;
use crate::transport::TransportError;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A connect call is already waiting for its outcome.
    #[error("a connection attempt is already in progress")]
    ConnectInProgress,

    /// The connection was not confirmed within the connect bound.
    #[error("connection was not confirmed within {0:?}")]
    ConnectTimeout(Duration),

    /// Server refused the handshake.
    #[error("connection rejected (code {code}, status {status}): {message}")]
    ConnectionRejected {
        /// Application error code.
        code: u32,
        /// HTTP-equivalent status.
        status: u16,
        /// Server message.
        message: String,
    },

    /// The connect attempt could not start.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// Server closed the socket with the success code.
    #[error("connection closed by server")]
    ClosedByServer,

    /// No user is connected.
    #[error("not connected")]
    NotConnected,

    /// The caller disconnected while the request was pending.
    #[error("disconnected")]
    Disconnected,

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Token error.
    #[error("token error: {0}")]
    Token(#[from] TokenError),

    /// Connection id unavailable.
    #[error(transparent)]
    ConnectionId(#[from] ConnectionIdError),

    /// Request-layer error.
    #[error("request error: {0}")]
    Api(#[from] ApiError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Wire encoding error.
    #[error("serialization error: {0}")]
    Serialization(#[from] TypesError),
}

impl From<ConnectFailure> for ClientError {
    fn from(failure: ConnectFailure) -> Self {
        match failure {
            ConnectFailure::Rejected {
                code,
                status,
                message,
            } => Self::ConnectionRejected {
                code,
                status,
                message,
            },
            ConnectFailure::Refused(reason) => Self::ConnectionRefused(reason),
            ConnectFailure::ClosedByPeer => Self::ClosedByServer,
            ConnectFailure::Disconnected => Self::Disconnected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_embeds_server_code() {
        let err = ClientError::from(ConnectFailure::Rejected {
            code: 43,
            status: 401,
            message: "bad signature".into(),
        });
        let text = err.to_string();
        assert!(text.contains("43"));
        assert!(text.contains("401"));
        assert!(text.contains("bad signature"));
    }

    #[test]
    fn token_error_converts() {
        let err: ClientError = TokenError::MissingToken.into();
        assert!(matches!(err, ClientError::Token(TokenError::MissingToken)));
    }
}
