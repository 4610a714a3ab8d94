//! Socket frames exchanged with the feed server.
//!
//! Every frame is a JSON text message. Outbound frames are the handshake
//! ([`ConnectRequest`]) and the periodic [`HealthCheckPing`]. Inbound frames
//! decode into [`WsEvent`], keyed by their `type` field.

use serde::{Deserialize, Serialize};

use crate::{
    ActivityData, FeedData, Fid, FollowData, NotificationStatus, PollData, PollVoteData,
    ReactionData, TypesError, UserData,
};

/// Error code reported by the server when the auth token has expired.
pub const TOKEN_EXPIRED_CODE: u32 = 40;

/// Close code for a deliberate, successful closure.
pub const WS_CLOSED_SUCCESS: u16 = 1000;

/// Product name announced in the handshake.
pub const FEEDS_PRODUCT: &str = "feeds";

/// First frame sent after the socket opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Auth token (absent for anonymous users)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Identity of the connecting user
    pub user_details: UserData,
    /// Products whose events this connection wants
    pub products: Vec<String>,
}

impl ConnectRequest {
    /// Handshake for the feeds product.
    pub fn new(token: Option<String>, user_details: UserData) -> Self {
        Self {
            token,
            user_details,
            products: vec![FEEDS_PRODUCT.to_string()],
        }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String, TypesError> {
        serde_json::to_string(self).map_err(TypesError::Serialization)
    }
}

/// Client-originated health check.
///
/// Sent as a one-element array, which is the batch form the server expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckPing {
    /// Always `health.check`
    #[serde(rename = "type")]
    pub kind: String,
    /// Connection id assigned by the server
    pub client_id: String,
}

impl HealthCheckPing {
    /// Ping for the given connection.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            kind: "health.check".to_string(),
            client_id: client_id.into(),
        }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String, TypesError> {
        serde_json::to_string(&[self]).map_err(TypesError::Serialization)
    }
}

/// Payload of `connection.ok`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionOkEvent {
    /// Identifier of the live connection
    pub connection_id: String,
    /// Server timestamp of the confirmation
    #[serde(default)]
    pub created_at: u64,
    /// Snapshot of the connected user
    #[serde(default)]
    pub me: Option<UserData>,
}

/// Payload of `connection.error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionErrorEvent {
    /// Connection the error refers to, if one was assigned
    #[serde(default)]
    pub connection_id: Option<String>,
    /// Structured error
    pub error: ErrorPayload,
}

/// Structured server error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Application error code
    pub code: u32,
    /// HTTP-equivalent status
    #[serde(rename = "StatusCode", default)]
    pub status_code: u16,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

impl ErrorPayload {
    /// Whether this error reports an expired token.
    pub fn is_token_expired(&self) -> bool {
        self.code == TOKEN_EXPIRED_CODE
    }
}

/// Payload of a server `health.check`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckEvent {
    /// Connection being checked
    #[serde(default)]
    pub connection_id: Option<String>,
}

/// Every inbound socket event.
///
/// Unrecognized `type` values decode to [`WsEvent::Unknown`] so new server
/// events never break the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsEvent {
    /// Handshake accepted
    #[serde(rename = "connection.ok")]
    ConnectionOk(ConnectionOkEvent),
    /// Handshake refused or in-band connection failure
    #[serde(rename = "connection.error")]
    ConnectionError(ConnectionErrorEvent),
    /// Server health check
    #[serde(rename = "health.check")]
    HealthCheck(HealthCheckEvent),

    /// A feed was created
    #[serde(rename = "feeds.feed.created")]
    FeedCreated {
        /// New feed
        feed: FeedData,
    },
    /// Feed attributes changed
    #[serde(rename = "feeds.feed.updated")]
    FeedUpdated {
        /// Updated feed
        feed: FeedData,
    },
    /// A feed was deleted
    #[serde(rename = "feeds.feed.deleted")]
    FeedDeleted {
        /// Deleted feed
        fid: Fid,
    },
    /// An activity was added to a feed
    #[serde(rename = "feeds.activity.added")]
    ActivityAdded {
        /// Receiving feed
        fid: Fid,
        /// New activity
        activity: ActivityData,
    },
    /// An activity changed
    #[serde(rename = "feeds.activity.updated")]
    ActivityUpdated {
        /// Feed holding the activity
        fid: Fid,
        /// Updated activity
        activity: ActivityData,
    },
    /// An activity was removed
    #[serde(rename = "feeds.activity.deleted")]
    ActivityDeleted {
        /// Feed holding the activity
        fid: Fid,
        /// Removed activity
        activity: ActivityData,
    },
    /// Someone reacted to an activity
    #[serde(rename = "feeds.activity.reaction.added")]
    ReactionAdded {
        /// Feed holding the activity
        fid: Fid,
        /// Activity with updated totals
        activity: ActivityData,
        /// The reaction
        reaction: ReactionData,
    },
    /// A reaction was withdrawn
    #[serde(rename = "feeds.activity.reaction.deleted")]
    ReactionDeleted {
        /// Feed holding the activity
        fid: Fid,
        /// Activity with updated totals
        activity: ActivityData,
        /// The reaction
        reaction: ReactionData,
    },
    /// A feed started following another
    #[serde(rename = "feeds.follow.created")]
    FollowCreated {
        /// The follow
        follow: FollowData,
    },
    /// A follow was removed
    #[serde(rename = "feeds.follow.deleted")]
    FollowDeleted {
        /// The removed follow
        follow: FollowData,
    },
    /// Notification counters changed
    #[serde(rename = "feeds.notification_feed.updated")]
    NotificationFeedUpdated {
        /// Notification feed
        fid: Fid,
        /// New counters
        notification_status: NotificationStatus,
    },
    /// Poll attributes or tallies changed
    #[serde(rename = "feeds.poll.updated")]
    PollUpdated {
        /// Updated poll
        poll: PollData,
    },
    /// Voting ended
    #[serde(rename = "feeds.poll.closed")]
    PollClosed {
        /// Closed poll
        poll: PollData,
    },
    /// A poll was removed
    #[serde(rename = "feeds.poll.deleted")]
    PollDeleted {
        /// Removed poll
        poll: PollData,
    },
    /// A vote was cast
    #[serde(rename = "feeds.poll.vote_casted")]
    PollVoteCasted {
        /// Poll with updated tallies
        poll: PollData,
        /// The vote
        poll_vote: PollVoteData,
    },
    /// A vote was withdrawn
    #[serde(rename = "feeds.poll.vote_removed")]
    PollVoteRemoved {
        /// Poll with updated tallies
        poll: PollData,
        /// The vote
        poll_vote: PollVoteData,
    },

    /// Any event type this client does not handle
    #[serde(other)]
    Unknown,
}

impl WsEvent {
    /// Decode an inbound text frame.
    pub fn from_json(text: &str) -> Result<Self, TypesError> {
        serde_json::from_str(text).map_err(TypesError::Deserialization)
    }

    /// Encode as a text frame (used by test servers and mocks).
    pub fn to_json(&self) -> Result<String, TypesError> {
        serde_json::to_string(self).map_err(TypesError::Serialization)
    }

    /// The wire `type` of this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ConnectionOk(_) => "connection.ok",
            Self::ConnectionError(_) => "connection.error",
            Self::HealthCheck(_) => "health.check",
            Self::FeedCreated { .. } => "feeds.feed.created",
            Self::FeedUpdated { .. } => "feeds.feed.updated",
            Self::FeedDeleted { .. } => "feeds.feed.deleted",
            Self::ActivityAdded { .. } => "feeds.activity.added",
            Self::ActivityUpdated { .. } => "feeds.activity.updated",
            Self::ActivityDeleted { .. } => "feeds.activity.deleted",
            Self::ReactionAdded { .. } => "feeds.activity.reaction.added",
            Self::ReactionDeleted { .. } => "feeds.activity.reaction.deleted",
            Self::FollowCreated { .. } => "feeds.follow.created",
            Self::FollowDeleted { .. } => "feeds.follow.deleted",
            Self::NotificationFeedUpdated { .. } => "feeds.notification_feed.updated",
            Self::PollUpdated { .. } => "feeds.poll.updated",
            Self::PollClosed { .. } => "feeds.poll.closed",
            Self::PollDeleted { .. } => "feeds.poll.deleted",
            Self::PollVoteCasted { .. } => "feeds.poll.vote_casted",
            Self::PollVoteRemoved { .. } => "feeds.poll.vote_removed",
            Self::Unknown => "unknown",
        }
    }

    /// Whether this is a connection-level event rather than an entity event.
    pub fn is_system(&self) -> bool {
        matches!(
            self,
            Self::ConnectionOk(_) | Self::ConnectionError(_) | Self::HealthCheck(_)
        )
    }
}
