//! # feed-types
//!
//! Wire format types for the rtfeed real-time feed client.
//!
//! This crate provides the foundational types used across all rtfeed crates:
//! - [`Fid`], [`ActivityId`], [`PollId`], [`UserId`] - Identity types
//! - [`FeedData`], [`ActivityData`], [`FollowData`], [`PollData`] - Entity payloads
//! - [`ConnectRequest`], [`HealthCheckPing`] - Outbound socket frames
//! - [`WsEvent`] - Inbound socket events, keyed by their `type` field
//! - [`ClientEvent`] - Everything the client fans out to listeners
//! - [`TypesError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod events;
mod ids;
mod messages;
mod models;

pub use error::TypesError;
pub use events::{
    ClientEvent, ReconciliationFailure, UnhandledErrorEvent, ALL_EVENTS,
    RECONNECTION_RECONCILIATION,
};
pub use ids::{ActivityId, Fid, PollId, UserId};
pub use messages::{
    ConnectRequest, ConnectionErrorEvent, ConnectionOkEvent, ErrorPayload, HealthCheckEvent,
    HealthCheckPing, WsEvent, FEEDS_PRODUCT, TOKEN_EXPIRED_CODE, WS_CLOSED_SUCCESS,
};
pub use models::{
    ActivityData, FeedData, FollowData, NotificationStatus, PollData, PollVoteData,
    ReactionData, UserData,
};
