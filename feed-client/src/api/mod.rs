//! Request-layer boundary.
//!
//! The HTTP endpoints themselves live outside this crate. [`FeedsApi`] is the
//! narrow surface the runtime needs: fetching entities (optionally asking
//! for live delivery on a connection), batch hydration of own-scoped fields,
//! and the few mutations whose responses are applied locally ahead of their
//! broadcast echo.

mod mock;

pub use mock::{ApiCall, MockFeedsApi};

use async_trait::async_trait;
use feed_types::{
    ActivityData, FeedData, Fid, FollowData, NotificationStatus, PollData, PollId, PollVoteData,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Request-layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// Server answered with an error status.
    #[error("request failed with status {status}: {message}")]
    Status {
        /// HTTP status.
        status: u16,
        /// Server message.
        message: String,
    },

    /// Request never reached the server.
    #[error("network error: {0}")]
    Network(String),

    /// Response body did not decode.
    #[error("invalid response: {0}")]
    Decode(String),
}

/// Response of a feed read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedResponse {
    /// Feed attributes, including the requester's own-scoped fields.
    pub feed: FeedData,
    /// Newest activities first.
    #[serde(default)]
    pub activities: Vec<ActivityData>,
    /// Follows targeting this feed.
    #[serde(default)]
    pub followers: Vec<FollowData>,
    /// Follows originating from this feed.
    #[serde(default)]
    pub following: Vec<FollowData>,
    /// Counters, for notification feeds.
    #[serde(default)]
    pub notification_status: Option<NotificationStatus>,
}

impl FeedResponse {
    /// Response carrying only feed attributes.
    pub fn new(feed: FeedData) -> Self {
        Self {
            feed,
            activities: Vec::new(),
            followers: Vec::new(),
            following: Vec::new(),
            notification_status: None,
        }
    }
}

/// Response of a vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CastVoteResponse {
    /// Poll with updated tallies and the requester's votes.
    pub poll: PollData,
    /// The new vote.
    pub vote: PollVoteData,
}

/// Calls the runtime makes against the HTTP API.
#[async_trait]
pub trait FeedsApi: Send + Sync + 'static {
    /// Read a feed, creating it if needed.
    ///
    /// With `watch` set, live events for the feed are delivered on the
    /// connection named by `connection_id`.
    async fn get_or_create_feed(
        &self,
        fid: &Fid,
        watch: bool,
        connection_id: Option<String>,
    ) -> Result<FeedResponse, ApiError>;

    /// Stop live delivery for a feed.
    async fn stop_watching_feed(&self, fid: &Fid, connection_id: &str) -> Result<(), ApiError>;

    /// Own capabilities of each feed, keyed by fid.
    async fn own_capabilities(&self, fids: &[Fid]) -> Result<HashMap<Fid, Vec<String>>, ApiError>;

    /// Make `source` follow `target`.
    async fn follow(&self, source: &Fid, target: &Fid) -> Result<FollowData, ApiError>;

    /// Remove the follow from `source` to `target`.
    async fn unfollow(&self, source: &Fid, target: &Fid) -> Result<FollowData, ApiError>;

    /// Post a text activity to a feed.
    async fn add_activity(&self, fid: &Fid, text: &str) -> Result<ActivityData, ApiError>;

    /// Read a poll.
    async fn get_poll(&self, id: &PollId) -> Result<PollData, ApiError>;

    /// Vote for an option.
    async fn cast_vote(&self, poll: &PollId, option_id: &str) -> Result<CastVoteResponse, ApiError>;
}
