//! # feed-client
//!
//! Client runtime for the rtfeed real-time feed platform.
//!
//! This is the library applications use to keep feeds and polls live.
//!
//! ## Features
//!
//! - **Resilient Connection**: handshake, health checks, jittered backoff,
//!   token reload on expiry and online/offline integration
//! - **Entity Stores**: feed and poll snapshots with change and selector
//!   subscriptions
//! - **Reconciliation**: echo suppression for local mutations, batched
//!   capability hydration and resynchronization after reconnects
//! - **Transport Abstraction**: pluggable socket layer (websocket, mock)
//! - **Pure State Machine**: uses feed-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use rtfeed_client::{ClientConfig, FeedsClient, TokenSource, WebSocketTransport};
//!
//! let config = ClientConfig::from_file(Path::new("rtfeed.toml"))?;
//! let client = FeedsClient::new(config, WebSocketTransport::new(Default::default()), my_api);
//! client.connect_user(UserData::new("alice"), Some(TokenSource::Static(token))).await?;
//!
//! // Watch a feed and follow its changes
//! let feed = client.watch(&Fid::new("user", "bob")).await?;
//! feed.subscribe(|next, _| println!("{} followers", next.followers.len()));
//!
//! // Hear about partial recovery failures
//! client.on("errors.unhandled", |event| eprintln!("{:?}", event));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod client;
pub mod client_state;
pub mod config;
mod connection;
pub mod connection_id;
pub mod dispatcher;
pub mod error;
pub mod feed;
pub mod poll;
pub mod reconcile;
pub mod registry;
pub mod store;
pub mod token;
pub mod transport;

pub use api::{ApiCall, ApiError, CastVoteResponse, FeedResponse, FeedsApi, MockFeedsApi};
pub use client::FeedsClient;
pub use client_state::ClientState;
pub use config::{AuthType, ClientConfig, ConfigError};
pub use connection_id::{ConnectionIdError, ConnectionIdSlot};
pub use dispatcher::{EventDispatcher, Subscription};
pub use error::ClientError;
pub use feed::{Feed, FeedState};
pub use poll::{Poll, PollState};
pub use store::{StateStore, StoreSubscription};
pub use token::{BoxError, TokenError, TokenManager, TokenProvider, TokenSource};
pub use transport::{
    Connection, Frame, MockConnection, MockTransport, Transport, TransportError,
    WebSocketConnection, WebSocketTransport, WebSocketTransportConfig,
};
