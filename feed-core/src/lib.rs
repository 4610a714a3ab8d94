//! # feed-core
//!
//! Pure logic for the rtfeed client (no I/O, instant tests).
//!
//! This crate implements the state machines and algorithms behind the feed
//! client without any network or timer I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. Time is passed in as [`std::time::Instant`] values
//! rather than read from a clock. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (sockets, timers, requests) is performed by `feed-client`,
//! which interprets the actions and decisions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dedup;
pub mod hydration;
pub mod merge;
pub mod recovery;
pub mod state;

pub use dedup::{DedupKey, DedupQueue, DEFAULT_TICKET_TTL};
pub use hydration::{HydrationThrottle, ThrottleDecision};
pub use merge::{
    adopt_broadcast, capabilities_changed, is_fresh, merge_broadcast, merge_feed_response,
    same_members, Fresh, OwnScoped,
};
pub use recovery::RecoveryReport;
pub use state::{
    backoff_bounds, calculate_backoff, Action, ConnectFailure, ConnectionState, Event, Session,
};
