//! Shared domain types and ticket lifecycle rules for the kitchen display engine.
//!
//! Everything here is pure: the server crate applies these rules inside its
//! store transactions, and the display client uses the same types and the
//! [`feed::TicketFeed`] merge contract.

pub mod classifier;
pub mod fanout;
pub mod feed;
pub mod lifecycle;
pub mod models;
pub mod retention;

pub use classifier::CategorySnapshot;
pub use feed::{FeedCursor, MergeOutcome, TicketFeed};
pub use lifecycle::TransitionError;
pub use models::*;
pub use retention::{RetentionError, RetentionPolicy};
