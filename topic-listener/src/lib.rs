//! Topic-dispatching consumer-group listener.
//!
//! A [`listener::TopicListener`] joins a Kafka consumer group, runs one claim
//! loop per assigned partition and hands every message to the handler
//! registered for its topic in a [`dispatcher::Dispatcher`]. Offsets are only
//! committed once the handler has been invoked.
//!
//! ## Error logging
//!
//! Errors with a cause chain are logged as `error = ?e` or `{e:#}` so the root
//! cause stays visible; `%e` only shows the top-level message.

pub mod claim;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod kafka;
pub mod listener;
pub mod metrics_consts;
pub mod observability;
pub mod offset_tracker;
pub mod purchases;
pub mod rejoin;
pub mod server;
pub mod session;
pub mod test_utils;
pub mod types;

// Re-export commonly used types for convenience
pub use coordinator::{Coordinator, CoordinatorState};
pub use dispatcher::{json, Dispatcher, HandlerRegistryBuilder, Outcome, OutcomeKind, RecordHandler};
pub use error::ListenerError;
pub use listener::TopicListener;
pub use types::{Message, Partition};
