// Kafka module - group consumer plumbing for the listener
pub mod commit;
pub mod config;
pub mod connection;
pub mod context;

pub use commit::{commit_offsets, CommitReason};
pub use config::ConsumerConfigBuilder;
pub use connection::{connect, KafkaConnection};
pub use context::ListenerContext;
