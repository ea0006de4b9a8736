//! Topic Dispatcher - decodes a message according to its topic and hands the
//! record to that topic's handler.
//!
//! The topic table is built once through [`HandlerRegistryBuilder`] and is
//! immutable afterwards, so a single [`Dispatcher`] is shared by every claim
//! loop without any locking.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::{DecodeError, HandlerError, RegistrationError};
use crate::types::Message;

/// Turns a raw payload into a typed record. Must be pure.
pub type DecodeFn<R> = fn(&[u8]) -> Result<R, DecodeError>;

/// Decoder for JSON encoded topics.
pub fn json<R: DeserializeOwned>(payload: &[u8]) -> Result<R, DecodeError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Business logic for one topic's decoded records.
///
/// Handlers are shared across partitions and may run concurrently with
/// themselves, but never twice at once for the same partition.
#[async_trait]
pub trait RecordHandler<R>: Send + Sync {
    async fn handle(&self, record: R) -> anyhow::Result<()>;
}

/// Disposition of a single message.
#[derive(Debug)]
pub enum Outcome {
    Handled,
    DecodeFailed(DecodeError),
    HandlerFailed(HandlerError),
    UnknownTopic,
}

impl Outcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Handled => OutcomeKind::Handled,
            Outcome::DecodeFailed(_) => OutcomeKind::DecodeFailed,
            Outcome::HandlerFailed(_) => OutcomeKind::HandlerFailed,
            Outcome::UnknownTopic => OutcomeKind::UnknownTopic,
        }
    }

    pub fn is_handled(&self) -> bool {
        matches!(self, Outcome::Handled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeKind {
    Handled,
    DecodeFailed,
    HandlerFailed,
    UnknownTopic,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Handled => "handled",
            OutcomeKind::DecodeFailed => "decode_failed",
            OutcomeKind::HandlerFailed => "handler_failed",
            OutcomeKind::UnknownTopic => "unknown_topic",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-erased decode + handle pair for one topic.
#[async_trait]
trait Route: Send + Sync {
    async fn dispatch(&self, payload: Option<&[u8]>) -> Outcome;
}

struct TypedRoute<R> {
    decode: DecodeFn<R>,
    handler: Arc<dyn RecordHandler<R>>,
}

#[async_trait]
impl<R: Send + 'static> Route for TypedRoute<R> {
    async fn dispatch(&self, payload: Option<&[u8]>) -> Outcome {
        let Some(payload) = payload else {
            return Outcome::DecodeFailed(DecodeError::EmptyPayload);
        };

        let record = match (self.decode)(payload) {
            Ok(record) => record,
            Err(e) => return Outcome::DecodeFailed(e),
        };

        match self.handler.handle(record).await {
            Ok(()) => Outcome::Handled,
            Err(e) => Outcome::HandlerFailed(HandlerError::from(e)),
        }
    }
}

/// Builds the static topic to handler table.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    routes: HashMap<String, Box<dyn Route>>,
    error: Option<RegistrationError>,
}

impl HandlerRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `decode` and `handler` for `topic`. Registering the same topic
    /// twice makes `build` fail.
    pub fn register<R, H>(mut self, topic: &str, decode: DecodeFn<R>, handler: Arc<H>) -> Self
    where
        R: Send + 'static,
        H: RecordHandler<R> + 'static,
    {
        if self.error.is_some() {
            return self;
        }
        if topic.is_empty() {
            self.error = Some(RegistrationError::EmptyTopic);
            return self;
        }
        if self.routes.contains_key(topic) {
            self.error = Some(RegistrationError::DuplicateTopic(topic.to_string()));
            return self;
        }

        let handler: Arc<dyn RecordHandler<R>> = handler;
        self.routes
            .insert(topic.to_string(), Box::new(TypedRoute { decode, handler }));
        self
    }

    pub fn build(self) -> Result<Dispatcher, RegistrationError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if self.routes.is_empty() {
            return Err(RegistrationError::NoHandlers);
        }
        Ok(Dispatcher {
            routes: self.routes,
        })
    }
}

/// Routes messages to the handler registered for their topic.
pub struct Dispatcher {
    routes: HashMap<String, Box<dyn Route>>,
}

impl Dispatcher {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::new()
    }

    /// Decode and handle one message. Never fails: every problem is reported
    /// through the returned outcome.
    pub async fn dispatch(&self, message: &Message) -> Outcome {
        match self.routes.get(message.topic()) {
            Some(route) => route.dispatch(message.payload()).await,
            None => Outcome::UnknownTopic,
        }
    }

    pub fn is_registered(&self, topic: &str) -> bool {
        self.routes.contains_key(topic)
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.routes.keys().cloned().collect();
        topics.sort();
        topics
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("topics", &self.topics())
            .finish()
    }
}
