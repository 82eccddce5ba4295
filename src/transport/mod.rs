//! Transport Boundary
//!
//! The consumer core talks to the message queue only through the traits in
//! this module:
//!
//! - [`DeliverySource`]: yields deliveries one at a time, respecting prefetch
//! - [`AckChannel`]: settles deliveries by tag, singly or cumulatively
//! - [`Publisher`]: producer side, one persistent message per fingerprint
//!
//! The in-memory broker in [`memory`] reproduces the semantics the core
//! relies on (monotonic per-session tags, cumulative settlement, prefetch
//! limits, redelivery of unsettled messages when a session closes). With the
//! `amqp` feature, `amqp` maps the same traits onto a real broker.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpPublisher, AmqpSession, AmqpTransport};
pub use memory::{InMemoryBroker, InMemorySession, Settlement, SettlementOutcome};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by transport operations
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Transport-assigned delivery identifier.
///
/// Starts at 1 for each session and increases by one per delivery, which is
/// what makes cumulative acknowledgment ("everything up to N") meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub const fn new(value: u64) -> Self {
        DeliveryTag(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// The tag that follows this one
    pub fn next(self) -> Self {
        DeliveryTag(self.0.checked_add(1).expect("delivery tag overflow is unreachable"))
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One message instance handed to the consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    /// Raw message body (the fingerprint string)
    pub body: Vec<u8>,
    /// Set when the message was delivered before and not settled
    pub redelivered: bool,
}

impl Delivery {
    pub fn new(tag: DeliveryTag, body: impl Into<Vec<u8>>) -> Self {
        Delivery {
            tag,
            body: body.into(),
            redelivered: false,
        }
    }
}

/// Publish-side durability of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Lost if the broker restarts
    Transient,
    /// Survives a broker restart when the queue is durable
    #[default]
    Persistent,
}

/// Queue declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueSpec {
    /// Durable, shared, never auto-deleted
    pub fn durable(name: impl Into<String>) -> Self {
        QueueSpec {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// Transport failures. All of them end the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Queue was never declared
    QueueNotFound(String),
    /// Protocol violation (unknown tag, redeclare with other properties)
    PreconditionFailed(String),
    /// Session or connection already closed
    ChannelClosed(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::QueueNotFound(name) => write!(f, "queue not found: {}", name),
            TransportError::PreconditionFailed(msg) => write!(f, "precondition failed: {}", msg),
            TransportError::ChannelClosed(msg) => write!(f, "channel closed: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

/// Settles deliveries on the session that produced them
pub trait AckChannel: Send + Sync + 'static {
    /// Positive acknowledgment. `multiple` settles every outstanding tag `<= tag`.
    fn ack(&self, tag: DeliveryTag, multiple: bool) -> TransportFuture<'_, ()>;

    /// Negative acknowledgment. `requeue = false` drops the message(s).
    fn nack(&self, tag: DeliveryTag, multiple: bool, requeue: bool) -> TransportFuture<'_, ()>;
}

/// Yields deliveries for one consumer session
pub trait DeliverySource: Send + Sync + 'static {
    /// Next delivery, or `None` once the session is closed
    fn recv(&self) -> Pin<Box<dyn Future<Output = Option<Delivery>> + Send + '_>>;
}

/// Producer-side publishing
pub trait Publisher: Send + Sync + 'static {
    fn publish<'a>(
        &'a self,
        queue: &'a str,
        body: &'a [u8],
        mode: DeliveryMode,
    ) -> TransportFuture<'a, ()>;
}
