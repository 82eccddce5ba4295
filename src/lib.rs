//! hash-relay: batched fingerprint relay from a message queue into a store
//!
//! A producer publishes SHA-1 fingerprints to a durable queue; the consumer
//! buffers deliveries, commits them in batches through a [`sink::BatchSink`]
//! and settles each delivery once its batch is resolved.

pub mod buffer;
pub mod buggify;
pub mod clock;
pub mod config;
pub mod consumer;
pub mod dst;
pub mod fingerprint;
pub mod io;
pub mod observability;
pub mod producer;
pub mod sink;
pub mod transport;

#[cfg(test)]
mod stateright;

pub use buffer::{Batch, PendingBuffer, PendingEntry};
pub use config::RelayConfig;
pub use consumer::{spawn_consumer, AckPolicy, ConsumerConfig, ConsumerError, ConsumerHandle, FailurePolicy};
pub use fingerprint::Fingerprint;
pub use sink::{BatchSink, InMemorySink, SinkError};
pub use transport::{Delivery, DeliveryTag, InMemoryBroker};
