//! Batching Consumer
//!
//! Receives deliveries, accumulates them into batches, commits each batch
//! to a [`crate::sink::BatchSink`] and settles the underlying deliveries on
//! the transport.
//!
//! ```text
//! DeliverySource ──► pump ──► ConsumerHandle ──► ingest actor ──► flush worker
//!                                                (buffer)         (sink, coordinator)
//! ```

pub mod actor;
pub mod config;
pub mod coordinator;
pub mod ledger;
pub mod pump;

pub use actor::{spawn_consumer, ConsumerError, ConsumerHandle, ConsumerTask};
pub use config::{AckPolicy, ConfigError, ConsumerConfig, FailurePolicy};
pub use coordinator::{AckCoordinator, BatchOutcome, ConsumerStats};
pub use ledger::{AckLedger, AckPlan};
pub use pump::{run_pump, PumpConfig, PumpExit, PumpReport};
