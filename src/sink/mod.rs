//! Persistence Sink
//!
//! A sink commits one batch of fingerprints atomically: every row persists
//! or none does. Each row is stamped with the receipt date of its batch.
//!
//! ## Implementations
//!
//! - `InMemorySink`: unit tests, DST and the demo binary
//! - `SimulatedSink`: wraps `InMemorySink` with buggify fault injection
//! - `MySqlSink` (feature `mysql`): transactional multi-row insert

pub mod memory;
#[cfg(feature = "mysql")]
pub mod mysql;
pub mod simulated;

pub use memory::InMemorySink;
#[cfg(feature = "mysql")]
pub use mysql::MySqlSink;
pub use simulated::{SimulatedSink, SimulatedSinkConfig, SimulatedSinkStats};

use crate::fingerprint::Fingerprint;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by sink operations
pub type SinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SinkError>> + Send + 'a>>;

/// Sink failures. None of them leave a partial batch behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Transaction rejected by the store
    Rejected(String),
    /// Connection to the store failed or dropped
    Connection(String),
    /// Backend-specific error
    Backend(String),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Rejected(msg) => write!(f, "batch rejected: {}", msg),
            SinkError::Connection(msg) => write!(f, "sink connection error: {}", msg),
            SinkError::Backend(msg) => write!(f, "sink backend error: {}", msg),
        }
    }
}

impl std::error::Error for SinkError {}

/// One persisted row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRow {
    pub date: NaiveDate,
    pub fingerprint: Fingerprint,
}

/// Number of fingerprints received on one day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub count: u64,
}

/// Atomic batch persistence
pub trait BatchSink: Send + Sync + 'static {
    /// Persist all fingerprints or none. Returns the receipt date assigned.
    fn commit_batch<'a>(&'a self, fingerprints: &'a [Fingerprint]) -> SinkFuture<'a, NaiveDate>;

    /// Row counts grouped by receipt date, oldest first
    fn daily_counts(&self) -> SinkFuture<'_, Vec<DailyCount>>;
}

impl<S: BatchSink + ?Sized> BatchSink for Arc<S> {
    fn commit_batch<'a>(&'a self, fingerprints: &'a [Fingerprint]) -> SinkFuture<'a, NaiveDate> {
        (**self).commit_batch(fingerprints)
    }

    fn daily_counts(&self) -> SinkFuture<'_, Vec<DailyCount>> {
        (**self).daily_counts()
    }
}
