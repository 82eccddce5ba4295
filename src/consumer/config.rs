//! Consumer Configuration
//!
//! Batch threshold, prefetch window and the two settlement policies. The
//! acknowledgment policy decides what the guarantee is for buffered
//! deliveries:
//!
//! - **OnCommit**: nothing is acked until its batch commits. At-least-once.
//! - **OnReceipt**: every delivery that does not trigger a drain is acked on
//!   arrival. The trailing buffer is at-most-once.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default batch size
pub const DEFAULT_BATCH_THRESHOLD: usize = 100;

/// Prefetch window of the classic receipt-ack deployment
pub const REFERENCE_PREFETCH: usize = 4;

/// When deliveries are acknowledged
///
/// The default is [`AckPolicy::OnCommit`], which departs from the classic
/// receipt-ack deployment: there, every delivery that does not fill the
/// buffer is acked as it arrives and only the threshold-reaching delivery
/// waits for its batch. That behavior is still available as
/// [`AckPolicy::OnReceipt`] (see [`ConsumerConfig::reference`]), at the cost
/// of losing the acked part of a buffer that never commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Ack non-triggering deliveries immediately; the triggering delivery is
    /// settled with its batch
    OnReceipt,
    /// Defer every ack to the batch outcome
    #[default]
    OnCommit,
}

/// What to do with a batch the sink rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Nack without requeue; the batch is lost
    #[default]
    Discard,
    /// Nack with requeue; the transport redelivers
    Requeue,
}

impl FailurePolicy {
    pub fn requeue(self) -> bool {
        matches!(self, FailurePolicy::Requeue)
    }
}

/// Configuration for one consumer instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Buffer size that triggers a flush
    pub batch_threshold: usize,
    /// Maximum unsettled deliveries the transport hands out
    pub prefetch_count: usize,
    pub ack_policy: AckPolicy,
    pub failure_policy: FailurePolicy,
    /// Commit the trailing partial batch on graceful shutdown
    pub flush_on_shutdown: bool,
    /// Deliveries processed concurrently by the pump
    pub max_in_flight: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            batch_threshold: DEFAULT_BATCH_THRESHOLD,
            prefetch_count: DEFAULT_BATCH_THRESHOLD * 2,
            ack_policy: AckPolicy::OnCommit,
            failure_policy: FailurePolicy::Discard,
            flush_on_shutdown: true,
            max_in_flight: REFERENCE_PREFETCH,
        }
    }
}

impl ConsumerConfig {
    /// Receipt-ack consumer with a prefetch of 4 and no
    /// shutdown flush
    pub fn reference() -> Self {
        ConsumerConfig {
            batch_threshold: DEFAULT_BATCH_THRESHOLD,
            prefetch_count: REFERENCE_PREFETCH,
            ack_policy: AckPolicy::OnReceipt,
            failure_policy: FailurePolicy::Discard,
            flush_on_shutdown: false,
            max_in_flight: REFERENCE_PREFETCH,
        }
    }

    /// Small batches for tests
    pub fn test() -> Self {
        ConsumerConfig {
            batch_threshold: 4,
            prefetch_count: 8,
            ack_policy: AckPolicy::OnCommit,
            failure_policy: FailurePolicy::Discard,
            flush_on_shutdown: true,
            max_in_flight: 2,
        }
    }

    pub fn with_threshold(mut self, batch_threshold: usize) -> Self {
        self.batch_threshold = batch_threshold;
        self
    }

    pub fn with_prefetch(mut self, prefetch_count: usize) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_ack_policy(mut self, ack_policy: AckPolicy) -> Self {
        self.ack_policy = ack_policy;
        self
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    pub fn with_flush_on_shutdown(mut self, flush_on_shutdown: bool) -> Self {
        self.flush_on_shutdown = flush_on_shutdown;
        self
    }

    /// Reject settings that cannot make progress
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "batch_threshold",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.prefetch_count == 0 {
            return Err(ConfigError::Invalid {
                field: "prefetch_count",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::Invalid {
                field: "max_in_flight",
                reason: "must be at least 1".to_string(),
            });
        }
        // Unacked deliveries would fill the window before a batch does
        if self.ack_policy == AckPolicy::OnCommit && self.prefetch_count < self.batch_threshold {
            return Err(ConfigError::Invalid {
                field: "prefetch_count",
                reason: format!(
                    "prefetch {} is below batch threshold {} with on_commit acks",
                    self.prefetch_count, self.batch_threshold
                ),
            });
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field holds a value the consumer cannot run with
    Invalid { field: &'static str, reason: String },
    /// File could not be read
    Io(String),
    /// TOML could not be parsed
    Parse(String),
    /// Environment override could not be parsed
    Env { var: String, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { field, reason } => write!(f, "invalid {}: {}", field, reason),
            ConfigError::Io(msg) => write!(f, "config io error: {}", msg),
            ConfigError::Parse(msg) => write!(f, "config parse error: {}", msg),
            ConfigError::Env { var, reason } => write!(f, "invalid {}: {}", var, reason),
        }
    }
}

impl std::error::Error for ConfigError {}
