//! Simulated sink with buggify fault injection
//!
//! Wraps an [`InMemorySink`]. Before each commit the sink may inject a
//! rejected transaction or a dropped connection; either way nothing from
//! the batch is persisted. Tests that need a specific batch to fail can
//! script failures by commit attempt number instead of relying on odds.

use super::{BatchSink, DailyCount, InMemorySink, SinkError, SinkFuture};
use crate::buggify::faults::sink as sink_faults;
use crate::clock::{ReceiptClock, SystemClock};
use crate::fingerprint::Fingerprint;
use crate::io::Rng;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Fault probabilities for the simulated sink
#[derive(Debug, Clone)]
pub struct SimulatedSinkConfig {
    pub commit_fail_prob: f64,
    pub connection_lost_prob: f64,
}

impl Default for SimulatedSinkConfig {
    fn default() -> Self {
        SimulatedSinkConfig {
            commit_fail_prob: 0.05,
            connection_lost_prob: 0.01,
        }
    }
}

impl SimulatedSinkConfig {
    pub fn no_faults() -> Self {
        SimulatedSinkConfig {
            commit_fail_prob: 0.0,
            connection_lost_prob: 0.0,
        }
    }

    pub fn high_chaos() -> Self {
        SimulatedSinkConfig {
            commit_fail_prob: 0.25,
            connection_lost_prob: 0.05,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedSinkStats {
    pub commit_attempts: u64,
    pub commits: u64,
    pub injected_rejections: u64,
    pub injected_disconnects: u64,
    pub scripted_failures: u64,
}

struct SimulatedSinkInner<R: Rng> {
    rng: R,
    stats: SimulatedSinkStats,
    /// 1-based commit attempts that must fail
    scripted: HashSet<u64>,
}

pub struct SimulatedSink<R: Rng, C: ReceiptClock = SystemClock> {
    inner: InMemorySink<C>,
    config: SimulatedSinkConfig,
    state: Arc<Mutex<SimulatedSinkInner<R>>>,
}

impl<R: Rng> SimulatedSink<R, SystemClock> {
    pub fn new(rng: R, config: SimulatedSinkConfig) -> Self {
        Self::wrap(InMemorySink::new(), rng, config)
    }
}

impl<R: Rng, C: ReceiptClock> SimulatedSink<R, C> {
    pub fn wrap(inner: InMemorySink<C>, rng: R, config: SimulatedSinkConfig) -> Self {
        SimulatedSink {
            inner,
            config,
            state: Arc::new(Mutex::new(SimulatedSinkInner {
                rng,
                stats: SimulatedSinkStats::default(),
                scripted: HashSet::new(),
            })),
        }
    }

    /// Make the given commit attempt (1-based) fail
    pub fn fail_attempt(&self, attempt: u64) {
        self.state.lock().scripted.insert(attempt);
    }

    pub fn stats(&self) -> SimulatedSinkStats {
        self.state.lock().stats.clone()
    }

    /// Underlying store, for verification
    pub fn inner_sink(&self) -> &InMemorySink<C> {
        &self.inner
    }

    fn check_faults(&self) -> Result<(), SinkError> {
        let mut s = self.state.lock();
        s.stats.commit_attempts += 1;
        let attempt = s.stats.commit_attempts;

        if s.scripted.remove(&attempt) {
            s.stats.scripted_failures += 1;
            return Err(SinkError::Rejected(format!(
                "scripted failure on attempt {}",
                attempt
            )));
        }
        if crate::buggify!(&mut s.rng, sink_faults::CONNECTION_LOST, self.config.connection_lost_prob) {
            s.stats.injected_disconnects += 1;
            return Err(SinkError::Connection("injected connection loss".to_string()));
        }
        if crate::buggify!(&mut s.rng, sink_faults::COMMIT_FAIL, self.config.commit_fail_prob) {
            s.stats.injected_rejections += 1;
            return Err(SinkError::Rejected("injected commit failure".to_string()));
        }
        s.stats.commits += 1;
        Ok(())
    }
}

impl<R: Rng, C: ReceiptClock> Clone for SimulatedSink<R, C> {
    fn clone(&self) -> Self {
        SimulatedSink {
            inner: self.inner.clone(),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<R: Rng + 'static, C: ReceiptClock> BatchSink for SimulatedSink<R, C> {
    fn commit_batch<'a>(&'a self, fingerprints: &'a [Fingerprint]) -> SinkFuture<'a, NaiveDate> {
        Box::pin(async move {
            self.check_faults()?;
            Ok(self.inner.commit_now(fingerprints))
        })
    }

    fn daily_counts(&self) -> SinkFuture<'_, Vec<DailyCount>> {
        Box::pin(async move { Ok(self.inner.counts_by_date()) })
    }
}
