//! In-memory sink
//!
//! Keeps committed rows plus a log of committed batch sizes. Clones share
//! state, so a test can hold one clone while the consumer owns another.

use super::{BatchSink, DailyCount, SinkFuture, StoredRow};
use crate::clock::{ReceiptClock, SystemClock};
use crate::fingerprint::Fingerprint;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct SinkState {
    rows: Vec<StoredRow>,
    batch_sizes: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct InMemorySink<C: ReceiptClock = SystemClock> {
    clock: C,
    state: Arc<Mutex<SinkState>>,
}

impl InMemorySink<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for InMemorySink<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ReceiptClock> InMemorySink<C> {
    pub fn with_clock(clock: C) -> Self {
        InMemorySink {
            clock,
            state: Arc::new(Mutex::new(SinkState::default())),
        }
    }

    /// Append every fingerprint under one lock acquisition
    pub fn commit_now(&self, fingerprints: &[Fingerprint]) -> NaiveDate {
        let date = self.clock.today();
        let mut state = self.state.lock();
        state.rows.extend(fingerprints.iter().map(|fp| StoredRow {
            date,
            fingerprint: fp.clone(),
        }));
        state.batch_sizes.push(fingerprints.len());
        date
    }

    pub fn counts_by_date(&self) -> Vec<DailyCount> {
        let state = self.state.lock();
        let mut counts: BTreeMap<NaiveDate, u64> = BTreeMap::new();
        for row in &state.rows {
            *counts.entry(row.date).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .map(|(date, count)| DailyCount { date, count })
            .collect()
    }

    pub fn rows(&self) -> Vec<StoredRow> {
        self.state.lock().rows.clone()
    }

    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        self.state
            .lock()
            .rows
            .iter()
            .map(|r| r.fingerprint.clone())
            .collect()
    }

    pub fn row_count(&self) -> usize {
        self.state.lock().rows.len()
    }

    /// Size of every committed batch, in commit order
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().batch_sizes.clone()
    }

    pub fn batch_count(&self) -> usize {
        self.state.lock().batch_sizes.len()
    }
}

impl<C: ReceiptClock> BatchSink for InMemorySink<C> {
    fn commit_batch<'a>(&'a self, fingerprints: &'a [Fingerprint]) -> SinkFuture<'a, NaiveDate> {
        Box::pin(async move { Ok(self.commit_now(fingerprints)) })
    }

    fn daily_counts(&self) -> SinkFuture<'_, Vec<DailyCount>> {
        Box::pin(async move { Ok(self.counts_by_date()) })
    }
}
