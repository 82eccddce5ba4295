//! Pending Buffer
//!
//! Ordered log of `(tag, fingerprint)` entries that have arrived but are not
//! yet part of a batch. A single owner (the consumer's ingest actor) appends
//! and drains it, so the size check and the swap happen in one step with
//! respect to every append.
//!
//! Drains always take the whole log, which is the contiguous prefix of
//! arrivals since the previous drain.

use crate::fingerprint::Fingerprint;
use crate::transport::DeliveryTag;

/// One buffered delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub tag: DeliveryTag,
    pub fingerprint: Fingerprint,
    /// Already acked individually at arrival (receipt-ack policy)
    pub acked_on_receipt: bool,
}

impl PendingEntry {
    pub fn new(tag: DeliveryTag, fingerprint: Fingerprint) -> Self {
        PendingEntry {
            tag,
            fingerprint,
            acked_on_receipt: false,
        }
    }
}

/// Immutable snapshot of the buffer taken at drain time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Drain sequence number, starting at 1
    pub seq: u64,
    entries: Vec<PendingEntry>,
}

impl Batch {
    pub fn new(seq: u64, entries: Vec<PendingEntry>) -> Self {
        debug_assert!(!entries.is_empty(), "batches are never empty");
        Batch { seq, entries }
    }

    pub fn entries(&self) -> &[PendingEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest delivery tag in the batch
    pub fn max_tag(&self) -> Option<DeliveryTag> {
        self.entries.iter().map(|e| e.tag).max()
    }

    pub fn tags(&self) -> impl Iterator<Item = DeliveryTag> + '_ {
        self.entries.iter().map(|e| e.tag)
    }

    /// Fingerprints in arrival order
    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        self.entries.iter().map(|e| e.fingerprint.clone()).collect()
    }
}

/// Single-owner accumulator of pending deliveries
#[derive(Debug, Default)]
pub struct PendingBuffer {
    entries: Vec<PendingEntry>,
    next_seq: u64,
}

impl PendingBuffer {
    pub fn new() -> Self {
        PendingBuffer {
            entries: Vec::new(),
            next_seq: 1,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        PendingBuffer {
            entries: Vec::with_capacity(capacity),
            next_seq: 1,
        }
    }

    /// Append an entry and return the new size
    pub fn append(&mut self, entry: PendingEntry) -> usize {
        self.entries.push(entry);
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PendingEntry] {
        &self.entries
    }

    /// Swap the contents out as a batch if at least `threshold` entries are
    /// buffered
    pub fn drain_if_threshold_reached(&mut self, threshold: usize) -> Option<Batch> {
        debug_assert!(threshold > 0, "threshold must be positive");
        if self.entries.len() < threshold {
            return None;
        }
        self.take_batch()
    }

    /// Swap out whatever is buffered, regardless of threshold
    pub fn drain_all(&mut self) -> Option<Batch> {
        if self.entries.is_empty() {
            return None;
        }
        self.take_batch()
    }

    fn take_batch(&mut self) -> Option<Batch> {
        let capacity = self.entries.capacity();
        let entries = std::mem::replace(&mut self.entries, Vec::with_capacity(capacity));
        let seq = self.next_seq.max(1);
        self.next_seq = seq + 1;
        Some(Batch::new(seq, entries))
    }
}
