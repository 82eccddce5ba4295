//! Settlement Ledger
//!
//! Tracks which delivery tags of one session have been settled (acked or
//! nacked) so that cumulative settlement never reaches a delivery outside
//! the batch being settled.
//!
//! ```text
//!   settled            watermark      settled_above
//!  ┌─────────────────────┐│  ┌───┐     ┌───┐
//!  1  2  3  4  5  6  7  8 │  10  11    13  ...
//!                          9 (unsettled, blocks compaction)
//! ```
//!
//! A batch plan walks upward from the watermark. As long as every tag is
//! either in the batch or already settled, the walk extends the cumulative
//! settle. The first tag that is neither stops it; batch tags above that
//! point are settled one by one.
//!
//! With in-order arrival the plan is exactly one cumulative call at the
//! batch's maximum tag.

use crate::buffer::Batch;
use crate::transport::DeliveryTag;
use std::collections::{BTreeSet, HashSet};

/// How to settle one batch on the transport
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckPlan {
    /// Settle every outstanding tag `<=` this one in a single call
    pub cumulative: Option<DeliveryTag>,
    /// Settle each of these with `multiple = false`
    pub individual: Vec<DeliveryTag>,
}

impl AckPlan {
    pub fn is_empty(&self) -> bool {
        self.cumulative.is_none() && self.individual.is_empty()
    }

    /// Transport calls this plan issues
    pub fn call_count(&self) -> usize {
        usize::from(self.cumulative.is_some()) + self.individual.len()
    }
}

/// Per-session settlement state
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct AckLedger {
    /// Every tag `<=` watermark is settled
    watermark: u64,
    /// Settled tags above the watermark
    settled_above: BTreeSet<DeliveryTag>,
}

impl AckLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watermark(&self) -> DeliveryTag {
        DeliveryTag::new(self.watermark)
    }

    pub fn is_settled(&self, tag: DeliveryTag) -> bool {
        tag.get() <= self.watermark || self.settled_above.contains(&tag)
    }

    /// Settled tags not yet folded into the watermark
    pub fn gap_count(&self) -> usize {
        self.settled_above.len()
    }

    /// Record a single settlement (receipt ack, poison nack)
    ///
    /// # Panics
    ///
    /// If `tag` is already settled.
    pub fn record(&mut self, tag: DeliveryTag) {
        assert!(
            !self.is_settled(tag),
            "delivery tag {} settled twice",
            tag
        );
        self.settled_above.insert(tag);
        self.compact();
    }

    /// Compute the settlement plan for a batch
    ///
    /// # Panics
    ///
    /// If a batch entry that was not acked on receipt is already settled.
    /// That only happens when a delivery was drained twice.
    pub fn plan(&self, batch: &Batch) -> AckPlan {
        let mut pending: HashSet<DeliveryTag> = HashSet::with_capacity(batch.len());
        for entry in batch.entries() {
            if entry.acked_on_receipt {
                debug_assert!(
                    self.is_settled(entry.tag),
                    "receipt ack for tag {} was never recorded",
                    entry.tag
                );
                continue;
            }
            assert!(
                !self.is_settled(entry.tag),
                "double drain: delivery tag {} in batch {} is already settled",
                entry.tag,
                batch.seq
            );
            assert!(
                pending.insert(entry.tag),
                "double drain: delivery tag {} appears twice in batch {}",
                entry.tag,
                batch.seq
            );
        }

        let Some(max_pending) = pending.iter().copied().max() else {
            return AckPlan::default();
        };

        let mut cumulative = None;
        let mut cursor = DeliveryTag::new(self.watermark).next();
        while cursor <= max_pending {
            if pending.contains(&cursor) {
                cumulative = Some(cursor);
            } else if !self.settled_above.contains(&cursor) {
                break;
            }
            cursor = cursor.next();
        }

        let mut individual: Vec<DeliveryTag> = pending
            .into_iter()
            .filter(|tag| cumulative.map_or(true, |c| *tag > c))
            .collect();
        individual.sort_unstable();

        AckPlan {
            cumulative,
            individual,
        }
    }

    /// Record that a plan was carried out on the transport
    pub fn apply(&mut self, plan: &AckPlan) {
        if let Some(cumulative) = plan.cumulative {
            debug_assert!(cumulative.get() > self.watermark);
            self.watermark = self.watermark.max(cumulative.get());
            // Tags now below the watermark no longer need tracking
            self.settled_above = self.settled_above.split_off(&self.watermark().next());
        }
        for tag in &plan.individual {
            debug_assert!(!self.is_settled(*tag));
            self.settled_above.insert(*tag);
        }
        self.compact();
    }

    fn compact(&mut self) {
        while let Some(first) = self.settled_above.first().copied() {
            if first.get() != self.watermark + 1 {
                break;
            }
            self.settled_above.remove(&first);
            self.watermark = first.get();
        }
    }
}
