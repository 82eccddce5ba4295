//! Acknowledgment Coordinator
//!
//! Turns receipts and batch outcomes into ack/nack calls on the transport.
//! Every settlement goes through the session's [`AckLedger`], so no tag is
//! settled twice and cumulative calls never cover deliveries outside the
//! batch being settled.

use super::config::{AckPolicy, FailurePolicy};
use super::ledger::{AckLedger, AckPlan};
use crate::buffer::Batch;
use crate::transport::{AckChannel, DeliveryTag, TransportError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

/// Counters for one consumer run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerStats {
    pub deliveries_received: u64,
    pub deliveries_acked_on_receipt: u64,
    /// Poison payloads nacked at ingest
    pub deliveries_rejected: u64,
    pub batches_drained: u64,
    pub batches_committed: u64,
    pub batches_discarded: u64,
    pub batches_requeued: u64,
    pub deliveries_committed: u64,
    pub deliveries_discarded: u64,
    pub deliveries_requeued: u64,
    /// Left unflushed (and unsettled unless acked on receipt) at shutdown
    pub buffered_at_shutdown: u64,
    pub max_batch_size: u64,
    /// ack/nack calls issued to the transport
    pub settle_calls: u64,
    pub last_committed_seq: u64,
}

impl ConsumerStats {
    /// Batches whose outcome has been settled on the transport
    pub fn batches_settled(&self) -> u64 {
        self.batches_committed + self.batches_discarded + self.batches_requeued
    }
}

/// How a batch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Committed,
    Failed,
}

pub struct AckCoordinator<A: AckChannel> {
    channel: A,
    ledger: AckLedger,
    ack_policy: AckPolicy,
    failure_policy: FailurePolicy,
}

impl<A: AckChannel> AckCoordinator<A> {
    pub fn new(channel: A, ack_policy: AckPolicy, failure_policy: FailurePolicy) -> Self {
        AckCoordinator {
            channel,
            ledger: AckLedger::new(),
            ack_policy,
            failure_policy,
        }
    }

    pub fn ledger(&self) -> &AckLedger {
        &self.ledger
    }

    pub fn ack_policy(&self) -> AckPolicy {
        self.ack_policy
    }

    /// Ack one delivery at arrival
    pub async fn ack_on_receipt(
        &mut self,
        tag: DeliveryTag,
        stats: &mut ConsumerStats,
    ) -> Result<(), TransportError> {
        debug_assert_eq!(self.ack_policy, AckPolicy::OnReceipt);
        self.channel.ack(tag, false).await?;
        self.ledger.record(tag);
        stats.settle_calls += 1;
        stats.deliveries_acked_on_receipt += 1;
        Ok(())
    }

    /// Nack a delivery whose payload could not be decoded
    pub async fn reject(
        &mut self,
        tag: DeliveryTag,
        stats: &mut ConsumerStats,
    ) -> Result<(), TransportError> {
        self.channel.nack(tag, false, false).await?;
        self.ledger.record(tag);
        stats.settle_calls += 1;
        stats.deliveries_rejected += 1;
        warn!(%tag, "rejected undecodable delivery without requeue");
        Ok(())
    }

    /// Settle every delivery of `batch` according to its outcome
    pub async fn settle_batch(
        &mut self,
        batch: &Batch,
        outcome: BatchOutcome,
        stats: &mut ConsumerStats,
    ) -> Result<(), TransportError> {
        let plan = self.ledger.plan(batch);
        let len = batch.len() as u64;

        match outcome {
            BatchOutcome::Committed => {
                // The rows are durable whether or not the acks below go through
                stats.batches_committed += 1;
                stats.deliveries_committed += len;
                debug_assert!(batch.seq > stats.last_committed_seq, "batch committed out of order");
                stats.last_committed_seq = batch.seq;
                self.execute(&plan, |channel, tag, multiple| channel.ack(tag, multiple))
                    .await?;
            }
            BatchOutcome::Failed => {
                let requeue = self.failure_policy.requeue();
                self.execute(&plan, |channel, tag, multiple| {
                    channel.nack(tag, multiple, requeue)
                })
                .await?;
                match self.failure_policy {
                    FailurePolicy::Discard => {
                        stats.batches_discarded += 1;
                        stats.deliveries_discarded += len;
                        error!(
                            batch_seq = batch.seq,
                            batch_len = batch.len(),
                            "batch discarded after failed commit"
                        );
                    }
                    FailurePolicy::Requeue => {
                        stats.batches_requeued += 1;
                        stats.deliveries_requeued += len;
                        warn!(
                            batch_seq = batch.seq,
                            batch_len = batch.len(),
                            "batch requeued after failed commit"
                        );
                    }
                }
            }
        }

        stats.settle_calls += plan.call_count() as u64;
        self.ledger.apply(&plan);
        debug!(
            batch_seq = batch.seq,
            cumulative = ?plan.cumulative.map(|t| t.get()),
            individual = plan.individual.len(),
            "batch settled"
        );
        Ok(())
    }

    async fn execute<'a, F>(&'a self, plan: &AckPlan, settle: F) -> Result<(), TransportError>
    where
        F: Fn(&'a A, DeliveryTag, bool) -> crate::transport::TransportFuture<'a, ()>,
    {
        if let Some(tag) = plan.cumulative {
            settle(&self.channel, tag, true).await?;
        }
        for tag in &plan.individual {
            settle(&self.channel, *tag, false).await?;
        }
        Ok(())
    }
}
