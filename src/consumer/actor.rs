//! Consumer Actors
//!
//! Two tasks split the work so storage round-trips never block intake:
//!
//! ```text
//! deliver() ──► IngestActor ───────────────► FlushWorker ──► sink.commit_batch
//!   (many)      owns PendingBuffer          owns sink,        │
//!               append + drain in one step  coordinator,      ▼
//!                                           ledger       ack / nack
//! ```
//!
//! The ingest actor is the only writer of the buffer, so append and the
//! threshold drain are one indivisible step. It forwards receipt acks,
//! rejections and drained batches to the flush worker over a FIFO channel;
//! the worker processes them strictly in order, one batch at a time, which
//! serializes drain → commit → ack per batch.
//!
//! ## Shutdown
//!
//! `shutdown()` stops intake after everything already queued. With
//! `flush_on_shutdown` the trailing partial batch is committed; without it
//! those deliveries stay unsettled and return to the queue when the session
//! closes.

use super::config::{AckPolicy, ConfigError, ConsumerConfig};
use super::coordinator::{AckCoordinator, BatchOutcome, ConsumerStats};
use crate::buffer::{Batch, PendingBuffer, PendingEntry};
use crate::fingerprint::Fingerprint;
use crate::sink::BatchSink;
use crate::transport::{AckChannel, Delivery, DeliveryTag, TransportError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Errors surfaced by the consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// Ack/nack failed; the session is gone
    Transport(TransportError),
    /// Rejected configuration
    Config(ConfigError),
    /// The consumer is no longer accepting deliveries
    Stopped,
    /// A consumer task panicked
    Panicked(String),
}

impl fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerError::Transport(e) => write!(f, "transport error: {}", e),
            ConsumerError::Config(e) => write!(f, "configuration error: {}", e),
            ConsumerError::Stopped => write!(f, "consumer stopped"),
            ConsumerError::Panicked(msg) => write!(f, "consumer task panicked: {}", msg),
        }
    }
}

impl std::error::Error for ConsumerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConsumerError::Transport(e) => Some(e),
            ConsumerError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for ConsumerError {
    fn from(e: TransportError) -> Self {
        ConsumerError::Transport(e)
    }
}

impl From<ConfigError> for ConsumerError {
    fn from(e: ConfigError) -> Self {
        ConsumerError::Config(e)
    }
}

/// Messages for the ingest actor
pub enum IngestMessage {
    /// One delivery; `done_tx` fires once it is buffered or rejected
    Deliver {
        delivery: Delivery,
        done_tx: Option<oneshot::Sender<()>>,
    },
    /// Stop intake; `flush` overrides the configured trailing-batch flush
    Shutdown {
        flush: Option<bool>,
        response_tx: oneshot::Sender<()>,
    },
}

/// Messages for the flush worker, processed in order
enum WorkerMessage {
    AckOnReceipt(DeliveryTag),
    Reject(DeliveryTag),
    Commit(Batch),
    Shutdown { response_tx: oneshot::Sender<()> },
}

/// Owns the pending buffer
struct IngestActor {
    buffer: PendingBuffer,
    config: ConsumerConfig,
    rx: mpsc::UnboundedReceiver<IngestMessage>,
    worker_tx: mpsc::UnboundedSender<WorkerMessage>,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl IngestActor {
    /// Run until shutdown or until the flush worker stops
    async fn run(mut self) {
        loop {
            let msg = tokio::select! {
                biased;
                msg = self.rx.recv() => msg,
                _ = self.worker_tx.closed() => {
                    warn!("flush worker stopped; ingest no longer accepting deliveries");
                    break;
                }
            };

            match msg {
                Some(IngestMessage::Deliver { delivery, done_tx }) => {
                    let accepted = self.handle_delivery(delivery);
                    if let Some(tx) = done_tx {
                        let _ = tx.send(());
                    }
                    if !accepted {
                        break;
                    }
                }
                Some(IngestMessage::Shutdown { flush, response_tx }) => {
                    self.finish(flush.unwrap_or(self.config.flush_on_shutdown))
                        .await;
                    let _ = response_tx.send(());
                    return;
                }
                None => {
                    self.finish(self.config.flush_on_shutdown).await;
                    return;
                }
            }
        }
        // Worker is gone; close intake so pending deliver() calls fail
        self.rx.close();
    }

    /// Buffer one delivery and forward a batch if the threshold is reached.
    /// Returns false once the worker is unreachable.
    fn handle_delivery(&mut self, delivery: Delivery) -> bool {
        let tag = delivery.tag;
        self.stats.lock().deliveries_received += 1;

        let fingerprint = match Fingerprint::from_payload(&delivery.body) {
            Ok(fp) => fp,
            Err(e) => {
                debug!(%tag, error = %e, "undecodable payload");
                return self.worker_tx.send(WorkerMessage::Reject(tag)).is_ok();
            }
        };

        let mut entry = PendingEntry::new(tag, fingerprint);
        let triggers_drain = self.buffer.len() + 1 >= self.config.batch_threshold;
        if self.config.ack_policy == AckPolicy::OnReceipt && !triggers_drain {
            if self.worker_tx.send(WorkerMessage::AckOnReceipt(tag)).is_err() {
                return false;
            }
            entry.acked_on_receipt = true;
        }

        self.buffer.append(entry);
        match self.buffer.drain_if_threshold_reached(self.config.batch_threshold) {
            Some(batch) => self.forward(batch),
            None => true,
        }
    }

    fn forward(&mut self, batch: Batch) -> bool {
        {
            let mut stats = self.stats.lock();
            stats.batches_drained += 1;
            stats.max_batch_size = stats.max_batch_size.max(batch.len() as u64);
        }
        debug!(batch_seq = batch.seq, batch_len = batch.len(), "batch drained");
        self.worker_tx.send(WorkerMessage::Commit(batch)).is_ok()
    }

    async fn finish(&mut self, flush: bool) {
        if flush {
            if let Some(batch) = self.buffer.drain_all() {
                info!(batch_len = batch.len(), "flushing trailing batch on shutdown");
                self.forward(batch);
            }
        } else if !self.buffer.is_empty() {
            info!(
                buffered = self.buffer.len(),
                "leaving trailing deliveries unflushed"
            );
        }
        self.stats.lock().buffered_at_shutdown = self.buffer.len() as u64;

        let (response_tx, response_rx) = oneshot::channel();
        if self
            .worker_tx
            .send(WorkerMessage::Shutdown { response_tx })
            .is_ok()
        {
            let _ = response_rx.await;
        }
    }
}

/// Owns the sink and the acknowledgment coordinator
struct FlushWorker<S: BatchSink, A: AckChannel> {
    sink: S,
    coordinator: AckCoordinator<A>,
    rx: mpsc::UnboundedReceiver<WorkerMessage>,
    /// Settlement counters; only this task writes them
    local: ConsumerStats,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl<S: BatchSink, A: AckChannel> FlushWorker<S, A> {
    async fn run(mut self) -> Result<(), ConsumerError> {
        while let Some(msg) = self.rx.recv().await {
            let result = match msg {
                WorkerMessage::AckOnReceipt(tag) => {
                    self.coordinator.ack_on_receipt(tag, &mut self.local).await
                }
                WorkerMessage::Reject(tag) => self.coordinator.reject(tag, &mut self.local).await,
                WorkerMessage::Commit(batch) => self.commit(batch).await,
                WorkerMessage::Shutdown { response_tx } => {
                    info!("flush worker shutting down");
                    let _ = response_tx.send(());
                    return Ok(());
                }
            };
            self.publish_stats();

            if let Err(e) = result {
                error!(error = %e, "transport failure; consumer session lost");
                return Err(ConsumerError::Transport(e));
            }
        }
        Ok(())
    }

    async fn commit(&mut self, batch: Batch) -> Result<(), TransportError> {
        let fingerprints = batch.fingerprints();
        let outcome = match self.sink.commit_batch(&fingerprints).await {
            Ok(date) => {
                debug!(
                    batch_seq = batch.seq,
                    batch_len = batch.len(),
                    max_tag = ?batch.max_tag().map(|t| t.get()),
                    %date,
                    "batch committed"
                );
                BatchOutcome::Committed
            }
            Err(e) => {
                error!(
                    batch_seq = batch.seq,
                    batch_len = batch.len(),
                    error = %e,
                    "batch commit failed"
                );
                BatchOutcome::Failed
            }
        };

        self.coordinator
            .settle_batch(&batch, outcome, &mut self.local)
            .await
    }

    /// Copy settlement counters into the shared snapshot; intake counters
    /// belong to the ingest actor
    fn publish_stats(&self) {
        let local = &self.local;
        let mut shared = self.stats.lock();
        shared.deliveries_acked_on_receipt = local.deliveries_acked_on_receipt;
        shared.deliveries_rejected = local.deliveries_rejected;
        shared.batches_committed = local.batches_committed;
        shared.batches_discarded = local.batches_discarded;
        shared.batches_requeued = local.batches_requeued;
        shared.deliveries_committed = local.deliveries_committed;
        shared.deliveries_discarded = local.deliveries_discarded;
        shared.deliveries_requeued = local.deliveries_requeued;
        shared.settle_calls = local.settle_calls;
        shared.last_committed_seq = local.last_committed_seq;
    }
}

/// Handle for feeding and stopping a consumer
#[derive(Clone)]
pub struct ConsumerHandle {
    tx: mpsc::UnboundedSender<IngestMessage>,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl ConsumerHandle {
    /// Hand one delivery to the consumer and wait until it is buffered
    pub async fn deliver(&self, delivery: Delivery) -> Result<(), ConsumerError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(IngestMessage::Deliver {
                delivery,
                done_tx: Some(done_tx),
            })
            .map_err(|_| ConsumerError::Stopped)?;
        done_rx.await.map_err(|_| ConsumerError::Stopped)
    }

    /// Hand one delivery to the consumer without waiting
    pub fn deliver_nowait(&self, delivery: Delivery) -> Result<(), ConsumerError> {
        self.tx
            .send(IngestMessage::Deliver {
                delivery,
                done_tx: None,
            })
            .map_err(|_| ConsumerError::Stopped)
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> ConsumerStats {
        self.stats.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Graceful shutdown using the configured flush behavior
    pub async fn shutdown(&self) {
        self.stop(None).await
    }

    /// Stop without flushing the trailing batch, as a crash would
    pub async fn abandon(&self) {
        self.stop(Some(false)).await
    }

    async fn stop(&self, flush: Option<bool>) {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .tx
            .send(IngestMessage::Shutdown { flush, response_tx })
            .is_ok()
        {
            let _ = response_rx.await;
        }
    }
}

/// Join handle resolving to the final counters or the error that ended the
/// consumer
pub type ConsumerTask = tokio::task::JoinHandle<Result<ConsumerStats, ConsumerError>>;

/// Spawn a consumer and return its handle + join handle
pub fn spawn_consumer<S, A>(
    sink: S,
    channel: A,
    config: ConsumerConfig,
) -> Result<(ConsumerHandle, ConsumerTask), ConsumerError>
where
    S: BatchSink,
    A: AckChannel,
{
    config.validate()?;

    let (tx, rx) = mpsc::unbounded_channel();
    let (worker_tx, worker_rx) = mpsc::unbounded_channel();
    let stats = Arc::new(Mutex::new(ConsumerStats::default()));

    let worker = FlushWorker {
        sink,
        coordinator: AckCoordinator::new(channel, config.ack_policy, config.failure_policy),
        rx: worker_rx,
        local: ConsumerStats::default(),
        stats: stats.clone(),
    };
    let worker_task = tokio::spawn(worker.run());

    let ingest = IngestActor {
        buffer: PendingBuffer::with_capacity(config.batch_threshold),
        config,
        rx,
        worker_tx,
        stats: stats.clone(),
    };

    let task_stats = stats.clone();
    let task = tokio::spawn(async move {
        ingest.run().await;
        let result = match worker_task.await {
            Ok(result) => result,
            Err(e) => Err(ConsumerError::Panicked(e.to_string())),
        };
        let stats = task_stats.lock().clone();
        info!(
            received = stats.deliveries_received,
            committed = stats.deliveries_committed,
            batches = stats.batches_committed,
            "consumer stopped"
        );
        result.map(|()| stats)
    });

    Ok((ConsumerHandle { tx, stats }, task))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SimulatedRng;
    use crate::sink::{InMemorySink, SimulatedSink, SimulatedSinkConfig};
    use crate::transport::{
        DeliveryMode, DeliverySource, InMemoryBroker, InMemorySession, QueueSpec,
        SettlementOutcome,
    };

    const QUEUE: &str = "hashes";

    fn broker_with(bodies: &[String]) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&QueueSpec::durable(QUEUE)).unwrap();
        for body in bodies {
            broker
                .publish_now(QUEUE, body.as_bytes(), DeliveryMode::Persistent)
                .unwrap();
        }
        broker
    }

    fn bodies(n: usize) -> Vec<String> {
        (0..n).map(|i| Fingerprint::sha1_of(&i.to_le_bytes()).to_string()).collect()
    }

    async fn feed(session: &InMemorySession, handle: &ConsumerHandle, n: usize) {
        for _ in 0..n {
            let delivery = session.recv().await.unwrap();
            handle.deliver(delivery).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_threshold_commits_and_acks() {
        let broker = broker_with(&bodies(8));
        let session = broker.open_session(QUEUE, 8).unwrap();
        let sink = InMemorySink::new();
        let config = ConsumerConfig::test().with_flush_on_shutdown(false);

        let (handle, task) = spawn_consumer(sink.clone(), session.clone(), config).unwrap();
        feed(&session, &handle, 8).await;
        handle.shutdown().await;
        let stats = task.await.unwrap().unwrap();

        assert_eq!(sink.batch_sizes(), vec![4, 4]);
        assert_eq!(stats.batches_committed, 2);
        assert_eq!(stats.settle_calls, 2);
        assert_eq!(broker.journal().len(), 8);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_trailing_batch() {
        let broker = broker_with(&bodies(6));
        let session = broker.open_session(QUEUE, 8).unwrap();
        let sink = InMemorySink::new();

        let (handle, task) =
            spawn_consumer(sink.clone(), session.clone(), ConsumerConfig::test()).unwrap();
        feed(&session, &handle, 6).await;
        handle.shutdown().await;
        let stats = task.await.unwrap().unwrap();

        assert_eq!(sink.batch_sizes(), vec![4, 2]);
        assert_eq!(stats.buffered_at_shutdown, 0);
        assert_eq!(broker.outstanding_count(session.id()), 0);
    }

    #[tokio::test]
    async fn test_abandon_leaves_trailing_unsettled() {
        let broker = broker_with(&bodies(6));
        let session = broker.open_session(QUEUE, 8).unwrap();
        let sink = InMemorySink::new();

        let (handle, task) =
            spawn_consumer(sink.clone(), session.clone(), ConsumerConfig::test()).unwrap();
        feed(&session, &handle, 6).await;
        handle.abandon().await;
        let stats = task.await.unwrap().unwrap();

        assert_eq!(stats.buffered_at_shutdown, 2);
        assert_eq!(broker.outstanding_count(session.id()), 2);
        session.close();
        assert_eq!(broker.ready_count(QUEUE), 2);
    }

    #[tokio::test]
    async fn test_failed_commit_nacks_and_continues() {
        let broker = broker_with(&bodies(8));
        let session = broker.open_session(QUEUE, 8).unwrap();
        let sink = SimulatedSink::new(SimulatedRng::new(7), SimulatedSinkConfig::no_faults());
        sink.fail_attempt(1);

        let (handle, task) = spawn_consumer(sink.clone(), session.clone(), ConsumerConfig::test())
            .unwrap();
        feed(&session, &handle, 8).await;
        handle.shutdown().await;
        let stats = task.await.unwrap().unwrap();

        assert_eq!(stats.batches_discarded, 1);
        assert_eq!(stats.batches_committed, 1);
        let journal = broker.journal();
        let nacked = journal
            .iter()
            .filter(|s| s.outcome == SettlementOutcome::Nacked { requeued: false })
            .count();
        assert_eq!(nacked, 4);
        assert_eq!(sink.inner_sink().row_count(), 4);
    }

    #[tokio::test]
    async fn test_poison_payload_is_rejected() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&QueueSpec::durable(QUEUE)).unwrap();
        broker.publish_now(QUEUE, &[0xff, 0xfe], DeliveryMode::Persistent).unwrap();
        broker.publish_now(QUEUE, b"", DeliveryMode::Persistent).unwrap();
        let session = broker.open_session(QUEUE, 8).unwrap();
        let sink = InMemorySink::new();

        let (handle, task) =
            spawn_consumer(sink.clone(), session.clone(), ConsumerConfig::test()).unwrap();
        feed(&session, &handle, 2).await;
        handle.shutdown().await;
        let stats = task.await.unwrap().unwrap();

        assert_eq!(stats.deliveries_rejected, 2);
        assert_eq!(sink.row_count(), 0);
        assert_eq!(broker.journal().len(), 2);
    }

    #[tokio::test]
    async fn test_transport_failure_ends_consumer() {
        let broker = broker_with(&bodies(4)).with_ack_faults(SimulatedRng::new(3), 1.0);
        let session = broker.open_session(QUEUE, 8).unwrap();

        let (handle, task) =
            spawn_consumer(InMemorySink::new(), session.clone(), ConsumerConfig::test()).unwrap();
        feed(&session, &handle, 4).await;

        let result = task.await.unwrap();
        assert!(matches!(result, Err(ConsumerError::Transport(_))));
        let late = crate::transport::Delivery::new(DeliveryTag::new(99), "x");
        assert_eq!(handle.deliver(late).await, Err(ConsumerError::Stopped));
    }

    #[test]
    fn test_invalid_config_rejected_before_spawn() {
        let broker = broker_with(&[]);
        let session = broker.open_session(QUEUE, 1).unwrap();
        let config = ConsumerConfig::test().with_threshold(0);
        let result = spawn_consumer(InMemorySink::new(), session, config);
        assert!(matches!(result, Err(ConsumerError::Config(_))));
    }
}
