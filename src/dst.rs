//! Consumer Deterministic Simulation Testing Harness
//!
//! Drives the full pipeline (in-memory broker, consumer actors, simulated
//! sink) from a single seed and checks delivery guarantees afterwards:
//!
//! - **Settle once**: no `(session, tag)` pair is settled twice
//! - **No silent loss**: every published fingerprint ends committed, in a
//!   discarded batch, acked on receipt (receipt-ack policy only), or back
//!   in the queue
//! - **Ack implies durable**: with commit-ack, every acked fingerprint is
//!   in the sink
//! - **Commit once per batch**: sink batch count equals committed batches,
//!   and every drained batch reaches the sink exactly once unless its
//!   session was lost first
//!
//! ## DST Methodology
//!
//! 1. Publish N fingerprints (optionally with poison payloads mixed in)
//! 2. Consume through a `SimulatedSink` with buggify faults, delivering in
//!    random windows that may be reordered
//! 3. Randomly tear sessions down mid-stream; unsettled deliveries return
//!    to the queue and a fresh session picks them up
//! 4. Check the invariants against the broker journal and the sink
//!
//! Each run uses a current-thread runtime, so task interleaving is a pure
//! function of the seed. The harness installs `ConsumerDSTConfig::faults`
//! as the thread's buggify configuration; session restarts, delivery
//! reordering and poison payloads fire at the probabilities it registers.

use crate::buggify::{self, faults, BuggifyStats, FaultConfig};
use crate::consumer::{spawn_consumer, AckPolicy, ConsumerConfig, ConsumerError, ConsumerStats};
use crate::fingerprint::Fingerprint;
use crate::io::{Rng, SimulatedRng};
use crate::sink::{SimulatedSink, SimulatedSinkConfig, SimulatedSinkStats};
use crate::transport::{
    DeliveryMode, InMemoryBroker, InMemorySession, QueueSpec, SettlementOutcome,
};
use std::collections::HashSet;

const QUEUE: &str = "dst.hashes";
/// Scheduler yields without a delivery before a session counts as drained
const IDLE_SPINS: usize = 64;

/// Result of a single DST run
#[derive(Debug)]
pub struct ConsumerDSTResult {
    pub seed: u64,
    pub published: usize,
    pub poison_published: usize,
    pub sessions: usize,
    pub sessions_lost: usize,
    pub committed_rows: usize,
    pub unique_committed: usize,
    pub discarded: usize,
    pub acked_on_receipt: usize,
    pub left_in_queue: usize,
    pub settlements: usize,
    pub sink_stats: SimulatedSinkStats,
    pub buggify_stats: BuggifyStats,
    pub passed: bool,
    pub error_message: Option<String>,
}

/// Configuration for the consumer DST harness
#[derive(Debug, Clone)]
pub struct ConsumerDSTConfig {
    pub num_messages: usize,
    pub consumer: ConsumerConfig,
    pub sink_config: SimulatedSinkConfig,
    /// Per ack/nack call
    pub ack_fail_prob: f64,
    /// Harness fault sites: session restart and delivery reorder are
    /// checked per delivery window, poison payload per published message
    pub faults: FaultConfig,
    pub max_sessions: usize,
    /// Largest delivery window handed over at once
    pub max_window: usize,
}

impl Default for ConsumerDSTConfig {
    fn default() -> Self {
        ConsumerDSTConfig {
            num_messages: 200,
            consumer: ConsumerConfig::test().with_threshold(10).with_prefetch(20),
            sink_config: SimulatedSinkConfig::default(),
            ack_fail_prob: 0.0,
            faults: FaultConfig::only(&[
                (faults::consumer::SESSION_RESTART, 0.02),
                (faults::transport::DELIVERY_REORDER, 0.1),
                (faults::transport::POISON_PAYLOAD, 0.01),
            ]),
            max_sessions: 16,
            max_window: 4,
        }
    }
}

impl ConsumerDSTConfig {
    /// No faults, no restarts: everything is committed
    pub fn baseline() -> Self {
        ConsumerDSTConfig {
            sink_config: SimulatedSinkConfig::no_faults(),
            faults: FaultConfig::disabled(),
            ..Default::default()
        }
    }

    /// Session restarts and reordering without storage faults
    pub fn restarts() -> Self {
        ConsumerDSTConfig {
            sink_config: SimulatedSinkConfig::no_faults(),
            faults: FaultConfig::only(&[
                (faults::consumer::SESSION_RESTART, 0.05),
                (faults::transport::DELIVERY_REORDER, 0.3),
                (faults::transport::POISON_PAYLOAD, 0.01),
            ]),
            ..Default::default()
        }
    }

    /// Storage faults, ack failures, restarts and reordering together
    pub fn chaos() -> Self {
        ConsumerDSTConfig {
            sink_config: SimulatedSinkConfig::high_chaos(),
            ack_fail_prob: 0.01,
            faults: FaultConfig::only(&[
                (faults::consumer::SESSION_RESTART, 0.05),
                (faults::transport::DELIVERY_REORDER, 0.3),
                (faults::transport::POISON_PAYLOAD, 0.02),
            ]),
            max_sessions: 32,
            ..Default::default()
        }
    }

    /// Receipt-ack policy with restarts
    pub fn receipt_ack() -> Self {
        ConsumerDSTConfig {
            consumer: ConsumerConfig::test()
                .with_threshold(10)
                .with_prefetch(4)
                .with_ack_policy(AckPolicy::OnReceipt),
            ..Self::restarts()
        }
    }
}

/// How one session ended
enum SessionEnd {
    Drained,
    Restarted,
    Lost,
}

/// Consumer DST Harness
pub struct ConsumerDSTHarness {
    seed: u64,
    rng: SimulatedRng,
    config: ConsumerDSTConfig,
}

impl ConsumerDSTHarness {
    pub fn new(seed: u64, config: ConsumerDSTConfig) -> Self {
        ConsumerDSTHarness {
            seed,
            rng: SimulatedRng::new(seed),
            config,
        }
    }

    /// Run a single DST scenario
    pub fn run(&mut self) -> ConsumerDSTResult {
        buggify::set_config(self.config.faults.clone());
        buggify::reset_stats();

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => return self.failed(format!("failed to build runtime: {}", e)),
        };
        runtime.block_on(self.run_async())
    }

    async fn run_async(&mut self) -> ConsumerDSTResult {
        let broker = {
            let ack_rng = self.rng.fork();
            let broker = InMemoryBroker::new();
            if self.config.ack_fail_prob > 0.0 {
                broker.with_ack_faults(ack_rng, self.config.ack_fail_prob)
            } else {
                broker
            }
        };
        if let Err(e) = broker.declare_queue(&QueueSpec::durable(QUEUE)) {
            return self.failed(format!("declare failed: {}", e));
        }

        // Phase 1: publish
        let mut published: Vec<Fingerprint> = Vec::with_capacity(self.config.num_messages);
        let mut poison_published = 0;
        for i in 0..self.config.num_messages {
            let poison = crate::buggify!(&mut self.rng, faults::transport::POISON_PAYLOAD);
            let result = if poison {
                poison_published += 1;
                broker.publish_now(QUEUE, &[0xff, 0xfe, i as u8], DeliveryMode::Persistent)
            } else {
                let fp = Fingerprint::sha1_of(format!("{}-{}", self.seed, i).as_bytes());
                let result = broker.publish_now(QUEUE, fp.as_bytes(), DeliveryMode::Persistent);
                published.push(fp);
                result
            };
            if let Err(e) = result {
                return self.failed(format!("publish failed: {}", e));
            }
        }

        // Phase 2: consume across sessions
        let sink = SimulatedSink::new(self.rng.fork(), self.config.sink_config.clone());
        let mut all_stats: Vec<ConsumerStats> = Vec::new();
        let mut sessions = 0;
        let mut sessions_lost = 0;

        while sessions < self.config.max_sessions && broker.ready_count(QUEUE) > 0 {
            sessions += 1;
            let session = match broker.open_session(QUEUE, self.config.consumer.prefetch_count) {
                Ok(s) => s,
                Err(e) => return self.failed(format!("open_session failed: {}", e)),
            };
            let (handle, task) =
                match spawn_consumer(sink.clone(), session.clone(), self.config.consumer.clone()) {
                    Ok(pair) => pair,
                    Err(e) => return self.failed(format!("spawn failed: {}", e)),
                };

            let end = self.drive_session(&session, &handle).await;
            match end {
                SessionEnd::Restarted => handle.abandon().await,
                SessionEnd::Drained | SessionEnd::Lost => handle.shutdown().await,
            }

            match task.await {
                Ok(Ok(stats)) => all_stats.push(stats),
                Ok(Err(ConsumerError::Transport(_))) => {
                    sessions_lost += 1;
                    all_stats.push(handle.stats());
                }
                Ok(Err(e)) => return self.failed(format!("consumer failed: {}", e)),
                Err(e) => return self.failed(format!("consumer task panicked: {}", e)),
            }
            session.close();
        }

        // Phase 3: verify
        self.verify(
            &broker,
            &sink,
            &published,
            poison_published,
            &all_stats,
            sessions,
            sessions_lost,
        )
    }

    /// Hand deliveries to the consumer in random windows until the session
    /// drains, restarts or is lost
    async fn drive_session(
        &mut self,
        session: &InMemorySession,
        handle: &crate::consumer::ConsumerHandle,
    ) -> SessionEnd {
        let mut idle = 0;
        loop {
            if !handle.is_running() || !session.is_open() {
                return SessionEnd::Lost;
            }
            if crate::buggify!(&mut self.rng, faults::consumer::SESSION_RESTART) {
                return SessionEnd::Restarted;
            }

            let window_size = self.rng.gen_range(1, self.config.max_window.max(1) as u64 + 1) as usize;
            let mut window = Vec::with_capacity(window_size);
            while window.len() < window_size {
                match session.try_recv() {
                    Some(delivery) => window.push(delivery),
                    None => break,
                }
            }

            if window.is_empty() {
                idle += 1;
                if idle > IDLE_SPINS {
                    return SessionEnd::Drained;
                }
                tokio::task::yield_now().await;
                continue;
            }
            idle = 0;

            if crate::buggify!(&mut self.rng, faults::transport::DELIVERY_REORDER) {
                self.rng.shuffle(&mut window);
            }
            for delivery in window {
                if handle.deliver(delivery).await.is_err() {
                    return SessionEnd::Lost;
                }
            }
            tokio::task::yield_now().await;
        }
    }

    fn verify(
        &self,
        broker: &InMemoryBroker,
        sink: &SimulatedSink<SimulatedRng>,
        published: &[Fingerprint],
        poison_published: usize,
        all_stats: &[ConsumerStats],
        sessions: usize,
        sessions_lost: usize,
    ) -> ConsumerDSTResult {
        let journal = broker.journal();
        let rows = sink.inner_sink().fingerprints();
        let committed: HashSet<&[u8]> = rows.iter().map(|fp| fp.as_bytes()).collect();
        let ready = broker.ready_bodies(QUEUE);
        let in_queue: HashSet<&[u8]> = ready.iter().map(|b| b.as_slice()).collect();

        let mut discarded: HashSet<&[u8]> = HashSet::new();
        let mut acked: HashSet<&[u8]> = HashSet::new();
        let mut settled_pairs = HashSet::new();
        let mut violations: Vec<String> = Vec::new();

        for settlement in &journal {
            if !settled_pairs.insert((settlement.session_id, settlement.tag)) {
                violations.push(format!(
                    "tag {} settled twice on session {}",
                    settlement.tag, settlement.session_id
                ));
            }
            match settlement.outcome {
                SettlementOutcome::Acked => {
                    acked.insert(settlement.body.as_slice());
                }
                SettlementOutcome::Nacked { requeued: false } => {
                    discarded.insert(settlement.body.as_slice());
                }
                SettlementOutcome::Nacked { requeued: true } => {}
            }
        }

        let on_receipt = self.config.consumer.ack_policy == AckPolicy::OnReceipt;
        let mut lost = Vec::new();
        let mut acked_not_committed = Vec::new();
        let mut acked_on_receipt = 0;
        let mut discarded_published = 0;
        for fp in published {
            let body = fp.as_bytes();
            let is_committed = committed.contains(body);
            if discarded.contains(body) {
                discarded_published += 1;
            }
            let is_acked = acked.contains(body);
            if is_acked && !is_committed {
                if on_receipt {
                    acked_on_receipt += 1;
                } else {
                    acked_not_committed.push(fp.to_string());
                }
            }
            let accounted = is_committed
                || discarded.contains(body)
                || in_queue.contains(body)
                || (on_receipt && is_acked);
            if !accounted {
                lost.push(fp.to_string());
            }
        }

        if !lost.is_empty() {
            violations.push(format!(
                "{} fingerprints lost (first: {:?})",
                lost.len(),
                lost.iter().take(3).collect::<Vec<_>>()
            ));
        }
        if !acked_not_committed.is_empty() {
            violations.push(format!(
                "{} fingerprints acked but never committed (first: {:?})",
                acked_not_committed.len(),
                acked_not_committed.iter().take(3).collect::<Vec<_>>()
            ));
        }

        let batches_committed: u64 = all_stats.iter().map(|s| s.batches_committed).sum();
        let sink_batches = sink.inner_sink().batch_count() as u64;
        if batches_committed != sink_batches {
            violations.push(format!(
                "sink holds {} batches but consumers committed {}",
                sink_batches, batches_committed
            ));
        }
        let batches_drained: u64 = all_stats.iter().map(|s| s.batches_drained).sum();
        let sink_stats = sink.stats();
        // A lost session may drop drained batches its worker never reached
        let attempts_ok = if sessions_lost == 0 {
            sink_stats.commit_attempts == batches_drained
        } else {
            sink_stats.commit_attempts <= batches_drained
        };
        if !attempts_ok {
            violations.push(format!(
                "sink saw {} commit attempts for {} drained batches",
                sink_stats.commit_attempts, batches_drained
            ));
        }
        for stats in all_stats {
            if stats.batches_settled() > stats.batches_drained {
                violations.push(format!(
                    "{} batches settled from {} drains",
                    stats.batches_settled(),
                    stats.batches_drained
                ));
            }
        }
        let passed = violations.is_empty();
        ConsumerDSTResult {
            seed: self.seed,
            published: published.len(),
            poison_published,
            sessions,
            sessions_lost,
            committed_rows: rows.len(),
            unique_committed: committed.len(),
            discarded: discarded_published,
            acked_on_receipt,
            left_in_queue: ready.len(),
            settlements: journal.len(),
            sink_stats,
            buggify_stats: buggify::get_stats(),
            passed,
            error_message: (!passed).then(|| format!("INVARIANT VIOLATION: {}", violations.join("; "))),
        }
    }

    fn failed(&self, message: String) -> ConsumerDSTResult {
        ConsumerDSTResult {
            seed: self.seed,
            published: 0,
            poison_published: 0,
            sessions: 0,
            sessions_lost: 0,
            committed_rows: 0,
            unique_committed: 0,
            discarded: 0,
            acked_on_receipt: 0,
            left_in_queue: 0,
            settlements: 0,
            sink_stats: SimulatedSinkStats::default(),
            buggify_stats: buggify::get_stats(),
            passed: false,
            error_message: Some(message),
        }
    }
}

/// Run a batch of DST tests across multiple seeds
pub fn run_consumer_dst_batch(
    seeds: std::ops::Range<u64>,
    config: ConsumerDSTConfig,
) -> Vec<ConsumerDSTResult> {
    seeds
        .map(|seed| {
            let mut harness = ConsumerDSTHarness::new(seed, config.clone());
            harness.run()
        })
        .collect()
}

/// Summarize batch results
pub fn summarize_consumer_dst_batch(results: &[ConsumerDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.passed).count();
    let failed = total - passed;

    let published: usize = results.iter().map(|r| r.published).sum();
    let committed: usize = results.iter().map(|r| r.unique_committed).sum();
    let discarded: usize = results.iter().map(|r| r.discarded).sum();
    let in_queue: usize = results.iter().map(|r| r.left_in_queue).sum();
    let sessions: usize = results.iter().map(|r| r.sessions).sum();

    let mut summary = format!(
        "Consumer DST Batch: {}/{} passed ({} failed)\n\
         Published: {}, Committed: {}, Discarded: {}, Left in queue: {}, Sessions: {}",
        passed, total, failed, published, committed, discarded, in_queue, sessions
    );

    let mut faults = BuggifyStats::new();
    for r in results {
        faults.merge(&r.buggify_stats);
    }
    summary.push_str("\n\n");
    summary.push_str(&faults.summary());

    if failed > 0 {
        summary.push_str("\n\nFailed seeds:");
        for r in results.iter().filter(|r| !r.passed) {
            summary.push_str(&format!(
                "\n  Seed {}: {}",
                r.seed,
                r.error_message.as_deref().unwrap_or("unknown error")
            ));
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::FailurePolicy;

    #[test]
    fn test_consumer_dst_baseline_commits_everything() {
        let results = run_consumer_dst_batch(0..10, ConsumerDSTConfig::baseline());

        for r in &results {
            assert!(r.passed, "Seed {} failed: {:?}", r.seed, r.error_message);
            assert_eq!(r.unique_committed, r.published);
            assert_eq!(r.committed_rows, r.published);
            assert_eq!(r.left_in_queue, 0);
        }
    }

    #[test]
    fn test_consumer_dst_restarts() {
        let results = run_consumer_dst_batch(0..20, ConsumerDSTConfig::restarts());
        let summary = summarize_consumer_dst_batch(&results);
        assert!(summary.contains("20/20 passed"), "{}", summary);
    }

    #[test]
    fn test_consumer_dst_chaos() {
        let results = run_consumer_dst_batch(0..30, ConsumerDSTConfig::chaos());
        for r in &results {
            assert!(r.passed, "Seed {} failed: {:?}", r.seed, r.error_message);
        }
    }

    #[test]
    fn test_consumer_dst_requeue_policy() {
        let mut config = ConsumerDSTConfig::chaos();
        config.consumer = config.consumer.with_failure_policy(FailurePolicy::Requeue);
        let results = run_consumer_dst_batch(0..20, config);
        for r in &results {
            assert!(r.passed, "Seed {} failed: {:?}", r.seed, r.error_message);
            assert_eq!(r.discarded, 0);
        }
    }

    #[test]
    fn test_consumer_dst_receipt_ack() {
        let results = run_consumer_dst_batch(0..20, ConsumerDSTConfig::receipt_ack());
        for r in &results {
            assert!(r.passed, "Seed {} failed: {:?}", r.seed, r.error_message);
        }
    }

    #[test]
    fn test_consumer_dst_fault_sites_follow_config() {
        let mut config = ConsumerDSTConfig::restarts();
        config.faults = FaultConfig::only(&[(faults::transport::POISON_PAYLOAD, 1.0)]);
        let r = ConsumerDSTHarness::new(11, config.clone()).run();
        assert!(r.passed, "{:?}", r.error_message);
        assert_eq!(r.poison_published, config.num_messages);
        assert_eq!(r.published, 0);
        assert_eq!(r.sessions, 1);
        assert_eq!(r.buggify_stats.triggered(faults::consumer::SESSION_RESTART), 0);
        assert_eq!(
            r.buggify_stats.triggered(faults::transport::POISON_PAYLOAD),
            config.num_messages as u64
        );

        let r = ConsumerDSTHarness::new(11, ConsumerDSTConfig::baseline()).run();
        assert_eq!(r.poison_published, 0);
        assert_eq!(r.buggify_stats.triggered(faults::transport::DELIVERY_REORDER), 0);
    }

    #[test]
    fn test_consumer_dst_summary_reports_fault_triggers() {
        let results = run_consumer_dst_batch(0..5, ConsumerDSTConfig::restarts());
        let summary = summarize_consumer_dst_batch(&results);
        assert!(summary.contains("BUGGIFY Statistics:"), "{}", summary);
        assert!(summary.contains(faults::consumer::SESSION_RESTART), "{}", summary);
    }

    #[test]
    fn test_consumer_dst_is_deterministic() {
        let a = ConsumerDSTHarness::new(4242, ConsumerDSTConfig::chaos()).run();
        let b = ConsumerDSTHarness::new(4242, ConsumerDSTConfig::chaos()).run();
        assert_eq!(a.committed_rows, b.committed_rows);
        assert_eq!(a.settlements, b.settlements);
        assert_eq!(a.sessions, b.sessions);
    }
}
