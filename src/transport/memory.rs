//! In-Memory Broker
//!
//! A single-process stand-in for a durable AMQP-style queue. It implements
//! the delivery semantics the consumer core depends on:
//!
//! ```text
//! publish ──► ready queue ──► session (prefetch window) ──► Delivery{tag}
//!                  ▲                    │
//!                  └── requeue / close ─┘   ack / nack(multiple)
//! ```
//!
//! - Tags start at 1 per session and increase by one per delivery
//! - At most `prefetch` deliveries are outstanding per session
//! - `multiple = true` settles every outstanding tag at or below the given tag
//! - Settling an unknown tag is a protocol error that closes the session
//! - Closing a session returns its outstanding deliveries to the head of the
//!   queue, flagged as redelivered
//!
//! Every settlement is journaled so tests can check per-tag outcomes.

use super::{
    AckChannel, Delivery, DeliveryMode, DeliverySource, DeliveryTag, Publisher, QueueSpec,
    TransportError, TransportFuture,
};
use crate::buggify::faults;
use crate::io::SimulatedRng;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementOutcome {
    Acked,
    Nacked { requeued: bool },
}

/// One journaled settlement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub session_id: u64,
    pub tag: DeliveryTag,
    pub outcome: SettlementOutcome,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    mode: DeliveryMode,
    redelivered: bool,
}

#[derive(Debug)]
struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<Message>,
}

#[derive(Debug)]
struct SessionState {
    queue: String,
    prefetch: usize,
    next_tag: DeliveryTag,
    outstanding: BTreeMap<DeliveryTag, Message>,
    open: bool,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    sessions: HashMap<u64, SessionState>,
    next_session_id: u64,
    journal: Vec<Settlement>,
    ack_fault: Option<(SimulatedRng, f64)>,
}

impl BrokerState {
    /// Return a session's outstanding deliveries to the head of its queue
    fn close_session(&mut self, session_id: u64) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        if !session.open {
            return;
        }
        session.open = false;
        let outstanding = std::mem::take(&mut session.outstanding);
        let queue_name = session.queue.clone();

        if let Some(queue) = self.queues.get_mut(&queue_name) {
            // Reverse so the lowest tag ends up first
            for (_, mut message) in outstanding.into_iter().rev() {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
    }

    fn settle(
        &mut self,
        session_id: u64,
        tag: DeliveryTag,
        multiple: bool,
        outcome: SettlementOutcome,
    ) -> Result<(), TransportError> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| TransportError::ChannelClosed(format!("session {}", session_id)))?;
        if !session.open {
            return Err(TransportError::ChannelClosed(format!("session {}", session_id)));
        }

        if !session.outstanding.contains_key(&tag) {
            self.close_session(session_id);
            return Err(TransportError::PreconditionFailed(format!(
                "unknown delivery tag {} on session {}",
                tag, session_id
            )));
        }

        let settled: Vec<(DeliveryTag, Message)> = if multiple {
            let above = session.outstanding.split_off(&tag.next());
            std::mem::replace(&mut session.outstanding, above)
                .into_iter()
                .collect()
        } else {
            session
                .outstanding
                .remove(&tag)
                .map(|m| vec![(tag, m)])
                .unwrap_or_default()
        };
        let queue_name = session.queue.clone();

        let mut requeue = Vec::new();
        for (settled_tag, message) in settled {
            self.journal.push(Settlement {
                session_id,
                tag: settled_tag,
                outcome,
                body: message.body.clone(),
            });
            if outcome == (SettlementOutcome::Nacked { requeued: true }) {
                requeue.push(message);
            }
        }

        if let Some(queue) = self.queues.get_mut(&queue_name) {
            for mut message in requeue.into_iter().rev() {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
        Ok(())
    }

    fn inject_ack_fault(&mut self) -> bool {
        match self.ack_fault.as_mut() {
            Some((rng, prob)) => {
                let prob = *prob;
                crate::buggify!(rng, faults::transport::ACK_FAIL, prob)
            }
            None => false,
        }
    }
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    notify: Notify,
}

/// Shared handle to an in-memory broker. Clones refer to the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        InMemoryBroker {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Fail acks/nacks with the given probability, closing the session
    pub fn with_ack_faults(self, rng: SimulatedRng, probability: f64) -> Self {
        self.inner.state.lock().ack_fault = Some((rng, probability));
        self
    }

    /// Declare a queue. Idempotent for identical specs.
    pub fn declare_queue(&self, spec: &QueueSpec) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock();
        match state.queues.get(&spec.name) {
            Some(existing) if existing.spec != *spec => Err(TransportError::PreconditionFailed(
                format!("queue {} redeclared with different properties", spec.name),
            )),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    spec.name.clone(),
                    QueueState {
                        spec: spec.clone(),
                        ready: VecDeque::new(),
                    },
                );
                debug!(queue = %spec.name, durable = spec.durable, "queue declared");
                Ok(())
            }
        }
    }

    /// Enqueue one message
    pub fn publish_now(
        &self,
        queue: &str,
        body: &[u8],
        mode: DeliveryMode,
    ) -> Result<(), TransportError> {
        {
            let mut state = self.inner.state.lock();
            let queue_state = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| TransportError::QueueNotFound(queue.to_string()))?;
            queue_state.ready.push_back(Message {
                body: body.to_vec(),
                mode,
                redelivered: false,
            });
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Start consuming `queue` with at most `prefetch` outstanding deliveries
    pub fn open_session(&self, queue: &str, prefetch: usize) -> Result<InMemorySession, TransportError> {
        if prefetch == 0 {
            return Err(TransportError::PreconditionFailed(
                "prefetch must be at least 1".to_string(),
            ));
        }
        let mut state = self.inner.state.lock();
        if !state.queues.contains_key(queue) {
            return Err(TransportError::QueueNotFound(queue.to_string()));
        }
        state.next_session_id += 1;
        let id = state.next_session_id;
        state.sessions.insert(
            id,
            SessionState {
                queue: queue.to_string(),
                prefetch,
                next_tag: DeliveryTag::new(1),
                outstanding: BTreeMap::new(),
                open: true,
            },
        );
        debug!(queue, session_id = id, prefetch, "session opened");
        Ok(InMemorySession {
            broker: self.clone(),
            id,
        })
    }

    /// Simulate a broker restart: sessions drop, transient messages and
    /// non-durable queues are lost.
    pub fn restart(&self) {
        {
            let mut state = self.inner.state.lock();
            let ids: Vec<u64> = state.sessions.keys().copied().collect();
            for id in ids {
                state.close_session(id);
            }
            state.queues.retain(|_, q| q.spec.durable);
            for queue in state.queues.values_mut() {
                queue.ready.retain(|m| m.mode == DeliveryMode::Persistent);
            }
        }
        warn!("in-memory broker restarted");
        self.inner.notify.notify_waiters();
    }

    /// Messages waiting to be delivered
    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Ready bodies in queue order
    pub fn ready_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Delivered but unsettled messages on a session
    pub fn outstanding_count(&self, session_id: u64) -> usize {
        self.inner
            .state
            .lock()
            .sessions
            .get(&session_id)
            .map(|s| s.outstanding.len())
            .unwrap_or(0)
    }

    /// Every settlement so far, in settlement order
    pub fn journal(&self) -> Vec<Settlement> {
        self.inner.state.lock().journal.clone()
    }

    /// Settlements for one session
    pub fn settlements_for(&self, session_id: u64) -> Vec<Settlement> {
        self.inner
            .state
            .lock()
            .journal
            .iter()
            .filter(|s| s.session_id == session_id)
            .cloned()
            .collect()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher for InMemoryBroker {
    fn publish<'a>(
        &'a self,
        queue: &'a str,
        body: &'a [u8],
        mode: DeliveryMode,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move { self.publish_now(queue, body, mode) })
    }
}

/// One consumer session (channel) on an [`InMemoryBroker`]
#[derive(Clone)]
pub struct InMemorySession {
    broker: InMemoryBroker,
    id: u64,
}

impl InMemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.broker
            .inner
            .state
            .lock()
            .sessions
            .get(&self.id)
            .map(|s| s.open)
            .unwrap_or(false)
    }

    /// Next delivery if one is ready and the prefetch window has room
    pub fn try_recv(&self) -> Option<Delivery> {
        self.try_deliver().ok().flatten()
    }

    /// Close the session; outstanding deliveries are requeued
    pub fn close(&self) {
        self.broker.inner.state.lock().close_session(self.id);
        self.broker.inner.notify.notify_waiters();
    }

    /// Deliver the next ready message if the prefetch window allows it
    fn try_deliver(&self) -> Result<Option<Delivery>, ()> {
        let mut state = self.broker.inner.state.lock();
        let state = &mut *state;
        let session = match state.sessions.get_mut(&self.id) {
            Some(s) if s.open => s,
            _ => return Err(()),
        };
        if session.outstanding.len() >= session.prefetch {
            return Ok(None);
        }
        let Some(queue) = state.queues.get_mut(&session.queue) else {
            return Err(());
        };
        let Some(message) = queue.ready.pop_front() else {
            return Ok(None);
        };

        let tag = session.next_tag;
        session.next_tag = tag.next();
        let delivery = Delivery {
            tag,
            body: message.body.clone(),
            redelivered: message.redelivered,
        };
        session.outstanding.insert(tag, message);
        Ok(Some(delivery))
    }

    fn settle(
        &self,
        tag: DeliveryTag,
        multiple: bool,
        outcome: SettlementOutcome,
    ) -> Result<(), TransportError> {
        let result = {
            let mut state = self.broker.inner.state.lock();
            if state.inject_ack_fault() {
                state.close_session(self.id);
                Err(TransportError::ChannelClosed(format!(
                    "injected ack failure on session {}",
                    self.id
                )))
            } else {
                state.settle(self.id, tag, multiple, outcome)
            }
        };
        // Settling frees prefetch slots; failures may have requeued messages
        self.broker.inner.notify.notify_waiters();
        result
    }
}

impl AckChannel for InMemorySession {
    fn ack(&self, tag: DeliveryTag, multiple: bool) -> TransportFuture<'_, ()> {
        Box::pin(async move { self.settle(tag, multiple, SettlementOutcome::Acked) })
    }

    fn nack(&self, tag: DeliveryTag, multiple: bool, requeue: bool) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.settle(tag, multiple, SettlementOutcome::Nacked { requeued: requeue })
        })
    }
}

impl DeliverySource for InMemorySession {
    fn recv(&self) -> Pin<Box<dyn Future<Output = Option<Delivery>> + Send + '_>> {
        Box::pin(async move {
            loop {
                let notified = self.broker.inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match self.try_deliver() {
                    Ok(Some(delivery)) => return Some(delivery),
                    Ok(None) => {}
                    Err(()) => return None,
                }
                notified.await;
            }
        })
    }
}
