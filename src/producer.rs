//! Fingerprint Producer
//!
//! Generates fresh 128-bit random tokens, formats each as a hyphenated
//! GUID string, hashes it with SHA-1 and publishes the hex digest as one
//! persistent message. Work is split across `fan_out` tokio tasks.

use crate::fingerprint::Fingerprint;
use crate::io::{ProductionRng, Rng, SimulatedRng};
use crate::transport::{DeliveryMode, Publisher, TransportError};
use std::sync::Arc;
use tracing::{debug, info};

/// Where token randomness comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Entropy,
    /// Task `i` uses seed `seed + i`
    Seeded(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProducerReport {
    pub published: u64,
    pub tasks: usize,
}

pub struct HashProducer<P: Publisher> {
    publisher: Arc<P>,
    queue: String,
    tokens: TokenSource,
}

impl<P: Publisher> HashProducer<P> {
    pub fn new(publisher: Arc<P>, queue: impl Into<String>) -> Self {
        HashProducer {
            publisher,
            queue: queue.into(),
            tokens: TokenSource::Entropy,
        }
    }

    pub fn with_token_source(mut self, tokens: TokenSource) -> Self {
        self.tokens = tokens;
        self
    }

    /// Publish `count` fingerprints across `fan_out` concurrent tasks.
    /// The remainder of `count / fan_out` goes to the first tasks.
    pub async fn generate(&self, count: usize, fan_out: usize) -> Result<ProducerReport, TransportError> {
        let fan_out = fan_out.max(1);
        let base = count / fan_out;
        let remainder = count % fan_out;

        let mut tasks = Vec::with_capacity(fan_out);
        for task_index in 0..fan_out {
            let share = base + usize::from(task_index < remainder);
            if share == 0 {
                continue;
            }
            let publisher = self.publisher.clone();
            let queue = self.queue.clone();
            let tokens = self.tokens;
            tasks.push(tokio::spawn(async move {
                match tokens {
                    TokenSource::Entropy => {
                        publish_share(&*publisher, &queue, share, ProductionRng::new()).await
                    }
                    TokenSource::Seeded(seed) => {
                        let rng = SimulatedRng::new(seed.wrapping_add(task_index as u64));
                        publish_share(&*publisher, &queue, share, rng).await
                    }
                }
            }));
        }

        let mut report = ProducerReport {
            published: 0,
            tasks: tasks.len(),
        };
        for task in tasks {
            let published = task
                .await
                .map_err(|e| TransportError::ChannelClosed(format!("producer task failed: {}", e)))??;
            report.published += published;
        }
        info!(published = report.published, tasks = report.tasks, queue = %self.queue, "fingerprints published");
        Ok(report)
    }
}

async fn publish_share<P: Publisher + ?Sized, R: Rng>(
    publisher: &P,
    queue: &str,
    share: usize,
    mut rng: R,
) -> Result<u64, TransportError> {
    for _ in 0..share {
        let token = guid_token(&mut rng);
        let fingerprint = Fingerprint::sha1_of(token.as_bytes());
        publisher
            .publish(queue, fingerprint.as_bytes(), DeliveryMode::Persistent)
            .await?;
    }
    debug!(share, queue, "producer task finished");
    Ok(share as u64)
}

/// Random 128-bit token in `8-4-4-4-12` hex form
pub fn guid_token<R: Rng>(rng: &mut R) -> String {
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    // RFC 4122 version 4 / variant bits
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::SHA1_HEX_LEN;
    use crate::transport::{InMemoryBroker, QueueSpec};

    #[test]
    fn test_guid_token_shape() {
        let mut rng = SimulatedRng::new(1);
        let token = guid_token(&mut rng);
        assert_eq!(token.len(), 36);
        let groups: Vec<usize> = token.split('-').map(|g| g.len()).collect();
        assert_eq!(groups, vec![8, 4, 4, 4, 12]);
        assert_eq!(&token[14..15], "4");
    }

    #[tokio::test]
    async fn test_generate_splits_work_and_publishes_all() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&QueueSpec::durable("hashes")).unwrap();
        let producer = HashProducer::new(Arc::new(broker.clone()), "hashes")
            .with_token_source(TokenSource::Seeded(9));

        let report = producer.generate(10, 4).await.unwrap();

        assert_eq!(report.published, 10);
        assert_eq!(report.tasks, 4);
        let bodies = broker.ready_bodies("hashes");
        assert_eq!(bodies.len(), 10);
        assert!(bodies.iter().all(|b| b.len() == SHA1_HEX_LEN));
    }

    #[tokio::test]
    async fn test_small_count_skips_empty_tasks() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&QueueSpec::durable("hashes")).unwrap();
        let producer = HashProducer::new(Arc::new(broker.clone()), "hashes");

        let report = producer.generate(2, 4).await.unwrap();
        assert_eq!(report.tasks, 2);
        assert_eq!(broker.ready_count("hashes"), 2);
    }

    #[tokio::test]
    async fn test_undeclared_queue_fails() {
        let broker = InMemoryBroker::new();
        let producer = HashProducer::new(Arc::new(broker), "missing");
        assert!(matches!(
            producer.generate(1, 1).await,
            Err(TransportError::QueueNotFound(_))
        ));
    }
}
