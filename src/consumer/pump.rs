//! Delivery Pump
//!
//! Pulls deliveries from a [`DeliverySource`] and hands them to a
//! [`ConsumerHandle`], keeping at most `max_in_flight` hand-offs running at
//! once, like a broker dispatching callbacks under a QoS limit. Stops when
//! the source closes, when the stop signal fires, or after the source has
//! been idle for `idle_timeout`.

use super::actor::{ConsumerError, ConsumerHandle};
use crate::transport::DeliverySource;
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpConfig {
    pub max_in_flight: usize,
    /// Stop when no delivery arrives for this long
    pub idle_timeout: Option<Duration>,
}

impl Default for PumpConfig {
    fn default() -> Self {
        PumpConfig {
            max_in_flight: super::config::REFERENCE_PREFETCH,
            idle_timeout: None,
        }
    }
}

/// Why the pump returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    SourceClosed,
    Stopped,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    pub delivered: u64,
    pub exit: PumpExit,
}

/// Feed `handle` from `source` until the source closes, `stop` resolves or
/// the idle timeout elapses. In-flight hand-offs always complete.
pub async fn run_pump<D, F>(
    source: &D,
    handle: &ConsumerHandle,
    config: &PumpConfig,
    stop: F,
) -> Result<PumpReport, ConsumerError>
where
    D: DeliverySource + ?Sized,
    F: Future<Output = ()>,
{
    let max_in_flight = config.max_in_flight.max(1);
    let mut in_flight = FuturesUnordered::new();
    let mut delivered = 0u64;
    tokio::pin!(stop);

    let exit = loop {
        if in_flight.len() >= max_in_flight {
            if let Some(result) = in_flight.next().await {
                result?;
                delivered += 1;
            }
            continue;
        }

        let next = async {
            match config.idle_timeout {
                Some(idle) => tokio::time::timeout(idle, source.recv()).await.map_err(|_| ()),
                None => Ok(source.recv().await),
            }
        };

        tokio::select! {
            biased;
            _ = &mut stop => break PumpExit::Stopped,
            Some(result) = in_flight.next(), if !in_flight.is_empty() => {
                result?;
                delivered += 1;
            }
            received = next => match received {
                Ok(Some(delivery)) => in_flight.push(handle.deliver(delivery)),
                Ok(None) => break PumpExit::SourceClosed,
                Err(()) => break PumpExit::Idle,
            },
        }
    };

    while let Some(result) = in_flight.next().await {
        result?;
        delivered += 1;
    }

    debug!(delivered, ?exit, "pump drained");
    if exit != PumpExit::Stopped {
        info!(delivered, ?exit, "delivery pump finished");
    }
    Ok(PumpReport { delivered, exit })
}
