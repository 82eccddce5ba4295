//! AMQP 0-9-1 transport
//!
//! Maps the transport traits onto a broker connection:
//!
//! | Trait | Broker method |
//! |-------|---------------|
//! | [`DeliverySource`] | `basic.consume` stream, window set by `basic.qos` |
//! | [`AckChannel`] | `basic.ack` / `basic.nack` with `multiple` and `requeue` |
//! | [`Publisher`] | `basic.publish` on the default exchange, `delivery_mode = 2` when persistent |
//!
//! Delivery tags are the channel's own, so cumulative settlement works
//! exactly as on the in-memory broker. A failed ack or a closed consumer
//! stream ends the session; the broker requeues whatever was unsettled.

use super::{
    AckChannel, Delivery, DeliveryMode, DeliverySource, DeliveryTag, Publisher, QueueSpec,
    TransportError, TransportFuture,
};
use crate::config::TransportConfig;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

const REPLY_SUCCESS: u16 = 200;

fn closed(context: &str, e: lapin::Error) -> TransportError {
    TransportError::ChannelClosed(format!("{}: {}", context, e))
}

/// Declare options for a queue spec; never passive
pub fn declare_options(spec: &QueueSpec) -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: spec.durable,
        exclusive: spec.exclusive,
        auto_delete: spec.auto_delete,
        ..QueueDeclareOptions::default()
    }
}

/// `basic.qos` carries the window as a 16-bit count, and 0 would mean unlimited
pub fn qos_prefetch(prefetch: usize) -> Result<u16, TransportError> {
    match u16::try_from(prefetch) {
        Ok(0) => Err(TransportError::PreconditionFailed(
            "prefetch must be at least 1".to_string(),
        )),
        Ok(n) => Ok(n),
        Err(_) => Err(TransportError::PreconditionFailed(format!(
            "prefetch {} exceeds {}",
            prefetch,
            u16::MAX
        ))),
    }
}

pub fn publish_properties(mode: DeliveryMode) -> BasicProperties {
    let delivery_mode = match mode {
        DeliveryMode::Transient => 1,
        DeliveryMode::Persistent => 2,
    };
    BasicProperties::default().with_delivery_mode(delivery_mode)
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        tag: DeliveryTag::new(delivery.delivery_tag),
        body: delivery.data,
        redelivered: delivery.redelivered,
    }
}

/// One broker connection
pub struct AmqpTransport {
    connection: Connection,
    consumer_tag: String,
}

impl AmqpTransport {
    #[instrument(skip(config))]
    pub async fn connect(config: &TransportConfig) -> Result<Self, TransportError> {
        let connection = Connection::connect(&config.amqp_url, ConnectionProperties::default())
            .await
            .map_err(|e| closed("failed to connect", e))?;
        info!(queue = %config.queue, "connected to AMQP broker");
        Ok(AmqpTransport {
            connection,
            consumer_tag: config.consumer_tag.clone(),
        })
    }

    async fn channel(&self) -> Result<Channel, TransportError> {
        self.connection
            .create_channel()
            .await
            .map_err(|e| closed("failed to open channel", e))
    }

    /// Declare a queue; the broker rejects a redeclare with other properties
    pub async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), TransportError> {
        let channel = self.channel().await?;
        channel
            .queue_declare(&spec.name, declare_options(spec), FieldTable::default())
            .await
            .map_err(|e| {
                TransportError::PreconditionFailed(format!("declare {} failed: {}", spec.name, e))
            })?;
        debug!(queue = %spec.name, durable = spec.durable, "queue declared");
        let _ = channel.close(REPLY_SUCCESS, "declared").await;
        Ok(())
    }

    /// Start consuming `queue` with at most `prefetch` unsettled deliveries
    pub async fn open_session(&self, queue: &str, prefetch: usize) -> Result<AmqpSession, TransportError> {
        let window = qos_prefetch(prefetch)?;
        let channel = self.channel().await?;
        channel
            .basic_qos(window, BasicQosOptions::default())
            .await
            .map_err(|e| closed("basic.qos failed", e))?;
        let consumer = channel
            .basic_consume(
                queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| match e {
                lapin::Error::ProtocolError(_) => TransportError::QueueNotFound(queue.to_string()),
                other => closed("basic.consume failed", other),
            })?;
        debug!(queue, prefetch = window, "session opened");
        Ok(AmqpSession {
            inner: Arc::new(SessionInner {
                channel,
                consumer: Mutex::new(consumer),
            }),
        })
    }

    /// Publisher on its own channel
    pub async fn publisher(&self) -> Result<AmqpPublisher, TransportError> {
        Ok(AmqpPublisher {
            channel: self.channel().await?,
        })
    }

    pub async fn close(&self) {
        if let Err(e) = self.connection.close(REPLY_SUCCESS, "shutdown").await {
            warn!(error = %e, "connection close failed");
        }
    }
}

impl std::fmt::Debug for AmqpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpTransport")
            .field("connection", &"[REDACTED]")
            .field("consumer_tag", &self.consumer_tag)
            .finish()
    }
}

struct SessionInner {
    channel: Channel,
    consumer: Mutex<Consumer>,
}

/// One consuming channel. Clones share the channel.
#[derive(Clone)]
pub struct AmqpSession {
    inner: Arc<SessionInner>,
}

impl AmqpSession {
    /// Close the channel; the broker requeues unsettled deliveries
    pub async fn close(&self) {
        if let Err(e) = self.inner.channel.close(REPLY_SUCCESS, "session closed").await {
            warn!(error = %e, "channel close failed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.channel.status().connected()
    }
}

impl DeliverySource for AmqpSession {
    fn recv(&self) -> Pin<Box<dyn Future<Output = Option<Delivery>> + Send + '_>> {
        Box::pin(async move {
            let mut consumer = self.inner.consumer.lock().await;
            match consumer.next().await {
                Some(Ok(delivery)) => Some(into_delivery(delivery)),
                Some(Err(e)) => {
                    warn!(error = %e, "consumer stream failed");
                    None
                }
                None => None,
            }
        })
    }
}

impl AckChannel for AmqpSession {
    fn ack(&self, tag: DeliveryTag, multiple: bool) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.inner
                .channel
                .basic_ack(tag.get(), BasicAckOptions { multiple })
                .await
                .map_err(|e| closed("basic.ack failed", e))
        })
    }

    fn nack(&self, tag: DeliveryTag, multiple: bool, requeue: bool) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.inner
                .channel
                .basic_nack(tag.get(), BasicNackOptions { multiple, requeue })
                .await
                .map_err(|e| closed("basic.nack failed", e))
        })
    }
}

/// Publishes to the default exchange, routed by queue name
#[derive(Clone)]
pub struct AmqpPublisher {
    channel: Channel,
}

impl Publisher for AmqpPublisher {
    fn publish<'a>(
        &'a self,
        queue: &'a str,
        body: &'a [u8],
        mode: DeliveryMode,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            self.channel
                .basic_publish(
                    "",
                    queue,
                    BasicPublishOptions::default(),
                    body,
                    publish_properties(mode),
                )
                .await
                .map_err(|e| closed("basic.publish failed", e))?;
            Ok(())
        })
    }
}
