//! AMQP transport (RabbitMQ) on `lapin`
//!
//! Queues are declared durable at startup and every message is published
//! persistent to the default exchange with publisher confirms. Each consumer
//! worker owns a channel with its own prefetch window.

use crate::messaging::carrier::{CarrierReader, CarrierWriter, MessageHeaders};
use crate::messaging::config::{AmqpConfig, MessagingSystem};
use crate::messaging::envelope::{Envelope, CONTENT_TYPE_HEADER, JSON_CONTENT_TYPE};
use crate::messaging::error::{TransportError, TransportResult};
use crate::messaging::metrics::{record_publish, MESSAGING_METRICS};
use crate::messaging::retry::{DeliveryProcessor, Disposition};
use crate::messaging::traits::{
    Concurrency, MessageHandler, MessageTransport, ShutdownSignal, Subscription,
};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

const PERSISTENT: u8 = 2;

/// Broker-maintained count of earlier deliveries (quorum queues)
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Read view over an AMQP header table; non-string values are skipped
pub struct AmqpHeaderReader<'a>(pub &'a FieldTable);

fn as_text(value: &AMQPValue) -> Option<&str> {
    match value {
        AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok(),
        AMQPValue::ShortString(s) => Some(s.as_str()),
        _ => None,
    }
}

impl CarrierReader for AmqpHeaderReader<'_> {
    fn keys(&self) -> Vec<&str> {
        self.0
            .inner()
            .iter()
            .filter(|(_, value)| as_text(value).is_some())
            .map(|(key, _)| key.as_str())
            .collect()
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .inner()
            .iter()
            .find(|(name, _)| name.as_str() == key)
            .and_then(|(_, value)| as_text(value))
    }
}

/// Write view over an AMQP header table
pub struct AmqpHeaderWriter<'a>(pub &'a mut FieldTable);

impl CarrierWriter for AmqpHeaderWriter<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(
            ShortString::from(key.to_string()),
            AMQPValue::LongString(LongString::from(value)),
        );
    }
}

/// Native header table for an outgoing message
pub fn to_field_table(headers: &MessageHeaders) -> FieldTable {
    let mut table = FieldTable::default();
    headers.write_to(&mut AmqpHeaderWriter(&mut table));
    table
}

/// AMQP [`MessageTransport`]
pub struct AmqpTransport {
    connection: Connection,
    publisher: Channel,
    config: AmqpConfig,
    processor: Arc<DeliveryProcessor>,
}

impl AmqpTransport {
    /// Connect, enable publisher confirms and declare the pipeline queues
    pub async fn new(config: AmqpConfig, processor: Arc<DeliveryProcessor>) -> TransportResult<Self> {
        let connection = Connection::connect(&config.uri(), ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::connection(format!("AMQP connection failed: {}", e)))?;

        let publisher = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::connection(format!("AMQP channel failed: {}", e)))?;
        publisher
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| TransportError::rejected(format!("publisher confirms refused: {}", e)))?;

        for queue in config.queues.all() {
            declare_queue(&publisher, queue).await?;
        }

        info!(host = %config.host, port = config.port, "AMQP transport ready");
        Ok(Self {
            connection,
            publisher,
            config,
            processor,
        })
    }

    async fn consumer_channel(&self, destination: &str, worker_id: usize, auto_ack: bool) -> TransportResult<(Channel, Consumer)> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| TransportError::connection(format!("AMQP channel failed: {}", e)))?;
        channel
            .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| TransportError::rejected(format!("basic.qos refused: {}", e)))?;
        declare_queue(&channel, destination).await?;

        let tag = format!("{}-{}-{}", self.config.consumer_tag_prefix, destination, worker_id);
        let consumer = channel
            .basic_consume(
                destination,
                &tag,
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::rejected(format!("basic.consume refused: {}", e)))?;
        Ok((channel, consumer))
    }
}

async fn declare_queue(channel: &Channel, queue: &str) -> TransportResult<()> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| TransportError::rejected(format!("queue {} declaration failed: {}", queue, e)))?;
    debug!(queue, "AMQP queue declared");
    Ok(())
}

#[async_trait]
impl MessageTransport for AmqpTransport {
    fn system(&self) -> MessagingSystem {
        MessagingSystem::Amqp
    }

    async fn publish(
        &self,
        destination: &str,
        payload: Vec<u8>,
        headers: &MessageHeaders,
    ) -> TransportResult<()> {
        let started = Instant::now();
        let content_type = headers.get(CONTENT_TYPE_HEADER).unwrap_or(JSON_CONTENT_TYPE);
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(content_type.to_string()))
            .with_delivery_mode(PERSISTENT)
            .with_headers(to_field_table(headers));

        let result = async {
            let confirm = self
                .publisher
                .basic_publish(
                    "",
                    destination,
                    BasicPublishOptions::default(),
                    &payload,
                    properties,
                )
                .await
                .map_err(|e| TransportError::connection(format!("AMQP publish failed: {}", e)))?;
            let confirmation = confirm
                .await
                .map_err(|e| TransportError::connection(format!("AMQP confirm failed: {}", e)))?;
            if confirmation.is_nack() {
                return Err(TransportError::rejected("broker nacked the message"));
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                debug!(destination, "AMQP message published");
                record_publish(destination, "amqp", started.elapsed().as_secs_f64(), None);
                Ok(())
            }
            Err(err) => {
                error!(destination, error = %err, "AMQP publish failed");
                record_publish(destination, "amqp", 0.0, Some(err.kind.as_ref()));
                Err(err)
            }
        }
    }

    async fn subscribe(
        &self,
        destination: &str,
        concurrency: Concurrency,
        handler: Arc<dyn MessageHandler>,
    ) -> TransportResult<Subscription> {
        let auto_ack = !handler.transactional();
        let (shutdown_tx, shutdown) = ShutdownSignal::channel();
        let mut workers = Vec::with_capacity(concurrency.max);

        for worker_id in 0..concurrency.max {
            let (channel, consumer) = self.consumer_channel(destination, worker_id, auto_ack).await?;
            let worker = AmqpWorker {
                worker_id,
                destination: destination.to_string(),
                channel,
                consumer,
                auto_ack,
                processor: self.processor.clone(),
                handler: handler.clone(),
                shutdown: shutdown.clone(),
            };
            workers.push(tokio::spawn(worker.run()));
        }

        info!(
            destination,
            consumers = concurrency.max,
            auto_ack,
            prefetch = self.config.prefetch_count,
            "AMQP subscription started"
        );
        Ok(Subscription::new(destination, shutdown_tx, workers))
    }

    async fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> TransportResult<()> {
        self.connection
            .close(200, "shutdown")
            .await
            .map_err(|e| TransportError::connection(format!("AMQP close failed: {}", e)))?;
        info!("AMQP transport closed");
        Ok(())
    }
}

fn to_envelope(destination: &str, delivery: &Delivery) -> Envelope {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(|table| MessageHeaders::from_reader(&AmqpHeaderReader(table)))
        .unwrap_or_default();
    let attempt = delivery_attempt(delivery.properties.headers().as_ref(), delivery.redelivered);
    Envelope::new(destination, delivery.data.clone(), headers).with_attempt(attempt)
}

/// Attempt number of a delivery.
///
/// Quorum queues count earlier deliveries in `x-delivery-count`; classic
/// queues only flag a redelivery, which counts as at least the second attempt.
fn delivery_attempt(headers: Option<&FieldTable>, redelivered: bool) -> u32 {
    let floor = if redelivered { 2 } else { 1 };
    headers
        .and_then(|table| {
            table
                .inner()
                .iter()
                .find(|(name, _)| name.as_str() == DELIVERY_COUNT_HEADER)
                .and_then(|(_, value)| as_count(value))
        })
        .map(|previous| previous.saturating_add(1).max(floor))
        .unwrap_or(floor)
}

fn as_count(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::ShortShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::LongUInt(n) => Some(*n),
        AMQPValue::ShortShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
        _ => None,
    }
}

struct AmqpWorker {
    worker_id: usize,
    destination: String,
    channel: Channel,
    consumer: Consumer,
    auto_ack: bool,
    processor: Arc<DeliveryProcessor>,
    handler: Arc<dyn MessageHandler>,
    shutdown: ShutdownSignal,
}

impl AmqpWorker {
    async fn run(mut self) {
        let gauge = MESSAGING_METRICS
            .active_consumers
            .with_label_values(&[&self.destination, "amqp"]);
        gauge.inc();
        info!(destination = %self.destination, worker_id = self.worker_id, "AMQP consumer started");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                next = self.consumer.next() => next,
            };

            let delivery = match next {
                None => {
                    warn!(destination = %self.destination, worker_id = self.worker_id, "AMQP consumer cancelled by broker");
                    break;
                }
                Some(Err(e)) => {
                    warn!(destination = %self.destination, worker_id = self.worker_id, error = %e, "AMQP receive failed");
                    continue;
                }
                Some(Ok(delivery)) => delivery,
            };

            let envelope = to_envelope(&self.destination, &delivery);
            let disposition = self
                .processor
                .process(self.handler.as_ref(), envelope, &self.shutdown)
                .await;

            if self.auto_ack {
                continue;
            }
            let acked = match disposition {
                Disposition::Committed { .. } => {
                    delivery.acker.ack(BasicAckOptions::default()).await
                }
                Disposition::DeadLettered { .. } => {
                    delivery
                        .acker
                        .nack(BasicNackOptions {
                            multiple: false,
                            requeue: false,
                        })
                        .await
                }
                Disposition::Abandoned { .. } => {
                    delivery
                        .acker
                        .nack(BasicNackOptions {
                            multiple: false,
                            requeue: true,
                        })
                        .await
                }
            };
            if let Err(e) = acked {
                warn!(destination = %self.destination, worker_id = self.worker_id, error = %e, "AMQP acknowledgement failed");
            }
        }

        if let Err(e) = self.channel.close(200, "subscription shutdown").await {
            debug!(destination = %self.destination, error = %e, "AMQP channel close failed");
        }
        gauge.dec();
        info!(destination = %self.destination, worker_id = self.worker_id, "AMQP consumer stopped");
    }
}
