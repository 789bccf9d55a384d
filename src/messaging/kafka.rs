//! Kafka transport
//!
//! Every subscription runs `concurrency` consumers in one consumer group
//! with auto-commit disabled. Offsets are committed per message, and only
//! after the retry policy reached a terminal disposition.

use crate::messaging::carrier::{CarrierReader, CarrierWriter, MessageHeaders};
use crate::messaging::config::{KafkaConfig, MessagingSystem};
use crate::messaging::envelope::{Envelope, MESSAGE_KEY_HEADER};
use crate::messaging::error::{TransportError, TransportResult};
use crate::messaging::metrics::{record_publish, MESSAGING_METRICS};
use crate::messaging::retry::DeliveryProcessor;
use crate::messaging::traits::{
    Concurrency, MessageHandler, MessageTransport, ShutdownSignal, Subscription,
};
use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Message, Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Read view over Kafka record headers.
///
/// Kafka allows repeated keys; the last occurrence wins. Values that are
/// not valid UTF-8 read as absent.
pub struct KafkaHeaderReader<'a, H: Headers>(pub &'a H);

impl<H: Headers> CarrierReader for KafkaHeaderReader<'_, H> {
    fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.0.iter().map(|header| header.key).collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .filter(|header| header.key == key)
            .last()
            .and_then(|header| header.value)
            .and_then(|value| std::str::from_utf8(value).ok())
    }
}

/// Write view over owned Kafka headers; `set` leaves a single entry per key
pub struct KafkaHeaderWriter<'a>(pub &'a mut OwnedHeaders);

impl CarrierWriter for KafkaHeaderWriter<'_> {
    fn set(&mut self, key: &str, value: String) {
        let current = std::mem::replace(self.0, OwnedHeaders::new());
        let mut rebuilt = OwnedHeaders::new_with_capacity(current.count() + 1);
        for header in current.iter().filter(|header| header.key != key) {
            rebuilt = rebuilt.insert(Header {
                key: header.key,
                value: header.value,
            });
        }
        *self.0 = rebuilt.insert(Header {
            key,
            value: Some(value.as_bytes()),
        });
    }
}

/// Native headers for an outgoing record
pub fn to_kafka_headers(headers: &MessageHeaders) -> OwnedHeaders {
    let mut owned = OwnedHeaders::new_with_capacity(headers.len());
    headers.write_to(&mut KafkaHeaderWriter(&mut owned));
    owned
}

fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.bootstrap_servers)
        .set("client.id", &config.client_id);

    if config.enable_sasl {
        if let (Some(mechanism), Some(username), Some(password)) = (
            &config.sasl_mechanism,
            &config.sasl_username,
            &config.sasl_password,
        ) {
            client_config
                .set("security.protocol", "SASL_SSL")
                .set("sasl.mechanism", mechanism)
                .set("sasl.username", username)
                .set("sasl.password", password);
        }
    } else if config.enable_ssl {
        client_config.set("security.protocol", "SSL");
    }

    client_config
}

fn classify(err: &KafkaError) -> TransportError {
    match err.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::MessageTimedOut
            | RDKafkaErrorCode::OperationTimedOut,
        ) => TransportError::connection(err.to_string()),
        _ => TransportError::rejected(err.to_string()),
    }
}

/// Kafka [`MessageTransport`]
pub struct KafkaTransport {
    producer: FutureProducer,
    config: KafkaConfig,
    processor: Arc<DeliveryProcessor>,
}

impl KafkaTransport {
    /// Create the producer and, if configured, the pipeline topics
    pub async fn new(config: KafkaConfig, processor: Arc<DeliveryProcessor>) -> TransportResult<Self> {
        let producer: FutureProducer = client_config(&config)
            .set("compression.type", &config.compression_type)
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| {
                TransportError::connection(format!("Kafka producer creation failed: {}", e))
            })?;

        let transport = Self {
            producer,
            config,
            processor,
        };

        if transport.config.create_topics {
            transport.ensure_topics().await?;
        }

        info!(
            bootstrap_servers = %transport.config.bootstrap_servers,
            "Kafka transport ready"
        );
        Ok(transport)
    }

    async fn ensure_topics(&self) -> TransportResult<()> {
        let admin: AdminClient<DefaultClientContext> =
            client_config(&self.config).create().map_err(|e| {
                TransportError::connection(format!("Kafka admin client creation failed: {}", e))
            })?;

        let topics: Vec<NewTopic<'_>> = self
            .config
            .topics
            .all()
            .into_iter()
            .map(|name| {
                NewTopic::new(
                    name,
                    self.config.topic_partitions,
                    TopicReplication::Fixed(self.config.replication_factor),
                )
            })
            .collect();

        let results = admin
            .create_topics(&topics, &AdminOptions::new())
            .await
            .map_err(|e| classify(&e))?;

        for result in results {
            match result {
                Ok(topic) => info!(topic = %topic, "Kafka topic created"),
                Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %topic, "Kafka topic already exists")
                }
                Err((topic, code)) => {
                    return Err(TransportError::rejected(format!(
                        "creating topic {} failed: {}",
                        topic, code
                    )))
                }
            }
        }
        Ok(())
    }

    fn consumer(&self, destination: &str) -> TransportResult<StreamConsumer> {
        let consumer: StreamConsumer = client_config(&self.config)
            .set("group.id", format!("{}.{}", self.config.group_id, destination))
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.config.auto_offset_reset)
            .set("session.timeout.ms", self.config.session_timeout_ms.to_string())
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| {
                TransportError::connection(format!("Kafka consumer creation failed: {}", e))
            })?;

        consumer
            .subscribe(&[destination])
            .map_err(|e| classify(&e))?;
        Ok(consumer)
    }
}

#[async_trait]
impl MessageTransport for KafkaTransport {
    fn system(&self) -> MessagingSystem {
        MessagingSystem::Kafka
    }

    async fn publish(
        &self,
        destination: &str,
        payload: Vec<u8>,
        headers: &MessageHeaders,
    ) -> TransportResult<()> {
        let started = Instant::now();
        let native_headers = to_kafka_headers(headers);

        let mut record: FutureRecord<'_, str, [u8]> = FutureRecord::to(destination)
            .payload(payload.as_slice())
            .headers(native_headers);
        if let Some(key) = headers.get(MESSAGE_KEY_HEADER) {
            record = record.key(key);
        }

        match self
            .producer
            .send(record, Duration::from_millis(self.config.message_timeout_ms))
            .await
        {
            Ok((partition, offset)) => {
                debug!(destination, partition, offset, "Kafka record published");
                record_publish(destination, "kafka", started.elapsed().as_secs_f64(), None);
                Ok(())
            }
            Err((e, _)) => {
                let err = classify(&e);
                error!(destination, error = %e, "Kafka publish failed");
                record_publish(destination, "kafka", 0.0, Some(err.kind.as_ref()));
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
        let (shutdown_tx, shutdown) = ShutdownSignal::channel();
        let mut workers = Vec::with_capacity(concurrency.max);

        for worker_id in 0..concurrency.max {
            let worker = KafkaWorker {
                worker_id,
                destination: destination.to_string(),
                consumer: self.consumer(destination)?,
                processor: self.processor.clone(),
                handler: handler.clone(),
                shutdown: shutdown.clone(),
                poll_timeout: Duration::from_millis(self.config.poll_timeout_ms),
            };
            workers.push(tokio::spawn(worker.run()));
        }

        info!(
            destination,
            consumers = concurrency.max,
            group_id = %format!("{}.{}", self.config.group_id, destination),
            "Kafka subscription started"
        );
        Ok(Subscription::new(destination, shutdown_tx, workers))
    }

    async fn is_connected(&self) -> bool {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, Duration::from_secs(2))
                .is_ok()
        })
        .await
        .unwrap_or(false)
    }

    async fn close(&self) -> TransportResult<()> {
        let producer = self.producer.clone();
        let timeout = Duration::from_millis(self.config.message_timeout_ms);
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| TransportError::connection(e.to_string()))?
            .map_err(|e| classify(&e))?;
        info!("Kafka transport closed");
        Ok(())
    }
}

/// Kafka keeps no delivery count, so a message re-read after an uncommitted
/// shutdown or rebalance starts again at attempt 1.
fn to_envelope(destination: &str, message: &BorrowedMessage<'_>) -> Envelope {
    let headers = message
        .headers()
        .map(|native| MessageHeaders::from_reader(&KafkaHeaderReader(native)))
        .unwrap_or_default();
    Envelope::new(
        destination,
        message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
    )
    .with_position(message.partition(), message.offset())
}

struct KafkaWorker {
    worker_id: usize,
    destination: String,
    consumer: StreamConsumer,
    processor: Arc<DeliveryProcessor>,
    handler: Arc<dyn MessageHandler>,
    shutdown: ShutdownSignal,
    poll_timeout: Duration,
}

impl KafkaWorker {
    async fn run(mut self) {
        let gauge = MESSAGING_METRICS
            .active_consumers
            .with_label_values(&[&self.destination, "kafka"]);
        gauge.inc();
        info!(destination = %self.destination, worker_id = self.worker_id, "Kafka consumer started");

        loop {
            let received = tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                received = tokio::time::timeout(self.poll_timeout, self.consumer.recv()) => received,
            };

            let envelope = match received {
                Err(_) => continue,
                Ok(Err(e)) => {
                    warn!(
                        destination = %self.destination,
                        worker_id = self.worker_id,
                        error = %e,
                        "Kafka receive failed"
                    );
                    None
                }
                Ok(Ok(message)) => Some(to_envelope(&self.destination, &message)),
            };
            let Some(envelope) = envelope else {
                if self.shutdown.sleep(self.poll_timeout).await {
                    break;
                }
                continue;
            };

            let partition = envelope.delivery.partition.unwrap_or_default();
            let offset = envelope.delivery.offset.unwrap_or_default();
            let disposition = self
                .processor
                .process(self.handler.as_ref(), envelope, &self.shutdown)
                .await;

            if disposition.acknowledges() {
                self.commit(partition, offset);
            } else {
                // Uncommitted; the group redelivers from this offset.
                break;
            }
        }

        gauge.dec();
        info!(destination = %self.destination, worker_id = self.worker_id, "Kafka consumer stopped");
    }

    fn commit(&self, partition: i32, offset: i64) {
        let mut positions = TopicPartitionList::new();
        let result = positions
            .add_partition_offset(&self.destination, partition, Offset::Offset(offset + 1))
            .and_then(|_| self.consumer.commit(&positions, CommitMode::Async));
        if let Err(e) = result {
            warn!(
                destination = %self.destination,
                partition,
                offset,
                error = %e,
                "Kafka offset commit failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::context::TraceContext;
    use crate::messaging::propagation::{Propagator, TRACEPARENT_HEADER};

    #[test]
    fn test_context_round_trip_through_kafka_headers() {
        let propagator = Propagator::new();
        let ctx = TraceContext::new_root();
        let mut native = OwnedHeaders::new();

        propagator.inject(&ctx, &mut KafkaHeaderWriter(&mut native));
        let extracted = propagator.extract(&KafkaHeaderReader(&native), TraceContext::new_root());

        assert!(extracted.same_span(&ctx));
    }

    #[test]
    fn test_last_duplicate_header_wins() {
        let native = OwnedHeaders::new()
            .insert(Header {
                key: "k",
                value: Some("first"),
            })
            .insert(Header {
                key: "k",
                value: Some("second"),
            });

        assert_eq!(KafkaHeaderReader(&native).get("k"), Some("second"));
    }

    #[test]
    fn test_set_leaves_single_entry() {
        let mut native = OwnedHeaders::new()
            .insert(Header {
                key: TRACEPARENT_HEADER,
                value: Some("old"),
            })
            .insert(Header {
                key: "other",
                value: Some("x"),
            });

        KafkaHeaderWriter(&mut native).set(TRACEPARENT_HEADER, "new".to_string());

        let reader = KafkaHeaderReader(&native);
        assert_eq!(native.count(), 2);
        assert_eq!(reader.get(TRACEPARENT_HEADER), Some("new"));
        assert_eq!(reader.get("other"), Some("x"));
    }

    #[test]
    fn test_non_utf8_value_reads_as_absent() {
        let native = OwnedHeaders::new().insert(Header {
            key: "bin",
            value: Some(&[0xff_u8, 0xfe][..]),
        });
        assert_eq!(KafkaHeaderReader(&native).get("bin"), None);
    }

    #[test]
    fn test_message_headers_convert_to_native() {
        let headers = MessageHeaders::new()
            .with(MESSAGE_KEY_HEADER, "T1")
            .with("content-type", "application/json");

        let native = to_kafka_headers(&headers);
        let back = MessageHeaders::from_reader(&KafkaHeaderReader(&native));
        assert_eq!(back, headers);
    }
}
