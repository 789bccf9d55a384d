//! Queue transport on NATS JetStream
//!
//! Each destination is a subject backed by its own stream. Subscriptions
//! use a durable pull consumer with explicit acks: a committed delivery is
//! acked, a dead-lettered one is terminated, and an abandoned one is nak'd
//! for redelivery. Workers scale between the configured bounds: a new one
//! starts while every running worker is busy, and surplus workers retire
//! after a run of empty receives.

use crate::messaging::carrier::{CarrierReader, CarrierWriter, MessageHeaders};
use crate::messaging::config::{MessagingSystem, QueueConfig};
use crate::messaging::envelope::Envelope;
use crate::messaging::error::{TransportError, TransportResult};
use crate::messaging::metrics::{record_publish, MESSAGING_METRICS};
use crate::messaging::retry::{DeliveryProcessor, Disposition, RetryPolicy};
use crate::messaging::traits::{
    Concurrency, MessageHandler, MessageTransport, ShutdownSignal, Subscription,
};
use async_nats::connection::State;
use async_nats::jetstream::consumer::pull::Config as PullConsumerConfig;
use async_nats::jetstream::consumer::{AckPolicy, DeliverPolicy, PullConsumer};
use async_nats::jetstream::stream::Config as StreamConfig;
use async_nats::jetstream::{self, AckKind};
use async_nats::{Client, ConnectOptions, HeaderMap};
use async_trait::async_trait;
use dashmap::DashSet;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Read view over NATS message headers
pub struct NatsHeaderReader<'a>(pub &'a HeaderMap);

impl CarrierReader for NatsHeaderReader<'_> {
    fn keys(&self) -> Vec<&str> {
        self.0
            .iter()
            .map(|(name, _)| {
                let name: &str = name.as_ref();
                name
            })
            .collect()
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|value| value.as_str())
    }
}

/// Write view over NATS message headers; `insert` replaces existing values
pub struct NatsHeaderWriter<'a>(pub &'a mut HeaderMap);

impl CarrierWriter for NatsHeaderWriter<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key, value.as_str());
    }
}

/// Native headers for an outgoing message
pub fn to_nats_headers(headers: &MessageHeaders) -> HeaderMap {
    let mut native = HeaderMap::new();
    headers.write_to(&mut NatsHeaderWriter(&mut native));
    native
}

/// Stream and durable names may not contain `.`, `*`, `>` or whitespace
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// The ack wait must outlast every backoff a delivery can sit through,
/// or JetStream redelivers it to another worker mid-retry.
fn check_ack_wait(config: &QueueConfig, policy: &RetryPolicy) -> TransportResult<()> {
    let retry_window = policy.backoff().saturating_mul(policy.max_retries());
    let ack_wait = Duration::from_millis(config.ack_wait_ms);
    if ack_wait <= retry_window {
        return Err(TransportError::invalid_config(format!(
            "ack_wait_ms {} must exceed max_retries * backoff ({} ms)",
            config.ack_wait_ms,
            retry_window.as_millis()
        )));
    }
    Ok(())
}

/// JetStream-backed [`MessageTransport`]
pub struct NatsQueueTransport {
    client: Client,
    jetstream: jetstream::Context,
    config: QueueConfig,
    processor: Arc<DeliveryProcessor>,
    streams: DashSet<String>,
}

impl NatsQueueTransport {
    /// Connect and declare the streams backing the configured queues
    pub async fn new(config: QueueConfig, processor: Arc<DeliveryProcessor>) -> TransportResult<Self> {
        check_ack_wait(&config, processor.policy())?;

        let options = match (&config.username, &config.password) {
            (Some(user), Some(password)) => {
                ConnectOptions::with_user_and_password(user.clone(), password.clone())
            }
            _ => ConnectOptions::new(),
        }
        .name(&config.connection_name);

        let servers = config.servers.join(",");
        let client = options.connect(servers.as_str()).await.map_err(|e| {
            TransportError::connection(format!("NATS connection failed: {}", e))
        })?;
        let jetstream = jetstream::new(client.clone());

        let transport = Self {
            client,
            jetstream,
            config,
            processor,
            streams: DashSet::new(),
        };

        for queue in transport.config.queues.all() {
            transport.ensure_stream(queue).await?;
        }

        info!(servers = %servers, "NATS queue transport ready");
        Ok(transport)
    }

    async fn ensure_stream(&self, subject: &str) -> TransportResult<jetstream::stream::Stream> {
        let name = sanitize(subject).to_uppercase();
        let stream = self
            .jetstream
            .get_or_create_stream(StreamConfig {
                name: name.clone(),
                subjects: vec![subject.to_string()],
                ..Default::default()
            })
            .await
            .map_err(|e| TransportError::rejected(format!("stream {} unavailable: {}", name, e)))?;

        if self.streams.insert(subject.to_string()) {
            debug!(stream = %name, subject, "JetStream stream declared");
        }
        Ok(stream)
    }

    async fn consumer(&self, destination: &str) -> TransportResult<PullConsumer> {
        let stream = self.ensure_stream(destination).await?;
        let durable = format!(
            "{}-{}",
            sanitize(&self.config.durable_prefix),
            sanitize(destination)
        );

        stream
            .get_or_create_consumer(
                &durable,
                PullConsumerConfig {
                    durable_name: Some(durable.clone()),
                    deliver_policy: DeliverPolicy::All,
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: Duration::from_millis(self.config.ack_wait_ms),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                TransportError::rejected(format!("consumer {} unavailable: {}", durable, e))
            })
    }
}

#[async_trait]
impl MessageTransport for NatsQueueTransport {
    fn system(&self) -> MessagingSystem {
        MessagingSystem::Queue
    }

    async fn publish(
        &self,
        destination: &str,
        payload: Vec<u8>,
        headers: &MessageHeaders,
    ) -> TransportResult<()> {
        let started = Instant::now();
        if !self.streams.contains(destination) {
            self.ensure_stream(destination).await?;
        }

        let result = async {
            let ack = self
                .jetstream
                .publish_with_headers(destination.to_string(), to_nats_headers(headers), payload.into())
                .await
                .map_err(|e| TransportError::connection(format!("NATS publish failed: {}", e)))?;
            ack.await
                .map_err(|e| TransportError::rejected(format!("NATS publish not acknowledged: {}", e)))
        }
        .await;

        match result {
            Ok(ack) => {
                debug!(destination, sequence = ack.sequence, "Queue message published");
                record_publish(destination, "queue", started.elapsed().as_secs_f64(), None);
                Ok(())
            }
            Err(err) => {
                error!(destination, error = %err, "Queue publish failed");
                record_publish(destination, "queue", 0.0, Some(err.kind.as_ref()));
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
        let consumer = self.consumer(destination).await?;
        let (shutdown_tx, shutdown) = ShutdownSignal::channel();

        let pool = Arc::new(WorkerPool {
            destination: destination.to_string(),
            consumer,
            processor: self.processor.clone(),
            handler,
            shutdown,
            busy: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            receive_timeout: Duration::from_millis(self.config.receive_timeout_ms),
            idle_limit: self.config.idle_receives_before_retire.max(1),
        });

        let supervisor = tokio::spawn(pool.supervise(concurrency));
        info!(
            destination,
            min_workers = concurrency.min,
            max_workers = concurrency.max,
            "Queue subscription started"
        );
        Ok(Subscription::new(destination, shutdown_tx, vec![supervisor]))
    }

    async fn is_connected(&self) -> bool {
        matches!(self.client.connection_state(), State::Connected)
    }

    async fn close(&self) -> TransportResult<()> {
        self.client
            .flush()
            .await
            .map_err(|e| TransportError::connection(format!("NATS flush failed: {}", e)))?;
        info!("NATS queue transport closed");
        Ok(())
    }
}

struct WorkerPool {
    destination: String,
    consumer: PullConsumer,
    processor: Arc<DeliveryProcessor>,
    handler: Arc<dyn MessageHandler>,
    shutdown: ShutdownSignal,
    busy: AtomicUsize,
    active: AtomicUsize,
    receive_timeout: Duration,
    idle_limit: u32,
}

impl WorkerPool {
    async fn supervise(self: Arc<Self>, concurrency: Concurrency) {
        let mut workers = JoinSet::new();
        let mut next_id = 0usize;
        for _ in 0..concurrency.min {
            self.active.fetch_add(1, Ordering::SeqCst);
            workers.spawn(self.clone().run_worker(next_id, false));
            next_id += 1;
        }

        let mut shutdown = self.shutdown.clone();
        let mut ticker =
            tokio::time::interval((self.receive_timeout / 3).max(Duration::from_millis(100)));
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    let active = self.active.load(Ordering::SeqCst);
                    let busy = self.busy.load(Ordering::SeqCst);
                    if busy >= active && active < concurrency.max {
                        self.active.fetch_add(1, Ordering::SeqCst);
                        workers.spawn(self.clone().run_worker(next_id, true));
                        info!(
                            destination = %self.destination,
                            worker_id = next_id,
                            active = active + 1,
                            "All queue workers busy, scaling up"
                        );
                        next_id += 1;
                    }
                }
                Some(joined) = workers.join_next() => {
                    if let Err(e) = joined {
                        warn!(destination = %self.destination, error = %e, "Queue worker panicked");
                    }
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(destination = %self.destination, error = %e, "Queue worker panicked");
            }
        }
    }

    async fn run_worker(self: Arc<Self>, worker_id: usize, elastic: bool) {
        let gauge = MESSAGING_METRICS
            .active_consumers
            .with_label_values(&[&self.destination, "queue"]);
        gauge.inc();

        match self.consume(worker_id, elastic).await {
            Ok(()) => debug!(destination = %self.destination, worker_id, "Queue worker stopped"),
            Err(e) => error!(destination = %self.destination, worker_id, error = %e, "Queue worker failed"),
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        gauge.dec();
    }

    async fn consume(&self, worker_id: usize, elastic: bool) -> TransportResult<()> {
        let mut messages = self
            .consumer
            .messages()
            .await
            .map_err(|e| TransportError::connection(format!("pull subscription failed: {}", e)))?;
        let mut shutdown = self.shutdown.clone();
        let mut idle = 0u32;
        debug!(destination = %self.destination, worker_id, elastic, "Queue worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.wait() => return Ok(()),
                next = tokio::time::timeout(self.receive_timeout, messages.next()) => next,
            };

            let message = match next {
                Err(_) => {
                    idle += 1;
                    if elastic && idle >= self.idle_limit {
                        info!(destination = %self.destination, worker_id, "Idle queue worker retiring");
                        return Ok(());
                    }
                    continue;
                }
                Ok(None) => return Err(TransportError::connection("message stream ended")),
                Ok(Some(Err(e))) => {
                    warn!(destination = %self.destination, worker_id, error = %e, "Queue receive failed");
                    continue;
                }
                Ok(Some(Ok(message))) => message,
            };
            idle = 0;

            self.busy.fetch_add(1, Ordering::SeqCst);
            let attempt = message
                .info()
                .map(|info| info.delivered.max(1) as u32)
                .unwrap_or(1);
            let headers = message
                .headers
                .as_ref()
                .map(|native| MessageHeaders::from_reader(&NatsHeaderReader(native)))
                .unwrap_or_default();
            let envelope = Envelope::new(&self.destination, message.payload.to_vec(), headers)
                .with_attempt(attempt);

            let disposition = self
                .processor
                .process(self.handler.as_ref(), envelope, &self.shutdown)
                .await;

            let acked = match disposition {
                Disposition::Committed { .. } => message.ack().await,
                Disposition::DeadLettered { .. } => message.ack_with(AckKind::Term).await,
                Disposition::Abandoned { .. } => message.ack_with(AckKind::Nak(None)).await,
            };
            if let Err(e) = acked {
                warn!(destination = %self.destination, worker_id, error = %e, "Queue acknowledgement failed");
            }
            self.busy.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
