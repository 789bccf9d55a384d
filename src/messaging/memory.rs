//! In-process partitioned transport
//!
//! Each destination is split into a fixed number of partitions, each an
//! unbounded ordered channel. Publishing picks the partition by hashing the
//! message key, so messages sharing a key keep their order. A subscription
//! assigns every partition to exactly one worker. A delivery abandoned at
//! shutdown is parked on its partition and handed out first to the next
//! subscription, keeping its attempt count.

use crate::messaging::carrier::MessageHeaders;
use crate::messaging::config::{InMemoryConfig, MessagingSystem};
use crate::messaging::envelope::{Envelope, MESSAGE_KEY_HEADER};
use crate::messaging::error::{TransportError, TransportResult};
use crate::messaging::metrics::{record_publish, MESSAGING_METRICS};
use crate::messaging::retry::{DeliveryProcessor, Disposition};
use crate::messaging::traits::{
    Concurrency, MessageHandler, MessageTransport, ShutdownSignal, Subscription,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::future::poll_fn;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Clone)]
struct StoredMessage {
    partition: usize,
    offset: i64,
    attempt: u32,
    payload: Vec<u8>,
    headers: MessageHeaders,
}

impl StoredMessage {
    fn envelope(&self, destination: &str) -> Envelope {
        Envelope::new(destination, self.payload.clone(), self.headers.clone())
            .with_position(self.partition as i32, self.offset)
            .with_attempt(self.attempt)
    }
}

struct Partition {
    sender: mpsc::UnboundedSender<StoredMessage>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<StoredMessage>>>,
    /// Abandoned delivery, served before the channel
    parked: Mutex<Option<StoredMessage>>,
    next_offset: AtomicI64,
}

impl Partition {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            parked: Mutex::new(None),
            next_offset: AtomicI64::new(0),
        }
    }
}

struct Topic {
    partitions: Vec<Partition>,
    round_robin: AtomicUsize,
}

impl Topic {
    fn new(partitions: usize) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| Partition::new()).collect(),
            round_robin: AtomicUsize::new(0),
        }
    }

    fn partition_for(&self, key: Option<&str>) -> usize {
        let count = self.partitions.len();
        match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % count as u64) as usize
            }
            None => self.round_robin.fetch_add(1, Ordering::Relaxed) % count,
        }
    }
}

/// In-memory [`MessageTransport`]
pub struct InMemoryTransport {
    topics: DashMap<String, Arc<Topic>>,
    partitions: usize,
    processor: Arc<DeliveryProcessor>,
    open: AtomicBool,
}

impl InMemoryTransport {
    pub fn new(config: &InMemoryConfig, processor: Arc<DeliveryProcessor>) -> Self {
        info!(partitions = config.partitions, "In-memory transport ready");
        Self {
            topics: DashMap::new(),
            partitions: config.partitions.max(1),
            processor,
            open: AtomicBool::new(true),
        }
    }

    fn topic(&self, destination: &str) -> Arc<Topic> {
        self.topics
            .entry(destination.to_string())
            .or_insert_with(|| Arc::new(Topic::new(self.partitions)))
            .clone()
    }

    /// Messages published but not yet received, across all partitions
    pub fn pending(&self, destination: &str) -> usize {
        self.topics
            .get(destination)
            .map(|topic| {
                topic
                    .partitions
                    .iter()
                    .map(|p| {
                        let queued = p.receiver.lock().as_ref().map(|rx| rx.len()).unwrap_or(0);
                        queued + usize::from(p.parked.lock().is_some())
                    })
                    .sum()
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageTransport for InMemoryTransport {
    fn system(&self) -> MessagingSystem {
        MessagingSystem::InMemory
    }

    async fn publish(
        &self,
        destination: &str,
        payload: Vec<u8>,
        headers: &MessageHeaders,
    ) -> TransportResult<()> {
        let started = Instant::now();
        if !self.open.load(Ordering::SeqCst) {
            let err = TransportError::connection("in-memory transport is closed");
            record_publish(destination, "in_memory", 0.0, Some(err.kind.as_ref()));
            return Err(err);
        }

        let topic = self.topic(destination);
        let partition = topic.partition_for(headers.get(MESSAGE_KEY_HEADER));
        let slot = &topic.partitions[partition];
        let offset = slot.next_offset.fetch_add(1, Ordering::SeqCst);

        slot.sender
            .send(StoredMessage {
                partition,
                offset,
                attempt: 1,
                payload,
                headers: headers.clone(),
            })
            .map_err(|_| TransportError::rejected("partition channel closed"))?;

        debug!(destination, partition, offset, "Message published");
        record_publish(
            destination,
            "in_memory",
            started.elapsed().as_secs_f64(),
            None,
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        destination: &str,
        concurrency: Concurrency,
        handler: Arc<dyn MessageHandler>,
    ) -> TransportResult<Subscription> {
        let topic = self.topic(destination);
        let partition_count = topic.partitions.len();

        let mut receivers = Vec::with_capacity(partition_count);
        for (index, partition) in topic.partitions.iter().enumerate() {
            match partition.receiver.lock().take() {
                Some(rx) => receivers.push((index, rx)),
                None => {
                    // Hand back what was already taken before failing.
                    for (i, rx) in receivers {
                        *topic.partitions[i].receiver.lock() = Some(rx);
                    }
                    return Err(TransportError::rejected(format!(
                        "destination {destination} already has an active subscription"
                    )));
                }
            }
        }

        let worker_count = concurrency.max.min(partition_count).max(1);
        let mut assignments: Vec<Vec<(usize, mpsc::UnboundedReceiver<StoredMessage>)>> =
            (0..worker_count).map(|_| Vec::new()).collect();
        for (index, rx) in receivers {
            assignments[index % worker_count].push((index, rx));
        }

        let (shutdown_tx, shutdown) = ShutdownSignal::channel();
        let workers = assignments
            .into_iter()
            .enumerate()
            .map(|(worker_id, assigned)| {
                let worker = PartitionWorker {
                    worker_id,
                    destination: destination.to_string(),
                    topic: topic.clone(),
                    processor: self.processor.clone(),
                    handler: handler.clone(),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(worker.run(assigned))
            })
            .collect();

        info!(
            destination,
            workers = worker_count,
            partitions = partition_count,
            "In-memory subscription started"
        );
        Ok(Subscription::new(destination, shutdown_tx, workers))
    }

    async fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> TransportResult<()> {
        self.open.store(false, Ordering::SeqCst);
        info!("In-memory transport closed");
        Ok(())
    }
}

struct PartitionWorker {
    worker_id: usize,
    destination: String,
    topic: Arc<Topic>,
    processor: Arc<DeliveryProcessor>,
    handler: Arc<dyn MessageHandler>,
    shutdown: ShutdownSignal,
}

impl PartitionWorker {
    async fn run(mut self, mut assigned: Vec<(usize, mpsc::UnboundedReceiver<StoredMessage>)>) {
        let gauge = MESSAGING_METRICS
            .active_consumers
            .with_label_values(&[&self.destination, "in_memory"]);
        gauge.inc();
        info!(
            destination = %self.destination,
            worker_id = self.worker_id,
            partitions = ?assigned.iter().map(|(p, _)| *p).collect::<Vec<_>>(),
            "Consumer worker started"
        );

        let mut cursor = 0usize;
        loop {
            if self.shutdown.is_shutdown() {
                break;
            }
            if let Some(parked) = self.take_parked(&assigned) {
                self.deliver(parked).await;
                continue;
            }

            let next = poll_fn(|cx| {
                let count = assigned.len();
                for step in 0..count {
                    let slot = (cursor + step) % count;
                    if let Poll::Ready(Some(message)) = assigned[slot].1.poll_recv(cx) {
                        cursor = slot + 1;
                        return Poll::Ready(message);
                    }
                }
                Poll::Pending
            });

            let message = tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                message = next => message,
            };

            self.deliver(message).await;
        }

        // Return the receivers so the destination can be subscribed again.
        for (index, rx) in assigned {
            *self.topic.partitions[index].receiver.lock() = Some(rx);
        }

        gauge.dec();
        info!(
            destination = %self.destination,
            worker_id = self.worker_id,
            "Consumer worker stopped"
        );
    }

    fn take_parked(
        &self,
        assigned: &[(usize, mpsc::UnboundedReceiver<StoredMessage>)],
    ) -> Option<StoredMessage> {
        assigned
            .iter()
            .find_map(|(index, _)| self.topic.partitions[*index].parked.lock().take())
    }

    async fn deliver(&self, message: StoredMessage) {
        let envelope = message.envelope(&self.destination);
        let disposition = self
            .processor
            .process(self.handler.as_ref(), envelope, &self.shutdown)
            .await;

        if let Disposition::Abandoned { attempts } = disposition {
            debug!(
                destination = %self.destination,
                partition = message.partition,
                offset = message.offset,
                attempts,
                "Parking abandoned delivery"
            );
            let partition = message.partition;
            *self.topic.partitions[partition].parked.lock() = Some(StoredMessage {
                attempt: attempts + 1,
                ..message
            });
        }
    }
}
