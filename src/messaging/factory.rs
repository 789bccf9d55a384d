use crate::messaging::amqp::AmqpTransport;
use crate::messaging::config::{MessagingConfig, MessagingSystem};
use crate::messaging::dead_letter::DeadLetterSink;
use crate::messaging::error::TransportResult;
use crate::messaging::kafka::KafkaTransport;
use crate::messaging::memory::InMemoryTransport;
use crate::messaging::nats::NatsQueueTransport;
use crate::messaging::retry::{DeliveryProcessor, RetryPolicy};
use crate::messaging::traits::MessageTransport;
use std::sync::Arc;

/// Create the transport selected by `config.system`
pub async fn create_transport(
    config: &MessagingConfig,
    dead_letters: Arc<dyn DeadLetterSink>,
) -> TransportResult<Arc<dyn MessageTransport>> {
    let processor = Arc::new(DeliveryProcessor::new(
        RetryPolicy::from_config(&config.retry),
        dead_letters,
    ));

    tracing::info!(
        system = %config.system,
        max_retries = config.retry.max_retries,
        backoff_ms = config.retry.backoff_ms,
        "Initializing messaging transport"
    );

    match config.system {
        MessagingSystem::Kafka => {
            let transport = KafkaTransport::new(config.kafka.clone(), processor).await?;
            Ok(Arc::new(transport))
        }
        MessagingSystem::Queue => {
            let transport = NatsQueueTransport::new(config.queue.clone(), processor).await?;
            Ok(Arc::new(transport))
        }
        MessagingSystem::Amqp => {
            let transport = AmqpTransport::new(config.amqp.clone(), processor).await?;
            Ok(Arc::new(transport))
        }
        MessagingSystem::InMemory => Ok(Arc::new(InMemoryTransport::new(
            &config.in_memory,
            processor,
        ))),
    }
}

/// Create an in-memory transport (for testing and development)
pub fn create_in_memory_transport(
    config: &MessagingConfig,
    dead_letters: Arc<dyn DeadLetterSink>,
) -> Arc<dyn MessageTransport> {
    let processor = Arc::new(DeliveryProcessor::new(
        RetryPolicy::from_config(&config.retry),
        dead_letters,
    ));
    Arc::new(InMemoryTransport::new(&config.in_memory, processor))
}
