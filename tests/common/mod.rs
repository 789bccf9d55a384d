//! Shared helpers for pipeline integration tests

#![allow(dead_code)]

use billing_pipeline::config::Config;
use billing_pipeline::messaging::{
    create_in_memory_transport, FailureKind, InMemoryDeadLetterSink, MessageTransport,
    MessagingSystem,
};
use billing_pipeline::models::BillingRequest;
use billing_pipeline::pipeline::PipelineRuntime;
use billing_pipeline::state::{create_in_memory_stores, StoreSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// In-memory configuration with fast retries
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.messaging.system = MessagingSystem::InMemory;
    config.messaging.retry.backoff_ms = 10;
    config
}

/// Same as [`test_config`] with every failure kind retryable
pub fn retry_everything_config() -> Config {
    let mut config = test_config();
    config.messaging.retry.fatal = Vec::<FailureKind>::new();
    config
}

pub struct TestPipeline {
    pub runtime: PipelineRuntime,
    pub transport: Arc<dyn MessageTransport>,
    pub dead_letters: Arc<InMemoryDeadLetterSink>,
}

pub async fn start_pipeline(config: &Config, stores: StoreSet) -> TestPipeline {
    let dead_letters = Arc::new(InMemoryDeadLetterSink::new(16));
    let transport = create_in_memory_transport(&config.messaging, dead_letters.clone());
    let runtime = PipelineRuntime::start(config, transport.clone(), stores)
        .await
        .expect("pipeline starts");

    TestPipeline {
        runtime,
        transport,
        dead_letters,
    }
}

pub async fn start_default_pipeline() -> TestPipeline {
    start_pipeline(&test_config(), create_in_memory_stores()).await
}

pub fn billing_request(amount: f64, currency: &str) -> BillingRequest {
    BillingRequest {
        customer_id: "customer-1".to_string(),
        product_id: "product-1".to_string(),
        amount,
        currency: currency.to_string(),
    }
}

/// Poll `check` until it yields a value or five seconds pass
pub async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met within 5s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
