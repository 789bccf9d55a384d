//! Messaging trait abstractions

use crate::messaging::carrier::MessageHeaders;
use crate::messaging::config::MessagingSystem;
use crate::messaging::envelope::{
    Envelope, TypedMessage, CONTENT_TYPE_HEADER, JSON_CONTENT_TYPE, MESSAGE_KEY_HEADER,
    MESSAGE_TYPE_HEADER,
};
use crate::messaging::error::{HandlerResult, TransportResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Consumer-side callback invoked once per delivery
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one delivery. `Ok` commits it; `Err` goes to the retry policy.
    async fn handle(&self, envelope: &Envelope) -> HandlerResult;

    /// Whether acknowledgement waits for the handler outcome.
    ///
    /// Non-transactional handlers may be acknowledged on receipt by
    /// backends that support it.
    fn transactional(&self) -> bool {
        true
    }
}

/// Adapter turning an async closure into a [`MessageHandler`]
pub struct FnHandler<F>(F);

/// Wrap a closure taking an owned envelope
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, envelope: &Envelope) -> HandlerResult {
        (self.0)(envelope.clone()).await
    }
}

/// Consumer worker bounds for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concurrency {
    pub min: usize,
    pub max: usize,
}

impl Concurrency {
    pub fn fixed(workers: usize) -> Self {
        Self::range(workers, workers)
    }

    /// `min` is raised to 1 and `max` to at least `min`
    pub fn range(min: usize, max: usize) -> Self {
        let min = min.max(1);
        Self {
            min,
            max: max.max(min),
        }
    }

    pub fn is_elastic(&self) -> bool {
        self.max > self.min
    }
}

impl Default for Concurrency {
    fn default() -> Self {
        Self::fixed(3)
    }
}

/// Broker-agnostic publish/subscribe interface.
///
/// The backend is chosen once at startup; stage code only ever sees this
/// trait.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Backend behind this transport
    fn system(&self) -> MessagingSystem;

    /// Publish a payload with headers to a named destination
    async fn publish(
        &self,
        destination: &str,
        payload: Vec<u8>,
        headers: &MessageHeaders,
    ) -> TransportResult<()>;

    /// Attach a handler to a destination with the given worker bounds
    async fn subscribe(
        &self,
        destination: &str,
        concurrency: Concurrency,
        handler: Arc<dyn MessageHandler>,
    ) -> TransportResult<Subscription>;

    /// Check if the broker connection is usable
    async fn is_connected(&self) -> bool;

    /// Close the broker connection
    async fn close(&self) -> TransportResult<()>;
}

/// Typed publishing on top of [`MessageTransport`]
#[async_trait]
pub trait MessageTransportExt: MessageTransport {
    /// Serialize `message` as JSON and publish it with type and key headers
    async fn publish_json<M: TypedMessage>(
        &self,
        destination: &str,
        message: &M,
        mut headers: MessageHeaders,
    ) -> TransportResult<()> {
        let payload = serde_json::to_vec(message)?;
        headers.insert(MESSAGE_TYPE_HEADER, M::MESSAGE_TYPE);
        headers.insert(CONTENT_TYPE_HEADER, JSON_CONTENT_TYPE);
        if headers.get(MESSAGE_KEY_HEADER).is_none() {
            headers.insert(MESSAGE_KEY_HEADER, message.message_key());
        }
        self.publish(destination, payload, &headers).await
    }
}

impl<T: MessageTransport + ?Sized> MessageTransportExt for T {}

/// Shutdown flag shared by a subscription's workers
#[derive(Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    pub fn channel() -> (watch::Sender<bool>, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (tx, ShutdownSignal(rx))
    }

    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once shutdown is requested or the owner is dropped
    pub async fn wait(&mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `duration` unless shutdown comes first; true when it did
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.wait() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}

/// Handle to an active subscription
pub struct Subscription {
    destination: String,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(
        destination: impl Into<String>,
        shutdown: watch::Sender<bool>,
        workers: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            destination: destination.into(),
            shutdown,
            workers,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Number of top-level worker tasks
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop receiving new deliveries and wait for in-flight work to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(
                    destination = %self.destination,
                    error = %e,
                    "Consumer worker ended abnormally"
                );
            }
        }
        info!(destination = %self.destination, "Subscription stopped");
    }
}
