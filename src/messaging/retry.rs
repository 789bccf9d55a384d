//! Retry policy and the per-delivery state machine shared by every backend
//!
//! A delivery moves `Delivered → Processing → Committed`, or on failure
//! through `Retrying → Processing` until it succeeds, hits a fatal failure
//! kind, or runs out of attempts and is `DeadLettered`. Retries are
//! in-process redeliveries of the same envelope, so the backend only
//! acknowledges once a terminal state is reached.

use crate::messaging::config::RetryConfig;
use crate::messaging::dead_letter::{DeadLetter, DeadLetterReason, DeadLetterSink};
use crate::messaging::envelope::Envelope;
use crate::messaging::error::{FailureKind, HandlerError};
use crate::messaging::metrics::MESSAGING_METRICS;
use crate::messaging::traits::{MessageHandler, ShutdownSignal};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum::{AsRefStr, Display};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Delivery lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryState {
    Delivered,
    Processing,
    Retrying,
    Committed,
    DeadLettered,
}

/// Terminal result of processing one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Handler succeeded; acknowledge
    Committed { attempts: u32 },
    /// Policy gave up; acknowledge without redelivery
    DeadLettered {
        attempts: u32,
        reason: DeadLetterReason,
        kind: FailureKind,
    },
    /// Shutdown interrupted a backoff; leave unacknowledged for the broker
    Abandoned { attempts: u32 },
}

impl Disposition {
    /// Whether the backend should acknowledge/commit the message
    pub fn acknowledges(&self) -> bool {
        !matches!(self, Disposition::Abandoned { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Disposition::Committed { attempts }
            | Disposition::DeadLettered { attempts, .. }
            | Disposition::Abandoned { attempts } => *attempts,
        }
    }
}

/// Decision for one failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { after: Duration },
    DeadLetter(DeadLetterReason),
}

/// Bounded fixed-interval retry with an explicit fatal set
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Duration,
    fatal: HashSet<FailureKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.backoff_ms),
            fatal: config.fatal.iter().copied().collect(),
        }
    }

    /// Fixed backoff with the default fatal set
    pub fn fixed(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
            ..Self::default()
        }
    }

    pub fn with_fatal(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.fatal = kinds.into_iter().collect();
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Deliveries allowed per message, first attempt included
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn is_fatal(&self, kind: FailureKind) -> bool {
        self.fatal.contains(&kind)
    }

    /// Decide what to do after `attempt` (1-based) failed with `error`
    pub fn decide(&self, error: &HandlerError, attempt: u32) -> RetryDecision {
        if self.is_fatal(error.kind) {
            RetryDecision::DeadLetter(DeadLetterReason::Fatal)
        } else if attempt >= self.max_attempts() {
            RetryDecision::DeadLetter(DeadLetterReason::RetriesExhausted)
        } else {
            RetryDecision::Retry {
                after: self.backoff,
            }
        }
    }
}

/// Runs one delivery through the handler under a [`RetryPolicy`]
pub struct DeliveryProcessor {
    policy: RetryPolicy,
    dead_letters: Arc<dyn DeadLetterSink>,
}

impl DeliveryProcessor {
    pub fn new(policy: RetryPolicy, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            policy,
            dead_letters,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Process `envelope` until it reaches a terminal disposition.
    ///
    /// A shutdown request during backoff abandons the delivery so the
    /// broker redelivers it to the next consumer.
    pub async fn process(
        &self,
        handler: &dyn MessageHandler,
        envelope: Envelope,
        shutdown: &ShutdownSignal,
    ) -> Disposition {
        let started = Instant::now();
        let destination = envelope.destination().to_string();
        let mut current = envelope;
        debug!(destination = %destination, state = %DeliveryState::Delivered, "Delivery received");

        loop {
            let attempt = current.delivery.attempt;
            debug!(destination = %destination, attempt, state = %DeliveryState::Processing, "Delivery processing");

            MESSAGING_METRICS
                .messages_consumed
                .with_label_values(&[&destination])
                .inc();

            let error = match handler.handle(&current).await {
                Ok(()) => {
                    debug!(destination = %destination, attempt, state = %DeliveryState::Committed, "Delivery committed");
                    self.observe(&destination, "committed", started);
                    return Disposition::Committed { attempts: attempt };
                }
                Err(e) => e,
            };

            MESSAGING_METRICS
                .handler_failures
                .with_label_values(&[&destination, error.kind.as_ref()])
                .inc();

            match self.policy.decide(&error, attempt) {
                RetryDecision::Retry { after } => {
                    warn!(
                        destination = %destination,
                        attempt,
                        max_attempts = self.policy.max_attempts(),
                        error_kind = %error.kind,
                        error = %error.message,
                        state = %DeliveryState::Retrying,
                        "Delivery failed, retrying after backoff"
                    );
                    MESSAGING_METRICS
                        .retries
                        .with_label_values(&[&destination])
                        .inc();

                    let mut shutdown = shutdown.clone();
                    tokio::select! {
                        _ = sleep(after) => {}
                        _ = shutdown.wait() => {
                            info!(
                                destination = %destination,
                                attempt,
                                "Shutdown during backoff, leaving delivery for redelivery"
                            );
                            self.observe(&destination, "abandoned", started);
                            return Disposition::Abandoned { attempts: attempt };
                        }
                    }
                    current = current.redelivery();
                }
                RetryDecision::DeadLetter(reason) => {
                    debug!(destination = %destination, attempt, state = %DeliveryState::DeadLettered, "Delivery terminal");
                    self.dead_letters
                        .record(DeadLetter::new(&current, reason, &error));
                    self.observe(&destination, "dead_lettered", started);
                    return Disposition::DeadLettered {
                        attempts: attempt,
                        reason,
                        kind: error.kind,
                    };
                }
            }
        }
    }

    fn observe(&self, destination: &str, outcome: &str, started: Instant) {
        MESSAGING_METRICS
            .delivery_duration
            .with_label_values(&[destination, outcome])
            .observe(started.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::carrier::MessageHeaders;
    use crate::messaging::dead_letter::InMemoryDeadLetterSink;
    use crate::messaging::error::HandlerResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` attempts with `kind`
    struct Flaky {
        failures: u32,
        kind: FailureKind,
        calls: AtomicU32,
        seen_attempts: parking_lot::Mutex<Vec<(u32, bool)>>,
    }

    impl Flaky {
        fn new(failures: u32, kind: FailureKind) -> Self {
            Self {
                failures,
                kind,
                calls: AtomicU32::new(0),
                seen_attempts: parking_lot::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MessageHandler for Flaky {
        async fn handle(&self, envelope: &Envelope) -> HandlerResult {
            self.seen_attempts
                .lock()
                .push((envelope.delivery.attempt, envelope.delivery.redelivered));
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(HandlerError::new(self.kind, "induced"))
            } else {
                Ok(())
            }
        }
    }

    fn processor(policy: RetryPolicy) -> (DeliveryProcessor, Arc<InMemoryDeadLetterSink>) {
        let sink = Arc::new(InMemoryDeadLetterSink::new(10));
        (DeliveryProcessor::new(policy, sink.clone()), sink)
    }

    fn envelope() -> Envelope {
        Envelope::new("billing-events", b"{}".to_vec(), MessageHeaders::new())
    }

    #[test]
    fn test_default_policy_decisions() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(
            policy.decide(&HandlerError::deserialization("x"), 1),
            RetryDecision::DeadLetter(DeadLetterReason::Fatal)
        );
        assert_eq!(
            policy.decide(&HandlerError::simulated("x"), 1),
            RetryDecision::Retry {
                after: Duration::from_secs(5)
            }
        );
        assert_eq!(
            policy.decide(&HandlerError::simulated("x"), 4),
            RetryDecision::DeadLetter(DeadLetterReason::RetriesExhausted)
        );
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let (processor, sink) = processor(RetryPolicy::fixed(3, Duration::from_millis(1)));
        let handler = Flaky::new(2, FailureKind::SimulatedProcessing);
        let (_tx, shutdown) = ShutdownSignal::channel();

        let disposition = processor.process(&handler, envelope(), &shutdown).await;

        assert_eq!(disposition, Disposition::Committed { attempts: 3 });
        assert_eq!(
            *handler.seen_attempts.lock(),
            vec![(1, false), (2, true), (3, true)]
        );
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_retries_exhausted_dead_letters() {
        let (processor, sink) = processor(RetryPolicy::fixed(3, Duration::from_millis(1)));
        let handler = Flaky::new(u32::MAX, FailureKind::ConnectionFailure);
        let (_tx, shutdown) = ShutdownSignal::channel();

        let disposition = processor.process(&handler, envelope(), &shutdown).await;

        assert_eq!(
            disposition,
            Disposition::DeadLettered {
                attempts: 4,
                reason: DeadLetterReason::RetriesExhausted,
                kind: FailureKind::ConnectionFailure,
            }
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
        assert_eq!(sink.len(), 1);
        assert!(disposition.acknowledges());
    }

    #[tokio::test]
    async fn test_fatal_failure_short_circuits() {
        let (processor, sink) = processor(RetryPolicy::fixed(3, Duration::from_millis(1)));
        let handler = Flaky::new(u32::MAX, FailureKind::StoreWrite);
        let (_tx, shutdown) = ShutdownSignal::channel();

        let disposition = processor.process(&handler, envelope(), &shutdown).await;

        assert_eq!(disposition.attempts(), 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.entries()[0].reason, DeadLetterReason::Fatal);
    }

    #[tokio::test]
    async fn test_empty_fatal_set_retries_everything() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(1)).with_fatal(Vec::new());
        let (processor, _sink) = processor(policy);
        let handler = Flaky::new(1, FailureKind::Deserialization);
        let (_tx, shutdown) = ShutdownSignal::channel();

        let disposition = processor.process(&handler, envelope(), &shutdown).await;
        assert_eq!(disposition, Disposition::Committed { attempts: 2 });
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff_abandons() {
        let (processor, sink) = processor(RetryPolicy::fixed(3, Duration::from_secs(60)));
        let handler = Flaky::new(u32::MAX, FailureKind::SimulatedProcessing);
        let (tx, shutdown) = ShutdownSignal::channel();

        let stopper = tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            tx.send(true).unwrap();
            tx
        });

        let disposition = processor.process(&handler, envelope(), &shutdown).await;
        let _tx = stopper.await.unwrap();

        assert_eq!(disposition, Disposition::Abandoned { attempts: 1 });
        assert!(!disposition.acknowledges());
        assert!(sink.is_empty());
    }
}
