//! Shared consumer-side plumbing for pipeline stages

use crate::config::StageKind;
use crate::messaging::{
    with_context, Envelope, HandlerError, HandlerResult, MessageHandler, Propagator, TraceContext,
    TypedMessage,
};
use crate::models::PipelineMessage;
use crate::pipeline::fault::FaultInjector;
use crate::pipeline::metrics::STAGE_METRICS;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, field, info_span, Instrument, Span};

/// Business step of a consuming stage
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    /// Message type this stage consumes
    type Input: PipelineMessage + 'static;

    const KIND: StageKind;

    /// Persist the stage record and forward whatever comes next.
    ///
    /// `context` is the stage's child context; anything published must carry it.
    async fn process(&self, input: Self::Input, context: &TraceContext) -> HandlerResult;
}

/// Adapts a [`Stage`] to the transport's [`MessageHandler`].
///
/// Per delivery: extract the inbound context (fresh root when absent), derive
/// the child, decode and type-check the payload, roll the fault injector, then
/// run the stage inside the child context.
pub struct StageRunner<S: Stage> {
    stage: Arc<S>,
    faults: Arc<FaultInjector>,
    propagator: Propagator,
}

impl<S: Stage> StageRunner<S> {
    pub fn new(stage: Arc<S>, faults: Arc<FaultInjector>) -> Self {
        Self {
            stage,
            faults,
            propagator: Propagator::new(),
        }
    }

    async fn run(&self, envelope: &Envelope, context: &TraceContext) -> HandlerResult {
        let input: S::Input = envelope.decode()?;
        if input.message_type() != S::Input::MESSAGE_TYPE {
            return Err(HandlerError::deserialization(format!(
                "payload message_type {} is not {}",
                input.message_type(),
                S::Input::MESSAGE_TYPE
            )));
        }
        Span::current().record("correlation_id", input.correlation_id());

        self.faults.check(S::KIND)?;
        self.stage.process(input, context).await
    }
}

#[async_trait]
impl<S: Stage> MessageHandler for StageRunner<S> {
    async fn handle(&self, envelope: &Envelope) -> HandlerResult {
        let started = Instant::now();
        let parent = self.propagator.extract_or_root(&envelope.headers);
        let context = parent.child();

        let span = info_span!(
            "stage",
            stage = %S::KIND,
            destination = %envelope.destination(),
            attempt = envelope.delivery.attempt,
            trace_id = %context.trace_id(),
            span_id = %context.span_id(),
            parent_span_id = %parent.span_id(),
            correlation_id = field::Empty,
        );

        let result = with_context(
            context.clone(),
            self.run(envelope, &context).instrument(span),
        )
        .await;

        let outcome = match &result {
            Ok(()) => "success",
            Err(err) => err.kind.as_ref(),
        };
        STAGE_METRICS
            .processed
            .with_label_values(&[S::KIND.as_ref(), outcome])
            .inc();
        STAGE_METRICS
            .duration
            .with_label_values(&[S::KIND.as_ref()])
            .observe(started.elapsed().as_secs_f64());
        debug!(stage = %S::KIND, outcome, "Stage invocation finished");

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{current_context, FailureKind, MessageHeaders, MESSAGE_TYPE_HEADER};
    use crate::models::{BillingMessage, RecordStatus};
    use chrono::Utc;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<(String, TraceContext, Option<TraceContext>)>>,
    }

    #[async_trait]
    impl Stage for Recording {
        type Input = BillingMessage;
        const KIND: StageKind = StageKind::Payment;

        async fn process(&self, input: BillingMessage, context: &TraceContext) -> HandlerResult {
            self.seen
                .lock()
                .push((input.transaction_id, context.clone(), current_context()));
            Ok(())
        }
    }

    fn billing_message() -> BillingMessage {
        BillingMessage {
            transaction_id: "T1".to_string(),
            customer_id: "C1".to_string(),
            product_id: "P1".to_string(),
            amount: 123.45,
            currency: "USD".to_string(),
            status: RecordStatus::Pending,
            message_type: BillingMessage::MESSAGE_TYPE.to_string(),
            created_at: Utc::now(),
        }
    }

    fn envelope(message: &BillingMessage, headers: MessageHeaders) -> Envelope {
        Envelope::new("billing-events", serde_json::to_vec(message).unwrap(), headers)
    }

    fn runner(stage: Arc<Recording>) -> StageRunner<Recording> {
        StageRunner::new(stage, Arc::new(FaultInjector::disabled()))
    }

    #[tokio::test]
    async fn test_child_of_inbound_context() {
        let stage = Arc::new(Recording::default());
        let upstream = TraceContext::new_root();
        let mut headers = MessageHeaders::new();
        Propagator::new().inject(&upstream, &mut headers);

        runner(stage.clone())
            .handle(&envelope(&billing_message(), headers))
            .await
            .unwrap();

        let seen = stage.seen.lock();
        let (id, context, scoped) = &seen[0];
        assert_eq!(id, "T1");
        assert_eq!(context.trace_id(), upstream.trace_id());
        assert_eq!(context.parent_span_id(), Some(upstream.span_id()));
        assert!(scoped.as_ref().unwrap().same_span(context));
    }

    #[tokio::test]
    async fn test_missing_context_starts_new_trace() {
        let stage = Arc::new(Recording::default());
        runner(stage.clone())
            .handle(&envelope(&billing_message(), MessageHeaders::new()))
            .await
            .unwrap();

        assert_eq!(stage.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_wrong_payload_type_is_deserialization_failure() {
        let stage = Arc::new(Recording::default());
        let mut message = billing_message();
        message.message_type = "PAYMENT_PROCESSED".to_string();

        let err = runner(stage.clone())
            .handle(&envelope(&message, MessageHeaders::new()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Deserialization);
        assert!(stage.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_header_type_is_deserialization_failure() {
        let stage = Arc::new(Recording::default());
        let headers = MessageHeaders::new().with(MESSAGE_TYPE_HEADER, "SOMETHING_ELSE");

        let err = runner(stage)
            .handle(&envelope(&billing_message(), headers))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Deserialization);
    }

    #[cfg(feature = "fault-injection")]
    #[tokio::test]
    async fn test_injected_failure_skips_stage() {
        use crate::config::FaultInjectionConfig;

        let stage = Arc::new(Recording::default());
        let faults = Arc::new(FaultInjector::new(&FaultInjectionConfig {
            enabled: true,
            probability: 1.0,
            stages: vec![StageKind::Payment],
        }));

        let err = StageRunner::new(stage.clone(), faults)
            .handle(&envelope(&billing_message(), MessageHeaders::new()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::SimulatedProcessing);
        assert!(stage.seen.lock().is_empty());
    }
}
