//! Broker-agnostic messaging for the billing pipeline
//!
//! Stages publish and consume through [`MessageTransport`]; the backend is
//! picked once at startup from [`MessagingConfig`].
//!
//! ```text
//!            ┌──────────────────────────────┐
//!            │   MessageTransport (trait)   │
//!            │  publish / subscribe / close │
//!            └──────────────┬───────────────┘
//!       ┌────────────┬──────┴──────┬──────────────┐
//!       ▼            ▼             ▼              ▼
//!   ┌───────┐  ┌───────────┐  ┌─────────┐  ┌───────────┐
//!   │ Kafka │  │ JetStream │  │  AMQP   │  │ In-memory │
//!   │ (log) │  │  (queue)  │  │ (lapin) │  │ (tests)   │
//!   └───────┘  └───────────┘  └─────────┘  └───────────┘
//! ```
//!
//! Every backend hands deliveries to the shared [`DeliveryProcessor`], which
//! applies the retry policy and reports a [`Disposition`] the backend turns
//! into its native acknowledgement. Trace context crosses the broker as
//! `traceparent`/`tracestate` headers through the carrier adapters.

mod amqp;
mod carrier;
mod config;
mod context;
mod dead_letter;
mod envelope;
mod error;
mod factory;
mod kafka;
mod memory;
mod metrics;
mod nats;
mod propagation;
mod retry;
mod scope;
mod traits;

pub use amqp::{AmqpHeaderReader, AmqpHeaderWriter, AmqpTransport};
pub use carrier::{CarrierReader, CarrierWriter, HttpHeaderReader, MessageHeaders};
pub use config::{
    AmqpConfig, Destinations, InMemoryConfig, KafkaConfig, MessagingConfig, MessagingSystem,
    QueueConfig, RetryConfig,
};
pub use context::TraceContext;
pub use dead_letter::{
    DeadLetter, DeadLetterReason, DeadLetterSink, InMemoryDeadLetterSink, LoggingDeadLetterSink,
};
pub use envelope::{
    DeliveryInfo, Envelope, TypedMessage, CONTENT_TYPE_HEADER, JSON_CONTENT_TYPE,
    MESSAGE_KEY_HEADER, MESSAGE_TYPE_HEADER,
};
pub use error::{
    FailureKind, HandlerError, HandlerResult, TransportError, TransportErrorKind, TransportResult,
};
pub use factory::{create_in_memory_transport, create_transport};
pub use kafka::{KafkaHeaderReader, KafkaHeaderWriter, KafkaTransport};
pub use memory::InMemoryTransport;
pub use metrics::{init_messaging_metrics, MESSAGING_METRICS};
pub use nats::{NatsHeaderReader, NatsHeaderWriter, NatsQueueTransport};
pub use propagation::{Propagator, TRACEPARENT_HEADER, TRACESTATE_HEADER};
pub use retry::{DeliveryProcessor, DeliveryState, Disposition, RetryDecision, RetryPolicy};
pub use scope::{current_context, with_context, ContextPropagatingExecutor};
pub use traits::{
    handler_fn, Concurrency, FnHandler, MessageHandler, MessageTransport, MessageTransportExt,
    ShutdownSignal, Subscription,
};
