//! Billing → payment → invoice pipeline over interchangeable message brokers
//!
//! Each stage persists one record and forwards a derived message to the
//! next stage through [`messaging::MessageTransport`]. Kafka, NATS JetStream,
//! AMQP and an in-process transport share one contract: at-least-once
//! delivery, bounded fixed-interval retries with dead-lettering, and W3C
//! trace context carried in message headers across every hop.

pub mod api;
pub mod config;
pub mod error;
pub mod messaging;
pub mod models;
pub mod pipeline;
pub mod state;
pub mod telemetry;

pub use error::{AppError, Result};
