//! Dead-letter sinks for deliveries the retry policy gave up on

use crate::messaging::envelope::Envelope;
use crate::messaging::error::{FailureKind, HandlerError};
use crate::messaging::metrics::MESSAGING_METRICS;
use crate::messaging::propagation::TRACEPARENT_HEADER;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use strum::{AsRefStr, Display};
use tracing::error;

const PAYLOAD_PREVIEW_CHARS: usize = 256;

/// Why a delivery was dead-lettered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeadLetterReason {
    /// The failure kind is in the fatal set
    Fatal,
    /// Every allowed attempt failed
    RetriesExhausted,
}

/// A delivery that will not be retried
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub destination: String,
    pub attempts: u32,
    pub reason: DeadLetterReason,
    pub error_kind: FailureKind,
    pub error: String,
    pub traceparent: Option<String>,
    pub message_key: Option<String>,
    pub partition: Option<i32>,
    pub offset: Option<i64>,
    pub payload_preview: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(envelope: &Envelope, reason: DeadLetterReason, error: &HandlerError) -> Self {
        Self {
            destination: envelope.destination().to_string(),
            attempts: envelope.delivery.attempt,
            reason,
            error_kind: error.kind,
            error: error.message.clone(),
            traceparent: envelope.headers.get(TRACEPARENT_HEADER).map(str::to_string),
            message_key: envelope.message_key().map(str::to_string),
            partition: envelope.delivery.partition,
            offset: envelope.delivery.offset,
            payload_preview: envelope.payload_preview(PAYLOAD_PREVIEW_CHARS),
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Receives dead-lettered deliveries
pub trait DeadLetterSink: Send + Sync {
    fn record(&self, dead_letter: DeadLetter);
}

fn log_dead_letter(dead_letter: &DeadLetter) {
    error!(
        destination = %dead_letter.destination,
        attempts = dead_letter.attempts,
        reason = %dead_letter.reason,
        error_kind = %dead_letter.error_kind,
        error = %dead_letter.error,
        message_key = ?dead_letter.message_key,
        partition = ?dead_letter.partition,
        offset = ?dead_letter.offset,
        "Delivery dead-lettered"
    );
    MESSAGING_METRICS
        .dead_lettered
        .with_label_values(&[&dead_letter.destination, dead_letter.error_kind.as_ref()])
        .inc();
}

/// Error log plus metric
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDeadLetterSink;

impl DeadLetterSink for LoggingDeadLetterSink {
    fn record(&self, dead_letter: DeadLetter) {
        log_dead_letter(&dead_letter);
    }
}

/// Logs like [`LoggingDeadLetterSink`] and keeps the most recent entries
pub struct InMemoryDeadLetterSink {
    capacity: usize,
    entries: Mutex<VecDeque<DeadLetter>>,
}

impl InMemoryDeadLetterSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Most recent first
    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries.lock().iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl DeadLetterSink for InMemoryDeadLetterSink {
    fn record(&self, dead_letter: DeadLetter) {
        log_dead_letter(&dead_letter);
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(dead_letter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::carrier::MessageHeaders;

    fn dead_letter(n: u8) -> DeadLetter {
        let envelope = Envelope::new("billing-events", vec![n], MessageHeaders::new());
        DeadLetter::new(
            &envelope,
            DeadLetterReason::Fatal,
            &HandlerError::deserialization("bad payload"),
        )
    }

    #[test]
    fn test_in_memory_sink_keeps_latest_first() {
        let sink = InMemoryDeadLetterSink::new(2);
        sink.record(dead_letter(1));
        sink.record(dead_letter(2));
        sink.record(dead_letter(3));

        let entries = sink.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].payload_preview, "\u{3}");
        assert_eq!(entries[1].payload_preview, "\u{2}");
    }

    #[test]
    fn test_dead_letter_captures_delivery_facts() {
        let envelope = Envelope::new(
            "payment-events",
            b"{}".to_vec(),
            MessageHeaders::new().with("x-message-key", "T1"),
        )
        .with_position(2, 41)
        .with_attempt(4);

        let letter = DeadLetter::new(
            &envelope,
            DeadLetterReason::RetriesExhausted,
            &HandlerError::simulated("boom"),
        );

        assert_eq!(letter.attempts, 4);
        assert_eq!(letter.partition, Some(2));
        assert_eq!(letter.offset, Some(41));
        assert_eq!(letter.message_key.as_deref(), Some("T1"));
        assert_eq!(letter.error_kind, FailureKind::SimulatedProcessing);
    }
}
