//! Prometheus metrics for messaging

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge_vec, CounterVec,
    HistogramVec, IntGaugeVec,
};

/// Messaging metrics
pub struct MessagingMetrics {
    /// Messages published counter
    pub messages_published: CounterVec,

    /// Deliveries handed to a handler, including redeliveries
    pub messages_consumed: CounterVec,

    /// Message publish failures
    pub publish_failures: CounterVec,

    /// Handler failures by failure kind
    pub handler_failures: CounterVec,

    /// In-process redeliveries
    pub retries: CounterVec,

    /// Deliveries that ended in the dead-letter sink
    pub dead_lettered: CounterVec,

    /// Active consumer workers
    pub active_consumers: IntGaugeVec,

    /// Message publish latency
    pub publish_latency: HistogramVec,

    /// Time from first delivery to terminal disposition
    pub delivery_duration: HistogramVec,
}

lazy_static! {
    pub static ref MESSAGING_METRICS: MessagingMetrics = MessagingMetrics {
        messages_published: register_counter_vec!(
            "pipeline_messages_published_total",
            "Total number of messages published",
            &["destination", "system"]
        )
        .unwrap(),

        messages_consumed: register_counter_vec!(
            "pipeline_messages_consumed_total",
            "Total number of deliveries handed to handlers",
            &["destination"]
        )
        .unwrap(),

        publish_failures: register_counter_vec!(
            "pipeline_publish_failures_total",
            "Total number of publish failures",
            &["destination", "system", "kind"]
        )
        .unwrap(),

        handler_failures: register_counter_vec!(
            "pipeline_handler_failures_total",
            "Total number of failed handler invocations",
            &["destination", "kind"]
        )
        .unwrap(),

        retries: register_counter_vec!(
            "pipeline_retries_total",
            "Total number of in-process redeliveries",
            &["destination"]
        )
        .unwrap(),

        dead_lettered: register_counter_vec!(
            "pipeline_dead_lettered_total",
            "Total number of dead-lettered deliveries",
            &["destination", "kind"]
        )
        .unwrap(),

        active_consumers: register_int_gauge_vec!(
            "pipeline_active_consumers",
            "Number of running consumer workers",
            &["destination", "system"]
        )
        .unwrap(),

        publish_latency: register_histogram_vec!(
            "pipeline_publish_latency_seconds",
            "Message publish latency in seconds",
            &["destination", "system"]
        )
        .unwrap(),

        delivery_duration: register_histogram_vec!(
            "pipeline_delivery_duration_seconds",
            "Time from first delivery to commit or dead-letter",
            &["destination", "outcome"]
        )
        .unwrap(),
    };
}

/// Initialize messaging metrics
pub fn init_messaging_metrics() {
    lazy_static::initialize(&MESSAGING_METRICS);
}

/// Record the outcome of one publish attempt
pub(crate) fn record_publish(
    destination: &str,
    system: &str,
    elapsed_secs: f64,
    failure: Option<&str>,
) {
    match failure {
        None => {
            MESSAGING_METRICS
                .messages_published
                .with_label_values(&[destination, system])
                .inc();
            MESSAGING_METRICS
                .publish_latency
                .with_label_values(&[destination, system])
                .observe(elapsed_secs);
        }
        Some(kind) => {
            MESSAGING_METRICS
                .publish_failures
                .with_label_values(&[destination, system, kind])
                .inc();
        }
    }
}
