//! Prometheus metrics for pipeline stages

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, HistogramVec};

/// Stage metrics
pub struct StageMetrics {
    /// Handler invocations by outcome (`success` or a failure kind)
    pub processed: CounterVec,

    /// Records written by stage
    pub records_saved: CounterVec,

    /// Simulated failures raised by the fault injector
    pub injected_failures: CounterVec,

    /// Handler latency
    pub duration: HistogramVec,
}

lazy_static! {
    pub static ref STAGE_METRICS: StageMetrics = StageMetrics {
        processed: register_counter_vec!(
            "pipeline_stage_processed_total",
            "Total number of stage invocations",
            &["stage", "outcome"]
        )
        .unwrap(),

        records_saved: register_counter_vec!(
            "pipeline_records_saved_total",
            "Total number of records persisted",
            &["stage"]
        )
        .unwrap(),

        injected_failures: register_counter_vec!(
            "pipeline_injected_failures_total",
            "Total number of simulated processing failures",
            &["stage"]
        )
        .unwrap(),

        duration: register_histogram_vec!(
            "pipeline_stage_duration_seconds",
            "Stage processing time in seconds",
            &["stage"],
            vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
        )
        .unwrap(),
    };
}

/// Initialize stage metrics
pub fn init_stage_metrics() {
    lazy_static::initialize(&STAGE_METRICS);
}
