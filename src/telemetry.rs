//! Log subscriber setup and Prometheus text export

use crate::config::ObservabilityConfig;
use prometheus::Encoder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `observability.log_level` when set.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let json = config.json_logs.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
    });
    let text = (!config.json_logs).then(|| tracing_subscriber::fmt::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .try_init()
}

/// Render every registered metric in the Prometheus text exposition format
pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    match prometheus::TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        Ok(()) => String::from_utf8_lossy(&buffer).into_owned(),
        Err(e) => {
            tracing::error!(error = %e, "Metrics encoding failed");
            "# metrics unavailable\n".to_string()
        }
    }
}
