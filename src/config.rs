use crate::messaging::MessagingConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum::{AsRefStr, Display, EnumString};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Messaging configuration
    #[serde(default)]
    pub messaging: MessagingConfig,

    /// Record store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/default.toml".to_string());
        Self::load_from(&config_path)
    }

    /// Load with an explicit override file
    pub fn load_from(config_path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            // Start with default values
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            // Override with config file if it exists
            .add_source(config::File::with_name(config_path).required(false))
            // Override with environment variables (prefix: PIPELINE_)
            .add_source(
                config::Environment::with_prefix("PIPELINE")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("pipeline.stages")
                    .with_list_parse_key("pipeline.fault_injection.stages")
                    .with_list_parse_key("messaging.queue.servers")
                    .with_list_parse_key("messaging.retry.fatal"),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Request timeout (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store backend type
    #[serde(default)]
    pub backend: StoreBackend,

    /// Path for the embedded database (sled)
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Default log filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub json_logs: bool,

    /// Service name attached to startup logs
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub prometheus_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            service_name: default_service_name(),
            prometheus_enabled: true,
        }
    }
}

/// Pipeline stage selector
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StageKind {
    Billing,
    Payment,
    Invoice,
}

impl StageKind {
    pub const ALL: [StageKind; 3] = [StageKind::Billing, StageKind::Payment, StageKind::Invoice];
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Stages hosted by this process
    #[serde(default = "default_stages")]
    pub stages: Vec<StageKind>,

    /// Synthetic failure settings
    #[serde(default)]
    pub fault_injection: FaultInjectionConfig,

    /// Bound on concurrent invoice store writes
    #[serde(default = "default_invoice_workers")]
    pub invoice_workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: default_stages(),
            fault_injection: FaultInjectionConfig::default(),
            invoice_workers: default_invoice_workers(),
        }
    }
}

impl PipelineConfig {
    pub fn hosts(&self, stage: StageKind) -> bool {
        self.stages.contains(&stage)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultInjectionConfig {
    /// Start with injection switched on
    #[serde(default)]
    pub enabled: bool,

    /// Probability of a simulated failure per delivery
    #[serde(default = "default_failure_probability")]
    pub probability: f64,

    /// Stages subject to injection
    #[serde(default = "default_fault_stages")]
    pub stages: Vec<StageKind>,
}

impl Default for FaultInjectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            probability: default_failure_probability(),
            stages: default_fault_stages(),
        }
    }
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "billing_pipeline=info,tower_http=info".to_string()
}

fn default_service_name() -> String {
    "billing-pipeline".to_string()
}

fn default_true() -> bool {
    true
}

fn default_stages() -> Vec<StageKind> {
    StageKind::ALL.to_vec()
}

fn default_invoice_workers() -> usize {
    10
}

fn default_failure_probability() -> f64 {
    0.05
}

fn default_fault_stages() -> Vec<StageKind> {
    vec![StageKind::Payment]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{FailureKind, MessagingSystem};

    #[test]
    fn test_embedded_defaults_load() {
        let config = Config::load_from("does-not-exist.toml").unwrap();
        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.pipeline.stages, StageKind::ALL.to_vec());
        assert_eq!(config.messaging.retry.max_retries, 3);
        assert_eq!(config.messaging.retry.backoff_ms, 5000);
        assert_eq!(config.messaging.queue.queues.billing, "billing.queue");
        assert!(!config.pipeline.fault_injection.enabled);
    }

    #[test]
    fn test_override_file_applies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("override.toml");
        std::fs::write(
            &path,
            r#"
[messaging]
system = "rabbitmq"

[pipeline]
stages = ["payment", "invoice"]
"#,
        )
        .unwrap();

        let config = Config::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(config.messaging.system, MessagingSystem::Amqp);
        assert!(!config.pipeline.hosts(StageKind::Billing));
        assert!(config.pipeline.hosts(StageKind::Invoice));
        assert_eq!(config.messaging.amqp.prefetch_count, 10);
    }

    #[test]
    fn test_fatal_kinds_from_env_list() {
        std::env::set_var("PIPELINE__MESSAGING__RETRY__FATAL", "store_write,processing");
        let config = Config::load_from("does-not-exist.toml");
        std::env::remove_var("PIPELINE__MESSAGING__RETRY__FATAL");

        assert_eq!(
            config.unwrap().messaging.retry.fatal,
            vec![FailureKind::StoreWrite, FailureKind::Processing]
        );
    }

    #[test]
    fn test_stage_kind_parses() {
        assert_eq!("payment".parse::<StageKind>().unwrap(), StageKind::Payment);
        assert!("shipping".parse::<StageKind>().is_err());
    }
}
