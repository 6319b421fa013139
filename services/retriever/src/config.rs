//! Service configuration, layered from defaults, files and `RETRIEVER__*` variables.

use crate::locator::DEFAULT_CHUNK_ID_PATTERN;
use crate::merger::DEFAULT_IMU_ORDER_PATTERN;
use crate::periods::DEFAULT_TOLERANCE;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the retriever service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// Bucket the devices upload chunks to
    pub source: S3Config,
    /// Bucket reconstructed artifacts are written to
    pub destination: S3Config,
    /// Retrieval configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Kafka consumer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Consumer group ID
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Topic carrying artifact descriptors
    #[serde(default = "default_descriptor_topic")]
    pub descriptor_topic: String,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Auto offset reset policy
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Max poll interval in milliseconds
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
    /// Delivery timeout for re-published descriptors in milliseconds
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u32,
    /// Earliest re-attempt of a retried descriptor, in milliseconds after the retry
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

/// S3 bucket configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Chunk retrieval configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    /// Chunk downloads in flight per artifact (1 = sequential)
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    /// Largest frame index gap inside one period
    #[serde(default = "default_period_tolerance")]
    pub period_tolerance: usize,
    /// Accepted IMU chunk suffixes
    #[serde(default = "default_imu_suffixes")]
    pub imu_suffixes: Vec<String>,
    /// Accepted metadata chunk suffixes
    #[serde(default = "default_metadata_suffixes")]
    pub metadata_suffixes: Vec<String>,
    /// Pattern whose first group is the canonical chunk id
    #[serde(default = "default_chunk_id_pattern")]
    pub chunk_id_pattern: String,
    /// Pattern whose first group is the IMU chunk sequence number
    #[serde(default = "default_imu_order_pattern")]
    pub imu_order_pattern: String,
}

// Default value functions
fn default_service_name() -> String {
    "chunk-retriever".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_consumer_group() -> String {
    "chunk-retriever".to_string()
}

fn default_descriptor_topic() -> String {
    "retriever.artifacts".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_max_poll_interval_ms() -> u32 {
    600000 // 10 minutes
}

fn default_message_timeout_ms() -> u32 {
    5000
}

fn default_retry_delay_ms() -> u64 {
    30000
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_fetch_concurrency() -> usize {
    1
}

fn default_period_tolerance() -> usize {
    DEFAULT_TOLERANCE
}

fn default_imu_suffixes() -> Vec<String> {
    vec![".csv.zip".to_string()]
}

fn default_metadata_suffixes() -> Vec<String> {
    vec![".json.zip".to_string()]
}

fn default_chunk_id_pattern() -> String {
    DEFAULT_CHUNK_ID_PATTERN.to_string()
}

fn default_imu_order_pattern() -> String {
    DEFAULT_IMU_ORDER_PATTERN.to_string()
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "chunk-retriever")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/retriever").required(false))
            .add_source(config::File::with_name("/etc/chunk-retriever/retriever").required(false))
            // Override with environment variables
            // RETRIEVER__SOURCE__BUCKET -> source.bucket
            .add_source(
                config::Environment::with_prefix("RETRIEVER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }
}

impl KafkaConfig {
    /// Get re-publish delivery timeout as Duration
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.message_timeout_ms))
    }

    /// Get retry delay as Duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            fetch_concurrency: default_fetch_concurrency(),
            period_tolerance: default_period_tolerance(),
            imu_suffixes: default_imu_suffixes(),
            metadata_suffixes: default_metadata_suffixes(),
            chunk_id_pattern: default_chunk_id_pattern(),
            imu_order_pattern: default_imu_order_pattern(),
        }
    }
}
