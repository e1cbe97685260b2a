use std::net::SocketAddr;
use std::str::FromStr;

use envconfig::Envconfig;

use stackex_common::config::{EnvMsDuration, NonEmptyString};
use stackex_common::kafka::KafkaConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:8080")]
    pub address: SocketAddr,

    #[envconfig(default = "push")]
    pub delivery_mode: DeliveryMode,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    /// gs://bucket, file:///path or memory://
    pub storage_url: NonEmptyString,

    #[envconfig(default = "json")]
    pub json_prefix: String,

    #[envconfig(default = "parquet")]
    pub columnar_prefix: String,

    #[envconfig(default = "dead-letter")]
    pub dead_letter_prefix: String,

    #[envconfig(from = "IO_TIMEOUT_MS", default = "30000")]
    pub io_timeout: EnvMsDuration,

    #[envconfig(default = "64")]
    pub max_concurrent_messages: usize,

    /// Failed deliveries at or past this attempt are quarantined, 0 retries forever
    #[envconfig(default = "5")]
    pub max_redeliveries: u32,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(default = "stackex-questions")]
    pub kafka_topic: String,

    #[envconfig(default = "stackex-consumer")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "10000")]
    pub kafka_session_timeout_ms: u32,

    #[envconfig(nested = true)]
    pub warehouse: WarehouseConfig,
}

#[derive(Envconfig, Clone, Debug)]
pub struct WarehouseConfig {
    #[envconfig(default = "false")]
    pub warehouse_enabled: bool,

    #[envconfig(default = "https://bigquery.googleapis.com")]
    pub warehouse_endpoint: String,

    pub warehouse_project: Option<String>,

    #[envconfig(default = "stackex")]
    pub warehouse_dataset: String,

    #[envconfig(default = "questions")]
    pub warehouse_table: String,

    pub warehouse_access_token: Option<String>,

    #[envconfig(from = "WAREHOUSE_POLL_INTERVAL_MS", default = "1000")]
    pub warehouse_poll_interval: EnvMsDuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Push,
    Pull,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseDeliveryModeError(String);

impl FromStr for DeliveryMode {
    type Err = ParseDeliveryModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "push" => Ok(DeliveryMode::Push),
            "pull" => Ok(DeliveryMode::Pull),
            other => Err(ParseDeliveryModeError(other.to_owned())),
        }
    }
}
