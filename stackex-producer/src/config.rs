use envconfig::Envconfig;

use stackex_common::config::{EnvMsDuration, NonEmptyString};
use stackex_common::kafka::KafkaConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    /// Log messages instead of producing them to Kafka
    #[envconfig(default = "false")]
    pub print_sink: bool,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(default = "stackex-questions")]
    pub kafka_topic: NonEmptyString,

    #[envconfig(default = "stackex-questions-dlq")]
    pub kafka_dlq_topic: NonEmptyString,

    #[envconfig(default = "stackexchange-producer")]
    pub source_tag: String,

    #[envconfig(default = "v1")]
    pub schema_version: String,

    #[envconfig(from = "PACING_DELAY_MS", default = "3000")]
    pub pacing_delay: EnvMsDuration,

    #[envconfig(from = "PUBLISH_TIMEOUT_MS", default = "30000")]
    pub publish_timeout: EnvMsDuration,

    /// Strip required fields from the last fetched item to exercise the dead-letter path
    #[envconfig(default = "false")]
    pub simulate_invalid_last: bool,

    #[envconfig(nested = true)]
    pub stackex: StackExchangeConfig,
}

#[derive(Envconfig, Clone)]
pub struct StackExchangeConfig {
    #[envconfig(default = "https://api.stackexchange.com/2.3/questions")]
    pub stackex_api_url: String,

    #[envconfig(default = "stackoverflow")]
    pub stackex_site: String,

    #[envconfig(default = "100")]
    pub stackex_pagesize: u32,

    #[envconfig(default = "votes")]
    pub stackex_sort: String,

    #[envconfig(default = "desc")]
    pub stackex_order: String,

    #[envconfig(default = "data-engineering")]
    pub stackex_tagged: String,

    pub stack_exchange_api_key: NonEmptyString,

    #[envconfig(from = "STACKEX_REQUEST_TIMEOUT_MS", default = "30000")]
    pub stackex_request_timeout: EnvMsDuration,
}
