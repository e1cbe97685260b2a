use envconfig::Envconfig;
use metrics::{counter, gauge};
use rdkafka::consumer::ConsumerContext;
use rdkafka::ClientConfig;
use tracing::debug;

use crate::health::HealthHandle;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
}

impl KafkaConfig {
    fn base_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.kafka_hosts)
            .set("statistics.interval.ms", "10000");

        if self.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };
        client_config
    }

    pub fn producer_config(&self) -> ClientConfig {
        let mut client_config = self.base_config();
        client_config
            .set("linger.ms", self.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                self.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", &self.kafka_compression_codec)
            .set(
                "queue.buffering.max.kbytes",
                (self.kafka_producer_queue_mib * 1024).to_string(),
            );

        debug!("rdkafka producer configuration: {:?}", client_config);
        client_config
    }

    /// Consumer offsets are stored explicitly once a message is acknowledged,
    /// then committed in the background by librdkafka.
    pub fn consumer_config(&self, group: &str, session_timeout_ms: u32) -> ClientConfig {
        let mut client_config = self.base_config();
        client_config
            .set("group.id", group)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", session_timeout_ms.to_string());

        debug!("rdkafka consumer configuration: {:?}", client_config);
        client_config
    }
}

/// Client context shared by producers and consumers: reports liveness from the
/// statistics callback and exports queue gauges.
pub struct KafkaContext {
    liveness: Option<HealthHandle>,
    prefix: &'static str,
    producer: bool,
}

impl KafkaContext {
    pub fn producer(prefix: &'static str, liveness: Option<HealthHandle>) -> Self {
        Self {
            liveness,
            prefix,
            producer: true,
        }
    }

    pub fn consumer(prefix: &'static str, liveness: Option<HealthHandle>) -> Self {
        Self {
            liveness,
            prefix,
            producer: false,
        }
    }

    fn record_queues(&self, callback_depth: f64, queue_depth: f64, queue_limit: f64) {
        let prefix = self.prefix;
        gauge!(format!("{prefix}_kafka_callback_queue_depth")).set(callback_depth);

        // Consumers report their fetch queue here, not a produce queue
        if self.producer {
            gauge!(format!("{prefix}_kafka_producer_queue_depth")).set(queue_depth);
            gauge!(format!("{prefix}_kafka_producer_queue_depth_limit")).set(queue_limit);
        }
    }
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy();
        }

        self.record_queues(
            stats.replyq as f64,
            stats.msg_cnt as f64,
            stats.msg_max as f64,
        );

        let prefix = self.prefix;

        for (_, stats) in stats.brokers {
            let id_string = format!("{}", stats.nodeid);
            gauge!(
                format!("{prefix}_kafka_broker_requests_pending"),
                "broker" => id_string.clone()
            )
            .set(stats.outbuf_cnt as f64);
            counter!(
                format!("{prefix}_kafka_broker_tx_errors_total"),
                "broker" => id_string.clone()
            )
            .absolute(stats.txerrs);
            counter!(
                format!("{prefix}_kafka_broker_rx_errors_total"),
                "broker" => id_string
            )
            .absolute(stats.rxerrs);
        }
    }
}

impl ConsumerContext for KafkaContext {}
