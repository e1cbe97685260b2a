use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use stackex_common::error::TransportError;
use stackex_common::health::HealthHandle;
use stackex_common::kafka::{KafkaConfig, KafkaContext};
use tracing::{error, info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Main,
    DeadLetter,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Main => "main",
            Topic::DeadLetter => "dead_letter",
        }
    }
}

/// One message as handed to the bus: opaque payload plus string attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub key: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

#[async_trait]
pub trait Publisher {
    /// Publishes a message and waits for the broker confirmation, returning the
    /// identifier the bus assigned to it.
    async fn publish(&self, topic: Topic, message: OutboundMessage)
        -> Result<String, TransportError>;
}

pub struct KafkaPublisher {
    producer: FutureProducer<KafkaContext>,
    main_topic: String,
    dead_letter_topic: String,
    timeout: Duration,
}

impl KafkaPublisher {
    pub fn new(
        config: &KafkaConfig,
        main_topic: String,
        dead_letter_topic: String,
        timeout: Duration,
        liveness: Option<HealthHandle>,
    ) -> Result<Self, KafkaError> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let producer: FutureProducer<KafkaContext> = config
            .producer_config()
            .create_with_context(KafkaContext::producer("stackex_producer", liveness))?;

        // Ping the cluster to make sure we can reach brokers, fail after 10 seconds
        drop(producer
            .client()
            .fetch_metadata(Some(&main_topic), Timeout::After(Duration::new(10, 0)))?);
        info!("connected to Kafka brokers");

        Ok(Self {
            producer,
            main_topic,
            dead_letter_topic,
            timeout,
        })
    }

    pub fn flush(&self) -> Result<(), KafkaError> {
        self.producer.flush(Duration::new(30, 0))
    }

    fn topic_name(&self, topic: Topic) -> &str {
        match topic {
            Topic::Main => &self.main_topic,
            Topic::DeadLetter => &self.dead_letter_topic,
        }
    }
}

fn classify(err: KafkaError) -> TransportError {
    match err.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::MessageSizeTooLarge
            | RDKafkaErrorCode::InvalidMessage
            | RDKafkaErrorCode::UnknownTopicOrPartition
            | RDKafkaErrorCode::TopicAuthorizationFailed,
        ) => TransportError::Rejected(err.to_string()),
        _ => TransportError::Unavailable(err.to_string()),
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    #[instrument(skip_all, fields(topic = topic.as_str()))]
    async fn publish(
        &self,
        topic: Topic,
        message: OutboundMessage,
    ) -> Result<String, TransportError> {
        let topic_name = self.topic_name(topic);

        let mut headers = OwnedHeaders::new_with_capacity(message.attributes.len());
        for (key, value) in &message.attributes {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let delivery = match self.producer.send_result(FutureRecord {
            topic: topic_name,
            payload: Some(message.payload.as_slice()),
            partition: None,
            key: message.key.as_deref(),
            timestamp: None,
            headers: Some(headers),
        }) {
            Ok(delivery) => delivery,
            Err((err, _)) => {
                error!("failed to enqueue message for {}: {}", topic_name, err);
                return Err(classify(err));
            }
        };

        match tokio::time::timeout(self.timeout, delivery).await {
            Err(_) => {
                counter!("stackex_producer_kafka_errors_total", "reason" => "timeout").increment(1);
                Err(TransportError::Timeout(self.timeout))
            }
            Ok(Err(_)) => {
                // Cancelled due to timeout while retrying
                counter!("stackex_producer_kafka_errors_total", "reason" => "cancelled")
                    .increment(1);
                Err(TransportError::Unavailable(
                    "delivery cancelled before broker ack".to_owned(),
                ))
            }
            Ok(Ok(Err((err, _)))) => {
                counter!("stackex_producer_kafka_errors_total", "reason" => "produce").increment(1);
                error!("failed to produce to {}: {}", topic_name, err);
                Err(classify(err))
            }
            Ok(Ok(Ok((partition, offset)))) => Ok(format!("{topic_name}-{partition}-{offset}")),
        }
    }
}

/// Logs messages instead of producing them, for local runs.
pub struct PrintPublisher {}

#[async_trait]
impl Publisher for PrintPublisher {
    async fn publish(
        &self,
        topic: Topic,
        message: OutboundMessage,
    ) -> Result<String, TransportError> {
        info!(
            topic = topic.as_str(),
            bytes = message.payload.len(),
            attributes = ?message.attributes,
            "message"
        );
        Ok(format!("print-{}", topic.as_str()))
    }
}

/// Keeps published messages in memory and can be told to fail upcoming publishes.
#[derive(Default)]
pub struct MemoryPublisher {
    published: Mutex<Vec<(Topic, OutboundMessage)>>,
    failures: Mutex<HashMap<Topic, usize>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` publishes to `topic` fail as unavailable.
    pub fn fail_next(&self, topic: Topic, count: usize) {
        if let Ok(mut failures) = self.failures.lock() {
            _ = failures.insert(topic, count);
        }
    }

    pub fn published(&self, topic: Topic) -> Vec<OutboundMessage> {
        self.published
            .lock()
            .map(|published| {
                published
                    .iter()
                    .filter(|(t, _)| *t == topic)
                    .map(|(_, message)| message.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(
        &self,
        topic: Topic,
        message: OutboundMessage,
    ) -> Result<String, TransportError> {
        if let Ok(mut failures) = self.failures.lock() {
            if let Some(remaining) = failures.get_mut(&topic).filter(|n| **n > 0) {
                *remaining -= 1;
                return Err(TransportError::Unavailable(format!(
                    "{} topic is failing",
                    topic.as_str()
                )));
            }
        }

        let mut published = self
            .published
            .lock()
            .map_err(|_| TransportError::Unavailable("poisoned lock".to_owned()))?;
        published.push((topic, message));
        Ok(format!("{}-0-{}", topic.as_str(), published.len() - 1))
    }
}
