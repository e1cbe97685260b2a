use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Headers};
use rdkafka::{Message, Offset};
use stackex_common::health::HealthHandle;
use stackex_common::kafka::{KafkaConfig, KafkaContext};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::delivery::{Delivery, InboundMessage, Verdict};
use crate::offsets::{OffsetAction, OffsetTracker};
use crate::pipeline::ConsumerPipeline;

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates a consumer-group member subscribed to `topic`. Offsets are only
/// stored once the pull loop acknowledges them.
pub fn subscribe(
    config: &KafkaConfig,
    topic: &str,
    group: &str,
    session_timeout_ms: u32,
    liveness: Option<HealthHandle>,
) -> Result<StreamConsumer<KafkaContext>, KafkaError> {
    info!("subscribing to {} as {} on {}", topic, group, config.kafka_hosts);
    let consumer: StreamConsumer<KafkaContext> = config
        .consumer_config(group, session_timeout_ms)
        .create_with_context(KafkaContext::consumer("stackex_consumer", liveness))?;
    consumer.subscribe(&[topic])?;
    Ok(consumer)
}

/// Settled delivery, as reported back by a message task.
struct Settled {
    partition: i32,
    offset: i64,
    generation: u64,
    id: String,
    verdict: Verdict,
}

pub struct PullLoop {
    consumer: StreamConsumer<KafkaContext>,
    topic: String,
    pipeline: Arc<ConsumerPipeline>,
    max_in_flight: usize,
    liveness: HealthHandle,
    tracker: OffsetTracker,
    /// Nacks seen per message id, to number redeliveries
    attempts: HashMap<String, u32>,
}

impl PullLoop {
    pub fn new(
        consumer: StreamConsumer<KafkaContext>,
        topic: String,
        pipeline: Arc<ConsumerPipeline>,
        max_in_flight: usize,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            consumer,
            topic,
            pipeline,
            max_in_flight: max_in_flight.max(1),
            liveness,
            tracker: OffsetTracker::default(),
            attempts: HashMap::new(),
        }
    }

    /// Dispatches messages to per-message tasks until `shutdown` resolves, then
    /// waits for in-flight tasks and applies their verdicts.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let semaphore = Arc::new(Semaphore::new(self.max_in_flight));
        let mut tasks: JoinSet<Settled> = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            self.liveness.report_healthy();
            gauge!("stackex_consumer_semaphore_utilization").set(
                1f64 - semaphore.available_permits() as f64 / self.max_in_flight as f64,
            );

            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutting down, waiting for {} in-flight messages", tasks.len());
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.settle(joined);
                }
                received = self.consumer.recv(), if semaphore.available_permits() > 0 => {
                    match received {
                        Ok(message) => {
                            // Only this loop acquires, and a permit was free before receiving
                            let permit = semaphore
                                .clone()
                                .try_acquire_owned()
                                .expect("semaphore has a free permit");
                            let (delivery, settled) =
                                dispatch(&mut self.tracker, &self.attempts, &message);
                            let pipeline = self.pipeline.clone();
                            tasks.spawn(async move {
                                let work = async move {
                                    drop(pipeline.process(delivery).await);
                                };
                                let settled = isolate(work, settled).await;
                                drop(permit);
                                settled
                            });
                        }
                        Err(err) => {
                            counter!("stackex_consumer_kafka_errors_total").increment(1);
                            warn!("failed to receive from Kafka: {}", err);
                        }
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            self.settle(joined);
        }
        if let Err(err) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            // Nothing stored since the last background commit
            if err.rdkafka_error_code() != Some(rdkafka::error::RDKafkaErrorCode::NoOffset) {
                error!("failed to commit offsets on shutdown: {}", err);
            }
        }
        info!("pull loop stopped");
    }

    fn settle(&mut self, joined: Result<Settled, JoinError>) {
        let settled = match joined {
            Ok(settled) => settled,
            Err(err) => {
                // Only cancellation lands here, as pipeline panics settle as nacks
                error!("message task failed: {}", err);
                return;
            }
        };

        let action = self.tracker.resolve(
            settled.partition,
            settled.offset,
            settled.generation,
            settled.verdict,
        );
        if action == OffsetAction::Stale {
            debug!("ignoring verdict for rewound delivery {}", settled.id);
            return;
        }

        match settled.verdict {
            Verdict::Ack => {
                _ = self.attempts.remove(&settled.id);
            }
            Verdict::Nack => {
                *self.attempts.entry(settled.id).or_insert(0) += 1;
            }
        }

        match action {
            OffsetAction::Store(next) => {
                if let Err(err) = self
                    .consumer
                    .store_offset(&self.topic, settled.partition, next)
                {
                    error!("failed to store offset {}: {}", next, err);
                }
            }
            OffsetAction::Seek(offset) => {
                warn!("rewinding partition {} to {}", settled.partition, offset);
                if let Err(err) = self.consumer.seek(
                    &self.topic,
                    settled.partition,
                    Offset::Offset(offset),
                    SEEK_TIMEOUT,
                ) {
                    error!("failed to seek partition {}: {}", settled.partition, err);
                }
            }
            OffsetAction::Nothing | OffsetAction::Stale => {}
        }
    }
}

/// Wraps a Kafka message in a [`Delivery`] and returns a future resolving to
/// its settled verdict.
fn dispatch(
    tracker: &mut OffsetTracker,
    attempts: &HashMap<String, u32>,
    message: &BorrowedMessage<'_>,
) -> (Delivery, impl Future<Output = Settled>) {
    let partition = message.partition();
    let offset = message.offset();
    let id = format!("{}-{}-{}", message.topic(), partition, offset);

    let mut attributes = HashMap::new();
    if let Some(headers) = message.headers() {
        for header in headers.iter() {
            let value = header
                .value
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default();
            drop(attributes.insert(header.key.to_owned(), value));
        }
    }

    let attempt = attempts.get(&id).copied().unwrap_or(0) + 1;
    let generation = tracker.track(partition, offset);

    let (delivery, receiver) = Delivery::new(InboundMessage {
        id: id.clone(),
        payload: message.payload().unwrap_or_default().to_vec(),
        attributes,
        attempt,
    });
    let settled = async move {
        Settled {
            partition,
            offset,
            generation,
            id,
            verdict: receiver.verdict().await,
        }
    };
    (delivery, settled)
}

/// Runs `work` on its own task and then awaits `settled`. A panic in `work`
/// drops its delivery, which settles as a nack instead of losing the offset.
async fn isolate<W, S>(work: W, settled: S) -> S::Output
where
    W: Future<Output = ()> + Send + 'static,
    S: Future,
{
    let work = tokio::spawn(work);
    let settled = settled.await;
    if let Err(err) = work.await {
        error!("message processing panicked: {}", err);
    }
    settled
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use object_store::memory::InMemory;
    use object_store::path::Path as ObjectPath;
    use object_store::ObjectStore;
    use rdkafka::config::ClientConfig;
    use rdkafka::mocking::MockCluster;
    use rdkafka::producer::{FutureProducer, FutureRecord};
    use stackex_common::codec::AvroCodec;
    use stackex_common::health::HealthRegistry;
    use stackex_common::kafka::KafkaConfig;
    use stackex_common::record::Record;
    use stackex_common::schema::RecordDescriptor;
    use tokio::sync::oneshot;

    use super::{isolate, subscribe, PullLoop};
    use crate::delivery::{Delivery, InboundMessage, Verdict};
    use crate::pipeline::ConsumerPipeline;
    use crate::storage::ObjectSink;

    const TOPIC: &str = "stackex-questions";

    fn question(id: i64) -> Record {
        Record::new()
            .with("question_id", id)
            .with("title", "Consumer groups and seeks")
            .with("link", format!("https://stackoverflow.com/q/{id}"))
            .with("score", 1i32)
            .with("creation_date", 1_700_000_000i64)
            .with("answer_count", 0i32)
            .with("is_answered", false)
            .with("view_count", 3i32)
            .with("tags", vec!["kafka"])
    }

    async fn wait_for(store: &InMemory, keys: &[&str]) -> bool {
        for _ in 0..300 {
            let mut found = 0;
            for key in keys {
                if store.head(&ObjectPath::from(*key)).await.is_ok() {
                    found += 1;
                }
            }
            if found == keys.len() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[tokio::test]
    async fn panicking_work_settles_as_nack() {
        let (delivery, receiver) = Delivery::new(InboundMessage {
            id: "stackex-questions-0-7".to_owned(),
            payload: vec![],
            attributes: Default::default(),
            attempt: 1,
        });
        let work = async move {
            let (_message, _handle) = delivery.into_parts();
            panic!("storage client bug");
        };

        assert_eq!(isolate(work, receiver.verdict()).await, Verdict::Nack);
    }

    #[tokio::test]
    async fn stores_valid_messages_and_quarantines_poison_ones() {
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        cluster.create_topic(TOPIC, 1, 1).expect("failed to create topic");

        let codec = Arc::new(AvroCodec::new(RecordDescriptor::question()).unwrap());
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", cluster.bootstrap_servers())
            .create()
            .unwrap();
        let payloads = [
            codec.encode(&question(1)).unwrap(),
            b"not avro".to_vec(),
            codec.encode(&question(2)).unwrap(),
        ];
        for payload in &payloads {
            producer
                .send(
                    FutureRecord::<(), _>::to(TOPIC).payload(payload),
                    Duration::from_secs(5),
                )
                .await
                .expect("failed to produce");
        }

        let store = Arc::new(InMemory::new());
        let pipeline = ConsumerPipeline::new(codec, ObjectSink::new(store.clone(), "gs://bucket"))
            .with_max_redeliveries(2);

        let kafka = KafkaConfig {
            kafka_hosts: cluster.bootstrap_servers(),
            kafka_tls: false,
            kafka_producer_linger_ms: 0,
            kafka_producer_queue_mib: 50,
            kafka_message_timeout_ms: 500,
            kafka_compression_codec: "none".to_owned(),
        };
        let consumer = subscribe(&kafka, TOPIC, "stackex-test", 10000, None).unwrap();
        let registry = HealthRegistry::new("liveness");
        let pull = PullLoop::new(
            consumer,
            TOPIC.to_owned(),
            Arc::new(pipeline),
            4,
            registry.register("pull_loop", time::Duration::seconds(30)),
        );

        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(pull.run(async {
            _ = stopped.await;
        }));

        let stored = wait_for(
            &store,
            &[
                "json/stackex-questions-0-0.json",
                "json/stackex-questions-0-2.json",
                "dead-letter/stackex-questions-0-1.avro",
            ],
        )
        .await;

        _ = stop.send(());
        handle.await.unwrap();
        assert!(stored, "expected both records stored and the poison message quarantined");

        let parked = store
            .get(&ObjectPath::from("dead-letter/stackex-questions-0-1.avro"))
            .await
            .unwrap();
        assert_eq!(parked.bytes().await.unwrap().as_ref(), b"not avro");
        assert!(registry.get_status().healthy);
    }
}
