use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use stackex_common::codec::AvroCodec;
use stackex_common::error::{DecodeError, InvalidTimestamp, TransportError};
use stackex_common::partition::Partitioner;
use stackex_common::record::Record;
use stackex_common::schema::{CREATION_DATE, QUESTION_ID};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::columnar::{ColumnarError, ParquetEncoder};
use crate::delivery::{Delivery, InboundMessage};
use crate::storage::{ObjectSink, AVRO_CONTENT_TYPE, JSON_CONTENT_TYPE, PARQUET_CONTENT_TYPE};
use crate::warehouse::Warehouse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decode,
    RawCopy,
    Partition,
    Columnar,
    Warehouse,
    Quarantine,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Decode => "decode",
            Stage::RawCopy => "raw_copy",
            Stage::Partition => "partition",
            Stage::Columnar => "columnar",
            Stage::Warehouse => "warehouse",
            Stage::Quarantine => "quarantine",
        }
    }
}

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("{} failed: {source}", .stage.as_str())]
    Transport {
        stage: Stage,
        source: TransportError,
    },
    #[error("cannot partition record: {0}")]
    InvalidTimestamp(#[from] InvalidTimestamp),
    #[error("columnar encoding failed: {0}")]
    Columnar(#[from] ColumnarError),
    #[error("json rendering failed: {0}")]
    Json(#[from] serde_json::Error),
    /// The raw copy was stored but a later step failed.
    #[error("stored {raw_key} then failed: {source}")]
    PartialFailure {
        raw_key: String,
        source: Box<ConsumerError>,
    },
}

impl ConsumerError {
    pub fn stage(&self) -> Stage {
        match self {
            ConsumerError::Decode(_) => Stage::Decode,
            ConsumerError::Transport { stage, .. } => *stage,
            ConsumerError::InvalidTimestamp(_) => Stage::Partition,
            ConsumerError::Columnar(_) => Stage::Columnar,
            ConsumerError::Json(_) => Stage::RawCopy,
            ConsumerError::PartialFailure { source, .. } => source.stage(),
        }
    }
}

/// How a delivery was settled when it was acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    Stored {
        raw_key: String,
        columnar_key: String,
    },
    /// Failed too many times, parked under the dead-letter prefix.
    Quarantined { key: String, reason: String },
}

/// Decode, store and acknowledge: the single code path behind both transports.
pub struct ConsumerPipeline {
    codec: Arc<AvroCodec>,
    encoder: ParquetEncoder,
    sink: ObjectSink,
    partitioner: Partitioner,
    warehouse: Option<Arc<dyn Warehouse + Send + Sync>>,
    json_prefix: String,
    dead_letter_prefix: String,
    io_timeout: Duration,
    max_redeliveries: u32,
}

impl ConsumerPipeline {
    pub fn new(codec: Arc<AvroCodec>, sink: ObjectSink) -> Self {
        let encoder = ParquetEncoder::new(codec.descriptor().clone());
        Self {
            codec,
            encoder,
            sink,
            partitioner: Partitioner::default(),
            warehouse: None,
            json_prefix: "json".to_owned(),
            dead_letter_prefix: "dead-letter".to_owned(),
            io_timeout: Duration::from_secs(30),
            max_redeliveries: 0,
        }
    }

    pub fn with_prefixes(mut self, json: &str, columnar: &str, dead_letter: &str) -> Self {
        self.json_prefix = json.trim_end_matches('/').to_owned();
        self.partitioner = Partitioner::new(columnar);
        self.dead_letter_prefix = dead_letter.trim_end_matches('/').to_owned();
        self
    }

    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    /// Deliveries failing at or past this attempt are quarantined, 0 never quarantines.
    pub fn with_max_redeliveries(mut self, max_redeliveries: u32) -> Self {
        self.max_redeliveries = max_redeliveries;
        self
    }

    pub fn with_warehouse(mut self, warehouse: Arc<dyn Warehouse + Send + Sync>) -> Self {
        self.warehouse = Some(warehouse);
        self
    }

    pub fn raw_key(&self, message_id: &str) -> String {
        format!("{}/{}.json", self.json_prefix, message_id)
    }

    pub fn dead_letter_key(&self, message_id: &str) -> String {
        format!("{}/{}.avro", self.dead_letter_prefix, message_id)
    }

    /// Runs one delivery to completion and settles it: ack on success or
    /// quarantine, nack otherwise.
    #[instrument(skip_all, fields(message_id = %delivery.message().id, attempt = delivery.message().attempt))]
    pub async fn process(&self, delivery: Delivery) -> Result<Processed, ConsumerError> {
        let (message, handle) = delivery.into_parts();

        let err = match self.store(&message).await {
            Ok((raw_key, columnar_key)) => {
                handle.ack();
                counter!("stackex_consumer_messages_total", "outcome" => "stored").increment(1);
                info!("stored {} and {}", raw_key, columnar_key);
                return Ok(Processed::Stored {
                    raw_key,
                    columnar_key,
                });
            }
            Err(err) => err,
        };

        warn!("processing failed at {}: {}", err.stage().as_str(), err);

        if self.max_redeliveries > 0 && message.attempt >= self.max_redeliveries {
            match self.quarantine(&message).await {
                Ok(key) => {
                    handle.ack();
                    counter!("stackex_consumer_messages_total", "outcome" => "quarantined")
                        .increment(1);
                    error!("quarantined after {} attempts at {}", message.attempt, key);
                    return Ok(Processed::Quarantined {
                        key,
                        reason: err.to_string(),
                    });
                }
                Err(quarantine_err) => {
                    error!("failed to quarantine: {}", quarantine_err);
                }
            }
        }

        handle.nack();
        counter!("stackex_consumer_messages_total", "outcome" => "nacked").increment(1);
        Err(err)
    }

    async fn store(&self, message: &InboundMessage) -> Result<(String, String), ConsumerError> {
        let started = Instant::now();
        let record = self.codec.decode(&message.payload)?;
        record_duration(Stage::Decode, started);

        let json = serde_json::to_vec(&self.codec.to_json(&record))?;
        let raw_key = self.raw_key(&message.id);
        drop(self
            .bounded(Stage::RawCopy, async {
                self.sink
                    .put(&raw_key, json, JSON_CONTENT_TYPE)
                    .await
                    .map_err(|e| TransportError::Storage(e.to_string()))
            })
            .await?);

        match self.store_columnar(&record).await {
            Ok(columnar_key) => Ok((raw_key, columnar_key)),
            Err(source) => Err(ConsumerError::PartialFailure {
                raw_key,
                source: Box::new(source),
            }),
        }
    }

    async fn store_columnar(&self, record: &Record) -> Result<String, ConsumerError> {
        let creation_date = required_long(record, CREATION_DATE)?;
        let question_id = required_long(record, QUESTION_ID)?;
        let columnar_key = self.partitioner.path(creation_date, question_id)?;

        let started = Instant::now();
        let parquet = self.encoder.encode_one(record)?;
        record_duration(Stage::Columnar, started);

        let object_uri = self
            .bounded(Stage::Columnar, async {
                self.sink
                    .put(&columnar_key, parquet, PARQUET_CONTENT_TYPE)
                    .await
                    .map_err(|e| TransportError::Storage(e.to_string()))
            })
            .await?;

        if let Some(warehouse) = &self.warehouse {
            self.bounded(Stage::Warehouse, async {
                warehouse
                    .append(&object_uri)
                    .await
                    .map_err(|e| TransportError::Warehouse(e.to_string()))
            })
            .await?;
        }

        Ok(columnar_key)
    }

    async fn quarantine(&self, message: &InboundMessage) -> Result<String, ConsumerError> {
        let key = self.dead_letter_key(&message.id);
        drop(self
            .bounded(Stage::Quarantine, async {
                self.sink
                    .put(&key, message.payload.clone(), AVRO_CONTENT_TYPE)
                    .await
                    .map_err(|e| TransportError::Storage(e.to_string()))
            })
            .await?);
        Ok(key)
    }

    /// Runs one I/O step under `io_timeout` and records its duration.
    async fn bounded<T, F>(&self, stage: Stage, step: F) -> Result<T, ConsumerError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.io_timeout, step).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.io_timeout)),
        };
        record_duration(stage, started);
        result.map_err(|source| ConsumerError::Transport { stage, source })
    }
}

fn record_duration(stage: Stage, started: Instant) {
    histogram!("stackex_consumer_stage_duration_seconds", "stage" => stage.as_str())
        .record(started.elapsed().as_secs_f64());
}

fn required_long(record: &Record, field: &str) -> Result<i64, ConsumerError> {
    record.get_long(field).ok_or_else(|| {
        ConsumerError::Decode(DecodeError::SchemaMismatch {
            field: field.to_owned(),
            found: "null".to_owned(),
        })
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use object_store::memory::InMemory;
    use object_store::path::Path as ObjectPath;
    use object_store::ObjectStore;
    use stackex_common::codec::AvroCodec;
    use stackex_common::error::TransportError;
    use stackex_common::record::Record;
    use stackex_common::schema::RecordDescriptor;

    use super::{ConsumerError, ConsumerPipeline, Processed, Stage};
    use crate::delivery::{Delivery, InboundMessage, Verdict};
    use crate::storage::ObjectSink;
    use crate::warehouse::{Warehouse, WarehouseError};

    fn codec() -> Arc<AvroCodec> {
        Arc::new(AvroCodec::new(RecordDescriptor::question()).unwrap())
    }

    fn payload(creation_date: i64) -> Vec<u8> {
        let record = Record::new()
            .with("question_id", 42i64)
            .with("title", "How do I partition by hour?")
            .with("link", "https://stackoverflow.com/q/42")
            .with("score", 3i32)
            .with("creation_date", creation_date)
            .with("answer_count", 1i32)
            .with("is_answered", true)
            .with("view_count", 12i32)
            .with("tags", vec!["parquet"]);
        codec().encode(&record).unwrap()
    }

    fn message(payload: Vec<u8>, attempt: u32) -> InboundMessage {
        InboundMessage {
            id: "m-1".to_owned(),
            payload,
            attributes: HashMap::new(),
            attempt,
        }
    }

    #[derive(Default)]
    struct RecordingWarehouse {
        appended: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Warehouse for RecordingWarehouse {
        async fn append(&self, object_uri: &str) -> Result<(), WarehouseError> {
            if self.fail {
                return Err(WarehouseError::MissingProject);
            }
            self.appended.lock().unwrap().push(object_uri.to_owned());
            Ok(())
        }
    }

    #[tokio::test]
    async fn stores_then_acks() {
        let store = Arc::new(InMemory::new());
        let warehouse = Arc::new(RecordingWarehouse::default());
        let pipeline = ConsumerPipeline::new(codec(), ObjectSink::new(store.clone(), "gs://bucket"))
            .with_warehouse(warehouse.clone());

        let (delivery, verdict) = Delivery::new(message(payload(1_700_000_000), 1));
        let processed = pipeline.process(delivery).await.unwrap();

        let columnar_key = "parquet/year=2023/month=11/day=14/hour=22/part-00000042.parquet";
        assert_eq!(
            processed,
            Processed::Stored {
                raw_key: "json/m-1.json".to_owned(),
                columnar_key: columnar_key.to_owned(),
            }
        );
        assert_eq!(verdict.verdict().await, Verdict::Ack);
        assert!(store.head(&ObjectPath::from(columnar_key)).await.is_ok());
        assert_eq!(
            *warehouse.appended.lock().unwrap(),
            vec![format!("gs://bucket/{columnar_key}")]
        );
    }

    #[tokio::test]
    async fn nacks_undecodable_payloads_without_writing() {
        let store = Arc::new(InMemory::new());
        let pipeline = ConsumerPipeline::new(codec(), ObjectSink::new(store.clone(), "gs://bucket"));

        let (delivery, verdict) = Delivery::new(message(vec![0xff, 0xff, 0xff], 1));
        let err = pipeline.process(delivery).await.unwrap_err();

        assert_eq!(err.stage(), Stage::Decode);
        assert_eq!(verdict.verdict().await, Verdict::Nack);
        assert!(store.head(&ObjectPath::from("json/m-1.json")).await.is_err());
    }

    #[tokio::test]
    async fn failures_after_the_raw_copy_are_partial() {
        let store = Arc::new(InMemory::new());
        let pipeline = ConsumerPipeline::new(codec(), ObjectSink::new(store.clone(), "gs://bucket"));

        let (delivery, verdict) = Delivery::new(message(payload(-5), 1));
        let err = pipeline.process(delivery).await.unwrap_err();

        assert!(matches!(
            &err,
            ConsumerError::PartialFailure { raw_key, .. } if raw_key == "json/m-1.json"
        ));
        assert_eq!(err.stage(), Stage::Partition);
        assert_eq!(verdict.verdict().await, Verdict::Nack);
    }

    #[tokio::test]
    async fn warehouse_failures_nack() {
        let store = Arc::new(InMemory::new());
        let warehouse = Arc::new(RecordingWarehouse {
            fail: true,
            ..Default::default()
        });
        let pipeline = ConsumerPipeline::new(codec(), ObjectSink::new(store, "gs://bucket"))
            .with_warehouse(warehouse);

        let (delivery, verdict) = Delivery::new(message(payload(1_700_000_000), 1));
        let err = pipeline.process(delivery).await.unwrap_err();

        assert_eq!(err.stage(), Stage::Warehouse);
        assert!(matches!(
            err,
            ConsumerError::PartialFailure { source, .. }
                if matches!(*source, ConsumerError::Transport { source: TransportError::Warehouse(_), .. })
        ));
        assert_eq!(verdict.verdict().await, Verdict::Nack);
    }

    #[tokio::test]
    async fn quarantines_at_the_last_attempt() {
        let store = Arc::new(InMemory::new());
        let pipeline = ConsumerPipeline::new(codec(), ObjectSink::new(store.clone(), "gs://bucket"))
            .with_prefixes("raw", "columns", "parked/")
            .with_max_redeliveries(3)
            .with_io_timeout(Duration::from_secs(5));

        let (delivery, verdict) = Delivery::new(message(vec![1], 2));
        assert!(pipeline.process(delivery).await.is_err());
        assert_eq!(verdict.verdict().await, Verdict::Nack);

        let (delivery, verdict) = Delivery::new(message(vec![1], 3));
        let processed = pipeline.process(delivery).await.unwrap();
        assert!(matches!(
            processed,
            Processed::Quarantined { ref key, .. } if key == "parked/m-1.avro"
        ));
        assert_eq!(verdict.verdict().await, Verdict::Ack);

        let parked = store.get(&ObjectPath::from("parked/m-1.avro")).await.unwrap();
        assert_eq!(parked.bytes().await.unwrap().as_ref(), &[1]);
    }
}
