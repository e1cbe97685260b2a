use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde_json::Value;
use stackex_common::codec::AvroCodec;
use stackex_common::error::{SchemaViolation, TransportError};
use stackex_common::schema::{QUESTION_ID, TITLE};
use stackex_common::time::TimeSource;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::publisher::{OutboundMessage, Publisher, Topic};
use crate::transform::{transform, ValidationError};

pub const ENCODING: &str = "avro";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedStage {
    Transform,
    Encode,
    Publish,
}

impl FailedStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailedStage::Transform => "transform",
            FailedStage::Encode => "encode",
            FailedStage::Publish => "publish",
        }
    }
}

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("transform failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("encode failed: {0}")]
    Schema(#[from] SchemaViolation),
    #[error("publish failed: {0}")]
    Transport(#[from] TransportError),
}

impl ProducerError {
    pub fn stage(&self) -> FailedStage {
        match self {
            ProducerError::Validation(_) => FailedStage::Transform,
            ProducerError::Schema(_) => FailedStage::Encode,
            ProducerError::Transport(_) => FailedStage::Publish,
        }
    }
}

/// What happened to one upstream item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Published {
        index: usize,
        message_id: String,
    },
    DeadLettered {
        index: usize,
        stage: FailedStage,
        reason: String,
        message_id: String,
    },
    /// The dead-letter publish failed too.
    Lost {
        index: usize,
        stage: FailedStage,
        reason: String,
        dead_letter_error: String,
    },
}

impl ItemOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ItemOutcome::Published { .. } => "published",
            ItemOutcome::DeadLettered { .. } => "dead_lettered",
            ItemOutcome::Lost { .. } => "lost",
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub published: Vec<ItemOutcome>,
    pub dead_lettered: Vec<ItemOutcome>,
    pub lost: Vec<ItemOutcome>,
}

impl BatchReport {
    pub fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Published { .. } => self.published.push(outcome),
            ItemOutcome::DeadLettered { .. } => self.dead_lettered.push(outcome),
            ItemOutcome::Lost { .. } => self.lost.push(outcome),
        }
    }

    pub fn total(&self) -> usize {
        self.published.len() + self.dead_lettered.len() + self.lost.len()
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} items: {} published, {} dead-lettered, {} lost",
            self.total(),
            self.published.len(),
            self.dead_lettered.len(),
            self.lost.len()
        )
    }
}

/// Sequential transform, encode and publish loop with a dead-letter fallback.
pub struct ProducerPipeline {
    codec: Arc<AvroCodec>,
    publisher: Arc<dyn Publisher + Send + Sync>,
    timesource: Arc<dyn TimeSource + Send + Sync>,
    source: String,
    schema_version: String,
    pacing_delay: Duration,
}

impl ProducerPipeline {
    pub fn new(
        codec: Arc<AvroCodec>,
        publisher: Arc<dyn Publisher + Send + Sync>,
        timesource: Arc<dyn TimeSource + Send + Sync>,
        source: String,
        schema_version: String,
        pacing_delay: Duration,
    ) -> Self {
        Self {
            codec,
            publisher,
            timesource,
            source,
            schema_version,
            pacing_delay,
        }
    }

    #[instrument(skip_all, fields(items = items.len()))]
    pub async fn run(&self, items: &[Value]) -> BatchReport {
        let mut report = BatchReport::default();
        let total = items.len();

        for (index, item) in items.iter().enumerate() {
            info!("processing item {}/{}", index + 1, total);
            let outcome = self.process(index, item).await;
            counter!("stackex_producer_items_total", "outcome" => outcome.label()).increment(1);

            let published = matches!(outcome, ItemOutcome::Published { .. });
            report.record(outcome);

            // Upstream rate limits: pace successful publishes, but never after the last item
            if published && index + 1 < total && !self.pacing_delay.is_zero() {
                tokio::time::sleep(self.pacing_delay).await;
            }
        }

        info!("done: {}", report);
        report
    }

    pub async fn process(&self, index: usize, item: &Value) -> ItemOutcome {
        let err = match self.publish_main(item).await {
            Ok(message_id) => {
                info!("published item {} to main topic: {}", index, message_id);
                return ItemOutcome::Published { index, message_id };
            }
            Err(err) => err,
        };

        let stage = err.stage();
        let reason = err.to_string();
        warn!("item {} failed at {}: {}", index, stage.as_str(), reason);

        match self.publish_dead_letter(item, stage, &reason).await {
            Ok(message_id) => {
                info!("published item {} to dead-letter topic: {}", index, message_id);
                ItemOutcome::DeadLettered {
                    index,
                    stage,
                    reason,
                    message_id,
                }
            }
            Err(dead_letter_error) => {
                error!(
                    "item {} lost, dead-letter publish failed: {}",
                    index, dead_letter_error
                );
                ItemOutcome::Lost {
                    index,
                    stage,
                    reason,
                    dead_letter_error: dead_letter_error.to_string(),
                }
            }
        }
    }

    async fn publish_main(&self, item: &Value) -> Result<String, ProducerError> {
        let record = transform(self.codec.descriptor(), item)?;
        let payload = self.codec.encode(&record)?;

        let message = OutboundMessage {
            payload,
            key: record.get_long(QUESTION_ID).map(|id| id.to_string()),
            attributes: BTreeMap::from([
                ("encoding".to_owned(), ENCODING.to_owned()),
                ("schema_version".to_owned(), self.schema_version.clone()),
                ("source".to_owned(), self.source.clone()),
            ]),
        };
        Ok(self.publisher.publish(Topic::Main, message).await?)
    }

    async fn publish_dead_letter(
        &self,
        item: &Value,
        stage: FailedStage,
        reason: &str,
    ) -> Result<String, TransportError> {
        let message = OutboundMessage {
            payload: item.to_string().into_bytes(),
            key: item.get(QUESTION_ID).and_then(Value::as_i64).map(|id| id.to_string()),
            attributes: BTreeMap::from([
                ("error_reason".to_owned(), reason.to_owned()),
                ("failed_stage".to_owned(), stage.as_str().to_owned()),
                ("source".to_owned(), self.source.clone()),
                ("timestamp".to_owned(), self.timesource.current_time()),
            ]),
        };
        self.publisher.publish(Topic::DeadLetter, message).await
    }
}

/// Strips required fields from the final item so the batch exercises the
/// dead-letter path.
pub fn simulate_invalid_last(items: &mut [Value]) {
    if let Some(Value::Object(last)) = items.last_mut() {
        warn!("simulating an invalid final item");
        last.remove(TITLE);
        last.remove(QUESTION_ID);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{simulate_invalid_last, BatchReport, FailedStage, ItemOutcome};

    #[test]
    fn strips_required_fields_from_the_last_item_only() {
        let mut items = vec![
            json!({"question_id": 1, "title": "first"}),
            json!({"question_id": 2, "title": "last", "score": 3}),
        ];
        simulate_invalid_last(&mut items);

        assert_eq!(items[0], json!({"question_id": 1, "title": "first"}));
        assert_eq!(items[1], json!({"score": 3}));

        let mut empty: Vec<serde_json::Value> = vec![];
        simulate_invalid_last(&mut empty);
        assert!(empty.is_empty());
    }

    #[test]
    fn report_sorts_outcomes() {
        let mut report = BatchReport::default();
        report.record(ItemOutcome::Published {
            index: 0,
            message_id: "t-0-0".to_owned(),
        });
        report.record(ItemOutcome::DeadLettered {
            index: 1,
            stage: FailedStage::Encode,
            reason: "bad".to_owned(),
            message_id: "dlq-0-0".to_owned(),
        });
        report.record(ItemOutcome::Lost {
            index: 2,
            stage: FailedStage::Publish,
            reason: "down".to_owned(),
            dead_letter_error: "down".to_owned(),
        });

        assert_eq!(report.total(), 3);
        assert_eq!(
            report.to_string(),
            "3 items: 1 published, 1 dead-lettered, 1 lost"
        );
    }
}
