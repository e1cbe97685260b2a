//! Fetch one page of Stack Exchange questions and publish them to Kafka.
use std::sync::Arc;

use anyhow::anyhow;
use envconfig::Envconfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stackex_common::codec::AvroCodec;
use stackex_common::schema::RecordDescriptor;
use stackex_common::time::SystemTime;
use stackex_producer::config::Config;
use stackex_producer::fetch::StackExchangeClient;
use stackex_producer::pipeline::{simulate_invalid_last, ProducerPipeline};
use stackex_producer::publisher::{KafkaPublisher, PrintPublisher, Publisher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::init_from_env().map_err(|e| anyhow!("invalid configuration: {e}"))?;

    let codec = Arc::new(AvroCodec::new(RecordDescriptor::question())?);
    let client = StackExchangeClient::new(config.stackex.clone())?;

    let mut items = client.fetch_questions().await?;
    if config.simulate_invalid_last {
        simulate_invalid_last(&mut items);
    }

    let kafka = if config.print_sink {
        None
    } else {
        Some(Arc::new(KafkaPublisher::new(
            &config.kafka,
            config.kafka_topic.0.clone(),
            config.kafka_dlq_topic.0.clone(),
            config.publish_timeout.0,
            None,
        )?))
    };
    let publisher: Arc<dyn Publisher + Send + Sync> = match &kafka {
        Some(kafka) => kafka.clone(),
        None => Arc::new(PrintPublisher {}),
    };

    let pipeline = ProducerPipeline::new(
        codec,
        publisher,
        Arc::new(SystemTime {}),
        config.source_tag,
        config.schema_version,
        config.pacing_delay.0,
    );
    let report = pipeline.run(&items).await;

    if let Some(kafka) = kafka {
        kafka.flush()?;
    }

    info!("{}", report);
    Ok(())
}
