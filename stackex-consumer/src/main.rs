//! Store Stack Exchange questions from the bus as JSON and Parquet objects.
use std::future::ready;
use std::sync::Arc;

use anyhow::anyhow;
use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stackex_common::codec::AvroCodec;
use stackex_common::health::HealthRegistry;
use stackex_common::metrics::{serve, setup_metrics_recorder, with_metrics_route};
use stackex_common::schema::RecordDescriptor;
use stackex_consumer::config::{Config, DeliveryMode};
use stackex_consumer::pipeline::ConsumerPipeline;
use stackex_consumer::pull::{subscribe, PullLoop};
use stackex_consumer::push::router;
use stackex_consumer::storage::{store_from_url, ObjectSink};
use stackex_consumer::warehouse::BigQueryWarehouse;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("shutting down gracefully...");
}

async fn index() -> &'static str {
    "stackex-consumer"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::init_from_env().map_err(|e| anyhow!("invalid configuration: {e}"))?;

    let recorder = if config.export_prometheus {
        Some(setup_metrics_recorder()?)
    } else {
        None
    };

    let codec = Arc::new(AvroCodec::new(RecordDescriptor::question())?);
    let store = store_from_url(config.storage_url.as_str())?;

    let mut pipeline = ConsumerPipeline::new(codec, ObjectSink::new(store, config.storage_url.as_str()))
        .with_prefixes(
            &config.json_prefix,
            &config.columnar_prefix,
            &config.dead_letter_prefix,
        )
        .with_io_timeout(config.io_timeout.0)
        .with_max_redeliveries(config.max_redeliveries);
    if config.warehouse.warehouse_enabled {
        info!(
            "appending to warehouse table {}.{}",
            config.warehouse.warehouse_dataset, config.warehouse.warehouse_table
        );
        pipeline = pipeline.with_warehouse(Arc::new(BigQueryWarehouse::new(&config.warehouse)?));
    }
    let pipeline = Arc::new(pipeline);

    let liveness = HealthRegistry::new("liveness");
    let bind = config.address.to_string();

    match config.delivery_mode {
        DeliveryMode::Push => {
            // Push mode has no loop of its own: report from the runtime
            let heartbeat = liveness.register("runtime", time::Duration::seconds(30));
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_secs(10));
                loop {
                    _ = interval.tick().await;
                    heartbeat.report_healthy();
                }
            });
            let app = router(pipeline, liveness, recorder);
            info!("listening for pushed messages on {}", bind);
            serve(app, &bind, shutdown()).await?;
        }
        DeliveryMode::Pull => {
            let consumer = subscribe(
                &config.kafka,
                &config.kafka_topic,
                &config.kafka_consumer_group,
                config.kafka_session_timeout_ms,
                Some(liveness.register("rdkafka", time::Duration::seconds(30))),
            )?;
            let pull = PullLoop::new(
                consumer,
                config.kafka_topic.clone(),
                pipeline,
                config.max_concurrent_messages,
                liveness.register("pull_loop", time::Duration::seconds(30)),
            );

            let status = liveness.clone();
            let app = Router::new()
                .route("/", get(index))
                .route("/_readiness", get(index))
                .route("/_liveness", get(move || ready(status.get_status())));
            let app = match recorder {
                Some(recorder) => with_metrics_route(app, recorder),
                None => app,
            };

            let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
            let server = tokio::spawn(async move {
                serve(app, &bind, async {
                    _ = stopped.await;
                })
                .await
            });

            pull.run(shutdown()).await;
            _ = stop.send(());
            server.await??;
        }
    }

    Ok(())
}
