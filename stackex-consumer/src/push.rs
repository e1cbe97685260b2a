use std::future::ready;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use metrics_exporter_prometheus::PrometheusHandle;
use stackex_common::health::HealthRegistry;
use stackex_common::metrics::{track_metrics, with_metrics_route};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::instrument;

use crate::api::{ApiError, PushEnvelope};
use crate::delivery::{Delivery, InboundMessage, Verdict};
use crate::pipeline::ConsumerPipeline;

/// Push subscriptions cap messages at 10 MB, plus envelope overhead.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct PushState {
    pub pipeline: Arc<ConsumerPipeline>,
}

async fn index() -> &'static str {
    "stackex-consumer"
}

pub fn router(
    pipeline: Arc<ConsumerPipeline>,
    liveness: HealthRegistry,
    metrics: Option<PrometheusHandle>,
) -> Router {
    let state = PushState { pipeline };

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route("/pubsub/push", post(push))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state);

    match metrics {
        Some(handle) => with_metrics_route(router, handle),
        None => router,
    }
}

/// Accepts one pushed message and answers only once the pipeline settled it.
#[instrument(skip_all, fields(subscription))]
pub async fn push(State(state): State<PushState>, body: Bytes) -> Result<StatusCode, ApiError> {
    let envelope: PushEnvelope = serde_json::from_slice(&body)?;
    if let Some(subscription) = &envelope.subscription {
        tracing::Span::current().record("subscription", subscription.as_str());
    }

    let message = envelope.message.ok_or(ApiError::MissingMessage)?;
    let id = message
        .message_id
        .filter(|id| !id.is_empty())
        .ok_or(ApiError::MissingMessageId)?;
    let payload = match message.data {
        Some(data) => STANDARD.decode(data)?,
        None => Vec::new(),
    };

    let (delivery, verdict) = Delivery::new(InboundMessage {
        id,
        payload,
        attributes: message.attributes,
        attempt: envelope.delivery_attempt.unwrap_or(1).max(1),
    });

    let outcome = state.pipeline.process(delivery).await;
    match verdict.verdict().await {
        Verdict::Ack => Ok(StatusCode::NO_CONTENT),
        Verdict::Nack => Err(outcome.err().map_or(ApiError::NotAcknowledged, ApiError::Processing)),
    }
}
