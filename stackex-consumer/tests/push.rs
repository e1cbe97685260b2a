use std::sync::Arc;

use assert_json_diff::assert_json_eq;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::TryStreamExt;
use http_body_util::BodyExt;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use serde_json::{json, Value};
use stackex_common::codec::AvroCodec;
use stackex_common::health::HealthRegistry;
use stackex_common::record::Record;
use stackex_common::schema::RecordDescriptor;
use stackex_consumer::pipeline::ConsumerPipeline;
use stackex_consumer::push::router;
use stackex_consumer::storage::ObjectSink;
use tower::ServiceExt;

const PARQUET_KEY: &str = "parquet/year=2023/month=11/day=14/hour=22/part-00000042.parquet";

fn codec() -> Arc<AvroCodec> {
    Arc::new(AvroCodec::new(RecordDescriptor::question()).unwrap())
}

fn encoded_question() -> Vec<u8> {
    let record = Record::new()
        .with("question_id", 42i64)
        .with("title", "How to write parquet from rust?")
        .with("link", "https://stackoverflow.com/q/42")
        .with("score", 7i32)
        .with("creation_date", 1_700_000_000i64)
        .with("answer_count", 2i32)
        .with("is_answered", true)
        .with("view_count", 120i32)
        .with("tags", vec!["rust", "parquet"])
        .with(
            "owner",
            Record::new()
                .with("user_id", 9i64)
                .with("display_name", "ferris"),
        );
    codec().encode(&record).unwrap()
}

fn setup(max_redeliveries: u32) -> (Router, Arc<InMemory>) {
    let store = Arc::new(InMemory::new());
    let pipeline = ConsumerPipeline::new(codec(), ObjectSink::new(store.clone(), "gs://bucket"))
        .with_max_redeliveries(max_redeliveries);
    let app = router(Arc::new(pipeline), HealthRegistry::new("liveness"), None);
    (app, store)
}

fn envelope(data: &str, message_id: &str) -> Value {
    json!({
        "message": {
            "data": data,
            "messageId": message_id,
            "attributes": {"encoding": "avro", "schema_version": "v1"},
        },
        "subscription": "projects/stackex/subscriptions/questions-push",
    })
}

async fn push(app: &Router, body: String) -> (StatusCode, String) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/pubsub/push")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}

async fn keys(store: &InMemory) -> Vec<String> {
    let mut keys: Vec<String> = store
        .list(None)
        .map_ok(|meta| meta.location.to_string())
        .try_collect()
        .await
        .unwrap();
    keys.sort();
    keys
}

#[tokio::test]
async fn index_and_readiness() {
    let (app, _) = setup(0);
    for uri in ["/", "/_readiness"] {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"stackex-consumer");
    }
}

#[tokio::test]
async fn stores_pushed_messages() {
    let (app, store) = setup(0);
    let data = STANDARD.encode(encoded_question());

    let (status, _) = push(&app, envelope(&data, "1001").to_string()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(keys(&store).await, vec!["json/1001.json", PARQUET_KEY]);

    let raw = store
        .get(&ObjectPath::from("json/1001.json"))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    let raw: Value = serde_json::from_slice(&raw).unwrap();
    assert_json_eq!(
        raw,
        json!({
            "question_id": 42,
            "title": "How to write parquet from rust?",
            "link": "https://stackoverflow.com/q/42",
            "score": 7,
            "creation_date": 1_700_000_000,
            "answer_count": 2,
            "is_answered": true,
            "view_count": 120,
            "tags": ["rust", "parquet"],
            "last_activity_date": null,
            "content_license": null,
            "owner": {
                "account_id": null,
                "user_id": 9,
                "reputation": null,
                "user_type": null,
                "display_name": "ferris",
                "profile_image": null,
                "link": null,
            },
        })
    );
}

#[tokio::test]
async fn redelivery_overwrites_the_same_objects() {
    let (app, store) = setup(0);
    let body = envelope(&STANDARD.encode(encoded_question()), "1001").to_string();

    for _ in 0..2 {
        let (status, _) = push(&app, body.clone()).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
    assert_eq!(keys(&store).await, vec!["json/1001.json", PARQUET_KEY]);
}

#[tokio::test]
async fn rejects_envelopes_without_message() {
    let (app, store) = setup(0);

    let (status, body) = push(&app, json!({"subscription": "s"}).to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "envelope carries no message");
    assert!(keys(&store).await.is_empty());
}

#[tokio::test]
async fn rejects_malformed_envelopes() {
    let (app, _) = setup(0);

    let (status, _) = push(&app, "{\"message\": ".to_owned()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = push(&app, json!({"message": {"data": "AQID"}}).to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn rejects_invalid_base64() {
    let (app, store) = setup(0);

    let (status, body) = push(&app, envelope("%%% not base64 %%%", "1002").to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.starts_with("message data is not valid base64"));
    assert!(keys(&store).await.is_empty());
}

#[tokio::test]
async fn rejects_undecodable_payloads() {
    let (app, store) = setup(0);

    let data = STANDARD.encode(b"definitely not avro");
    let (status, body) = push(&app, envelope(&data, "1003").to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.starts_with("decode failed"));
    assert!(keys(&store).await.is_empty());

    let (status, _) = push(&app, envelope("", "1004").to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn quarantines_on_the_last_delivery_attempt() {
    let (app, store) = setup(5);
    let data = STANDARD.encode(b"definitely not avro");

    let mut body = envelope(&data, "1005");
    body["deliveryAttempt"] = json!(4);
    let (status, _) = push(&app, body.to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    body["deliveryAttempt"] = json!(5);
    let (status, _) = push(&app, body.to_string()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(keys(&store).await, vec!["dead-letter/1005.avro"]);
}
