mod common;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;
use sinkflow::config::generate::generate_starter_config;
use sinkflow::config::parse_config;
use sinkflow::config::types::{HttpMode, HttpWriterConfig, WriterConfig};
use sinkflow::delivery::{DeliveryController, DeliveryOutcome, DeliveryPolicy, Verdict};
use sinkflow::writer::{HttpWriter, Writer, WriterError};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
struct SeenRequest {
    path: String,
    idempotency_key: Option<String>,
    authorization: Option<String>,
    body: Value,
}

type Seen = Arc<Mutex<Vec<SeenRequest>>>;

fn remember(seen: &Seen, uri: &Uri, headers: &HeaderMap, body: Value) {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };
    seen.lock().unwrap().push(SeenRequest {
        path: uri.path().to_string(),
        idempotency_key: header("idempotency-key"),
        authorization: header("authorization"),
        body,
    });
}

async fn accept(State(seen): State<Seen>, uri: Uri, headers: HeaderMap, Json(body): Json<Value>) -> StatusCode {
    remember(&seen, &uri, &headers, body);
    StatusCode::OK
}

async fn panel(
    State(seen): State<Seen>,
    Path(id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    remember(&seen, &uri, &headers, body);
    if id == "p1" {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::CREATED
    }
}

/// A healthy endpoint with realistic latency
async fn reading(State(seen): State<Seen>, uri: Uri, headers: HeaderMap, Json(body): Json<Value>) -> StatusCode {
    tokio::time::sleep(Duration::from_millis(25)).await;
    remember(&seen, &uri, &headers, body);
    StatusCode::CREATED
}

async fn slow() -> StatusCode {
    tokio::time::sleep(Duration::from_secs(2)).await;
    StatusCode::OK
}

async fn start_server() -> (String, Seen) {
    let seen: Seen = Arc::default();
    let app = Router::new()
        .route("/ok", post(accept))
        .route("/panels/:id", post(panel))
        .route(
            "/busy",
            post(|| async { (StatusCode::TOO_MANY_REQUESTS, [("retry-after", "7")]) }),
        )
        .route("/unavailable", post(|| async { StatusCode::SERVICE_UNAVAILABLE }))
        .route("/broken", post(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
        .route(
            "/bad",
            post(|| async { (StatusCode::BAD_REQUEST, "power_output must be a number") }),
        )
        .route("/slow", post(slow))
        .route("/readings", post(reading))
        .with_state(seen.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), seen)
}

fn writer_config(url: String) -> HttpWriterConfig {
    HttpWriterConfig {
        url,
        mode: HttpMode::PerRecord,
        key_field: None,
        headers: BTreeMap::from([("Authorization".to_string(), "Bearer test-token".to_string())]),
        request_timeout: Duration::from_secs(5),
        backpressure_retry_after: Duration::from_secs(30),
    }
}

async fn attempt(config: HttpWriterConfig) -> DeliveryOutcome {
    let mut writer = HttpWriter::new(config).unwrap();
    writer.setup().await.unwrap();
    let outcome = writer.attempt(&common::batch(0, 0..3)).await.unwrap();
    writer.close().await.unwrap();
    outcome
}

#[tokio::test]
async fn test_per_record_success_sends_idempotency_keys() {
    let (base, seen) = start_server().await;

    let outcome = attempt(writer_config(format!("{}/ok", base))).await;

    assert_eq!(outcome, DeliveryOutcome::Success);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0].idempotency_key.as_deref(), Some("panel-0-0"));
    assert_eq!(seen[2].idempotency_key.as_deref(), Some("panel-0-2"));
    assert_eq!(seen[1].authorization.as_deref(), Some("Bearer test-token"));
    assert_eq!(seen[1].body["panel_id"], "p1");
}

#[tokio::test]
async fn test_too_many_requests_honours_retry_after() {
    let (base, _seen) = start_server().await;
    let outcome = attempt(writer_config(format!("{}/busy", base))).await;
    assert_eq!(outcome, DeliveryOutcome::Backpressure(Duration::from_secs(7)));
}

#[tokio::test]
async fn test_unavailable_without_header_uses_configured_pause() {
    let (base, _seen) = start_server().await;
    let outcome = attempt(writer_config(format!("{}/unavailable", base))).await;
    assert_eq!(outcome, DeliveryOutcome::Backpressure(Duration::from_secs(30)));
}

#[tokio::test]
async fn test_server_error_on_every_record_is_retryable() {
    let (base, _seen) = start_server().await;
    let outcome = attempt(writer_config(format!("{}/broken", base))).await;
    assert!(matches!(outcome, DeliveryOutcome::Retryable(reason) if reason.contains("500")));
}

#[tokio::test]
async fn test_client_error_is_fatal() {
    let (base, _seen) = start_server().await;
    match attempt(writer_config(format!("{}/bad", base))).await {
        DeliveryOutcome::Fatal(reason) => {
            assert!(reason.contains("offset 0"), "reason: {}", reason);
            assert!(reason.contains("400"));
            assert!(reason.contains("power_output must be a number"));
        }
        other => panic!("expected fatal outcome, got {:?}", other),
    }
}

#[tokio::test]
async fn test_per_record_failures_are_reported_by_index() {
    let (base, seen) = start_server().await;
    let mut config = writer_config(format!("{}/panels", base));
    config.key_field = Some("panel_id".to_string());

    let outcome = attempt(config).await;

    assert_eq!(outcome, DeliveryOutcome::PartialFailure(vec![1]));
    let paths: Vec<String> = seen.lock().unwrap().iter().map(|r| r.path.clone()).collect();
    assert_eq!(paths, vec!["/panels/p0", "/panels/p1", "/panels/p2"]);
}

#[tokio::test]
async fn test_bulk_mode_posts_one_array() {
    let (base, seen) = start_server().await;
    let mut config = writer_config(format!("{}/ok", base));
    config.mode = HttpMode::Bulk;

    let outcome = attempt(config).await;

    assert_eq!(outcome, DeliveryOutcome::Success);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].body.as_array().map(|a| a.len()), Some(3));
    assert_eq!(seen[0].idempotency_key.as_deref(), Some("solar[0]-0-2"));
}

#[tokio::test]
async fn test_request_timeout_is_backpressure() {
    let (base, _seen) = start_server().await;
    let mut config = writer_config(format!("{}/slow", base));
    config.request_timeout = Duration::from_millis(200);

    let outcome = attempt(config).await;

    assert_eq!(outcome, DeliveryOutcome::Backpressure(Duration::from_secs(30)));
}

#[tokio::test]
async fn test_setup_fails_when_unreachable() {
    // Grab a free port and release it so nothing is listening there
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut writer = HttpWriter::new(writer_config(format!("http://{}/ok", addr))).unwrap();
    let result = writer.setup().await;

    assert!(matches!(result, Err(WriterError::Connection(_))), "got {:?}", result);
}

#[tokio::test]
async fn test_attempt_before_setup_is_an_error() {
    let mut writer = HttpWriter::new(writer_config("http://127.0.0.1:9/ok".to_string())).unwrap();
    let result = writer.attempt(&common::batch(0, 0..1)).await;
    assert!(matches!(result, Err(WriterError::Connection(_))));
}

#[tokio::test]
async fn test_starter_config_acks_full_batch_against_healthy_server() {
    let (base, seen) = start_server().await;
    std::env::set_var("SINKFLOW_API_TOKEN", "starter-token");
    let config = parse_config(&generate_starter_config()).unwrap();

    let mut http = match config.writer {
        WriterConfig::Http(http) => http,
        other => panic!("expected http writer, got {}", other.kind()),
    };
    assert_eq!(http.mode, HttpMode::PerRecord);
    http.url = format!("{}/readings", base);

    let mut writer = HttpWriter::new(http).unwrap();
    writer.setup().await.unwrap();
    let mut controller = DeliveryController::new(writer, DeliveryPolicy::from(&config.sink));

    let batch_size = config.sink.max_batch_size as u64;
    let verdict = controller.deliver(&common::batch(0, 0..batch_size)).await;

    assert_eq!(verdict, Verdict::Ack);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len() as u64, batch_size);
    assert_eq!(seen[0].authorization.as_deref(), Some("Bearer starter-token"));
}
