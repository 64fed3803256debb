//! HTTP transport tests against a local mock receiver.

use std::time::Duration;

use chrono::Utc;
use courier_jobs::{
    compute_signature, HttpWebhookTransport, OutboxEntry, OutboxStatus, TransportConfig,
    WebhookEndpoint, WebhookTransport,
};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn entry(payload: serde_json::Value) -> OutboxEntry {
    let now = Utc::now();
    OutboxEntry {
        id: Uuid::now_v7(),
        aggregate_type: "UploadFile".to_string(),
        aggregate_id: "42".to_string(),
        event_type: "file.stored".to_string(),
        payload,
        status: OutboxStatus::Pending,
        idempotency_key: "UploadFile:42".to_string(),
        attempts: 0,
        max_attempts: 5,
        next_attempt_at: Some(now),
        delivered_at: None,
        error_message: String::new(),
        created_at: now,
        updated_at: now,
    }
}

fn endpoint(url: String) -> WebhookEndpoint {
    let now = Utc::now();
    WebhookEndpoint {
        id: Uuid::new_v4(),
        url,
        secret: "whsec_test".to_string(),
        event_types: vec![],
        is_active: true,
        created_at: now,
        updated_at: now,
    }
}

fn transport() -> HttpWebhookTransport {
    HttpWebhookTransport::new(TransportConfig::default()).expect("Failed to create transport")
}

#[tokio::test]
async fn test_delivery_sends_signed_canonical_body() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks"))
        .and(header("Content-Type", "application/json"))
        .and(header("X-Webhook-Event", "file.stored"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;

    let entry = entry(json!({"size_bytes": 1000, "file_id": "42", "batch": null}));
    let endpoint = endpoint(format!("{}/hooks", mock_server.uri()));

    let result = transport().deliver(&endpoint, &entry).await;
    assert!(result.ok, "delivery should succeed: {}", result.error);
    assert_eq!(result.status_code, Some(204));
    assert!(result.error.is_empty());

    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    // Keys sorted, no whitespace.
    assert_eq!(
        request.body,
        br#"{"batch":null,"file_id":"42","size_bytes":1000}"#.to_vec()
    );

    let signature = request
        .headers
        .get("X-Webhook-Signature")
        .unwrap()
        .to_str()
        .unwrap();
    assert_eq!(signature, compute_signature("whsec_test", &request.body));
    assert_eq!(signature.len(), 64);
    assert!(signature.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));

    let delivery_id = request
        .headers
        .get("X-Webhook-Delivery")
        .unwrap()
        .to_str()
        .unwrap();
    assert_eq!(delivery_id, entry.id.to_string());
}

#[tokio::test]
async fn test_non_success_status_reports_truncated_body() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("x".repeat(500)))
        .mount(&mock_server)
        .await;

    let result = transport()
        .deliver(&endpoint(mock_server.uri()), &entry(json!({})))
        .await;

    assert!(!result.ok);
    assert_eq!(result.status_code, Some(500));
    assert_eq!(result.error, format!("HTTP 500: {}", "x".repeat(200)));
}

#[tokio::test]
async fn test_client_error_status_is_failure() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such hook"))
        .mount(&mock_server)
        .await;

    let result = transport()
        .deliver(&endpoint(mock_server.uri()), &entry(json!({})))
        .await;

    assert!(!result.ok);
    assert_eq!(result.error, "HTTP 404: no such hook");
}

#[tokio::test]
async fn test_connection_refused_reports_connect_error() {
    // Reserve a port, then close it so nothing is listening.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let result = transport()
        .deliver(&endpoint(format!("http://127.0.0.1:{}/hooks", port)), &entry(json!({})))
        .await;

    assert!(!result.ok);
    assert_eq!(result.status_code, None);
    assert!(
        result.error.starts_with("ConnectError: "),
        "unexpected error: {}",
        result.error
    );
}

#[tokio::test]
async fn test_slow_receiver_reports_timeout() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&mock_server)
        .await;

    let transport = HttpWebhookTransport::new(
        TransportConfig::default().with_timeout(Duration::from_millis(200)),
    )
    .unwrap();
    let result = transport
        .deliver(&endpoint(mock_server.uri()), &entry(json!({})))
        .await;

    assert!(!result.ok);
    assert_eq!(result.status_code, None);
    assert!(result.error.starts_with("Timeout: "), "unexpected error: {}", result.error);
}

#[test]
fn test_signature_matches_known_vector() {
    // RFC 4231 test case 2.
    assert_eq!(
        compute_signature("Jefe", b"what do ya want for nothing?"),
        "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
    );
}
