//! The request/response HTTP transport, exercised against a local mock hub.


use devicelink::testing::mocks::FakeAuthProvider;
use devicelink::{DeviceClient, DeviceError, Feature, HttpRequestClient, TelemetryMessage};
use serde_json::json;
use std::sync::Arc;
use test_helpers::fast_config;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn http_client(server: &MockServer) -> DeviceClient {
    let config = fast_config();
    let http = HttpRequestClient::with_base_url(&server.uri(), &config.device_id)
        .expect("mock server uri is valid");
    DeviceClient::with_http_client(config, Arc::new(FakeAuthProvider::new(3_600, 3_600)), http)
        .expect("valid test config")
}

#[tokio::test]
async fn test_telemetry_posts_to_events_endpoint() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/devices/d1/messages/events"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    let client = http_client(&server).await;

    // Act
    client.connect().await.unwrap();
    client
        .send_telemetry(TelemetryMessage::new(&b"{\"temp\": 20}"[..]))
        .await
        .unwrap();

    // Assert: the mock's expect(1) verifies on drop
}

#[tokio::test]
async fn test_get_twin_over_http() {
    // Arrange
    let server = MockServer::start().await;
    let twin = json!({"desired": {"$version": 3}, "reported": {}});
    Mock::given(method("GET"))
        .and(path("/twins/d1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(twin.clone()))
        .mount(&server)
        .await;
    let client = http_client(&server).await;
    client.connect().await.unwrap();

    // Act
    let fetched = client.get_twin().await.unwrap();

    // Assert
    assert_eq!(fetched, twin);
}

#[tokio::test]
async fn test_patch_twin_reported_over_http() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/twins/d1/properties/reported"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    let client = http_client(&server).await;
    client.connect().await.unwrap();

    // Act + Assert
    client
        .patch_twin_reported(json!({"firmware": "2.0.0"}))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unauthorized_telemetry_is_terminal() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/devices/d1/messages/events"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1) // terminal: exactly one attempt, no retry
        .mount(&server)
        .await;
    let client = http_client(&server).await;
    client.connect().await.unwrap();

    // Act
    let result = client
        .send_telemetry(TelemetryMessage::new(&b"{}"[..]))
        .await;

    // Assert
    assert!(matches!(result, Err(DeviceError::Unauthorized(_))));
}

#[tokio::test]
async fn test_server_failure_retries_until_success() {
    // Arrange: two failures, then success; retry budget is 3
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/devices/d1/messages/events"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/devices/d1/messages/events"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    let client = http_client(&server).await;
    client.connect().await.unwrap();

    // Act + Assert
    client
        .send_telemetry(TelemetryMessage::new(&b"{}"[..]))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_subscriptions_unsupported_over_http() {
    // Arrange
    let server = MockServer::start().await;
    let client = http_client(&server).await;
    client.connect().await.unwrap();

    // Act
    let result = client.enable_feature(Feature::Methods).await;

    // Assert: terminal protocol error, not a retry loop
    match result {
        Err(DeviceError::ProtocolClient { transient, .. }) => assert!(!transient),
        other => panic!("expected protocol error, got {other:?}"),
    }
}
