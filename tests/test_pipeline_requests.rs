//! Request/response coordination: twin traffic, correlation, timeouts, and
//! the response/timeout race.


use devicelink::transport::TransportNotification;
use devicelink::{ClientEvent, DeviceError, Feature};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;

/// Pull the `$rid` out of a published twin request topic.
fn rid_of(topic: &str) -> String {
    topic
        .split("$rid=")
        .nth(1)
        .expect("twin topic carries a request id")
        .to_string()
}

/// Wait for the nth published twin request and answer it.
async fn respond_to_twin_request(
    transport: &Arc<devicelink::testing::mocks::FakeProtocolClient>,
    request_index: usize,
    status: u16,
    body: &str,
) {
    assert!(
        wait_until(
            || transport.published().len() > request_index,
            Duration::from_secs(2)
        )
        .await,
        "twin request was never published"
    );
    let (topic, _) = transport.published()[request_index].clone();
    let rid = rid_of(&topic);
    transport.inject(TransportNotification::MessageReceived {
        topic: format!("$iothub/twin/res/{status}/?$rid={rid}"),
        payload: body.as_bytes().to_vec().into(),
    });
}

#[tokio::test]
async fn test_get_twin_roundtrip() {
    // Arrange
    let (client, transport) = fake_client(fast_config());
    client.connect().await.unwrap();
    client.enable_feature(Feature::Twin).await.unwrap();

    // Act: answer the GET with a twin document
    let twin_body = r#"{"desired":{"$version":4},"reported":{"$version":2}}"#;
    let (twin, _) = tokio::join!(client.get_twin(), async {
        respond_to_twin_request(&transport, 0, 200, twin_body).await;
    });

    // Assert
    let twin = twin.unwrap();
    assert_eq!(twin["desired"]["$version"], json!(4));
    let (topic, _) = transport.published()[0].clone();
    assert!(topic.starts_with("$iothub/twin/GET/?$rid="));
}

#[tokio::test]
async fn test_patch_twin_reported_publishes_patch_body() {
    // Arrange
    let (client, transport) = fake_client(fast_config());
    client.connect().await.unwrap();

    // Act
    let patch = json!({"firmware": "1.2.3"});
    let (result, _) = tokio::join!(client.patch_twin_reported(patch.clone()), async {
        respond_to_twin_request(&transport, 0, 204, "").await;
    });

    // Assert
    result.unwrap();
    let (topic, payload) = transport.published()[0].clone();
    assert!(topic.starts_with("$iothub/twin/PATCH/properties/reported/?$rid="));
    let sent: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(sent, patch);
}

#[tokio::test]
async fn test_twin_request_times_out_and_late_response_is_noop() {
    // Arrange: nobody answers the request
    let (client, transport) = fake_client(fast_config());
    let mut events = client.take_events().unwrap();
    client.connect().await.unwrap();

    // Act
    let result = client.get_twin().await;

    // Assert: completed exactly once, with a timeout
    assert!(matches!(result, Err(DeviceError::Timeout)));

    // Act again: the genuine response arrives after the timeout won the race
    respond_to_twin_request(&transport, 0, 200, "{}").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Assert: the late response is a no-op - no background exception, and the
    // pipeline still works
    let noise = drain_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, ClientEvent::BackgroundException(_)))
        .count();
    assert_eq!(noise, 0);

    let (twin, _) = tokio::join!(client.get_twin(), async {
        respond_to_twin_request(&transport, 1, 200, r#"{"ok":true}"#).await;
    });
    assert_eq!(twin.unwrap()["ok"], json!(true));
}

#[tokio::test]
async fn test_unauthorized_twin_response_maps_to_unauthorized() {
    let (client, transport) = fake_client(fast_config());
    client.connect().await.unwrap();

    let (result, _) = tokio::join!(client.get_twin(), async {
        respond_to_twin_request(&transport, 0, 401, "").await;
    });

    assert!(matches!(result, Err(DeviceError::Unauthorized(_))));
}

#[tokio::test]
async fn test_pending_request_resent_after_reconnect_with_same_correlation() {
    // Arrange: a twin GET whose response was lost with the connection
    let (client, transport) = fake_client(fast_config());
    client.connect().await.unwrap();

    let twin_fut = client.get_twin();
    let driver = async {
        // first request goes out, then the connection drops unanswered
        assert!(wait_until(|| !transport.published().is_empty(), Duration::from_secs(2)).await);
        let first_rid = rid_of(&transport.published()[0].0);
        transport.inject(TransportNotification::Dropped {
            cause: DeviceError::connection_dropped("socket reset"),
        });

        // after the reconnect the request is re-sent under the same id
        assert!(
            wait_until(
                || {
                    transport
                        .published()
                        .iter()
                        .skip(1)
                        .any(|(topic, _)| topic.contains("$iothub/twin/GET"))
                },
                Duration::from_secs(2)
            )
            .await,
            "request was not re-sent after reconnect"
        );
        let resent = transport
            .published()
            .iter()
            .skip(1)
            .find(|(topic, _)| topic.contains("$iothub/twin/GET"))
            .map(|(topic, _)| rid_of(topic))
            .unwrap();
        assert_eq!(resent, first_rid);

        transport.inject(TransportNotification::MessageReceived {
            topic: format!("$iothub/twin/res/200/?$rid={first_rid}"),
            payload: br#"{"recovered":true}"#.to_vec().into(),
        });
    };

    let (twin, _) = tokio::join!(twin_fut, driver);
    assert_eq!(twin.unwrap()["recovered"], json!(true));
    assert_eq!(transport.connect_calls(), 2);
}
