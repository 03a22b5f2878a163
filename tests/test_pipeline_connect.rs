//! Connection lifecycle: coalescing, no-op terminal states, auto-connect,
//! unsolicited drops, and shutdown semantics.


use devicelink::transport::TransportNotification;
use devicelink::{ClientEvent, ConnectionState, DeviceError, TelemetryMessage};
use std::time::Duration;
use test_helpers::*;

#[tokio::test]
async fn test_connect_reports_state_changes() {
    // Arrange
    let (client, _transport) = fake_client(fast_config());
    let mut events = client.take_events().unwrap();

    // Act
    client.connect().await.unwrap();
    client.disconnect().await.unwrap();

    // Assert: connected then disconnected, in order
    match next_event(&mut events, Duration::from_secs(1)).await {
        Some(ClientEvent::ConnectionStateChanged(ConnectionState::Connected)) => {}
        other => panic!("expected connected event, got {other:?}"),
    }
    match next_event(&mut events, Duration::from_secs(1)).await {
        Some(ClientEvent::ConnectionStateChanged(ConnectionState::Disconnected)) => {}
        other => panic!("expected disconnected event, got {other:?}"),
    }
}

#[tokio::test]
async fn test_back_to_back_connects_share_one_transport_call() {
    // Arrange: a slow connect so the second op arrives mid-transition
    let (client, transport) = fake_client(fast_config());
    transport.set_connect_delay(Duration::from_millis(50));

    // Act: two connects submitted while disconnected
    let (first, second) = tokio::join!(client.connect(), client.connect());

    // Assert: both succeed, exactly one transport-level connect
    first.unwrap();
    second.unwrap();
    assert_eq!(transport.connect_calls(), 1);
}

#[tokio::test]
async fn test_connect_while_connected_is_noop() {
    let (client, transport) = fake_client(fast_config());

    client.connect().await.unwrap();
    client.connect().await.unwrap();

    assert_eq!(transport.connect_calls(), 1);
}

#[tokio::test]
async fn test_disconnect_while_disconnected_is_noop() {
    let (client, transport) = fake_client(fast_config());

    client.disconnect().await.unwrap();

    assert_eq!(transport.connect_calls(), 0);
}

#[tokio::test]
async fn test_send_with_auto_connect_disabled_fails_fast() {
    // Arrange
    let mut config = fast_config();
    config.auto_connect = false;
    let (client, transport) = fake_client(config);

    // Act
    let result = client
        .send_telemetry(TelemetryMessage::new(&b"reading"[..]))
        .await;

    // Assert: immediate failure, no transport connect attempted
    assert!(matches!(result, Err(DeviceError::NotConnected)));
    assert_eq!(transport.connect_calls(), 0);
    assert!(transport.published().is_empty());
}

#[tokio::test]
async fn test_send_with_auto_connect_completes_after_connect() {
    // Arrange: disconnected client, auto-connect on (default)
    let (client, transport) = fake_client(fast_config());

    // Act: send without connecting first
    client
        .send_telemetry(TelemetryMessage::new(&b"reading"[..]))
        .await
        .unwrap();

    // Assert: the pipeline connected exactly once, then published
    assert_eq!(transport.connect_calls(), 1);
    let published = transport.published();
    assert_eq!(published.len(), 1);
    assert!(published[0].0.starts_with("devices/d1/messages/events/"));
}

#[tokio::test]
async fn test_concurrent_sends_trigger_single_auto_connect() {
    let (client, transport) = fake_client(fast_config());
    transport.set_connect_delay(Duration::from_millis(50));

    let (a, b, c) = tokio::join!(
        client.send_telemetry(TelemetryMessage::new(&b"a"[..])),
        client.send_telemetry(TelemetryMessage::new(&b"b"[..])),
        client.send_telemetry(TelemetryMessage::new(&b"c"[..])),
    );

    a.unwrap();
    b.unwrap();
    c.unwrap();
    assert_eq!(transport.connect_calls(), 1);
    assert_eq!(transport.published().len(), 3);
}

#[tokio::test]
async fn test_unsolicited_disconnect_emits_one_event_and_sends_recover() {
    // Arrange: connected client with three sends in flight
    let (client, transport) = fake_client(fast_config());
    let mut events = client.take_events().unwrap();
    client.connect().await.unwrap();
    transport.set_publish_delay(Duration::from_millis(100));

    let sends = tokio::join!(
        client.send_telemetry(TelemetryMessage::new(&b"s1"[..])),
        client.send_telemetry(TelemetryMessage::new(&b"s2"[..])),
        async {
            // let the sends reach the transport, then drop the connection
            tokio::time::sleep(Duration::from_millis(30)).await;
            transport.inject(TransportNotification::Dropped {
                cause: DeviceError::connection_dropped("socket reset"),
            });
            client.send_telemetry(TelemetryMessage::new(&b"s3"[..])).await
        },
    );

    // Assert: every send eventually succeeded (retried after reconnect)
    sends.0.unwrap();
    sends.1.unwrap();
    sends.2.unwrap();
    assert!(transport.connect_calls() >= 2, "expected a reconnect");

    // Assert: exactly one disconnected state change was observed
    tokio::time::sleep(Duration::from_millis(50)).await;
    let disconnects = drain_events(&mut events)
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                ClientEvent::ConnectionStateChanged(ConnectionState::Disconnected)
            )
        })
        .count();
    assert_eq!(disconnects, 1);
}

#[tokio::test]
async fn test_shutdown_completes_pending_operations_as_cancelled() {
    // Arrange: a connect that will never finish in time
    let (client, transport) = fake_client(fast_config());
    transport.set_connect_delay(Duration::from_secs(30));

    // Act: shut down while the connect is in flight
    let (connect_result, _) = tokio::join!(client.connect(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.shutdown().await;
    });

    // Assert: the pending operation completed exactly once, as cancelled
    assert!(matches!(
        connect_result,
        Err(DeviceError::OperationCancelled)
    ));
}

#[tokio::test]
async fn test_submit_after_shutdown_completes_as_cancelled() {
    let (client, _transport) = fake_client(fast_config());
    client.shutdown().await;

    let result = client
        .send_telemetry(TelemetryMessage::new(&b"late"[..]))
        .await;

    assert!(matches!(result, Err(DeviceError::OperationCancelled)));
}
