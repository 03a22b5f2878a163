//! Credential renewal: lead-time renewal events, forced reconnects, queue
//! ordering during an outstanding renewal, and renewal failure.


use devicelink::testing::mocks::{FakeAuthProvider, FakeProtocolClient};
use devicelink::{ClientEvent, DeviceClient, DeviceError, TelemetryMessage};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;

fn renewal_client(
    auth: Arc<FakeAuthProvider>,
    margin_secs: u64,
) -> (DeviceClient, Arc<FakeProtocolClient>) {
    let mut config = fast_config();
    config.sas_renewal_margin_secs = margin_secs;
    let transport = Arc::new(FakeProtocolClient::new());
    let protocol: Arc<dyn devicelink::ProtocolClient> = transport.clone();
    let client = DeviceClient::with_protocol_client(config, auth, protocol)
        .expect("valid test config");
    (client, transport)
}

#[tokio::test]
async fn test_renewal_event_fires_margin_before_expiry() {
    // Arrange: token lives 3s, margin 2s => renewal due after ~1s
    let auth = Arc::new(FakeAuthProvider::new(3, 3_600));
    let (client, _transport) = renewal_client(Arc::clone(&auth), 2);
    let mut events = client.take_events().unwrap();

    // Act + Assert: the renewal announcement arrives before expiry
    let deadline = Duration::from_secs(2);
    loop {
        match next_event(&mut events, deadline).await {
            Some(ClientEvent::NewSasTokenRequired) => break,
            Some(_) => continue,
            None => panic!("renewal event did not fire before expiry"),
        }
    }
    assert!(
        wait_until(|| auth.renewals() == 1, Duration::from_secs(1)).await,
        "provider was never asked to renew"
    );
}

#[tokio::test]
async fn test_renewal_while_connected_forces_reconnect() {
    // Arrange: connected client whose token is about to hit its margin
    let auth = Arc::new(FakeAuthProvider::new(2, 3_600));
    let (client, transport) = renewal_client(Arc::clone(&auth), 1);
    client.connect().await.unwrap();
    assert_eq!(transport.connect_calls(), 1);

    // Act + Assert: renewal lands and the pipeline reauthorizes by
    // reconnecting with the fresh credential
    assert!(
        wait_until(
            || auth.renewals() == 1 && transport.connect_calls() == 2,
            Duration::from_secs(3)
        )
        .await,
        "no reconnect after renewal (renewals={}, connects={})",
        auth.renewals(),
        transport.connect_calls()
    );
}

#[tokio::test]
async fn test_ops_queued_during_renewal_release_in_submission_order() {
    // Arrange: the token is already inside its renewal margin, so renewal
    // starts immediately; a slow provider keeps it outstanding for a while
    let auth = Arc::new(FakeAuthProvider::new(60, 3_600));
    auth.set_renew_delay(Duration::from_millis(200));
    let (client, transport) = renewal_client(Arc::clone(&auth), 3_600);

    // Act: submit sends while the renewal is outstanding
    tokio::time::sleep(Duration::from_millis(50)).await;
    let (a, b, c) = tokio::join!(
        client.send_telemetry(TelemetryMessage::new(&b"first"[..])),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            client.send_telemetry(TelemetryMessage::new(&b"second"[..])).await
        },
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.send_telemetry(TelemetryMessage::new(&b"third"[..])).await
        },
    );

    // Assert: all succeed, published in original submission order
    a.unwrap();
    b.unwrap();
    c.unwrap();
    let payloads: Vec<Vec<u8>> = transport
        .published()
        .into_iter()
        .map(|(_, payload)| payload.to_vec())
        .collect();
    assert_eq!(payloads, vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]);
}

#[tokio::test]
async fn test_failed_renewal_surfaces_background_exception_and_retries() {
    // Arrange: the first renewal attempt fails
    let auth = Arc::new(FakeAuthProvider::new(60, 3_600));
    auth.fail_next_renewal(DeviceError::protocol("token service unreachable", true));
    let (client, _transport) = renewal_client(Arc::clone(&auth), 3_600);
    let mut events = client.take_events().unwrap();

    // Act + Assert: failure is reported without an attributable operation
    let deadline = Duration::from_secs(2);
    loop {
        match next_event(&mut events, deadline).await {
            Some(ClientEvent::BackgroundException(DeviceError::ProtocolClient { .. })) => break,
            Some(_) => continue,
            None => panic!("renewal failure was not reported"),
        }
    }

    // Assert: the stage retries and eventually renews
    assert!(
        wait_until(|| auth.renewals() == 1, Duration::from_secs(2)).await,
        "renewal was not retried after failure"
    );
}
