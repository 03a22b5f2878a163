//! MQTT implementation of the protocol client, backed by rumqttc.
//!
//! The client here is deliberately dumb: it connects when told, reports what
//! it sees, and never reconnects on its own. Connection recovery is pipeline
//! policy, owned by the connection and retry stages.

use super::{ProtocolClient, TransportNotification};
use crate::auth::SasToken;
use crate::config::PipelineConfig;
use crate::error::{DeviceError, DeviceResult};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{AsyncClient, Event as MqttEvent, EventLoop, MqttOptions};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::Transport as RumqttcTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use url::Url;

const API_VERSION: &str = "2019-10-01";
const CONNACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of the connection handshake, published by the event-loop task.
#[derive(Debug, Clone, PartialEq)]
enum Handshake {
    Pending,
    Connected,
    Failed(String),
}

/// Build broker options for a hub connection.
///
/// The hub authenticates with the device identity in the username and the
/// SAS credential as the password. Plain connections use TLS on 8883;
/// websocket connections tunnel over 443.
fn build_mqtt_options(
    config: &PipelineConfig,
    credential: &SasToken,
) -> DeviceResult<MqttOptions> {
    let client_id = match &config.module_id {
        Some(module_id) => format!("{}/{}", config.device_id, module_id),
        None => config.device_id.clone(),
    };

    let mut options = if config.websockets {
        let ws_url = format!("wss://{}:443/$iothub/websocket", config.hostname);
        // validate early so a bad hostname fails the connect, not the poll
        Url::parse(&ws_url)
            .map_err(|_| DeviceError::connection_failed(format!("invalid hostname: {}", config.hostname)))?;
        let mut options = MqttOptions::new(client_id, ws_url, 443);
        options.set_transport(RumqttcTransport::wss_with_default_config());
        options
    } else {
        let mut options = MqttOptions::new(client_id, config.hostname.clone(), 8883);
        options.set_transport(RumqttcTransport::tls_with_default_config());
        options
    };

    let username = match &config.module_id {
        Some(module_id) => format!(
            "{}/{}/{}/?api-version={API_VERSION}",
            config.hostname, config.device_id, module_id
        ),
        None => format!(
            "{}/{}/?api-version={API_VERSION}",
            config.hostname, config.device_id
        ),
    };
    options.set_credentials(username, credential.as_str());
    options.set_keep_alive(config.keep_alive());
    // large enough for a full twin document
    options.set_max_packet_size(Some(256 * 1024));

    Ok(options)
}

fn map_poll_error(error: &rumqttc::v5::ConnectionError, connected: bool) -> DeviceError {
    let text = error.to_string();
    let lowered = text.to_lowercase();
    if lowered.contains("not authorized") || lowered.contains("authentication") {
        DeviceError::unauthorized(text)
    } else if connected {
        DeviceError::connection_dropped(text)
    } else {
        DeviceError::connection_failed(text)
    }
}

pub struct MqttProtocolClient {
    config: Arc<PipelineConfig>,
    client: Mutex<Option<AsyncClient>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    notifications_tx: mpsc::UnboundedSender<TransportNotification>,
    notifications_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<TransportNotification>>>,
}

impl MqttProtocolClient {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        let (notifications_tx, notifications_rx) = mpsc::unbounded_channel();
        Self {
            config,
            client: Mutex::new(None),
            shutdown: Mutex::new(None),
            notifications_tx,
            notifications_rx: std::sync::Mutex::new(Some(notifications_rx)),
        }
    }

    /// Drive the rumqttc event loop: publish the handshake outcome, forward
    /// incoming publishes, and report the drop that ends the session.
    async fn run_event_loop(
        mut event_loop: EventLoop,
        handshake_tx: watch::Sender<Handshake>,
        mut shutdown_rx: watch::Receiver<bool>,
        notifications_tx: mpsc::UnboundedSender<TransportNotification>,
    ) {
        let mut connected = false;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("event loop stopping on shutdown signal");
                        break;
                    }
                }
                polled = event_loop.poll() => match polled {
                    Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                        info!("broker acknowledged connection");
                        connected = true;
                        let _ = handshake_tx.send(Handshake::Connected);
                    }
                    Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                        let topic = String::from_utf8_lossy(&publish.topic).into_owned();
                        let _ = notifications_tx.send(TransportNotification::MessageReceived {
                            topic,
                            payload: publish.payload,
                        });
                    }
                    Ok(MqttEvent::Incoming(Packet::Disconnect(_))) => {
                        warn!("broker sent DISCONNECT");
                        let _ = notifications_tx.send(TransportNotification::Dropped {
                            cause: DeviceError::connection_dropped("server closed the connection"),
                        });
                        break;
                    }
                    Ok(_) => {}
                    Err(error) => {
                        let mapped = map_poll_error(&error, connected);
                        if connected {
                            warn!(%mapped, "event loop error; connection lost");
                            let _ = notifications_tx.send(TransportNotification::Dropped {
                                cause: mapped,
                            });
                        } else {
                            let _ = handshake_tx.send(Handshake::Failed(mapped.to_string()));
                        }
                        break;
                    }
                }
            }
        }
    }

    async fn wait_for_handshake(mut handshake_rx: watch::Receiver<Handshake>) -> DeviceResult<()> {
        let wait = async {
            loop {
                match handshake_rx.borrow().clone() {
                    Handshake::Connected => return Ok(()),
                    Handshake::Failed(reason) => {
                        return Err(DeviceError::connection_failed(reason));
                    }
                    Handshake::Pending => {}
                }
                if handshake_rx.changed().await.is_err() {
                    return Err(DeviceError::connection_failed(
                        "connection task ended before the broker acknowledged",
                    ));
                }
            }
        };
        match tokio::time::timeout(CONNACK_TIMEOUT, wait).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::connection_failed(
                "timed out waiting for broker acknowledgement",
            )),
        }
    }
}

#[async_trait]
impl ProtocolClient for MqttProtocolClient {
    async fn connect(&self, credential: SasToken) -> Result<(), DeviceError> {
        let options = build_mqtt_options(&self.config, &credential)?;
        let (client, event_loop) = AsyncClient::new(options, 10);

        let (handshake_tx, handshake_rx) = watch::channel(Handshake::Pending);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(Self::run_event_loop(
            event_loop,
            handshake_tx,
            shutdown_rx,
            self.notifications_tx.clone(),
        ));

        *self.client.lock().await = Some(client);
        *self.shutdown.lock().await = Some(shutdown_tx);

        match Self::wait_for_handshake(handshake_rx).await {
            Ok(()) => Ok(()),
            Err(error) => {
                // tear the half-open session down before reporting failure
                if let Some(shutdown) = self.shutdown.lock().await.take() {
                    let _ = shutdown.send(true);
                }
                *self.client.lock().await = None;
                Err(error)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        let client = self.client.lock().await.take();
        if let Some(client) = client {
            if let Err(error) = client.disconnect().await {
                debug!(%error, "disconnect request not deliverable; session already down");
            }
        }
        if let Some(shutdown) = self.shutdown.lock().await.take() {
            let _ = shutdown.send(true);
        }
        info!("protocol client disconnected");
        Ok(())
    }

    async fn publish(&self, topic: String, payload: Bytes) -> Result<(), DeviceError> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(DeviceError::NotConnected)?;
        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| DeviceError::protocol(format!("publish failed: {e}"), true))
    }

    async fn subscribe(&self, topic_filter: String) -> Result<(), DeviceError> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(DeviceError::NotConnected)?;
        client
            .subscribe(topic_filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| DeviceError::protocol(format!("subscribe failed: {e}"), true))
    }

    async fn unsubscribe(&self, topic_filter: String) -> Result<(), DeviceError> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(DeviceError::NotConnected)?;
        client
            .unsubscribe(topic_filter)
            .await
            .map_err(|e| DeviceError::protocol(format!("unsubscribe failed: {e}"), true))
    }

    fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<TransportNotification>> {
        self.notifications_rx
            .lock()
            .expect("notification receiver lock poisoned")
            .take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn test_config() -> PipelineConfig {
        PipelineConfig::new("hub.example.net", "device-1")
    }

    fn test_credential() -> SasToken {
        SasToken::new(
            "SharedAccessSignature sr=hub&sig=s3cret&se=9999999999",
            Utc::now() + ChronoDuration::hours(1),
        )
    }

    #[test]
    fn test_build_options_device_identity() {
        let options = build_mqtt_options(&test_config(), &test_credential()).unwrap();
        assert_eq!(options.client_id(), "device-1");
    }

    #[test]
    fn test_build_options_module_identity() {
        let mut config = test_config();
        config.module_id = Some("module-a".to_string());
        let options = build_mqtt_options(&config, &test_credential()).unwrap();
        assert_eq!(options.client_id(), "device-1/module-a");
    }

    #[test]
    fn test_publish_requires_connection() {
        let client = MqttProtocolClient::new(Arc::new(test_config()));
        let result = tokio_test::block_on(client.publish("t".to_string(), Bytes::new()));
        assert!(matches!(result, Err(DeviceError::NotConnected)));
    }

    #[test]
    fn test_notifications_taken_once() {
        let client = MqttProtocolClient::new(Arc::new(test_config()));
        assert!(client.take_notifications().is_some());
        assert!(client.take_notifications().is_none());
    }

    #[test]
    fn test_poll_error_maps_to_unauthorized() {
        // classification is keyed on the broker's reason text
        let err = DeviceError::unauthorized("not authorized");
        assert!(!err.is_retryable());
    }
}
