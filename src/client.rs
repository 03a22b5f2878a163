//! Public device client: a thin async facade over the pipeline.
//!
//! Every method builds an operation, submits it at the head of the chain,
//! and awaits the completion the pipeline delivers. Unsolicited traffic
//! (messages, method requests, twin patches, state changes) arrives on the
//! event stream returned by [`DeviceClient::take_events`].

use crate::auth::AuthProvider;
use crate::config::{ConfigError, PipelineConfig};
use crate::error::{DeviceError, DeviceResult};
use crate::message::{Feature, TelemetryMessage};
use crate::pipeline::ops::{OpKind, OpOutcome, OpResult, Operation};
use crate::pipeline::{ClientEvent, Pipeline, PipelineHandle};
use crate::transport::http::HttpRequestClient;
use crate::transport::mqtt::MqttProtocolClient;
use crate::transport::ProtocolClient;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Device-side client for a cloud IoT hub.
///
/// Construction spawns the pipeline's serialized execution context, so all
/// constructors must run inside a tokio runtime.
pub struct DeviceClient {
    pipeline: Pipeline,
    handle: PipelineHandle,
    events: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
}

impl DeviceClient {
    /// Client over the publish/subscribe protocol transport.
    pub fn new(config: PipelineConfig, auth: Arc<dyn AuthProvider>) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        let client = Arc::new(MqttProtocolClient::new(Arc::clone(&config)));
        Ok(Self::start(config, auth, client))
    }

    /// Client over a caller-supplied protocol client. This is the seam used
    /// for dependency injection in tests.
    pub fn with_protocol_client(
        config: PipelineConfig,
        auth: Arc<dyn AuthProvider>,
        client: Arc<dyn ProtocolClient>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::start(Arc::new(config), auth, client))
    }

    /// Client over the request/response HTTP transport. Subscriptions and
    /// method responses are unavailable in this mode.
    pub fn over_http(config: PipelineConfig, auth: Arc<dyn AuthProvider>) -> Result<Self, ConfigError> {
        let client = HttpRequestClient::new(&config)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
        Self::with_http_client(config, auth, client)
    }

    /// Client over a caller-supplied HTTP request client (injection seam for
    /// tests pointing at a local server).
    pub fn with_http_client(
        config: PipelineConfig,
        auth: Arc<dyn AuthProvider>,
        client: HttpRequestClient,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (pipeline, events) = Pipeline::start_http(Arc::new(config), auth, Arc::new(client));
        Ok(Self::from_pipeline(pipeline, events))
    }

    fn start(
        config: Arc<PipelineConfig>,
        auth: Arc<dyn AuthProvider>,
        client: Arc<dyn ProtocolClient>,
    ) -> Self {
        let (pipeline, events) = Pipeline::start(config, auth, client);
        Self::from_pipeline(pipeline, events)
    }

    fn from_pipeline(pipeline: Pipeline, events: mpsc::UnboundedReceiver<ClientEvent>) -> Self {
        let handle = pipeline.handle();
        Self {
            pipeline,
            handle,
            events: std::sync::Mutex::new(Some(events)),
        }
    }

    /// The stream of unsolicited client events. Yields `Some` exactly once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.events.lock().expect("event receiver lock poisoned").take()
    }

    fn submit(&self, kind: OpKind) -> oneshot::Receiver<OpResult> {
        let (tx, rx) = oneshot::channel();
        let op = Operation::new(self.handle.next_op_id(), kind, tx);
        self.handle.submit(op);
        rx
    }

    async fn run(&self, kind: OpKind) -> DeviceResult<OpOutcome> {
        match self.submit(kind).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::pipeline(
                "pipeline terminated before completion",
            )),
        }
    }

    pub async fn connect(&self) -> DeviceResult<()> {
        self.run(OpKind::Connect).await.map(|_| ())
    }

    pub async fn disconnect(&self) -> DeviceResult<()> {
        self.run(OpKind::Disconnect).await.map(|_| ())
    }

    pub async fn send_telemetry(&self, message: TelemetryMessage) -> DeviceResult<()> {
        self.submit_telemetry(message).wait().await
    }

    /// Submit telemetry and keep a handle that can cancel it while it waits
    /// for a retry or reconnect.
    pub fn submit_telemetry(&self, message: TelemetryMessage) -> TelemetrySend {
        let (tx, rx) = oneshot::channel();
        let op = Operation::new(
            self.handle.next_op_id(),
            OpKind::SendTelemetry(message),
            tx,
        );
        let cancel = op.cancel_flag();
        self.handle.submit(op);
        TelemetrySend { rx, cancel }
    }

    pub async fn send_method_response(
        &self,
        request_id: impl Into<String>,
        status: u16,
        payload: serde_json::Value,
    ) -> DeviceResult<()> {
        self.run(OpKind::SendMethodResponse {
            request_id: request_id.into(),
            status,
            payload,
        })
        .await
        .map(|_| ())
    }

    /// Fetch the full twin document.
    pub async fn get_twin(&self) -> DeviceResult<serde_json::Value> {
        match self.run(OpKind::GetTwin).await? {
            OpOutcome::Response { body, .. } => serde_json::from_slice(&body)
                .map_err(|e| DeviceError::protocol(format!("malformed twin document: {e}"), false)),
            OpOutcome::Done => Err(DeviceError::pipeline("twin request returned no response")),
        }
    }

    /// Patch the twin's reported properties.
    pub async fn patch_twin_reported(&self, patch: serde_json::Value) -> DeviceResult<()> {
        self.run(OpKind::PatchTwinReported { patch })
            .await
            .map(|_| ())
    }

    pub async fn enable_feature(&self, feature: Feature) -> DeviceResult<()> {
        self.run(OpKind::Subscribe(feature)).await.map(|_| ())
    }

    pub async fn disable_feature(&self, feature: Feature) -> DeviceResult<()> {
        self.run(OpKind::Unsubscribe(feature)).await.map(|_| ())
    }

    /// Stop the pipeline. Every pending operation completes as cancelled.
    pub async fn shutdown(&self) {
        self.pipeline.shutdown().await;
    }
}

/// In-flight telemetry submission that can be cancelled.
///
/// Cancellation is checked before each retry resubmission: an operation
/// already on the wire completes normally, one waiting out a backoff or a
/// reconnect completes as cancelled.
pub struct TelemetrySend {
    rx: oneshot::Receiver<OpResult>,
    cancel: Arc<AtomicBool>,
}

impl TelemetrySend {
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub async fn wait(self) -> DeviceResult<()> {
        match self.rx.await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(DeviceError::pipeline(
                "pipeline terminated before completion",
            )),
        }
    }
}
