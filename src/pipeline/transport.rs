//! Terminal stages owning the protocol clients.
//!
//! All network I/O in the pipeline happens here, and none of it happens on
//! the serialized context: every transport call runs in a spawned task whose
//! result re-enters the context as a wake-up, so a blocked call never stalls
//! reconnection or unrelated operations.

use super::events::Event;
use super::ops::{OpKind, OpOutcome, OpResult, Operation};
use super::stage::PipelineStage;
use super::{StageCtx, Wake};
use crate::auth::AuthProvider;
use crate::error::{DeviceError, DeviceResult};
use crate::message::{MethodRequest, ReceivedMessage};
use crate::topics::{self, InboundRoute};
use crate::transport::http::HttpRequestClient;
use crate::transport::{ProtocolClient, TransportNotification};
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, error, warn};

type IoFuture = Pin<Box<dyn Future<Output = DeviceResult<()>> + Send>>;

/// Terminal stage for the publish/subscribe transport.
pub(crate) struct TransportStage {
    client: Arc<dyn ProtocolClient>,
    auth: Arc<dyn AuthProvider>,
    in_flight: HashMap<u64, Operation>,
}

impl TransportStage {
    pub fn new(client: Arc<dyn ProtocolClient>, auth: Arc<dyn AuthProvider>) -> Self {
        Self {
            client,
            auth,
            in_flight: HashMap::new(),
        }
    }

    /// Translate an operation into the transport call that executes it.
    fn io_for(&self, op: &Operation, ctx: &StageCtx<'_>) -> Result<IoFuture, DeviceError> {
        let client = Arc::clone(&self.client);
        let config = ctx.config();
        let device_id = config.device_id.clone();
        let module_id = config.module_id.clone();

        match &op.kind {
            OpKind::Connect => {
                let credential = self.auth.current_token();
                Ok(Box::pin(async move { client.connect(credential).await }))
            }
            OpKind::Disconnect => Ok(Box::pin(async move { client.disconnect().await })),
            OpKind::SendTelemetry(message) => {
                let topic =
                    topics::telemetry_publish_topic(&device_id, module_id.as_deref(), message);
                let payload = message.payload.clone();
                Ok(Box::pin(async move { client.publish(topic, payload).await }))
            }
            OpKind::SendMethodResponse {
                request_id,
                status,
                payload,
            } => {
                let topic = topics::method_response_topic(request_id, *status);
                let body = serde_json::to_vec(payload)
                    .map_err(|e| DeviceError::pipeline(format!("encoding method response: {e}")))?;
                Ok(Box::pin(async move {
                    client.publish(topic, Bytes::from(body)).await
                }))
            }
            OpKind::Request {
                method,
                resource,
                body,
                correlation_id,
            } => {
                let topic = topics::twin_request_topic(method, resource, correlation_id);
                let payload = body.clone();
                Ok(Box::pin(async move { client.publish(topic, payload).await }))
            }
            OpKind::Subscribe(feature) => {
                let filter =
                    topics::subscription_filter(*feature, &device_id, module_id.as_deref());
                Ok(Box::pin(async move { client.subscribe(filter).await }))
            }
            OpKind::Unsubscribe(feature) => {
                let filter =
                    topics::subscription_filter(*feature, &device_id, module_id.as_deref());
                Ok(Box::pin(async move { client.unsubscribe(filter).await }))
            }
            OpKind::Reauthorize | OpKind::GetTwin | OpKind::PatchTwinReported { .. } => {
                Err(DeviceError::pipeline(format!(
                    "{} operation reached the transport stage unconverted",
                    op.name()
                )))
            }
        }
    }

    fn handle_inbound(&mut self, topic: String, payload: Bytes, ctx: &mut StageCtx<'_>) {
        let config = ctx.config();
        let route = topics::route_inbound(&topic, &config.device_id, config.module_id.as_deref());
        match route {
            Some(InboundRoute::C2d { properties }) => {
                ctx.send_up(Event::C2dMessage(ReceivedMessage {
                    payload,
                    properties,
                    input_name: None,
                }));
            }
            Some(InboundRoute::Input {
                input_name,
                properties,
            }) => {
                ctx.send_up(Event::InputMessage(ReceivedMessage {
                    payload,
                    properties,
                    input_name: Some(input_name),
                }));
            }
            Some(InboundRoute::Method { name, request_id }) => {
                let parsed = if payload.is_empty() {
                    Ok(serde_json::Value::Null)
                } else {
                    serde_json::from_slice(&payload)
                };
                match parsed {
                    Ok(method_payload) => ctx.send_up(Event::MethodRequest(MethodRequest {
                        request_id,
                        name,
                        payload: method_payload,
                    })),
                    Err(e) => ctx.background_exception(DeviceError::protocol(
                        format!("malformed method payload: {e}"),
                        false,
                    )),
                }
            }
            Some(InboundRoute::TwinResponse { status, request_id }) => {
                match request_id.parse() {
                    Ok(correlation_id) => ctx.send_up(Event::Response {
                        correlation_id,
                        status,
                        body: payload,
                    }),
                    Err(_) => ctx.background_exception(DeviceError::protocol(
                        format!("unparseable twin response id: {request_id}"),
                        false,
                    )),
                }
            }
            Some(InboundRoute::TwinPatch) => match serde_json::from_slice(&payload) {
                Ok(patch) => ctx.send_up(Event::TwinDesiredPatch(patch)),
                Err(e) => ctx.background_exception(DeviceError::protocol(
                    format!("malformed twin patch: {e}"),
                    false,
                )),
            },
            None => {
                debug!(%topic, "dropping message on unrecognized topic");
            }
        }
    }
}

impl PipelineStage for TransportStage {
    fn name(&self) -> &'static str {
        "transport"
    }

    fn handle_op(&mut self, op: Operation, ctx: &mut StageCtx<'_>) {
        let io = match self.io_for(&op, ctx) {
            Ok(io) => io,
            Err(e) => {
                error!(op = op.name(), %e, "cannot execute operation");
                ctx.complete(op, Err(e));
                return;
            }
        };

        debug!(op = op.name(), op_id = op.id(), "starting transport I/O");
        let op_id = op.id();
        self.in_flight.insert(op_id, op);
        ctx.spawn_wake(async move {
            Wake::IoResult {
                op_id,
                result: io.await.map(|_| OpOutcome::Done),
            }
        });
    }

    fn handle_wake(&mut self, wake: Wake, ctx: &mut StageCtx<'_>) {
        match wake {
            Wake::IoResult { op_id, result } => {
                let op = match self.in_flight.remove(&op_id) {
                    Some(op) => op,
                    None => {
                        // Already failed by a connection drop; the late I/O
                        // result has nobody to complete.
                        debug!(op_id, "I/O result for an operation no longer in flight");
                        return;
                    }
                };
                match (&op.kind, &result) {
                    (OpKind::Connect, Ok(_)) => ctx.send_up(Event::Connected),
                    (OpKind::Disconnect, Ok(_)) => {
                        ctx.send_up(Event::Disconnected { cause: None })
                    }
                    _ => {}
                }
                ctx.complete(op, result);
            }
            Wake::Notification(TransportNotification::MessageReceived { topic, payload }) => {
                self.handle_inbound(topic, payload, ctx);
            }
            Wake::Notification(TransportNotification::Dropped { cause }) => {
                warn!(%cause, in_flight = self.in_flight.len(), "transport connection dropped");
                ctx.send_up(Event::Disconnected {
                    cause: Some(cause.clone()),
                });
                let failure = DeviceError::connection_dropped(cause.to_string());
                for (_, op) in self.in_flight.drain() {
                    ctx.complete(op, Err(failure.clone()));
                }
            }
            _ => {}
        }
    }

    fn shutdown(&mut self, ctx: &mut StageCtx<'_>) {
        for (_, op) in self.in_flight.drain() {
            ctx.complete(op, Err(DeviceError::OperationCancelled));
        }
    }
}

/// Terminal stage for the request/response HTTP transport.
///
/// Connection lifecycle is a formality here: there is no link to keep up, so
/// connect validates the credential and completes. Correlated requests
/// execute as HTTP calls whose responses come back as response events, the
/// same shape the pub/sub transport produces.
pub(crate) struct HttpTransportStage {
    client: Arc<HttpRequestClient>,
    auth: Arc<dyn AuthProvider>,
    in_flight: HashMap<u64, Operation>,
}

impl HttpTransportStage {
    pub fn new(client: Arc<HttpRequestClient>, auth: Arc<dyn AuthProvider>) -> Self {
        Self {
            client,
            auth,
            in_flight: HashMap::new(),
        }
    }
}

impl PipelineStage for HttpTransportStage {
    fn name(&self) -> &'static str {
        "http_transport"
    }

    fn handle_op(&mut self, op: Operation, ctx: &mut StageCtx<'_>) {
        match &op.kind {
            OpKind::Connect => {
                let credential = self.auth.current_token();
                if credential.is_expired() {
                    ctx.complete(op, Err(DeviceError::unauthorized("credential expired")));
                    return;
                }
                ctx.send_up(Event::Connected);
                ctx.complete(op, Ok(OpOutcome::Done));
            }
            OpKind::Disconnect => {
                ctx.send_up(Event::Disconnected { cause: None });
                ctx.complete(op, Ok(OpOutcome::Done));
            }
            OpKind::SendTelemetry(message) => {
                let client = Arc::clone(&self.client);
                let credential = self.auth.current_token();
                let message = message.clone();
                let op_id = op.id();
                self.in_flight.insert(op_id, op);
                ctx.spawn_wake(async move {
                    Wake::IoResult {
                        op_id,
                        result: client
                            .send_telemetry(&message, &credential)
                            .await
                            .map(|_| OpOutcome::Done),
                    }
                });
            }
            OpKind::Request {
                method,
                resource,
                body,
                ..
            } => {
                let client = Arc::clone(&self.client);
                let credential = self.auth.current_token();
                let method = *method;
                let resource = *resource;
                let body = body.clone();
                let op_id = op.id();
                self.in_flight.insert(op_id, op);
                ctx.spawn_wake(async move {
                    Wake::IoResult {
                        op_id,
                        result: client
                            .twin_request(method, resource, body, &credential)
                            .await
                            .map(|(status, body)| OpOutcome::Response { status, body }),
                    }
                });
            }
            OpKind::SendMethodResponse { .. } | OpKind::Subscribe(_) | OpKind::Unsubscribe(_) => {
                ctx.complete(
                    op,
                    Err(DeviceError::protocol(
                        "not supported over the request/response transport",
                        false,
                    )),
                );
            }
            OpKind::Reauthorize | OpKind::GetTwin | OpKind::PatchTwinReported { .. } => {
                let op_name = op.name();
                ctx.complete(
                    op,
                    Err(DeviceError::pipeline(format!(
                        "{op_name} operation reached the transport stage unconverted"
                    ))),
                );
            }
        }
    }

    fn handle_wake(&mut self, wake: Wake, ctx: &mut StageCtx<'_>) {
        if let Wake::IoResult { op_id, result } = wake {
            let op = match self.in_flight.remove(&op_id) {
                Some(op) => op,
                None => return,
            };
            match (&op.kind, result) {
                (OpKind::Request { correlation_id, .. }, Ok(OpOutcome::Response { status, body })) => {
                    ctx.send_up(Event::Response {
                        correlation_id: *correlation_id,
                        status,
                        body,
                    });
                    ctx.complete(op, Ok(OpOutcome::Done));
                }
                (_, result) => ctx.complete(op, result),
            }
        }
    }

    fn shutdown(&mut self, ctx: &mut StageCtx<'_>) {
        for (_, op) in self.in_flight.drain() {
            ctx.complete(op, Err(DeviceError::OperationCancelled));
        }
    }
}
