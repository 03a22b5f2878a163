//! Transport collaborator interfaces.
//!
//! The pipeline owns no sockets. It drives a [`ProtocolClient`] (any
//! publish/subscribe client with asynchronous completion and an
//! unsolicited-notification channel) or, for request/response pipelines,
//! the HTTP client in [`http`]. Wire framing is the client's business.

use crate::auth::SasToken;
use crate::error::DeviceError;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

pub mod http;
pub mod mqtt;

/// Unsolicited notifications surfaced by a protocol client.
#[derive(Debug)]
pub enum TransportNotification {
    /// A message arrived on a subscribed topic.
    MessageReceived { topic: String, payload: Bytes },
    /// The connection was lost without a disconnect being requested.
    Dropped { cause: DeviceError },
}

/// A publish/subscribe protocol client.
///
/// Calls may block on the network; the transport stage always invokes them
/// from spawned tasks, never from the serialized context.
#[async_trait]
pub trait ProtocolClient: Send + Sync + 'static {
    /// Open the connection and authenticate with the given credential.
    /// Resolves once the server acknowledges the connection.
    async fn connect(&self, credential: SasToken) -> Result<(), DeviceError>;

    /// Close the connection.
    async fn disconnect(&self) -> Result<(), DeviceError>;

    async fn publish(&self, topic: String, payload: Bytes) -> Result<(), DeviceError>;

    async fn subscribe(&self, topic_filter: String) -> Result<(), DeviceError>;

    async fn unsubscribe(&self, topic_filter: String) -> Result<(), DeviceError>;

    /// Hand over the unsolicited-notification channel. Yields `Some` exactly
    /// once; the pipeline takes it at construction.
    fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<TransportNotification>>;
}
