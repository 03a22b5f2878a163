//! devicelink - device-side pipeline client for cloud IoT hubs
//!
//! This crate implements the operation/event pipeline a device runs to talk
//! to a cloud IoT message broker:
//!
//! - a chain-of-responsibility stage pipeline turning client intents
//!   (connect, telemetry, twin traffic, subscriptions) into transport calls
//! - connection lifecycle management with coalescing, auto-connect, and
//!   reconnect-after-drop
//! - uniform retry/backoff classification across transports
//! - credential expiry tracking with forced re-authentication
//! - pluggable transports: a publish/subscribe protocol client and a
//!   request/response HTTP transport
//!
//! # Quick start
//!
//! ```no_run
//! use devicelink::{
//!     DeviceClient, PipelineConfig, SasToken, StaticAuthProvider, TelemetryMessage,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::new("contoso.example-hub.net", "device-1");
//! let auth = Arc::new(StaticAuthProvider::new(SasToken::new(
//!     "SharedAccessSignature sr=...&sig=...&se=...",
//!     chrono::Utc::now() + chrono::Duration::hours(24),
//! )));
//!
//! let client = DeviceClient::new(config, auth)?;
//! client.connect().await?;
//! client
//!     .send_telemetry(TelemetryMessage::new(&b"{\"temp\": 21.5}"[..]))
//!     .await?;
//!
//! let mut events = client.take_events().expect("events taken once");
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(()) }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod message;
pub mod pipeline;
pub mod testing;
mod topics;
pub mod transport;

pub use auth::{AuthProvider, SasToken, StaticAuthProvider};
pub use client::{DeviceClient, TelemetrySend};
pub use config::{ConfigError, PipelineConfig, RetryPolicy};
pub use error::{DeviceError, DeviceResult};
pub use message::{Feature, MethodRequest, ReceivedMessage, TelemetryMessage};
pub use pipeline::{ClientEvent, ConnectionState};
pub use transport::http::HttpRequestClient;
pub use transport::mqtt::MqttProtocolClient;
pub use transport::{ProtocolClient, TransportNotification};
