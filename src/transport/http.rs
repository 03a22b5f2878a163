//! Request/response HTTP transport, backed by reqwest.
//!
//! Serves the pipeline flavors that have no standing connection: telemetry
//! posts to the events endpoint and twin traffic runs against the twins
//! resource. The SAS credential travels in the Authorization header.

use crate::auth::SasToken;
use crate::config::PipelineConfig;
use crate::error::{DeviceError, DeviceResult};
use crate::message::TelemetryMessage;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tracing::debug;
use url::Url;

const API_VERSION: &str = "2019-10-01";

pub struct HttpRequestClient {
    http: reqwest::Client,
    base: Url,
    device_id: String,
}

impl HttpRequestClient {
    pub fn new(config: &PipelineConfig) -> DeviceResult<Self> {
        Self::with_base_url(&format!("https://{}", config.hostname), &config.device_id)
    }

    /// Point the client at an explicit base URL (tests use this to target a
    /// local mock server).
    pub fn with_base_url(base: &str, device_id: &str) -> DeviceResult<Self> {
        let base = Url::parse(base)
            .map_err(|_| DeviceError::connection_failed(format!("invalid base url: {base}")))?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| DeviceError::protocol(format!("building http client: {e}"), false))?;
        Ok(Self {
            http,
            base,
            device_id: device_id.to_string(),
        })
    }

    fn map_send_error(error: reqwest::Error) -> DeviceError {
        if error.is_timeout() {
            DeviceError::Timeout
        } else if error.is_connect() {
            DeviceError::connection_failed(error.to_string())
        } else {
            DeviceError::protocol(error.to_string(), true)
        }
    }

    /// POST a telemetry message to the events endpoint.
    pub async fn send_telemetry(
        &self,
        message: &TelemetryMessage,
        credential: &SasToken,
    ) -> DeviceResult<()> {
        let url = self
            .base
            .join(&format!(
                "devices/{}/messages/events?api-version={API_VERSION}",
                self.device_id
            ))
            .map_err(|e| DeviceError::pipeline(format!("building events url: {e}")))?;

        let mut request = self
            .http
            .post(url)
            .header(AUTHORIZATION, credential.as_str())
            .body(message.payload.clone());
        for (name, value) in &message.properties {
            request = request.header(format!("iothub-app-{name}"), value);
        }

        let response = request.send().await.map_err(Self::map_send_error)?;
        let status = response.status();
        debug!(%status, "telemetry POST completed");
        match status.as_u16() {
            s if s < 300 => Ok(()),
            401 | 403 => Err(DeviceError::unauthorized(format!(
                "telemetry rejected with status {status}"
            ))),
            429 => Err(DeviceError::protocol("telemetry throttled", true)),
            s if s >= 500 => Err(DeviceError::protocol(
                format!("service failure with status {status}"),
                true,
            )),
            _ => Err(DeviceError::protocol(
                format!("telemetry failed with status {status}"),
                false,
            )),
        }
    }

    /// Execute a twin request against the twins resource. Returns the raw
    /// status and body; the request/response stage interprets them.
    pub async fn twin_request(
        &self,
        method: &str,
        resource: &str,
        body: Bytes,
        credential: &SasToken,
    ) -> DeviceResult<(u16, Bytes)> {
        let path = format!(
            "twins/{}{}?api-version={API_VERSION}",
            self.device_id,
            resource.trim_end_matches('/')
        );
        let url = self
            .base
            .join(&path)
            .map_err(|e| DeviceError::pipeline(format!("building twin url: {e}")))?;

        let request = match method {
            "GET" => self.http.get(url),
            "PATCH" => self
                .http
                .patch(url)
                .header(CONTENT_TYPE, "application/json")
                .body(body),
            other => {
                return Err(DeviceError::pipeline(format!(
                    "unsupported twin request method {other}"
                )))
            }
        };

        let response = request
            .header(AUTHORIZATION, credential.as_str())
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(Self::map_send_error)?;
        debug!(status, bytes = body.len(), "twin request completed");
        Ok((status, body))
    }
}
