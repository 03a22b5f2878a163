//! Message and feature types shared by the client surface and the pipeline.

use bytes::Bytes;
use std::collections::HashMap;

/// Features a device client can enable on the hub connection.
///
/// Enabling a feature registers the matching inbound topic with the
/// transport; disabling unregisters it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// Cloud-to-device messages.
    C2dMessages,
    /// Input messages routed to a module.
    InputMessages,
    /// Direct method requests.
    Methods,
    /// Twin request/response traffic.
    Twin,
    /// Twin desired-property patches.
    TwinPatches,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::C2dMessages => "c2d_messages",
            Feature::InputMessages => "input_messages",
            Feature::Methods => "methods",
            Feature::Twin => "twin",
            Feature::TwinPatches => "twin_patches",
        }
    }
}

/// An outbound telemetry message.
#[derive(Debug, Clone, Default)]
pub struct TelemetryMessage {
    pub payload: Bytes,
    /// Output name, used by modules to route telemetry to a named output.
    pub output_name: Option<String>,
    /// Custom application properties, encoded into the publish topic.
    pub properties: HashMap<String, String>,
}

impl TelemetryMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            output_name: None,
            properties: HashMap::new(),
        }
    }

    pub fn with_output(mut self, output_name: impl Into<String>) -> Self {
        self.output_name = Some(output_name.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// An inbound message (cloud-to-device or module input).
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub payload: Bytes,
    /// Properties decoded from the inbound topic.
    pub properties: HashMap<String, String>,
    /// Input name, set for module input messages only.
    pub input_name: Option<String>,
}

/// A direct method invocation received from the hub.
#[derive(Debug, Clone)]
pub struct MethodRequest {
    /// Request id used to correlate the method response.
    pub request_id: String,
    pub name: String,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_builder() {
        let msg = TelemetryMessage::new("hello".as_bytes().to_vec())
            .with_output("alerts")
            .with_property("priority", "high");

        assert_eq!(msg.payload.as_ref(), b"hello");
        assert_eq!(msg.output_name.as_deref(), Some("alerts"));
        assert_eq!(
            msg.properties.get("priority").map(String::as_str),
            Some("high")
        );
    }

    #[test]
    fn test_feature_names_are_unique() {
        let features = [
            Feature::C2dMessages,
            Feature::InputMessages,
            Feature::Methods,
            Feature::Twin,
            Feature::TwinPatches,
        ];
        let mut names: Vec<_> = features.iter().map(|f| f.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), features.len());
    }
}
