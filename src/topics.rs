//! Hub topic grammar for the pub/sub transport.
//!
//! Builders produce the publish topics and subscription filters the
//! transport stage registers; [`route_inbound`] classifies an incoming
//! topic so the transport stage can synthesize the matching pipeline event.
//!
//! Values embedded in topics are percent-encoded. `+` must never stand in
//! for a space inside a topic, so the form-urlencoded serializer's output
//! is post-processed.

use crate::message::{Feature, TelemetryMessage};
use std::collections::HashMap;
use uuid::Uuid;

fn topic_base(device_id: &str, module_id: Option<&str>) -> String {
    match module_id {
        Some(module_id) => format!("devices/{device_id}/modules/{module_id}"),
        None => format!("devices/{device_id}"),
    }
}

fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// Publish topic for a telemetry message, message properties included.
pub(crate) fn telemetry_publish_topic(
    device_id: &str,
    module_id: Option<&str>,
    message: &TelemetryMessage,
) -> String {
    let mut topic = format!("{}/messages/events/", topic_base(device_id, module_id));

    let mut pairs: Vec<String> = Vec::new();
    if let Some(output_name) = &message.output_name {
        pairs.push(format!("{}={}", encode("$.on"), encode(output_name)));
    }
    let mut names: Vec<&String> = message.properties.keys().collect();
    names.sort(); // deterministic topic for a given message
    for name in names {
        pairs.push(format!("{}={}", encode(name), encode(&message.properties[name])));
    }
    topic.push_str(&pairs.join("&"));
    topic
}

/// Publish topic for a direct method response.
pub(crate) fn method_response_topic(request_id: &str, status: u16) -> String {
    format!("$iothub/methods/res/{status}/?$rid={}", encode(request_id))
}

/// Publish topic for a twin request (GET or PATCH).
pub(crate) fn twin_request_topic(method: &str, resource: &str, correlation_id: &Uuid) -> String {
    format!("$iothub/twin/{method}{resource}?$rid={correlation_id}")
}

/// Subscription filter registered when a feature is enabled.
pub(crate) fn subscription_filter(
    feature: Feature,
    device_id: &str,
    module_id: Option<&str>,
) -> String {
    match feature {
        Feature::C2dMessages => format!("{}/messages/devicebound/#", topic_base(device_id, None)),
        Feature::InputMessages => format!("{}/inputs/#", topic_base(device_id, module_id)),
        Feature::Methods => "$iothub/methods/POST/#".to_string(),
        Feature::Twin => "$iothub/twin/res/#".to_string(),
        Feature::TwinPatches => "$iothub/twin/PATCH/properties/desired/#".to_string(),
    }
}

/// Classified inbound topic.
#[derive(Debug, PartialEq)]
pub(crate) enum InboundRoute {
    C2d {
        properties: HashMap<String, String>,
    },
    Input {
        input_name: String,
        properties: HashMap<String, String>,
    },
    Method {
        name: String,
        request_id: String,
    },
    TwinResponse {
        status: u16,
        request_id: String,
    },
    TwinPatch,
}

/// Classify an inbound topic, or `None` for topics this device does not
/// recognize (which the transport stage drops with a debug log).
pub(crate) fn route_inbound(
    topic: &str,
    device_id: &str,
    module_id: Option<&str>,
) -> Option<InboundRoute> {
    if let Some(rest) = topic.strip_prefix("$iothub/twin/res/") {
        let (status_part, query) = rest.split_once("/?")?;
        let status = status_part.parse::<u16>().ok()?;
        let request_id = query_value(query, "$rid")?;
        return Some(InboundRoute::TwinResponse { status, request_id });
    }

    if topic.starts_with("$iothub/twin/PATCH/properties/desired") {
        return Some(InboundRoute::TwinPatch);
    }

    if let Some(rest) = topic.strip_prefix("$iothub/methods/POST/") {
        let (name, query) = rest.split_once("/?")?;
        let request_id = query_value(query, "$rid")?;
        return Some(InboundRoute::Method {
            name: name.to_string(),
            request_id,
        });
    }

    let c2d_prefix = format!("{}/messages/devicebound", topic_base(device_id, None));
    if let Some(rest) = topic.strip_prefix(c2d_prefix.as_str()) {
        let properties = decode_properties(rest.trim_start_matches('/'));
        return Some(InboundRoute::C2d { properties });
    }

    if let Some(module_id) = module_id {
        let input_prefix = format!("{}/inputs/", topic_base(device_id, Some(module_id)));
        if let Some(rest) = topic.strip_prefix(input_prefix.as_str()) {
            let (input_name, props) = match rest.split_once('/') {
                Some((name, props)) => (name, props),
                None => (rest, ""),
            };
            if input_name.is_empty() {
                return None;
            }
            return Some(InboundRoute::Input {
                input_name: input_name.to_string(),
                properties: decode_properties(props),
            });
        }
    }

    None
}

fn query_value(query: &str, key: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

fn decode_properties(segment: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(segment.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}
