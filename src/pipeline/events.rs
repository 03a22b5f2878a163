//! Events: pipeline- and transport-initiated notifications that flow up the
//! stage chain. Anything a stage does not recognize it forwards unchanged;
//! whatever reaches the head is translated for the client.

use crate::error::DeviceError;
use crate::message::{MethodRequest, ReceivedMessage};
use bytes::Bytes;
use uuid::Uuid;

#[derive(Debug)]
pub enum Event {
    /// The transport established a connection.
    Connected,
    /// The transport lost or closed its connection. `cause` is set for
    /// unsolicited drops.
    Disconnected { cause: Option<DeviceError> },
    /// Response half of a correlated request; matched against the pending
    /// operation table by the request/response stage.
    Response {
        correlation_id: Uuid,
        status: u16,
        body: Bytes,
    },
    C2dMessage(ReceivedMessage),
    InputMessage(ReceivedMessage),
    MethodRequest(MethodRequest),
    TwinDesiredPatch(serde_json::Value),
    /// The current credential approaches expiry and a renewed one is needed.
    NewSasTokenRequired,
    /// A failure with no attributable operation.
    BackgroundException(DeviceError),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Connected => "connected",
            Event::Disconnected { .. } => "disconnected",
            Event::Response { .. } => "response",
            Event::C2dMessage(_) => "c2d_message",
            Event::InputMessage(_) => "input_message",
            Event::MethodRequest(_) => "method_request",
            Event::TwinDesiredPatch(_) => "twin_desired_patch",
            Event::NewSasTokenRequired => "new_sastoken_required",
            Event::BackgroundException(_) => "background_exception",
        }
    }
}
