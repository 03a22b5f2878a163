//! Operations: caller-initiated intents that flow down the stage chain.
//!
//! An operation is owned by the caller until submission and by the pipeline
//! until completion. Completion is exactly-once by construction: the
//! completion channel is a oneshot whose sender is consumed by
//! [`Operation::finish`], and an operation dropped before it was finished
//! fires the channel with an internal pipeline error so the submitter never
//! hangs and the breach is observable.

use crate::error::DeviceError;
use crate::message::{Feature, TelemetryMessage};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;

/// What a successfully completed operation produced.
#[derive(Debug)]
pub enum OpOutcome {
    Done,
    /// A request/response operation's response.
    Response { status: u16, body: Bytes },
}

pub type OpResult = Result<OpOutcome, DeviceError>;

/// The intent an operation carries down the chain.
#[derive(Debug)]
pub enum OpKind {
    Connect,
    Disconnect,
    /// Drop and re-establish the connection to pick up a renewed credential.
    Reauthorize,
    SendTelemetry(TelemetryMessage),
    SendMethodResponse {
        request_id: String,
        status: u16,
        payload: serde_json::Value,
    },
    GetTwin,
    PatchTwinReported {
        patch: serde_json::Value,
    },
    /// A correlated request produced from `GetTwin`/`PatchTwinReported` by
    /// the request/response stage.
    Request {
        method: &'static str,
        resource: &'static str,
        body: Bytes,
        correlation_id: Uuid,
    },
    Subscribe(Feature),
    Unsubscribe(Feature),
}

#[derive(Debug)]
pub struct Operation {
    id: u64,
    pub kind: OpKind,
    completion: Option<oneshot::Sender<OpResult>>,
    cancelled: Arc<AtomicBool>,
    /// Number of retries performed so far; maintained by the retry stage.
    pub(crate) attempt: u32,
}

impl Operation {
    pub(crate) fn new(id: u64, kind: OpKind, completion: oneshot::Sender<OpResult>) -> Self {
        Self {
            id,
            kind,
            completion: Some(completion),
            cancelled: Arc::new(AtomicBool::new(false)),
            attempt: 0,
        }
    }

    /// An operation spawned by a stage on its own behalf. Nothing awaits it,
    /// so it has no completion channel.
    pub(crate) fn internal(id: u64, kind: OpKind) -> Self {
        Self {
            id,
            kind,
            completion: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            attempt: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stage-facing name, used for logging.
    pub fn name(&self) -> &'static str {
        match &self.kind {
            OpKind::Connect => "connect",
            OpKind::Disconnect => "disconnect",
            OpKind::Reauthorize => "reauthorize",
            OpKind::SendTelemetry(_) => "send_telemetry",
            OpKind::SendMethodResponse { .. } => "send_method_response",
            OpKind::GetTwin => "get_twin",
            OpKind::PatchTwinReported { .. } => "patch_twin_reported",
            OpKind::Request { .. } => "request",
            OpKind::Subscribe(_) => "subscribe",
            OpKind::Unsubscribe(_) => "unsubscribe",
        }
    }

    /// Whether this operation can only run over an established connection.
    pub fn needs_connection(&self) -> bool {
        !matches!(
            self.kind,
            OpKind::Connect | OpKind::Disconnect | OpKind::Reauthorize
        )
    }

    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Complete the operation. Consumes it, so a second completion is
    /// unrepresentable.
    pub(crate) fn finish(mut self, result: OpResult) {
        if let Some(completion) = self.completion.take() {
            // A dropped receiver just means the submitter stopped waiting.
            let _ = completion.send(result);
        }
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            tracing::error!(
                op = self.name(),
                op_id = self.id,
                "operation dropped without completion"
            );
            let _ = completion.send(Err(DeviceError::pipeline(format!(
                "{} operation dropped without completion",
                self.name()
            ))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_finish_delivers_result_once() {
        let (tx, rx) = oneshot::channel();
        let op = Operation::new(1, OpKind::Connect, tx);

        op.finish(Ok(OpOutcome::Done));

        assert!(matches!(rx.await, Ok(Ok(OpOutcome::Done))));
    }

    #[tokio::test]
    async fn test_dropped_operation_completes_with_pipeline_error() {
        let (tx, rx) = oneshot::channel();
        {
            let _op = Operation::new(2, OpKind::GetTwin, tx);
            // dropped here without finish()
        }

        match rx.await {
            Ok(Err(DeviceError::Pipeline(message))) => {
                assert!(message.contains("dropped without completion"));
            }
            other => panic!("expected pipeline error, got {other:?}"),
        }
    }

    #[test]
    fn test_needs_connection() {
        let (tx, _rx) = oneshot::channel();
        assert!(!Operation::new(1, OpKind::Connect, tx).needs_connection());
        let (tx, _rx) = oneshot::channel();
        assert!(!Operation::new(2, OpKind::Disconnect, tx).needs_connection());
        let (tx, _rx) = oneshot::channel();
        assert!(
            Operation::new(3, OpKind::SendTelemetry(TelemetryMessage::default()), tx)
                .needs_connection()
        );
        let (tx, _rx) = oneshot::channel();
        assert!(Operation::new(4, OpKind::GetTwin, tx).needs_connection());
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let (tx, _rx) = oneshot::channel();
        let op = Operation::new(5, OpKind::SendTelemetry(TelemetryMessage::default()), tx);
        let flag = op.cancel_flag();
        assert!(!op.is_cancelled());
        flag.store(true, Ordering::SeqCst);
        assert!(op.is_cancelled());
    }

    #[test]
    fn test_internal_operation_drops_silently() {
        // No completion channel, so Drop has nothing to report.
        let op = Operation::internal(6, OpKind::Connect);
        drop(op);
    }
}
