//! Request/response coordination: the pending-operation table.
//!
//! Twin reads and reported-property patches are request/response exchanges
//! over a transport that only knows how to publish. This stage converts them
//! into correlated request operations, parks the original in the pending
//! table, and completes it when the matching response event arrives, when
//! its timeout fires, or at shutdown. Whichever comes first removes the
//! table entry; the losers of that race find no entry and are no-ops.

use super::events::Event;
use super::ops::{OpKind, OpOutcome, OpResult, Operation};
use super::stage::PipelineStage;
use super::{StageCtx, Wake};
use crate::error::DeviceError;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub(crate) struct RequestResponseStage {
    pending: HashMap<Uuid, Operation>,
    timers: HashMap<Uuid, JoinHandle<()>>,
}

impl RequestResponseStage {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            timers: HashMap::new(),
        }
    }

    /// Build the correlated request for a waiting operation. `None` for
    /// kinds this stage does not convert.
    fn request_kind(op: &Operation, correlation_id: Uuid) -> Option<OpKind> {
        match &op.kind {
            OpKind::GetTwin => Some(OpKind::Request {
                method: "GET",
                resource: "/",
                body: Bytes::new(),
                correlation_id,
            }),
            OpKind::PatchTwinReported { patch } => {
                let body = serde_json::to_vec(patch).ok()?;
                Some(OpKind::Request {
                    method: "PATCH",
                    resource: "/properties/reported/",
                    body: Bytes::from(body),
                    correlation_id,
                })
            }
            _ => None,
        }
    }

    fn clear_timer(&mut self, correlation_id: &Uuid) {
        if let Some(timer) = self.timers.remove(correlation_id) {
            timer.abort();
        }
    }

    fn status_error(status: u16) -> DeviceError {
        match status {
            401 | 403 => DeviceError::unauthorized(format!("request rejected with status {status}")),
            429 => DeviceError::protocol(format!("request throttled with status {status}"), true),
            s if s >= 500 => {
                DeviceError::protocol(format!("service failure with status {status}"), true)
            }
            s => DeviceError::protocol(format!("request failed with status {status}"), false),
        }
    }
}

impl PipelineStage for RequestResponseStage {
    fn name(&self) -> &'static str {
        "request_response"
    }

    fn handle_op(&mut self, op: Operation, ctx: &mut StageCtx<'_>) {
        if !matches!(op.kind, OpKind::GetTwin | OpKind::PatchTwinReported { .. }) {
            ctx.send_down(op);
            return;
        }

        let correlation_id = Uuid::new_v4();
        let request_kind = match Self::request_kind(&op, correlation_id) {
            Some(kind) => kind,
            None => {
                ctx.complete(
                    op,
                    Err(DeviceError::pipeline("failed to encode request body")),
                );
                return;
            }
        };

        debug!(
            op = op.name(),
            op_id = op.id(),
            %correlation_id,
            "registering pending request"
        );
        let timeout = ctx.config().request_timeout();
        self.timers.insert(
            correlation_id,
            ctx.schedule(timeout, Wake::RequestTimeout(correlation_id)),
        );
        self.pending.insert(correlation_id, op);

        let request = Operation::internal(ctx.next_op_id(), request_kind);
        ctx.send_down(request);
    }

    fn handle_completion(&mut self, op: Operation, result: OpResult, ctx: &mut StageCtx<'_>) {
        let correlation_id = match &op.kind {
            OpKind::Request { correlation_id, .. } => *correlation_id,
            _ => {
                ctx.complete(op, result);
                return;
            }
        };

        // The request operation only reports whether the transport accepted
        // it; success means "now wait for the response event".
        if let Err(error) = result {
            if let Some(original) = self.pending.remove(&correlation_id) {
                self.clear_timer(&correlation_id);
                warn!(%correlation_id, %error, "request send failed");
                ctx.complete(original, Err(error));
            }
        }
        // the internal request operation is absorbed here
    }

    fn handle_event(&mut self, event: Event, ctx: &mut StageCtx<'_>) {
        match event {
            Event::Response {
                correlation_id,
                status,
                body,
            } => match self.pending.remove(&correlation_id) {
                Some(original) => {
                    self.clear_timer(&correlation_id);
                    debug!(%correlation_id, status, "matched response to pending request");
                    let result = if status < 300 {
                        Ok(OpOutcome::Response { status, body })
                    } else {
                        Err(Self::status_error(status))
                    };
                    ctx.complete(original, result);
                }
                None => {
                    // Timed out, shut down, or a duplicate: resolved once
                    // already, so this is deliberately a no-op.
                    debug!(%correlation_id, "response without pending entry; dropping");
                }
            },
            Event::Connected => {
                // The connection was re-established; any response in flight
                // may have been lost with the old connection. Re-send every
                // pending request under its original correlation id.
                if !self.pending.is_empty() {
                    info!(count = self.pending.len(), "re-sending pending requests");
                }
                let resend: Vec<(Uuid, OpKind)> = self
                    .pending
                    .iter()
                    .filter_map(|(correlation_id, original)| {
                        Self::request_kind(original, *correlation_id)
                            .map(|kind| (*correlation_id, kind))
                    })
                    .collect();
                for (correlation_id, kind) in resend {
                    debug!(%correlation_id, "re-sending request");
                    let request = Operation::internal(ctx.next_op_id(), kind);
                    ctx.send_down(request);
                }
                ctx.send_up(Event::Connected);
            }
            other => ctx.send_up(other),
        }
    }

    fn handle_wake(&mut self, wake: Wake, ctx: &mut StageCtx<'_>) {
        if let Wake::RequestTimeout(correlation_id) = wake {
            self.timers.remove(&correlation_id);
            match self.pending.remove(&correlation_id) {
                Some(original) => {
                    warn!(%correlation_id, "request timed out");
                    ctx.complete(original, Err(DeviceError::Timeout));
                }
                None => {
                    // response won the race
                    debug!(%correlation_id, "timeout after resolution; no-op");
                }
            }
        }
    }

    fn shutdown(&mut self, ctx: &mut StageCtx<'_>) {
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        for (_, original) in self.pending.drain() {
            ctx.complete(original, Err(DeviceError::OperationCancelled));
        }
    }
}
