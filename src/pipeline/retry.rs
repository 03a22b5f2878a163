//! Retry: watches transport-bound operations for retryable failures.
//!
//! Two recovery modes, chosen by error kind:
//!
//! - retry-after-reconnect: an operation that failed because the connection
//!   went away is held until a Connected event passes this stage, then
//!   resubmitted;
//! - immediate retry: timeouts and transient protocol failures resubmit
//!   after exponential backoff keyed on the operation's attempt counter.
//!
//! Cancellation is checked before every resubmission. Once the attempt
//! budget is spent the operation fails terminally with its last error.

use super::events::Event;
use super::ops::{OpKind, OpResult, Operation};
use super::stage::PipelineStage;
use super::{StageCtx, Wake};
use crate::error::DeviceError;
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub(crate) struct RetryStage {
    waiting_reconnect: Vec<Operation>,
    in_backoff: HashMap<u64, (Operation, JoinHandle<()>)>,
}

impl RetryStage {
    pub fn new() -> Self {
        Self {
            waiting_reconnect: Vec::new(),
            in_backoff: HashMap::new(),
        }
    }

    /// Connection lifecycle operations are the connection stage's business;
    /// everything transport-bound is eligible here.
    fn watches(op: &Operation) -> bool {
        matches!(
            op.kind,
            OpKind::SendTelemetry(_)
                | OpKind::SendMethodResponse { .. }
                | OpKind::Request { .. }
                | OpKind::Subscribe(_)
                | OpKind::Unsubscribe(_)
        )
    }

    fn resubmit_checked(&mut self, op: Operation, ctx: &mut StageCtx<'_>) {
        if op.is_cancelled() {
            debug!(op = op.name(), op_id = op.id(), "cancelled while awaiting retry");
            ctx.complete(op, Err(DeviceError::OperationCancelled));
        } else {
            ctx.resubmit(op);
        }
    }
}

impl PipelineStage for RetryStage {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn handle_completion(&mut self, mut op: Operation, result: OpResult, ctx: &mut StageCtx<'_>) {
        let error = match &result {
            Err(error) if Self::watches(&op) && error.is_retryable() => error.clone(),
            _ => {
                ctx.complete(op, result);
                return;
            }
        };

        if op.is_cancelled() {
            ctx.complete(op, Err(DeviceError::OperationCancelled));
            return;
        }

        let tries_done = op.attempt + 1;
        if tries_done >= ctx.config().retry.max_attempts {
            warn!(
                op = op.name(),
                op_id = op.id(),
                attempts = tries_done,
                %error,
                "retry budget spent; failing with last error"
            );
            ctx.complete(op, result);
            return;
        }
        op.attempt += 1;

        match error {
            DeviceError::ConnectionDropped(_) | DeviceError::NotConnected => {
                debug!(
                    op = op.name(),
                    op_id = op.id(),
                    "holding op until reconnect"
                );
                self.waiting_reconnect.push(op);
            }
            _ => {
                let delay = ctx.config().retry.delay_for(op.attempt);
                info!(
                    op = op.name(),
                    op_id = op.id(),
                    retry = op.attempt,
                    ?delay,
                    %error,
                    "retrying after backoff"
                );
                let timer = ctx.schedule(delay, Wake::Retry(op.id()));
                self.in_backoff.insert(op.id(), (op, timer));
            }
        }
    }

    fn handle_event(&mut self, event: Event, ctx: &mut StageCtx<'_>) {
        if let Event::Connected = event {
            if !self.waiting_reconnect.is_empty() {
                info!(
                    count = self.waiting_reconnect.len(),
                    "reconnected; resubmitting held ops"
                );
            }
            let held = std::mem::take(&mut self.waiting_reconnect);
            for op in held {
                self.resubmit_checked(op, ctx);
            }
        }
        ctx.send_up(event);
    }

    fn handle_wake(&mut self, wake: Wake, ctx: &mut StageCtx<'_>) {
        if let Wake::Retry(op_id) = wake {
            if let Some((op, _timer)) = self.in_backoff.remove(&op_id) {
                self.resubmit_checked(op, ctx);
            }
        }
    }

    fn shutdown(&mut self, ctx: &mut StageCtx<'_>) {
        for op in self.waiting_reconnect.drain(..) {
            ctx.complete(op, Err(DeviceError::OperationCancelled));
        }
        for (_, (op, timer)) in self.in_backoff.drain() {
            timer.abort();
            ctx.complete(op, Err(DeviceError::OperationCancelled));
        }
    }
}
