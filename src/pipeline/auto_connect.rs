//! Auto-connect: operations that need a connection trigger one.
//!
//! When a network-bound operation arrives while the pipeline is not
//! connected, this stage either fails it immediately (auto-connect off) or
//! parks it and sends a single internal connect down, releasing everything
//! it parked once the connect settles. Concurrent triggers coalesce onto the
//! one in-flight connect.

use super::ops::{OpKind, OpResult, Operation};
use super::stage::PipelineStage;
use super::{ConnectionState, StageCtx};
use crate::error::DeviceError;
use tracing::debug;

pub(crate) struct AutoConnectStage {
    waiting: Vec<Operation>,
    pending_connect: Option<u64>,
}

impl AutoConnectStage {
    pub fn new() -> Self {
        Self {
            waiting: Vec::new(),
            pending_connect: None,
        }
    }
}

impl PipelineStage for AutoConnectStage {
    fn name(&self) -> &'static str {
        "auto_connect"
    }

    fn handle_op(&mut self, op: Operation, ctx: &mut StageCtx<'_>) {
        if !op.needs_connection() || ctx.nucleus.state == ConnectionState::Connected {
            ctx.send_down(op);
            return;
        }

        if !ctx.config().auto_connect {
            debug!(op = op.name(), "not connected and auto-connect disabled");
            ctx.complete(op, Err(DeviceError::NotConnected));
            return;
        }

        debug!(op = op.name(), op_id = op.id(), "parking op behind connect");
        self.waiting.push(op);
        if self.pending_connect.is_none() {
            let connect = Operation::internal(ctx.next_op_id(), OpKind::Connect);
            self.pending_connect = Some(connect.id());
            ctx.send_down(connect);
        }
    }

    fn handle_completion(&mut self, op: Operation, result: OpResult, ctx: &mut StageCtx<'_>) {
        if self.pending_connect != Some(op.id()) {
            ctx.complete(op, result);
            return;
        }

        self.pending_connect = None;
        match result {
            Ok(_) => {
                debug!(parked = self.waiting.len(), "connected; releasing parked ops");
                // Re-run through this stage: the connection can drop again
                // before the parked ops make it to the transport.
                for parked in self.waiting.drain(..) {
                    ctx.resubmit(parked);
                }
            }
            Err(error) => {
                debug!(parked = self.waiting.len(), %error, "connect failed; failing parked ops");
                for parked in self.waiting.drain(..) {
                    ctx.complete(parked, Err(error.clone()));
                }
            }
        }
        // The internal connect has no submitter; it is absorbed here.
    }

    fn shutdown(&mut self, ctx: &mut StageCtx<'_>) {
        for parked in self.waiting.drain(..) {
            ctx.complete(parked, Err(DeviceError::OperationCancelled));
        }
        self.pending_connect = None;
    }
}
