//! The stage capability: accept operations travelling down and events
//! travelling up, with explicit default-forward behavior.
//!
//! Stages form a chain of responsibility. Each stage overrides only the
//! handlers for the traffic it owns; everything else forwards to the
//! neighbor via the defaults below. Completions travel back up through the
//! same chain so that cross-cutting stages (retry, connection management)
//! can intercept results of operations they let pass.

use super::events::Event;
use super::ops::{OpResult, Operation};
use super::{StageCtx, Wake};

pub(crate) trait PipelineStage: Send {
    /// Stage name, used for logging.
    fn name(&self) -> &'static str;

    /// Called once before the pipeline starts processing, e.g. to arm
    /// timers.
    fn start(&mut self, _ctx: &mut StageCtx<'_>) {}

    /// An operation arriving from the stage above.
    fn handle_op(&mut self, op: Operation, ctx: &mut StageCtx<'_>) {
        ctx.send_down(op);
    }

    /// An event arriving from the stage below.
    fn handle_event(&mut self, event: Event, ctx: &mut StageCtx<'_>) {
        ctx.send_up(event);
    }

    /// A completion travelling up for an operation this stage previously
    /// passed down.
    fn handle_completion(&mut self, op: Operation, result: OpResult, ctx: &mut StageCtx<'_>) {
        ctx.complete(op, result);
    }

    /// A wake-up this stage scheduled (timer expiry, I/O result,
    /// transport notification).
    fn handle_wake(&mut self, _wake: Wake, _ctx: &mut StageCtx<'_>) {}

    /// The pipeline is shutting down: fail every held operation with
    /// `OperationCancelled` and release resources. Runs head to tail.
    fn shutdown(&mut self, _ctx: &mut StageCtx<'_>) {}
}
