//! Connection management: the connection state machine, transition
//! coalescing, and reconnect-after-drop.
//!
//! This stage is the sole writer of the connection state. Connect and
//! disconnect operations that match the current terminal state complete
//! immediately; ones that match an in-flight transition coalesce onto it, so
//! back-to-back connects produce exactly one transport-level call. Unrelated
//! operations arriving mid-transition are parked and resubmitted when the
//! transition settles. An unsolicited drop schedules a reconnect with the
//! retry policy's backoff.

use super::events::Event;
use super::ops::{OpKind, OpOutcome, OpResult, Operation};
use super::stage::PipelineStage;
use super::{StageCtx, Wake};
use crate::error::DeviceError;
use std::collections::VecDeque;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection lifecycle of the pipeline.
///
/// Transitions run Disconnected → Connecting → Connected → Disconnecting →
/// Disconnected, plus Connecting/Connected → Disconnected on failure, always
/// inside the serialized context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReauthPhase {
    Disconnecting,
    Connecting,
}

enum Transition {
    Connecting {
        op_id: u64,
        waiters: Vec<Operation>,
        /// Started by the reconnect timer rather than a submitted operation.
        reconnecting: bool,
    },
    Disconnecting {
        op_id: u64,
        waiters: Vec<Operation>,
    },
    Reauthorizing {
        op_id: u64,
        phase: ReauthPhase,
        original: Option<Operation>,
    },
}

pub(crate) struct ConnectionStage {
    transition: Option<Transition>,
    /// Operations that arrived while a transition was in flight.
    parked: VecDeque<Operation>,
    reconnect_timer: Option<JoinHandle<()>>,
    reconnect_attempt: u32,
}

impl ConnectionStage {
    pub fn new() -> Self {
        Self {
            transition: None,
            parked: VecDeque::new(),
            reconnect_timer: None,
            reconnect_attempt: 0,
        }
    }

    fn cancel_reconnect_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    fn release_parked(&mut self, ctx: &mut StageCtx<'_>) {
        for op in self.parked.drain(..) {
            ctx.resubmit(op);
        }
    }

    fn fail_parked(&mut self, error: &DeviceError, ctx: &mut StageCtx<'_>) {
        for op in self.parked.drain(..) {
            ctx.complete(op, Err(error.clone()));
        }
    }

    fn schedule_reconnect(&mut self, ctx: &mut StageCtx<'_>) {
        let attempt = self.reconnect_attempt + 1;
        if attempt > ctx.config().retry.max_attempts {
            warn!(attempts = self.reconnect_attempt, "reconnect attempts exhausted");
            self.reconnect_attempt = 0;
            ctx.background_exception(DeviceError::connection_dropped(
                "reconnect attempts exhausted",
            ));
            return;
        }
        self.reconnect_attempt = attempt;
        let delay = ctx.config().retry.delay_for(attempt);
        info!(attempt, ?delay, "scheduling reconnect");
        self.cancel_reconnect_timer();
        self.reconnect_timer = Some(ctx.schedule(delay, Wake::Reconnect));
    }

    fn handle_connect(&mut self, op: Operation, ctx: &mut StageCtx<'_>) {
        if let Some(transition) = &mut self.transition {
            match transition {
                Transition::Connecting { waiters, .. } => {
                    debug!(op_id = op.id(), "coalescing connect onto in-flight connect");
                    waiters.push(op);
                }
                _ => self.parked.push_back(op),
            }
            return;
        }

        if ctx.nucleus.state == ConnectionState::Connected {
            debug!("already connected; completing connect as no-op");
            ctx.complete(op, Ok(OpOutcome::Done));
            return;
        }

        // A manual connect supersedes any waiting reconnect.
        self.cancel_reconnect_timer();
        ctx.nucleus.state = ConnectionState::Connecting;
        self.transition = Some(Transition::Connecting {
            op_id: op.id(),
            waiters: Vec::new(),
            reconnecting: false,
        });
        ctx.send_down(op);
    }

    fn handle_disconnect(&mut self, op: Operation, ctx: &mut StageCtx<'_>) {
        if let Some(transition) = &mut self.transition {
            match transition {
                Transition::Disconnecting { waiters, .. } => {
                    debug!(op_id = op.id(), "coalescing disconnect onto in-flight disconnect");
                    waiters.push(op);
                }
                _ => self.parked.push_back(op),
            }
            return;
        }

        if ctx.nucleus.state == ConnectionState::Disconnected {
            // An explicit disconnect also cancels a pending reconnect.
            self.cancel_reconnect_timer();
            self.reconnect_attempt = 0;
            debug!("already disconnected; completing disconnect as no-op");
            ctx.complete(op, Ok(OpOutcome::Done));
            return;
        }

        self.cancel_reconnect_timer();
        self.reconnect_attempt = 0;
        ctx.nucleus.state = ConnectionState::Disconnecting;
        self.transition = Some(Transition::Disconnecting {
            op_id: op.id(),
            waiters: Vec::new(),
        });
        ctx.send_down(op);
    }

    fn handle_reauthorize(&mut self, op: Operation, ctx: &mut StageCtx<'_>) {
        if self.transition.is_some() {
            self.parked.push_back(op);
            return;
        }

        if ctx.nucleus.state != ConnectionState::Connected {
            // Nothing to re-authenticate; the renewed credential is picked
            // up at the next connect.
            ctx.complete(op, Ok(OpOutcome::Done));
            return;
        }

        info!("reauthorizing: dropping connection to re-authenticate");
        let disconnect = Operation::internal(ctx.next_op_id(), OpKind::Disconnect);
        ctx.nucleus.state = ConnectionState::Disconnecting;
        self.transition = Some(Transition::Reauthorizing {
            op_id: disconnect.id(),
            phase: ReauthPhase::Disconnecting,
            original: Some(op),
        });
        ctx.send_down(disconnect);
    }

    fn transition_matches(&self, op: &Operation) -> bool {
        match &self.transition {
            Some(Transition::Connecting { op_id, .. })
            | Some(Transition::Disconnecting { op_id, .. })
            | Some(Transition::Reauthorizing { op_id, .. }) => *op_id == op.id(),
            None => false,
        }
    }
}

impl PipelineStage for ConnectionStage {
    fn name(&self) -> &'static str {
        "connection"
    }

    fn handle_op(&mut self, op: Operation, ctx: &mut StageCtx<'_>) {
        match op.kind {
            OpKind::Connect => self.handle_connect(op, ctx),
            OpKind::Disconnect => self.handle_disconnect(op, ctx),
            OpKind::Reauthorize => self.handle_reauthorize(op, ctx),
            _ => {
                if self.transition.is_some() {
                    debug!(op = op.name(), "transition in flight; parking op");
                    self.parked.push_back(op);
                } else {
                    ctx.send_down(op);
                }
            }
        }
    }

    fn handle_completion(&mut self, op: Operation, result: OpResult, ctx: &mut StageCtx<'_>) {
        if !self.transition_matches(&op) {
            ctx.complete(op, result);
            return;
        }

        match self.transition.take().expect("transition checked above") {
            Transition::Connecting {
                waiters,
                reconnecting,
                ..
            } => match &result {
                Ok(_) => {
                    info!("connected");
                    ctx.nucleus.state = ConnectionState::Connected;
                    self.reconnect_attempt = 0;
                    for waiter in waiters {
                        ctx.complete(waiter, Ok(OpOutcome::Done));
                    }
                    self.release_parked(ctx);
                    if !reconnecting {
                        ctx.complete(op, result);
                    }
                }
                Err(error) => {
                    warn!(%error, "connect failed");
                    ctx.nucleus.state = ConnectionState::Disconnected;
                    for waiter in waiters {
                        ctx.complete(waiter, Err(error.clone()));
                    }
                    let error = error.clone();
                    self.fail_parked(&error, ctx);
                    if reconnecting {
                        if error.is_retryable() && ctx.config().connection_retry {
                            self.schedule_reconnect(ctx);
                        } else {
                            ctx.background_exception(error);
                        }
                    } else {
                        ctx.complete(op, result);
                    }
                }
            },
            Transition::Disconnecting { waiters, .. } => {
                if let Err(error) = &result {
                    // The transport could not close cleanly; the connection
                    // is gone either way.
                    warn!(%error, "disconnect completed with error");
                }
                info!("disconnected");
                ctx.nucleus.state = ConnectionState::Disconnected;
                for waiter in waiters {
                    ctx.complete(waiter, Ok(OpOutcome::Done));
                }
                self.release_parked(ctx);
                ctx.complete(op, Ok(OpOutcome::Done));
            }
            Transition::Reauthorizing {
                phase, original, ..
            } => match phase {
                ReauthPhase::Disconnecting => {
                    if let Err(error) = &result {
                        warn!(%error, "disconnect during reauthorization failed");
                    }
                    let connect = Operation::internal(ctx.next_op_id(), OpKind::Connect);
                    ctx.nucleus.state = ConnectionState::Connecting;
                    self.transition = Some(Transition::Reauthorizing {
                        op_id: connect.id(),
                        phase: ReauthPhase::Connecting,
                        original,
                    });
                    ctx.send_down(connect);
                    // the internal disconnect is absorbed here
                }
                ReauthPhase::Connecting => match &result {
                    Ok(_) => {
                        info!("reauthorized");
                        ctx.nucleus.state = ConnectionState::Connected;
                        self.reconnect_attempt = 0;
                        self.release_parked(ctx);
                        if let Some(original) = original {
                            ctx.complete(original, Ok(OpOutcome::Done));
                        }
                    }
                    Err(error) => {
                        warn!(%error, "reconnect after reauthorization failed");
                        ctx.nucleus.state = ConnectionState::Disconnected;
                        let error = error.clone();
                        self.fail_parked(&error, ctx);
                        match original {
                            Some(original) => ctx.complete(original, Err(error)),
                            None => {
                                if error.is_retryable() && ctx.config().connection_retry {
                                    self.schedule_reconnect(ctx);
                                } else {
                                    ctx.background_exception(error);
                                }
                            }
                        }
                    }
                },
            },
        }
    }

    fn handle_event(&mut self, event: Event, ctx: &mut StageCtx<'_>) {
        match event {
            Event::Disconnected { cause } => {
                let voluntary = matches!(
                    self.transition,
                    Some(Transition::Disconnecting { .. }) | Some(Transition::Reauthorizing { .. })
                );
                if voluntary {
                    // transition completion performs the state change
                    ctx.send_up(Event::Disconnected { cause });
                } else if ctx.nucleus.state == ConnectionState::Connected {
                    info!("unsolicited disconnect");
                    ctx.nucleus.state = ConnectionState::Disconnected;
                    ctx.send_up(Event::Disconnected { cause });
                    if ctx.config().connection_retry {
                        self.schedule_reconnect(ctx);
                    }
                } else {
                    debug!("dropping redundant disconnected event");
                }
            }
            Event::Connected => {
                let expected = matches!(
                    self.transition,
                    Some(Transition::Connecting { .. })
                        | Some(Transition::Reauthorizing {
                            phase: ReauthPhase::Connecting,
                            ..
                        })
                );
                if expected {
                    ctx.send_up(Event::Connected);
                } else {
                    debug!("dropping unexpected connected event");
                }
            }
            other => ctx.send_up(other),
        }
    }

    fn handle_wake(&mut self, wake: Wake, ctx: &mut StageCtx<'_>) {
        if let Wake::Reconnect = wake {
            // A wake that raced a cancelled timer finds it already cleared.
            if self.reconnect_timer.take().is_none() {
                debug!("reconnect wake after cancellation; ignoring");
                return;
            }
            if self.transition.is_some() || ctx.nucleus.state != ConnectionState::Disconnected {
                debug!("reconnect wake superseded");
                return;
            }
            info!(attempt = self.reconnect_attempt, "reconnecting");
            let connect = Operation::internal(ctx.next_op_id(), OpKind::Connect);
            ctx.nucleus.state = ConnectionState::Connecting;
            self.transition = Some(Transition::Connecting {
                op_id: connect.id(),
                waiters: Vec::new(),
                reconnecting: true,
            });
            ctx.send_down(connect);
        }
    }

    fn shutdown(&mut self, ctx: &mut StageCtx<'_>) {
        self.cancel_reconnect_timer();
        if let Some(transition) = self.transition.take() {
            let waiters = match transition {
                Transition::Connecting { waiters, .. }
                | Transition::Disconnecting { waiters, .. } => waiters,
                Transition::Reauthorizing { original, .. } => original.into_iter().collect(),
            };
            for waiter in waiters {
                ctx.complete(waiter, Err(DeviceError::OperationCancelled));
            }
        }
        for op in self.parked.drain(..) {
            ctx.complete(op, Err(DeviceError::OperationCancelled));
        }
        ctx.nucleus.state = ConnectionState::Disconnected;
    }
}
