//! Credential renewal: watches token expiry and forces re-authentication.
//!
//! A renewal timer fires a configured margin before the current credential
//! expires. The stage announces `NewSasTokenRequired` to the client, asks
//! the auth provider for a renewed credential off the serialized context,
//! and, once renewal lands, reauthorizes the connection if one is up.
//! Network-bound operations submitted while renewal is outstanding are
//! queued and released in their original submission order.

use super::events::Event;
use super::ops::{OpKind, Operation};
use super::stage::PipelineStage;
use super::{ConnectionState, StageCtx, Wake};
use crate::auth::AuthProvider;
use crate::error::DeviceError;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub(crate) struct SasRenewalStage {
    auth: Arc<dyn AuthProvider>,
    renewal_outstanding: bool,
    queued: VecDeque<Operation>,
    timer: Option<JoinHandle<()>>,
}

impl SasRenewalStage {
    pub fn new(auth: Arc<dyn AuthProvider>) -> Self {
        Self {
            auth,
            renewal_outstanding: false,
            queued: VecDeque::new(),
            timer: None,
        }
    }

    fn arm_renewal_timer(&mut self, ctx: &mut StageCtx<'_>) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let margin = ctx.config().sas_renewal_margin();
        let remaining = self.auth.current_token().time_to_live();
        let delay = remaining
            .to_std()
            .unwrap_or(Duration::ZERO)
            .saturating_sub(margin);
        if delay.is_zero() {
            warn!("credential lifetime shorter than renewal margin; renewing now");
        } else {
            debug!(?delay, "renewal timer armed");
        }
        self.timer = Some(ctx.schedule(delay, Wake::RenewToken));
    }
}

impl PipelineStage for SasRenewalStage {
    fn name(&self) -> &'static str {
        "sas_renewal"
    }

    fn start(&mut self, ctx: &mut StageCtx<'_>) {
        self.arm_renewal_timer(ctx);
    }

    fn handle_op(&mut self, op: Operation, ctx: &mut StageCtx<'_>) {
        if self.renewal_outstanding && op.needs_connection() {
            debug!(op = op.name(), op_id = op.id(), "queueing op behind renewal");
            self.queued.push_back(op);
        } else {
            ctx.send_down(op);
        }
    }

    fn handle_wake(&mut self, wake: Wake, ctx: &mut StageCtx<'_>) {
        match wake {
            Wake::RenewToken => {
                if self.renewal_outstanding {
                    debug!("renewal already outstanding; ignoring duplicate wake");
                    return;
                }
                info!("credential approaching expiry; requesting renewal");
                self.renewal_outstanding = true;
                ctx.send_up(Event::NewSasTokenRequired);
                let auth = Arc::clone(&self.auth);
                ctx.spawn_wake(async move { Wake::RenewalResult(auth.renew_token().await) });
            }
            Wake::RenewalResult(Ok(token)) => {
                info!(expires_at = %token.expires_at(), "credential renewed");
                self.renewal_outstanding = false;
                self.arm_renewal_timer(ctx);
                if ctx.nucleus.state == ConnectionState::Connected {
                    let reauthorize = Operation::internal(ctx.next_op_id(), OpKind::Reauthorize);
                    ctx.send_down(reauthorize);
                }
                for queued in self.queued.drain(..) {
                    ctx.resubmit(queued);
                }
            }
            Wake::RenewalResult(Err(error)) => {
                warn!(%error, "credential renewal failed");
                self.renewal_outstanding = false;
                ctx.background_exception(error);
                // Release the queue rather than starving it; the old
                // credential may still be valid until actual expiry.
                for queued in self.queued.drain(..) {
                    ctx.resubmit(queued);
                }
                let retry_delay = ctx.config().retry.base_delay();
                if let Some(timer) = self.timer.take() {
                    timer.abort();
                }
                self.timer = Some(ctx.schedule(retry_delay, Wake::RenewToken));
            }
            _ => {}
        }
    }

    fn shutdown(&mut self, ctx: &mut StageCtx<'_>) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        for queued in self.queued.drain(..) {
            ctx.complete(queued, Err(DeviceError::OperationCancelled));
        }
    }
}
