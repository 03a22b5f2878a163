//! The operation/event pipeline.
//!
//! A fixed chain of stages turns client intents into transport actions:
//!
//! ```text
//! head → SasRenewalStage → RequestResponseStage → AutoConnectStage
//!      → ConnectionStage → RetryStage → transport stage (tail)
//! ```
//!
//! Operations flow down, events flow up, completions travel back up through
//! the stages that let the operation pass. All stage state is owned by one
//! task, the serialized execution context. Everything that wants in
//! (client submissions, transport notifications, timer expiry, I/O results)
//! goes through a single message queue, so exactly one operation or event is
//! processed at a time across the whole chain. Network I/O is the only thing
//! allowed to block, and it runs in spawned tasks that re-enter the context
//! through the same queue.

pub mod events;
pub mod ops;
pub(crate) mod stage;

mod auto_connect;
mod connection;
mod request_response;
mod retry;
mod sas_renewal;
mod transport;

pub use connection::ConnectionState;

use crate::auth::{AuthProvider, SasToken};
use crate::config::PipelineConfig;
use crate::error::{DeviceError, DeviceResult};
use crate::message::{MethodRequest, ReceivedMessage};
use crate::transport::http::HttpRequestClient;
use crate::transport::{ProtocolClient, TransportNotification};
use events::Event;
use ops::{OpResult, Operation};
use stage::PipelineStage;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Events delivered to the owner of the pipeline.
#[derive(Debug)]
pub enum ClientEvent {
    ConnectionStateChanged(ConnectionState),
    C2dMessage(ReceivedMessage),
    InputMessage(ReceivedMessage),
    MethodRequest(MethodRequest),
    TwinDesiredPatch(serde_json::Value),
    NewSasTokenRequired,
    BackgroundException(DeviceError),
}

/// Messages entering the serialized context.
pub(crate) enum PipelineMsg {
    Submit(Operation),
    Wake { stage: usize, wake: Wake },
    Shutdown,
}

/// Payload of a wake-up addressed to a specific stage.
pub(crate) enum Wake {
    /// Backoff expired for a held operation.
    Retry(u64),
    /// Reconnect delay expired.
    Reconnect,
    /// Credential renewal lead time reached.
    RenewToken,
    /// Credential renewal finished off-context.
    RenewalResult(DeviceResult<SasToken>),
    /// A correlated request ran out of time.
    RequestTimeout(Uuid),
    /// Network I/O for an in-flight operation finished.
    IoResult { op_id: u64, result: OpResult },
    /// Unsolicited transport notification.
    Notification(TransportNotification),
}

/// Work items produced by stage handlers, drained in FIFO order by the
/// executor.
enum Action {
    OpDown { index: usize, op: Operation },
    EventUp { index: Option<usize>, event: Event },
    CompleteUp { index: Option<usize>, op: Operation, result: OpResult },
}

/// State shared by all stages inside the serialized context.
///
/// `state` is written only by the connection stage; everyone else reads.
pub(crate) struct Nucleus {
    pub config: Arc<PipelineConfig>,
    pub state: ConnectionState,
}

/// Stage-side view of the executor, handed to every handler invocation.
pub(crate) struct StageCtx<'a> {
    index: usize,
    actions: &'a mut VecDeque<Action>,
    pub nucleus: &'a mut Nucleus,
    handle: &'a PipelineHandle,
}

impl StageCtx<'_> {
    pub fn config(&self) -> &PipelineConfig {
        &self.nucleus.config
    }

    /// Forward an operation to the next stage down.
    pub fn send_down(&mut self, op: Operation) {
        self.actions.push_back(Action::OpDown {
            index: self.index + 1,
            op,
        });
    }

    /// Re-run an operation through this stage (and everything below it).
    pub fn resubmit(&mut self, op: Operation) {
        self.actions.push_back(Action::OpDown {
            index: self.index,
            op,
        });
    }

    /// Forward an event to the next stage up; past the head it is delivered
    /// to the client.
    pub fn send_up(&mut self, event: Event) {
        self.actions.push_back(Action::EventUp {
            index: self.index.checked_sub(1),
            event,
        });
    }

    /// Complete an operation. The completion travels up through the stages
    /// above this one before the result is delivered.
    pub fn complete(&mut self, op: Operation, result: OpResult) {
        self.actions.push_back(Action::CompleteUp {
            index: self.index.checked_sub(1),
            op,
            result,
        });
    }

    /// Report a failure with no attributable operation.
    pub fn background_exception(&mut self, error: DeviceError) {
        self.send_up(Event::BackgroundException(error));
    }

    /// Fresh operation id for internally spawned operations.
    pub fn next_op_id(&self) -> u64 {
        self.handle.next_op_id()
    }

    /// Run a future off the serialized context; its output re-enters the
    /// context as a wake-up addressed to this stage.
    pub fn spawn_wake<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = Wake> + Send + 'static,
    {
        let handle = self.handle.clone();
        let stage = self.index;
        tokio::spawn(async move {
            let wake = fut.await;
            handle.wake(stage, wake);
        })
    }

    /// Arm a timer that wakes this stage after `delay`.
    pub fn schedule(&self, delay: Duration, wake: Wake) -> JoinHandle<()> {
        self.spawn_wake(async move {
            tokio::time::sleep(delay).await;
            wake
        })
    }
}

/// Cloneable submission handle into the serialized context.
#[derive(Clone)]
pub(crate) struct PipelineHandle {
    tx: mpsc::UnboundedSender<PipelineMsg>,
    ids: Arc<AtomicU64>,
}

impl PipelineHandle {
    pub fn next_op_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Submit an operation at the head of the chain. If the pipeline is
    /// gone, the operation completes as cancelled instead of hanging.
    pub fn submit(&self, op: Operation) {
        if let Err(send_error) = self.tx.send(PipelineMsg::Submit(op)) {
            if let PipelineMsg::Submit(op) = send_error.0 {
                warn!(op = op.name(), "pipeline gone; completing as cancelled");
                op.finish(Err(DeviceError::OperationCancelled));
            }
        }
    }

    pub(crate) fn wake(&self, stage: usize, wake: Wake) -> bool {
        self.tx.send(PipelineMsg::Wake { stage, wake }).is_ok()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(PipelineMsg::Shutdown);
    }
}

/// A running pipeline. Dropping it aborts the serialized context; prefer
/// [`Pipeline::shutdown`] so pending operations complete as cancelled.
pub struct Pipeline {
    handle: PipelineHandle,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    /// Build and start a pipeline over a publish/subscribe protocol client.
    pub(crate) fn start(
        config: Arc<PipelineConfig>,
        auth: Arc<dyn AuthProvider>,
        client: Arc<dyn ProtocolClient>,
    ) -> (Pipeline, mpsc::UnboundedReceiver<ClientEvent>) {
        let stages: Vec<Box<dyn PipelineStage>> = vec![
            Box::new(sas_renewal::SasRenewalStage::new(Arc::clone(&auth))),
            Box::new(request_response::RequestResponseStage::new()),
            Box::new(auto_connect::AutoConnectStage::new()),
            Box::new(connection::ConnectionStage::new()),
            Box::new(retry::RetryStage::new()),
            Box::new(transport::TransportStage::new(Arc::clone(&client), auth)),
        ];
        let notifications = client.take_notifications();
        Self::launch(config, stages, notifications)
    }

    /// Build and start a pipeline over the request/response HTTP transport.
    pub(crate) fn start_http(
        config: Arc<PipelineConfig>,
        auth: Arc<dyn AuthProvider>,
        client: Arc<HttpRequestClient>,
    ) -> (Pipeline, mpsc::UnboundedReceiver<ClientEvent>) {
        let stages: Vec<Box<dyn PipelineStage>> = vec![
            Box::new(sas_renewal::SasRenewalStage::new(Arc::clone(&auth))),
            Box::new(request_response::RequestResponseStage::new()),
            Box::new(auto_connect::AutoConnectStage::new()),
            Box::new(connection::ConnectionStage::new()),
            Box::new(retry::RetryStage::new()),
            Box::new(transport::HttpTransportStage::new(client, auth)),
        ];
        Self::launch(config, stages, None)
    }

    fn launch(
        config: Arc<PipelineConfig>,
        stages: Vec<Box<dyn PipelineStage>>,
        notifications: Option<mpsc::UnboundedReceiver<TransportNotification>>,
    ) -> (Pipeline, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = PipelineHandle {
            tx,
            ids: Arc::new(AtomicU64::new(0)),
        };

        // Pump unsolicited transport notifications into the serialized
        // context, addressed to the tail stage.
        if let Some(mut notifications) = notifications {
            let tail = stages.len() - 1;
            let pump_handle = handle.clone();
            tokio::spawn(async move {
                while let Some(notification) = notifications.recv().await {
                    if !pump_handle.wake(tail, Wake::Notification(notification)) {
                        break;
                    }
                }
            });
        }

        let mut executor = Executor {
            stages,
            nucleus: Nucleus {
                config,
                state: ConnectionState::Disconnected,
            },
            actions: VecDeque::new(),
            events_tx,
            handle: handle.clone(),
        };
        let task = tokio::spawn(async move {
            executor.run(rx).await;
        });

        (
            Pipeline {
                handle,
                task: std::sync::Mutex::new(Some(task)),
            },
            events_rx,
        )
    }

    pub(crate) fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    /// Stop the pipeline, completing every pending operation as cancelled.
    pub async fn shutdown(&self) {
        self.handle.shutdown();
        let task = self.task.lock().expect("pipeline task lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Ok(mut guard) = self.task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

/// The serialized execution context: owns every stage and drains one message
/// at a time.
struct Executor {
    stages: Vec<Box<dyn PipelineStage>>,
    nucleus: Nucleus,
    actions: VecDeque<Action>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    handle: PipelineHandle,
}

impl Executor {
    async fn run(&mut self, mut rx: mpsc::UnboundedReceiver<PipelineMsg>) {
        info!(stages = self.stages.len(), "pipeline started");
        for index in 0..self.stages.len() {
            let stage = &mut self.stages[index];
            let mut ctx = StageCtx {
                index,
                actions: &mut self.actions,
                nucleus: &mut self.nucleus,
                handle: &self.handle,
            };
            stage.start(&mut ctx);
        }
        self.pump();

        while let Some(msg) = rx.recv().await {
            match msg {
                PipelineMsg::Submit(op) => {
                    debug!(op = op.name(), op_id = op.id(), "operation submitted");
                    self.actions.push_back(Action::OpDown { index: 0, op });
                }
                PipelineMsg::Wake { stage, wake } => {
                    if stage < self.stages.len() {
                        let target = &mut self.stages[stage];
                        let mut ctx = StageCtx {
                            index: stage,
                            actions: &mut self.actions,
                            nucleus: &mut self.nucleus,
                            handle: &self.handle,
                        };
                        target.handle_wake(wake, &mut ctx);
                    }
                }
                PipelineMsg::Shutdown => {
                    info!("pipeline shutting down");
                    for index in 0..self.stages.len() {
                        let stage = &mut self.stages[index];
                        let mut ctx = StageCtx {
                            index,
                            actions: &mut self.actions,
                            nucleus: &mut self.nucleus,
                            handle: &self.handle,
                        };
                        stage.shutdown(&mut ctx);
                    }
                    self.pump();
                    break;
                }
            }
            self.pump();
        }
        info!("pipeline stopped");
    }

    /// Drain the action queue. Handlers invoked here may push further
    /// actions; processing continues until the queue is empty.
    fn pump(&mut self) {
        while let Some(action) = self.actions.pop_front() {
            match action {
                Action::OpDown { index, op } => self.dispatch_op(index, op),
                Action::EventUp { index: Some(index), event } => self.dispatch_event(index, event),
                Action::EventUp { index: None, event } => self.deliver(event),
                Action::CompleteUp { index: Some(index), op, result } => {
                    self.dispatch_completion(index, op, result)
                }
                Action::CompleteUp { index: None, op, result } => op.finish(result),
            }
        }
    }

    fn dispatch_op(&mut self, index: usize, op: Operation) {
        if index >= self.stages.len() {
            // The tail is the transport stage; nothing should fall past it.
            error!(op = op.name(), "operation passed the terminal stage");
            let failure = DeviceError::pipeline(format!(
                "{} operation not handled by any stage",
                op.name()
            ));
            self.actions.push_back(Action::EventUp {
                index: None,
                event: Event::BackgroundException(failure.clone()),
            });
            op.finish(Err(failure));
            return;
        }
        let stage = &mut self.stages[index];
        let mut ctx = StageCtx {
            index,
            actions: &mut self.actions,
            nucleus: &mut self.nucleus,
            handle: &self.handle,
        };
        stage.handle_op(op, &mut ctx);
    }

    fn dispatch_event(&mut self, index: usize, event: Event) {
        let stage = &mut self.stages[index];
        let mut ctx = StageCtx {
            index,
            actions: &mut self.actions,
            nucleus: &mut self.nucleus,
            handle: &self.handle,
        };
        stage.handle_event(event, &mut ctx);
    }

    fn dispatch_completion(&mut self, index: usize, op: Operation, result: OpResult) {
        let stage = &mut self.stages[index];
        let mut ctx = StageCtx {
            index,
            actions: &mut self.actions,
            nucleus: &mut self.nucleus,
            handle: &self.handle,
        };
        stage.handle_completion(op, result, &mut ctx);
    }

    /// Translate an event that crossed the head into a client event.
    fn deliver(&mut self, event: Event) {
        debug!(event = event.name(), "delivering event to client");
        let client_event = match event {
            Event::Connected => ClientEvent::ConnectionStateChanged(ConnectionState::Connected),
            Event::Disconnected { .. } => {
                ClientEvent::ConnectionStateChanged(ConnectionState::Disconnected)
            }
            Event::C2dMessage(message) => ClientEvent::C2dMessage(message),
            Event::InputMessage(message) => ClientEvent::InputMessage(message),
            Event::MethodRequest(request) => ClientEvent::MethodRequest(request),
            Event::TwinDesiredPatch(patch) => ClientEvent::TwinDesiredPatch(patch),
            Event::NewSasTokenRequired => ClientEvent::NewSasTokenRequired,
            Event::BackgroundException(error) => ClientEvent::BackgroundException(error),
            Event::Response { correlation_id, .. } => {
                // Responses are matched below the head; one surfacing here
                // lost its pending entry without being dropped deliberately.
                warn!(%correlation_id, "unmatched response event reached pipeline head");
                return;
            }
        };
        if self.events_tx.send(client_event).is_err() {
            debug!("client event receiver dropped");
        }
    }
}
