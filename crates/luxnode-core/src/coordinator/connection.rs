//! Single-link operation executor.
//!
//! A [`Connection`] owns one open link and the only pending-operation slot for
//! it. Every link event is drained by a dispatcher task which hands it to the
//! pending operation; the awaiting caller is resumed through a oneshot channel
//! that is resolved at most once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::Context;
use super::state::ConnectionStatus;
use crate::config::CoordinatorConfig;
use crate::events::{NodeEvent, PacketDirection};
use crate::link::{LinkEvent, LinkTransport};
use crate::operation::{
    AbortReliableWrite, BeginReliableWrite, ExecuteReliableWrite, GattErrorKind, Operation,
    OperationError, Progress, WriteCharacteristic,
};

/// Type-erased view of the operation sitting in the slot.
trait PendingOperation: Send {
    /// Feed an event. Returns true once the operation has resolved.
    fn on_event(&mut self, event: &LinkEvent, link: &dyn LinkTransport) -> bool;
    fn fail(&mut self, kind: GattErrorKind);
    fn survives_disconnect(&self) -> bool;
}

struct Awaiting<O: Operation> {
    op: O,
    reply: Option<oneshot::Sender<Result<O::Output, GattErrorKind>>>,
}

impl<O: Operation> Awaiting<O> {
    fn resolve(&mut self, result: Result<O::Output, GattErrorKind>) {
        if let Some(reply) = self.reply.take() {
            // Receiver gone means the caller was cancelled.
            let _ = reply.send(result);
        }
    }
}

impl<O: Operation> PendingOperation for Awaiting<O> {
    fn on_event(&mut self, event: &LinkEvent, link: &dyn LinkTransport) -> bool {
        match self.op.on_event(event, link) {
            Progress::Pending => false,
            Progress::Done(result) => {
                self.resolve(result);
                true
            }
        }
    }

    fn fail(&mut self, kind: GattErrorKind) {
        self.resolve(Err(kind));
    }

    fn survives_disconnect(&self) -> bool {
        self.op.survives_disconnect()
    }
}

struct Pending {
    generation: u64,
    id: String,
    op: Box<dyn PendingOperation>,
}

type Slot = Mutex<Option<Pending>>;

fn lock(slot: &Slot) -> MutexGuard<'_, Option<Pending>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// Clears the slot if the awaiting caller is dropped before resolution.
struct SlotGuard<'a> {
    slot: &'a Slot,
    generation: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut slot = lock(self.slot);
        if let Some(p) = slot.take_if(|p| p.generation == self.generation) {
            debug!(op = %p.id, "Pending operation cancelled");
        }
    }
}

/// One open link plus its operation serializer.
pub struct Connection {
    link: Arc<dyn LinkTransport>,
    pending: Arc<Slot>,
    generation: AtomicU64,
    op_lock: tokio::sync::Mutex<()>,
    ctx: Arc<Context>,
    dispatcher: JoinHandle<()>,
    closed: AtomicBool,
}

impl Connection {
    pub(crate) fn new(
        link: Arc<dyn LinkTransport>,
        events: mpsc::UnboundedReceiver<LinkEvent>,
        ctx: Arc<Context>,
    ) -> Self {
        let pending = Arc::new(Mutex::new(None));
        let dispatcher = tokio::spawn(dispatch(
            events,
            pending.clone(),
            link.clone(),
            ctx.clone(),
        ));
        Self {
            link,
            pending,
            generation: AtomicU64::new(0),
            op_lock: tokio::sync::Mutex::new(()),
            ctx,
            dispatcher,
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.ctx.config
    }

    pub fn status(&self) -> ConnectionStatus {
        self.ctx.state.borrow().connection_status
    }

    pub fn notify(&self, event: &NodeEvent) {
        self.ctx.observer.on_event(event);
    }

    /// Run one operation. Waits for any operation already in flight.
    pub async fn perform<O: Operation>(&self, op: O) -> Result<O::Output, OperationError> {
        let _serial = self.op_lock.lock().await;
        self.perform_locked(op).await
    }

    async fn perform_locked<O: Operation>(&self, op: O) -> Result<O::Output, OperationError> {
        let id = op.id();
        let result = if self.ctx.permissions.check() {
            self.run(op).await
        } else {
            Err(OperationError::gatt(GattErrorKind::MissingPermission, id))
        };

        if let Err(e) = &result {
            if e.is_missing_permission() {
                self.ctx.permissions.request_once();
            }
            self.ctx.record_error(e);
        }
        result
    }

    async fn run<O: Operation>(&self, mut op: O) -> Result<O::Output, OperationError> {
        let id = op.id();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();

        {
            let mut slot = lock(&self.pending);
            if let Some(stale) = slot.take() {
                warn!(op = %stale.id, "Dropping stale pending operation");
            }
            trace!(op = %id, "Starting operation");
            // Started under the slot lock so no event can race the registration.
            match op.start(self.link.as_ref()) {
                Progress::Done(result) => {
                    return result.map_err(|kind| OperationError::gatt(kind, id));
                }
                Progress::Pending => {
                    *slot = Some(Pending {
                        generation,
                        id: id.clone(),
                        op: Box::new(Awaiting {
                            op,
                            reply: Some(tx),
                        }),
                    });
                }
            }
        }

        let _guard = SlotGuard {
            slot: &self.pending,
            generation,
        };
        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(kind)) => Err(OperationError::gatt(kind, id)),
            Err(_) => Err(OperationError::Fatal(format!("{id}: operation abandoned"))),
        }
    }

    /// Begin a reliable write, run `ops` in order, then commit or abort.
    /// Holds the operation lock for the whole transaction.
    pub async fn write_transaction(
        &self,
        ops: Vec<WriteCharacteristic>,
    ) -> Result<(), OperationError> {
        if ops.is_empty() {
            return Ok(());
        }
        let _serial = self.op_lock.lock().await;
        self.perform_locked(BeginReliableWrite).await?;

        let mut failure = None;
        for op in ops {
            if let Err(e) = self.perform_locked(op).await {
                failure = Some(e);
                break;
            }
        }

        match failure {
            None => self.perform_locked(ExecuteReliableWrite).await,
            Some(e) => {
                debug!(error = %e, "Aborting reliable write");
                if let Err(abort) = self.perform_locked(AbortReliableWrite).await {
                    warn!(error = %abort, "Abort of reliable write failed");
                }
                Err(e)
            }
        }
    }

    pub async fn perform_write_transaction(&self, ops: Vec<WriteCharacteristic>) -> bool {
        self.write_transaction(ops).await.is_ok()
    }

    /// Forget the cached service table.
    pub async fn refresh(&self) -> Result<(), OperationError> {
        let _serial = self.op_lock.lock().await;
        self.link.refresh().map_err(|e| {
            let err = OperationError::gatt(e.into(), "refresh");
            self.ctx.record_error(&err);
            err
        })
    }

    /// Drop whatever operation is pending. Its caller sees a fatal error.
    pub fn reset_pending(&self) {
        if let Some(p) = lock(&self.pending).take() {
            warn!(op = %p.id, "Resetting pending operation");
        }
    }

    pub fn is_operation_in_progress(&self) -> bool {
        lock(&self.pending).is_some() || self.op_lock.try_lock().is_err()
    }

    /// Release the link handle. Idempotent.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing link");
        self.dispatcher.abort();
        if let Some(mut p) = lock(&self.pending).take() {
            p.op.fail(GattErrorKind::MethodFailed);
        }
        self.link.close();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn dispatch(
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    pending: Arc<Slot>,
    link: Arc<dyn LinkTransport>,
    ctx: Arc<Context>,
) {
    while let Some(event) = events.recv().await {
        trace!(kind = event.kind(), "Link event");
        report_inbound(&ctx, &event);

        let mut slot = lock(&pending);

        if let LinkEvent::ConnectionStateChanged { status, connected } = event {
            if connected {
                if let Some(p) = slot.as_ref()
                    && !p.op.survives_disconnect()
                {
                    warn!(op = %p.id, "Connected event while operation outstanding");
                }
                ctx.goto_status(ConnectionStatus::Connected);
            } else {
                ctx.on_link_lost(status);
                if let Some(mut p) = slot.take_if(|p| !p.op.survives_disconnect()) {
                    debug!(op = %p.id, status, "Link lost with operation outstanding");
                    p.op.fail(GattErrorKind::Gatt(status));
                    continue;
                }
            }
        }

        match slot.as_mut() {
            Some(p) => {
                if p.op.on_event(&event, link.as_ref()) {
                    *slot = None;
                }
            }
            None => trace!(kind = event.kind(), "No pending operation, event ignored"),
        }
    }
}

fn report_inbound(ctx: &Context, event: &LinkEvent) {
    let (uuid, request, data) = match event {
        LinkEvent::CharacteristicRead { uuid, value, .. } => (*uuid, "read", value),
        LinkEvent::CharacteristicChanged { uuid, value } => (*uuid, "indication", value),
        _ => return,
    };
    ctx.observer.on_event(&NodeEvent::Attribute {
        direction: PacketDirection::Rx,
        uuid: Some(uuid),
        request: request.to_string(),
        length: data.len(),
        data: Some(data.iter().take(32).copied().collect()),
    });
}
