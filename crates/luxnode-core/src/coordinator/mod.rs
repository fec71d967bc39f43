//! Connection coordinator.
//!
//! The [`Coordinator`] owns at most one [`Connection`] at a time and exposes
//! the caller-facing API: connect with retry, grouped characteristic reads and
//! writes, reliable-write transactions and teardown. Every mutation is
//! published as an immutable [`ConnectionState`] through a watch channel.

pub mod connection;
mod keepalive;
pub mod state;

pub use connection::Connection;
pub use state::{ConnectionState, ConnectionStatus};

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::auth::CredentialService;
use crate::codec::{FamilyCodec, codec_for};
use crate::config::CoordinatorConfig;
use crate::events::{LogLevel, NodeEvent, NodeObserver};
use crate::link::{EventSink, LinkFactory, LinkTransport, ObservableLink};
use crate::model::{DaliBanks, Device, DeviceCharacteristics};
use crate::operation::{GattErrorKind, Operation, OperationError, WriteCharacteristic};
use crate::permission::{PermissionGate, PermissionProvider};

/// State shared between the coordinator, its connection and background tasks.
pub(crate) struct Context {
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) observer: Arc<dyn NodeObserver>,
    pub(crate) permissions: PermissionGate,
    pub(crate) config: CoordinatorConfig,
}

impl Context {
    pub(crate) fn new(
        config: CoordinatorConfig,
        observer: Arc<dyn NodeObserver>,
        permissions: Arc<dyn PermissionProvider>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::default());
        Self {
            state,
            observer,
            permissions: PermissionGate::new(permissions),
            config,
        }
    }

    /// Apply `update` and move to `to` in a single published snapshot.
    pub(crate) fn transition(
        &self,
        to: ConnectionStatus,
        update: impl FnOnce(&mut ConnectionState),
    ) {
        let mut from = to;
        self.state.send_modify(|s| {
            from = s.connection_status;
            s.connection_status = to;
            if to == ConnectionStatus::Connected {
                s.last_error = None;
            }
            update(s);
        });
        if from != to {
            debug!(from = %from, to = %to, "Status transition");
            self.observer
                .on_event(&NodeEvent::StatusChanged { from, to });
        }
    }

    pub(crate) fn goto_status(&self, to: ConnectionStatus) {
        self.transition(to, |_| {});
    }

    /// Link dropped. During a connect attempt this is part of the retry
    /// protocol and the snapshot stays `Connecting`.
    pub(crate) fn on_link_lost(&self, status: u8) {
        if self.state.borrow().is_connecting {
            debug!(status, "Link dropped during connect");
            self.goto_status(ConnectionStatus::Connecting);
            return;
        }
        self.log(LogLevel::Warn, format!("Link lost (status 0x{status:02X})"));
        self.transition(ConnectionStatus::Disconnected, |s| {
            s.characteristics = DeviceCharacteristics::default();
        });
    }

    /// User-facing message, forwarded to the observer.
    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.observer.on_event(&NodeEvent::Log {
            level,
            message: message.into(),
        });
    }

    pub(crate) fn record_error(&self, error: &OperationError) {
        let fresh = self.state.send_if_modified(|s| {
            if s.last_error.as_ref() == Some(error) {
                return false;
            }
            s.last_error = Some(error.clone());
            true
        });
        if fresh {
            self.observer.on_event(&NodeEvent::OperationFailed {
                error: error.clone(),
            });
        }
    }
}

#[derive(Clone)]
struct Active {
    device: Device,
    conn: Arc<Connection>,
    codec: Arc<dyn FamilyCodec>,
}

struct Inner {
    factory: Arc<dyn LinkFactory>,
    ctx: Arc<Context>,
    active: Mutex<Option<Active>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    /// Releases the link when the node drops it on its own.
    link_watch: Mutex<Option<JoinHandle<()>>>,
    /// Serializes connect and teardown.
    lifecycle: tokio::sync::Mutex<()>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Inner {
    fn active(&self) -> Option<Active> {
        lock(&self.active).clone()
    }

    fn is_current(&self, conn: &Connection) -> bool {
        lock(&self.active)
            .as_ref()
            .is_some_and(|a| std::ptr::eq(Arc::as_ptr(&a.conn), conn))
    }

    fn start_keepalive(&self, active: &Active) {
        if active.conn.status() != ConnectionStatus::Connected || !self.is_current(&active.conn) {
            return;
        }
        let mut slot = lock(&self.keepalive);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        debug!("Starting keep-alive");
        *slot = Some(keepalive::spawn(
            active.conn.clone(),
            active.codec.clone(),
            self.ctx.clone(),
        ));
    }

    fn stop_keepalive(&self) {
        if let Some(task) = lock(&self.keepalive).take() {
            debug!("Stopping keep-alive");
            task.abort();
        }
    }

    fn stop_link_watch(&self) {
        if let Some(task) = lock(&self.link_watch).take() {
            task.abort();
        }
    }

    async fn connect_with_retry(&self, conn: &Connection, codec: &dyn FamilyCodec) -> bool {
        let config = &self.ctx.config;
        for (attempt, delay) in config.retry_delays().enumerate() {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            debug!(attempt, "Connect attempt");
            match tokio::time::timeout(config.connect_timeout(), codec.connect(conn)).await {
                Ok(Ok(())) => return true,
                Ok(Err(e)) if e.is_missing_permission() => {
                    warn!("Link permission missing, giving up");
                    return false;
                }
                Ok(Err(e)) => {
                    warn!(attempt, error = %e, "Connect attempt failed");
                    self.ctx.record_error(&e);
                }
                Err(_) => {
                    warn!(attempt, "Connect attempt timed out");
                    conn.reset_pending();
                }
            }
        }
        false
    }

    /// Stop the heartbeat, ask the node to disconnect, then always release
    /// the link handle.
    async fn teardown(&self) {
        self.stop_keepalive();
        self.stop_link_watch();
        let Some(active) = lock(&self.active).take() else {
            debug!("No link to release");
            return;
        };

        if active.conn.status() == ConnectionStatus::Connected {
            self.ctx.goto_status(ConnectionStatus::Disconnecting);
            let limit = self.ctx.config.disconnect_timeout();
            match tokio::time::timeout(limit, active.codec.disconnect(&active.conn)).await {
                Ok(Ok(())) => debug!("Disconnect acknowledged"),
                Ok(Err(e)) => warn!(error = %e, "Disconnect request failed"),
                Err(_) => warn!("Disconnect timed out"),
            }
        }

        active.conn.close();
        self.ctx.transition(ConnectionStatus::Disconnected, |s| {
            s.characteristics = DeviceCharacteristics::default();
            s.is_connecting = false;
        });
        self.ctx.log(
            LogLevel::Info,
            format!("Link to {} released", active.device.address),
        );
    }
}

/// Wait for an unsolicited link loss on `conn`, then release it the same way
/// an explicit disconnect does.
fn spawn_link_watch(inner: &Arc<Inner>, conn: &Arc<Connection>) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    let conn = Arc::downgrade(conn);
    let mut rx = inner.ctx.state.subscribe();
    tokio::spawn(async move {
        let lost = rx
            .wait_for(|s| s.connection_status == ConnectionStatus::Disconnected)
            .await
            .is_ok();
        drop(rx);
        let Some(inner) = weak.upgrade().filter(|_| lost) else {
            return;
        };
        let _lifecycle = inner.lifecycle.lock().await;
        let Some(conn) = conn.upgrade() else {
            return;
        };
        // A reconnect may already have replaced this link.
        if inner.is_current(&conn) {
            lock(&inner.link_watch).take();
            debug!("Releasing dropped link");
            inner.teardown().await;
        }
    })
}

/// Caller-facing connection service. Cheap to clone.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(
        factory: Arc<dyn LinkFactory>,
        permissions: Arc<dyn PermissionProvider>,
        observer: Arc<dyn NodeObserver>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                ctx: Arc::new(Context::new(config, observer, permissions)),
                active: Mutex::new(None),
                keepalive: Mutex::new(None),
                link_watch: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Current snapshot.
    pub fn state(&self) -> ConnectionState {
        self.inner.ctx.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.ctx.state.subscribe()
    }

    /// Replace any existing link with a fresh one to `device` and run the
    /// family connect sequence with retry. Returns whether the node ends up
    /// connected.
    #[instrument(skip_all, fields(address = %device.address, family = %device.family))]
    pub async fn connect(
        &self,
        device: Device,
        credentials: Option<Arc<dyn CredentialService>>,
    ) -> bool {
        let inner = &self.inner;
        let ctx = &inner.ctx;
        let _lifecycle = inner.lifecycle.lock().await;
        inner.stop_keepalive();
        inner.teardown().await;

        if !ctx.permissions.check() {
            ctx.record_error(&OperationError::gatt(
                GattErrorKind::MissingPermission,
                "connect",
            ));
            return false;
        }

        ctx.transition(ConnectionStatus::Connecting, |s| {
            s.device = Some(device.clone());
            s.characteristics = DeviceCharacteristics::default();
            s.is_connecting = true;
            s.last_error = None;
        });

        let (sink, events) = EventSink::channel();
        let link = match inner.factory.open(&device, sink).await {
            Ok(link) => link,
            Err(e) => {
                warn!(error = %e, "Failed to open link");
                ctx.record_error(&OperationError::gatt(e.into(), "open"));
                ctx.transition(ConnectionStatus::Disconnected, |s| s.is_connecting = false);
                return false;
            }
        };
        let link: Arc<dyn LinkTransport> =
            Arc::new(ObservableLink::new(link, ctx.observer.clone()));
        let active = Active {
            conn: Arc::new(Connection::new(link, events, ctx.clone())),
            codec: codec_for(&device, credentials),
            device,
        };
        *lock(&inner.active) = Some(active.clone());

        let connected = inner
            .connect_with_retry(&active.conn, active.codec.as_ref())
            .await;
        ctx.state.send_modify(|s| s.is_connecting = false);

        if connected && active.conn.status() == ConnectionStatus::Connected {
            ctx.log(LogLevel::Info, format!("Connected to {}", active.device.address));
            *lock(&inner.link_watch) = Some(spawn_link_watch(inner, &active.conn));
            true
        } else {
            inner.teardown().await;
            false
        }
    }

    /// Read every group the family supports, one operation at a time,
    /// merging each result into the snapshot as it arrives.
    pub async fn read_characteristics(
        &self,
        advertised_health: Option<u16>,
        advertised_state: Option<u16>,
    ) -> DeviceCharacteristics {
        let Some(active) = self.inner.active() else {
            return self.state().characteristics;
        };
        let conn = active.conn.as_ref();
        let codec = active.codec.as_ref();

        self.absorb(codec.read_general(conn).await, |c, v| c.general = Some(v));
        self.absorb(codec.read_dim(conn).await, |c, v| c.dim = Some(v));
        self.absorb(codec.read_dali(conn).await, |c, v| c.dali = Some(v));
        self.absorb(codec.read_time(conn).await, |c, v| c.time = Some(v));
        self.absorb(codec.read_gps(conn).await, |c, v| c.gps = Some(v));
        self.absorb(codec.read_diagnostics(conn).await, |c, mut v| {
            v.health = v.health.or(advertised_health);
            v.state = v.state.or(advertised_state);
            c.diagnostics = Some(v);
        });

        let characteristics = self.state().characteristics;
        if !characteristics.is_empty() {
            self.inner.start_keepalive(&active);
        }
        characteristics
    }

    /// Read the family's memory banks. `None` when the family has none.
    pub async fn read_dali_banks(&self) -> Option<DaliBanks> {
        let active = self.inner.active()?;
        let banks = active.codec.dali_banks();
        if banks.is_empty() {
            return None;
        }

        let mut all = DaliBanks::new();
        for &bank in banks {
            match active.codec.read_dali_bank(&active.conn, bank).await {
                Ok(Some(fields)) => {
                    all.insert(bank, fields);
                }
                Ok(None) => debug!(bank, "Bank not available"),
                Err(e) => self.inner.ctx.record_error(&e),
            }
        }
        let snapshot = all.clone();
        self.inner
            .ctx
            .state
            .send_modify(|s| s.characteristics.dali_banks = Some(snapshot));
        Some(all)
    }

    /// Write every populated writable group. Each group's state follows its
    /// own outcome; the result is the AND of all groups.
    pub async fn write_characteristics(&self, new: &DeviceCharacteristics) -> bool {
        let Some(active) = self.inner.active() else {
            self.inner.ctx.record_error(&not_connected("write"));
            return false;
        };
        let conn = active.conn.as_ref();
        let codec = active.codec.as_ref();
        let mut ok = true;

        if let Some(general) = &new.general {
            ok &= self.commit(codec.write_general(conn, general).await, |c| {
                c.general = Some(*general)
            });
        }
        if let Some(dim) = &new.dim {
            ok &= self.commit(codec.write_dim(conn, dim).await, |c| {
                c.dim = Some(dim.clone())
            });
        }
        if let Some(dali) = &new.dali {
            ok &= self.commit(codec.write_dali(conn, dali).await, |c| {
                c.dali = Some(dali.clone())
            });
        }
        if let Some(time) = &new.time {
            ok &= self.commit(codec.write_time(conn, time).await, |c| {
                c.time = Some(*time)
            });
        }
        if new.gps.is_some() || new.diagnostics.is_some() || new.dali_banks.is_some() {
            debug!("Read-only groups ignored");
        }
        ok
    }

    /// Run one operation on the current link. Errors land in `last_error`.
    pub async fn perform_operation<O: Operation>(&self, op: O) -> Option<O::Output> {
        let Some(active) = self.inner.active() else {
            self.inner.ctx.record_error(&not_connected(&op.id()));
            return None;
        };
        active.conn.perform(op).await.ok()
    }

    pub async fn perform_operation_or<O: Operation>(&self, op: O, default: O::Output) -> O::Output {
        self.perform_operation(op).await.unwrap_or(default)
    }

    pub async fn perform_write_transaction(&self, ops: Vec<WriteCharacteristic>) -> bool {
        match self.inner.active() {
            Some(active) => active.conn.perform_write_transaction(ops).await,
            None => {
                self.inner
                    .ctx
                    .record_error(&not_connected("write-transaction"));
                false
            }
        }
    }

    /// Tear the link down. Runs on its own task so the link handle is
    /// released even if the caller is cancelled. Idempotent.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let _lifecycle = inner.lifecycle.lock().await;
            inner.teardown().await;
        });
        if let Err(e) = task.await {
            warn!(error = %e, "Disconnect task failed");
        }
    }

    /// Forget the cached service table of the current link.
    pub async fn refresh(&self) -> bool {
        match self.inner.active() {
            Some(active) => active.conn.refresh().await.is_ok(),
            None => false,
        }
    }

    pub fn is_operation_in_progress(&self) -> bool {
        self.inner
            .active()
            .is_some_and(|active| active.conn.is_operation_in_progress())
    }

    fn absorb<T>(
        &self,
        result: Result<Option<T>, OperationError>,
        apply: impl FnOnce(&mut DeviceCharacteristics, T),
    ) {
        match result {
            Ok(Some(value)) => self
                .inner
                .ctx
                .state
                .send_modify(|s| apply(&mut s.characteristics, value)),
            Ok(None) => {}
            Err(e) => self.inner.ctx.record_error(&e),
        }
    }

    fn commit(
        &self,
        result: Result<(), OperationError>,
        apply: impl FnOnce(&mut DeviceCharacteristics),
    ) -> bool {
        match result {
            Ok(()) => {
                self.inner
                    .ctx
                    .state
                    .send_modify(|s| apply(&mut s.characteristics));
                true
            }
            Err(e) => {
                self.inner.ctx.record_error(&e);
                false
            }
        }
    }
}

fn not_connected(operation: &str) -> OperationError {
    OperationError::gatt(
        GattErrorKind::PreconditionFailed("not connected".into()),
        operation,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::d4i;
    use crate::events::NullObserver;
    use crate::events::tests::RecordingObserver;
    use crate::link::constants::GATT_CONN_TIMEOUT;
    use crate::link::{ConnectBehavior, MockLinkFactory, MockNode, MockRequest};
    use crate::model::{DeviceFamily, Dim, DimStep, General, OperatingMode};
    use crate::operation::ReadCharacteristic;
    use crate::permission::AlwaysGranted;
    use crate::permission::tests::ManualPermissions;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::time::Instant;
    use uuid::Uuid;

    fn device() -> Device {
        Device::new(Uuid::from_u128(7), "00:11:22:33:44:55", DeviceFamily::D4i)
    }

    fn coordinator(node: &MockNode) -> Coordinator {
        Coordinator::new(
            Arc::new(MockLinkFactory::new(node.clone())),
            Arc::new(AlwaysGranted),
            Arc::new(NullObserver),
            CoordinatorConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_connect_fails_fast() {
        let node = d4i::tests::node();
        let permissions = Arc::new(ManualPermissions::denied());
        let coordinator = Coordinator::new(
            Arc::new(MockLinkFactory::new(node.clone())),
            permissions.clone(),
            Arc::new(NullObserver),
            CoordinatorConfig::default(),
        );

        let start = Instant::now();
        assert!(!coordinator.connect(device(), None).await);
        assert_eq!(start.elapsed(), Duration::ZERO);

        let state = coordinator.state();
        assert_eq!(
            state.last_error.as_ref().and_then(|e| e.kind()),
            Some(&GattErrorKind::MissingPermission)
        );
        assert_eq!(node.opens(), 0);
        assert_eq!(permissions.requests.load(Ordering::SeqCst), 1);

        // Still denied: no second request.
        assert!(!coordinator.connect(device(), None).await);
        assert_eq!(permissions.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_with_backoff() {
        let node = d4i::tests::node();
        for _ in 0..3 {
            node.queue_connect(ConnectBehavior::Fail(GATT_CONN_TIMEOUT));
        }
        let coordinator = coordinator(&node);

        let start = Instant::now();
        assert!(coordinator.connect(device(), None).await);
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(700), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(800), "{elapsed:?}");
        assert_eq!(
            coordinator.state().connection_status,
            ConnectionStatus::Connected
        );
        let connects = node
            .requests()
            .iter()
            .filter(|r| **r == MockRequest::Connect)
            .count();
        assert_eq!(connects, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_after_last_delay() {
        let node = d4i::tests::node();
        for _ in 0..4 {
            node.queue_connect(ConnectBehavior::Fail(GATT_CONN_TIMEOUT));
        }
        let coordinator = coordinator(&node);

        assert!(!coordinator.connect(device(), None).await);
        let state = coordinator.state();
        assert_eq!(state.connection_status, ConnectionStatus::Disconnected);
        assert!(!state.is_connecting);
        assert_eq!(node.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_double_disconnect_closes_once() {
        let node = d4i::tests::node();
        let coordinator = coordinator(&node);
        assert!(coordinator.connect(device(), None).await);

        coordinator.disconnect().await;
        coordinator.disconnect().await;

        assert_eq!(node.closes(), 1);
        assert_eq!(node.open_handles(), 0);
        let disconnects = node
            .requests()
            .iter()
            .filter(|r| **r == MockRequest::Disconnect)
            .count();
        assert_eq!(disconnects, 1);
        assert_eq!(
            coordinator.state().connection_status,
            ConnectionStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn test_reconnect_releases_previous_link() {
        let node = d4i::tests::node();
        let coordinator = coordinator(&node);
        assert!(coordinator.connect(device(), None).await);
        assert!(coordinator.connect(device(), None).await);

        assert_eq!(node.opens(), 2);
        assert_eq!(node.closes(), 1);
        assert_eq!(node.open_handles(), 1);
    }

    #[tokio::test]
    async fn test_read_characteristics_merges_groups() {
        let node = d4i::tests::node();
        let coordinator = coordinator(&node);
        assert!(coordinator.connect(device(), None).await);

        let chars = coordinator.read_characteristics(Some(3), None).await;
        assert_eq!(
            chars.general,
            Some(General {
                mode: OperatingMode::Dimming
            })
        );
        assert!(chars.gps.is_none());
        let diagnostics = chars.diagnostics.unwrap();
        assert_eq!(diagnostics.health, Some(3));
        assert_eq!(coordinator.state().characteristics.dim, chars.dim);
    }

    #[tokio::test]
    async fn test_write_groups_are_independent() {
        let node = d4i::tests::node();
        node.ignore_writes(d4i::uuids::MODE);
        let coordinator = coordinator(&node);
        assert!(coordinator.connect(device(), None).await);
        let before = coordinator.read_characteristics(None, None).await;

        let dim = Dim {
            preset: Some(2),
            steps: vec![DimStep::new(22, 0, 60), DimStep::new(1, 30, 30)],
            level: None,
            schedule: None,
        };
        let update = DeviceCharacteristics {
            general: Some(General {
                mode: OperatingMode::Off,
            }),
            dim: Some(dim.clone()),
            ..Default::default()
        };

        assert!(!coordinator.write_characteristics(&update).await);
        let state = coordinator.state();
        assert_eq!(state.characteristics.general, before.general);
        assert_eq!(state.characteristics.dim.as_ref().unwrap().steps, dim.steps);
        assert_eq!(
            state.last_error.as_ref().and_then(|e| e.kind()),
            Some(&GattErrorKind::WriteValueMismatch)
        );
    }

    #[tokio::test]
    async fn test_link_loss_clears_characteristics() {
        let node = d4i::tests::node();
        let observer = Arc::new(RecordingObserver::default());
        let coordinator = Coordinator::new(
            Arc::new(MockLinkFactory::new(node.clone())),
            Arc::new(AlwaysGranted),
            observer.clone(),
            CoordinatorConfig::default(),
        );
        assert!(coordinator.connect(device(), None).await);
        coordinator.read_characteristics(None, None).await;

        let mut rx = coordinator.subscribe();
        node.drop_link();
        rx.wait_for(|s| s.connection_status == ConnectionStatus::Disconnected)
            .await
            .unwrap();
        assert!(coordinator.state().characteristics.is_empty());

        let events = observer.events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            NodeEvent::StatusChanged {
                to: ConnectionStatus::Disconnected,
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_recovers_stuck_read() {
        let node = d4i::tests::node();
        let coordinator = coordinator(&node);
        assert!(coordinator.connect(device(), None).await);
        coordinator.read_characteristics(None, None).await;

        node.silence_reads(d4i::uuids::DIAGNOSTICS);
        node.clear_requests();
        // One interval plus the keep-alive timeout.
        tokio::time::sleep(Duration::from_secs(21)).await;

        assert!(node.requests().contains(&MockRequest::Read(d4i::uuids::DIAGNOSTICS)));
        assert!(!coordinator.is_operation_in_progress());
        assert!(node.is_connected());

        node.clear_silenced_reads();
        let mode = coordinator
            .perform_operation(ReadCharacteristic::new(d4i::uuids::MODE))
            .await;
        assert_eq!(mode, Some(vec![2]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_stops_keepalive_and_releases_link() {
        let node = d4i::tests::node();
        let observer = Arc::new(RecordingObserver::default());
        let coordinator = Coordinator::new(
            Arc::new(MockLinkFactory::new(node.clone())),
            Arc::new(AlwaysGranted),
            observer.clone(),
            CoordinatorConfig::default(),
        );
        assert!(coordinator.connect(device(), None).await);
        coordinator.read_characteristics(None, None).await;
        assert_eq!(coordinator.state().last_error, None);

        let mut rx = coordinator.subscribe();
        node.drop_link();
        rx.wait_for(|s| s.connection_status == ConnectionStatus::Disconnected)
            .await
            .unwrap();
        node.clear_requests();
        // Three keep-alive periods.
        tokio::time::sleep(Duration::from_secs(46)).await;

        assert!(node.requests().is_empty(), "{:?}", node.requests());
        assert_eq!(coordinator.state().last_error, None);
        assert_eq!(node.closes(), 1);
        assert_eq!(node.open_handles(), 0);
        assert!(!coordinator.is_operation_in_progress());

        let events = observer.events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            NodeEvent::Log { level: LogLevel::Warn, message } if message.starts_with("Link lost")
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_survives_cancelled_caller() {
        let node = d4i::tests::node();
        let coordinator = coordinator(&node);
        assert!(coordinator.connect(device(), None).await);
        node.silence_disconnect();

        let caller = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.disconnect().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(node.requests().contains(&MockRequest::Disconnect));
        assert_eq!(node.closes(), 0);

        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        // Past the disconnect timeout.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(node.closes(), 1);
        assert_eq!(node.open_handles(), 0);
        assert_eq!(
            coordinator.state().connection_status,
            ConnectionStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn test_revoked_permission_requests_once() {
        let node = d4i::tests::node();
        let permissions = Arc::new(ManualPermissions::default());
        let coordinator = Coordinator::new(
            Arc::new(MockLinkFactory::new(node.clone())),
            permissions.clone(),
            Arc::new(NullObserver),
            CoordinatorConfig::default(),
        );
        assert!(coordinator.connect(device(), None).await);

        permissions.denied.store(true, Ordering::SeqCst);
        node.clear_requests();
        let mode = coordinator
            .perform_operation(ReadCharacteristic::new(d4i::uuids::MODE))
            .await;
        let level = coordinator
            .perform_operation(ReadCharacteristic::new(d4i::uuids::LEVEL))
            .await;

        assert_eq!(mode, None);
        assert_eq!(level, None);
        assert_eq!(
            coordinator.state().last_error.as_ref().and_then(|e| e.kind()),
            Some(&GattErrorKind::MissingPermission)
        );
        assert_eq!(permissions.requests.load(Ordering::SeqCst), 1);
        assert!(node.requests().is_empty());
    }

    #[tokio::test]
    async fn test_link_permission_denial_maps_to_missing_permission() {
        let node = d4i::tests::node();
        let permissions = Arc::new(ManualPermissions::default());
        let coordinator = Coordinator::new(
            Arc::new(MockLinkFactory::new(node.clone())),
            permissions.clone(),
            Arc::new(NullObserver),
            CoordinatorConfig::default(),
        );
        assert!(coordinator.connect(device(), None).await);

        node.deny_permission(true);
        let mode = coordinator
            .perform_operation(ReadCharacteristic::new(d4i::uuids::MODE))
            .await;
        assert_eq!(mode, None);
        assert_eq!(
            coordinator.state().last_error.as_ref().and_then(|e| e.kind()),
            Some(&GattErrorKind::MissingPermission)
        );
        assert_eq!(permissions.requests.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_operation_in_progress());

        node.deny_permission(false);
        let mode = coordinator
            .perform_operation(ReadCharacteristic::new(d4i::uuids::MODE))
            .await;
        assert_eq!(mode, Some(vec![2]));
    }

    #[tokio::test]
    async fn test_operation_without_link_is_none() {
        let coordinator = coordinator(&MockNode::new());
        assert_eq!(
            coordinator
                .perform_operation_or(ReadCharacteristic::new(d4i::uuids::MODE), vec![0xFF])
                .await,
            vec![0xFF]
        );
        assert!(!coordinator.refresh().await);
        assert!(coordinator.read_dali_banks().await.is_none());
    }
}
