//! btleplug-based link implementation.
//!
//! btleplug exposes an async request/response API; each accepted request is
//! spawned on the tokio runtime and its outcome reported through the event
//! sink, which gives the same callback shape the coordinator expects.
//!
//! Key differences from a native GATT client:
//! - there is no prepared-write queue, so reliable writes are queued locally
//!   and flushed in order on execute
//! - CCCD writes map to `subscribe` / `unsubscribe`
//! - MTU is negotiated by the OS and never reported

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::constants::{
    CCCD_DISABLE, CCCD_UUID, GATT_CONN_TERMINATE_LOCAL_HOST, GATT_CONN_TERMINATE_PEER_USER,
    GATT_ERROR, GATT_SUCCESS,
};
use super::traits::{EventSink, LinkEvent, LinkFactory, LinkTransport, TransportError};
use crate::model::Device;

/// Opens [`BtleLink`]s on one adapter.
pub struct BtleLinkFactory {
    adapter: Adapter,
}

impl BtleLinkFactory {
    /// Use the first adapter the platform reports.
    #[instrument(level = "info")]
    pub async fn first_adapter() -> Result<Self, TransportError> {
        let manager = Manager::new()
            .await
            .map_err(|e| TransportError::AdapterUnavailable(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| TransportError::AdapterUnavailable(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::AdapterUnavailable("no adapter found".into()))?;
        Ok(Self { adapter })
    }

    pub fn new(adapter: Adapter) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Scan for `window` so nearby nodes become known to the adapter.
    pub async fn scan(&self, window: std::time::Duration) -> Result<(), TransportError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| TransportError::AdapterUnavailable(e.to_string()))?;
        tokio::time::sleep(window).await;
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| TransportError::AdapterUnavailable(e.to_string()))
    }
}

#[async_trait]
impl LinkFactory for BtleLinkFactory {
    #[instrument(skip(self, sink), fields(address = %device.address))]
    async fn open(
        &self,
        device: &Device,
        sink: EventSink,
    ) -> Result<Arc<dyn LinkTransport>, TransportError> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| TransportError::AdapterUnavailable(e.to_string()))?;

        let peripheral = peripherals
            .into_iter()
            .find(|p| p.address().to_string().eq_ignore_ascii_case(&device.address))
            .ok_or_else(|| TransportError::DeviceNotFound {
                address: device.address.clone(),
            })?;

        info!(address = %device.address, family = %device.family, "Opened link");
        let handle = Handle::try_current()
            .map_err(|e| TransportError::AdapterUnavailable(e.to_string()))?;
        Ok(Arc::new(BtleLink::new(
            self.adapter.clone(),
            peripheral,
            sink,
            handle,
        )))
    }
}

/// btleplug link to one peripheral.
pub struct BtleLink {
    adapter: Adapter,
    peripheral: Peripheral,
    sink: EventSink,
    runtime: Handle,
    table: Arc<Mutex<Option<BTreeSet<Characteristic>>>>,
    reliable: Mutex<Option<Vec<(Characteristic, Vec<u8>)>>>,
    connected: Arc<AtomicBool>,
    closed: AtomicBool,
    watching: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl BtleLink {
    fn new(adapter: Adapter, peripheral: Peripheral, sink: EventSink, runtime: Handle) -> Self {
        Self {
            adapter,
            peripheral,
            sink,
            runtime,
            table: Arc::new(Mutex::new(None)),
            reliable: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            watching: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        lock(&self.table)
            .as_ref()
            .and_then(|table| table.iter().find(|c| c.uuid == uuid).cloned())
            .ok_or(TransportError::UnknownCharacteristic(uuid))
    }

    fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = self.runtime.spawn(fut);
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Forward notifications and central disconnect events into the sink.
    fn start_watchers(&self) {
        if self.watching.swap(true, Ordering::SeqCst) {
            return;
        }
        let peripheral = self.peripheral.clone();
        let sink = self.sink.clone();
        self.spawn(async move {
            match peripheral.notifications().await {
                Ok(mut stream) => {
                    while let Some(n) = stream.next().await {
                        sink.emit(LinkEvent::CharacteristicChanged {
                            uuid: n.uuid,
                            value: n.value,
                        });
                    }
                }
                Err(e) => warn!(error = %e, "Notification stream unavailable"),
            }
        });

        let adapter = self.adapter.clone();
        let id = self.peripheral.id();
        let sink = self.sink.clone();
        let connected = self.connected.clone();
        self.spawn(async move {
            let Ok(mut events) = adapter.events().await else {
                warn!("Central event stream unavailable");
                return;
            };
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event
                    && gone == id
                {
                    // Only report drops we did not ask for
                    if connected.swap(false, Ordering::SeqCst) {
                        sink.emit(LinkEvent::ConnectionStateChanged {
                            status: GATT_CONN_TERMINATE_PEER_USER,
                            connected: false,
                        });
                    }
                }
            }
        });
    }
}

impl LinkTransport for BtleLink {
    fn connect(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        let peripheral = self.peripheral.clone();
        let sink = self.sink.clone();
        let connected = self.connected.clone();
        self.spawn(async move {
            match peripheral.connect().await {
                Ok(()) => {
                    connected.store(true, Ordering::SeqCst);
                    sink.emit(LinkEvent::ConnectionStateChanged {
                        status: GATT_SUCCESS,
                        connected: true,
                    });
                }
                Err(e) => {
                    debug!(error = %e, "Connect failed");
                    sink.emit(LinkEvent::ConnectionStateChanged {
                        status: GATT_ERROR,
                        connected: false,
                    });
                }
            }
        });
        self.start_watchers();
        Ok(())
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        let peripheral = self.peripheral.clone();
        let sink = self.sink.clone();
        let connected = self.connected.clone();
        self.spawn(async move {
            connected.store(false, Ordering::SeqCst);
            if let Err(e) = peripheral.disconnect().await {
                debug!(error = %e, "Disconnect reported an error");
            }
            sink.emit(LinkEvent::ConnectionStateChanged {
                status: GATT_CONN_TERMINATE_LOCAL_HOST,
                connected: false,
            });
        });
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        *lock(&self.table) = None;
        if self.connected.swap(false, Ordering::SeqCst) {
            let peripheral = self.peripheral.clone();
            self.runtime.spawn(async move {
                let _ = peripheral.disconnect().await;
            });
        }
        debug!("Link closed");
    }

    fn discover_services(&self) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let peripheral = self.peripheral.clone();
        let sink = self.sink.clone();
        let table = self.table.clone();
        self.spawn(async move {
            let status = match peripheral.discover_services().await {
                Ok(()) => {
                    *lock(&table) = Some(peripheral.characteristics());
                    GATT_SUCCESS
                }
                Err(e) => {
                    debug!(error = %e, "Service discovery failed");
                    GATT_ERROR
                }
            };
            sink.emit(LinkEvent::ServicesDiscovered { status });
        });
        Ok(())
    }

    fn refresh(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        *lock(&self.table) = None;
        Ok(())
    }

    fn has_characteristic(&self, uuid: Uuid) -> bool {
        self.characteristic(uuid).is_ok()
    }

    fn read_characteristic(&self, uuid: Uuid) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let characteristic = self.characteristic(uuid)?;
        let peripheral = self.peripheral.clone();
        let sink = self.sink.clone();
        self.spawn(async move {
            let event = match peripheral.read(&characteristic).await {
                Ok(value) => LinkEvent::CharacteristicRead {
                    uuid,
                    status: GATT_SUCCESS,
                    value,
                },
                Err(e) => {
                    debug!(%uuid, error = %e, "Read failed");
                    LinkEvent::CharacteristicRead {
                        uuid,
                        status: GATT_ERROR,
                        value: Vec::new(),
                    }
                }
            };
            sink.emit(event);
        });
        Ok(())
    }

    fn write_characteristic(&self, uuid: Uuid, value: &[u8]) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let characteristic = self.characteristic(uuid)?;

        if let Some(queue) = lock(&self.reliable).as_mut() {
            queue.push((characteristic, value.to_vec()));
            self.sink.emit(LinkEvent::CharacteristicWritten {
                uuid,
                status: GATT_SUCCESS,
                value: value.to_vec(),
            });
            return Ok(());
        }

        let peripheral = self.peripheral.clone();
        let sink = self.sink.clone();
        let value = value.to_vec();
        self.spawn(async move {
            let status = match peripheral
                .write(&characteristic, &value, WriteType::WithResponse)
                .await
            {
                Ok(()) => GATT_SUCCESS,
                Err(e) => {
                    debug!(%uuid, error = %e, "Write failed");
                    GATT_ERROR
                }
            };
            sink.emit(LinkEvent::CharacteristicWritten {
                uuid,
                status,
                value,
            });
        });
        Ok(())
    }

    fn begin_reliable_write(&self) -> Result<(), TransportError> {
        self.ensure_connected()?;
        *lock(&self.reliable) = Some(Vec::new());
        Ok(())
    }

    fn execute_reliable_write(&self) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let queue = lock(&self.reliable)
            .take()
            .ok_or(TransportError::NoReliableWrite)?;
        let peripheral = self.peripheral.clone();
        let sink = self.sink.clone();
        self.spawn(async move {
            let mut status = GATT_SUCCESS;
            for (characteristic, value) in queue {
                if let Err(e) = peripheral
                    .write(&characteristic, &value, WriteType::WithResponse)
                    .await
                {
                    warn!(uuid = %characteristic.uuid, error = %e, "Queued write failed");
                    status = GATT_ERROR;
                    break;
                }
            }
            sink.emit(LinkEvent::ReliableWriteCompleted { status });
        });
        Ok(())
    }

    fn abort_reliable_write(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        *lock(&self.reliable) = None;
        Ok(())
    }

    fn set_notification(&self, uuid: Uuid, _enabled: bool) -> Result<(), TransportError> {
        self.ensure_open()?;
        // Routing is done by the notification stream; only validate the target
        self.characteristic(uuid).map(|_| ())
    }

    fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.ensure_connected()?;
        if descriptor != CCCD_UUID {
            return Err(TransportError::Rejected(format!(
                "descriptor {descriptor} is not writable through this backend"
            )));
        }
        let target = self.characteristic(characteristic)?;
        let enable = value != CCCD_DISABLE;
        let peripheral = self.peripheral.clone();
        let sink = self.sink.clone();
        self.spawn(async move {
            let result = if enable {
                peripheral.subscribe(&target).await
            } else {
                peripheral.unsubscribe(&target).await
            };
            let status = match result {
                Ok(()) => GATT_SUCCESS,
                Err(e) => {
                    debug!(uuid = %characteristic, error = %e, "Subscription change failed");
                    GATT_ERROR
                }
            };
            sink.emit(LinkEvent::DescriptorWritten {
                characteristic,
                descriptor,
                status,
            });
        });
        Ok(())
    }
}
