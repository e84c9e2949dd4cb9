use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::runtime::Handle as RuntimeHandle;
use tokio::time::sleep;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, trace, warn};

use super::driver::{
    CallbackSink, DriverCallback, GattAdapter, GattDriver, GattStatus, LinkState,
    PeripheralHandle,
};
use super::model::{CharacteristicRef, GattCharacteristic, GattService, WriteKind};
use crate::error::InteractionError;

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Platform driver backed by `btleplug`.
#[derive(Debug)]
pub(crate) struct BtleplugDriver {
    manager: Manager,
}

impl BtleplugDriver {
    /// Creates the real BLE driver.
    pub(crate) async fn new() -> Result<Self, InteractionError> {
        let manager = Manager::new().await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl GattDriver for BtleplugDriver {
    #[instrument(skip(self), level = "trace")]
    async fn adapter(&self) -> Result<Arc<dyn GattAdapter>, InteractionError> {
        let adapters = self.manager.adapters().await?;
        let Some(adapter) = adapters.into_iter().next() else {
            return Err(InteractionError::AdapterUnavailable);
        };
        let name = adapter.adapter_info().await?;
        debug!(adapter = %name, "using BLE adapter");
        Ok(Arc::new(BtleplugAdapter {
            adapter,
            runtime: RuntimeHandle::current(),
        }))
    }
}

#[derive(Debug)]
struct BtleplugAdapter {
    adapter: Adapter,
    runtime: RuntimeHandle,
}

impl GattAdapter for BtleplugAdapter {
    fn open_connection(
        &self,
        address: &str,
        sink: CallbackSink,
    ) -> Result<Box<dyn PeripheralHandle>, InteractionError> {
        let shared = Arc::new(LinkShared {
            adapter: self.adapter.clone(),
            runtime: self.runtime.clone(),
            address: address.to_string(),
            sink,
            peripheral: Mutex::new(None),
            catalog: Mutex::new(Catalog::default()),
            tasks: LinkTasks::default(),
        });
        shared.spawn("watch_link", watch_link(Arc::clone(&shared)));
        shared.start_link("connect");
        Ok(Box::new(BtleplugHandle { shared }))
    }
}

#[derive(Debug, Default)]
struct Catalog {
    services: Vec<GattService>,
    characteristics: HashMap<CharacteristicRef, Characteristic>,
}

/// Cancellation scopes of one handle.
///
/// Handle-wide tasks stop on close. The connect attempt and the notification forwarder of the
/// current link run in a child scope that ends when the link goes down or is replaced.
#[derive(Debug, Default)]
struct LinkTasks {
    handle: CancellationToken,
    link: Mutex<Option<CancellationToken>>,
    up: AtomicBool,
}

impl LinkTasks {
    /// Opens a scope for a new link attempt, cancelling the previous one.
    fn begin(&self) -> CancellationToken {
        let scope = self.handle.child_token();
        if let Some(previous) = lock(&self.link).replace(scope.clone()) {
            previous.cancel();
        }
        self.up.store(false, Ordering::SeqCst);
        scope
    }

    fn mark_up(&self) {
        self.up.store(true, Ordering::SeqCst);
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    /// Cancels the current link scope and returns whether the link was up.
    fn end(&self) -> bool {
        if let Some(scope) = lock(&self.link).take() {
            scope.cancel();
        }
        self.up.swap(false, Ordering::SeqCst)
    }

    fn close(&self) {
        self.handle.cancel();
    }

    fn is_closed(&self) -> bool {
        self.handle.is_cancelled()
    }
}

#[derive(Debug)]
struct LinkShared {
    adapter: Adapter,
    runtime: RuntimeHandle,
    address: String,
    sink: CallbackSink,
    peripheral: Mutex<Option<Peripheral>>,
    catalog: Mutex<Catalog>,
    tasks: LinkTasks,
}

impl LinkShared {
    fn spawn<F>(&self, operation: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn_in(&self.tasks.handle, operation, task);
    }

    fn spawn_in<F>(&self, scope: &CancellationToken, operation: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = scope.clone();
        let span = info_span!("ble_task", operation, handle = %self.sink.handle());
        self.runtime.spawn(
            async move {
                tokio::select! {
                    () = cancel.cancelled() => trace!("task cancelled with its scope"),
                    () = task => {}
                }
            }
            .instrument(span),
        );
    }

    fn peripheral(&self) -> Option<Peripheral> {
        lock(&self.peripheral).clone()
    }

    fn characteristic(&self, reference: &CharacteristicRef) -> Option<Characteristic> {
        lock(&self.catalog).characteristics.get(reference).cloned()
    }

    /// Starts connecting in a fresh link scope.
    fn start_link(self: &Arc<Self>, operation: &'static str) {
        let scope = self.tasks.begin();
        self.spawn_in(
            &scope,
            operation,
            establish_link(Arc::clone(self), scope.clone()),
        );
    }

    fn report_link_up(&self) {
        self.tasks.mark_up();
        self.sink.emit(DriverCallback::ConnectionStateChange {
            status: GattStatus::SUCCESS,
            new_state: LinkState::Connected,
        });
    }

    fn report_link_down(&self, status: GattStatus) {
        if self.tasks.end() {
            self.sink.emit(DriverCallback::ConnectionStateChange {
                status,
                new_state: LinkState::Disconnected,
            });
        }
    }

    fn report_connect_failure(&self) {
        self.tasks.end();
        self.sink.emit(DriverCallback::ConnectionStateChange {
            status: GattStatus::FAILURE,
            new_state: LinkState::Disconnected,
        });
    }
}

/// Peripheral handle whose requests run as tasks on the tokio runtime.
#[derive(Debug)]
struct BtleplugHandle {
    shared: Arc<LinkShared>,
}

impl PeripheralHandle for BtleplugHandle {
    fn reconnect(&self) -> bool {
        if self.shared.tasks.is_closed() {
            return false;
        }
        self.shared.start_link("reconnect");
        true
    }

    fn disconnect(&self) {
        if !self.shared.tasks.is_up() {
            debug!("link not up; abandoning the pending connect");
            self.shared.tasks.end();
            if let Some(peripheral) = self.shared.peripheral() {
                self.shared.spawn("abort_connect", async move {
                    if let Err(error) = peripheral.disconnect().await {
                        debug!(?error, "platform disconnect after an abandoned connect failed");
                    }
                });
            }
            self.shared.sink.emit(DriverCallback::ConnectionStateChange {
                status: GattStatus::SUCCESS,
                new_state: LinkState::Disconnected,
            });
            return;
        }
        let Some(peripheral) = self.shared.peripheral() else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        self.shared.spawn("disconnect", async move {
            let status = match peripheral.disconnect().await {
                Ok(()) => GattStatus::SUCCESS,
                Err(error) => {
                    warn!(%error, "peripheral disconnect failed");
                    GattStatus::FAILURE
                }
            };
            shared.report_link_down(status);
        });
    }

    fn close(&self) {
        self.shared.tasks.close();
        let Some(peripheral) = self.shared.peripheral() else {
            return;
        };
        self.shared.runtime.spawn(async move {
            if let Ok(true) = peripheral.is_connected().await
                && let Err(error) = peripheral.disconnect().await
            {
                debug!(?error, "failed to disconnect while closing handle");
            }
        });
    }

    fn discover_services(&self) -> bool {
        let Some(peripheral) = self.shared.peripheral() else {
            return false;
        };
        let shared = Arc::clone(&self.shared);
        self.shared.spawn("discover_services", async move {
            let status = match peripheral.discover_services().await {
                Ok(()) => {
                    *lock(&shared.catalog) = collect_catalog(&peripheral);
                    GattStatus::SUCCESS
                }
                Err(error) => {
                    warn!(%error, "service discovery failed");
                    GattStatus::FAILURE
                }
            };
            shared
                .sink
                .emit(DriverCallback::ServicesDiscovered { status });
        });
        true
    }

    fn read_characteristic(&self, characteristic: &CharacteristicRef) -> bool {
        let (Some(peripheral), Some(target)) = (
            self.shared.peripheral(),
            self.shared.characteristic(characteristic),
        ) else {
            return false;
        };
        let shared = Arc::clone(&self.shared);
        self.shared.spawn("read", async move {
            let (value, status) = match peripheral.read(&target).await {
                Ok(value) => (value, GattStatus::SUCCESS),
                Err(error) => {
                    warn!(%error, uuid = %target.uuid, "characteristic read failed");
                    (Vec::new(), GattStatus::READ_NOT_PERMITTED)
                }
            };
            shared.sink.emit(DriverCallback::CharacteristicRead {
                characteristic: snapshot(&target, value),
                status,
            });
        });
        true
    }

    fn write_characteristic(&self, characteristic: &GattCharacteristic) -> bool {
        let (Some(peripheral), Some(target)) = (
            self.shared.peripheral(),
            self.shared.characteristic(&characteristic.reference()),
        ) else {
            return false;
        };
        let value = characteristic.value().to_vec();
        let write_type = write_type(characteristic.write_kind());
        let shared = Arc::clone(&self.shared);
        self.shared.spawn("write", async move {
            let status = match peripheral.write(&target, &value, write_type).await {
                Ok(()) => GattStatus::SUCCESS,
                Err(error) => {
                    warn!(%error, uuid = %target.uuid, "characteristic write failed");
                    GattStatus::WRITE_NOT_PERMITTED
                }
            };
            shared.sink.emit(DriverCallback::CharacteristicWrite {
                characteristic: snapshot(&target, value),
                status,
            });
        });
        true
    }

    fn set_notification(&self, characteristic: &CharacteristicRef, enabled: bool) -> bool {
        let (Some(peripheral), Some(target)) = (
            self.shared.peripheral(),
            self.shared.characteristic(characteristic),
        ) else {
            return false;
        };
        self.shared.spawn("set_notification", async move {
            let result = if enabled {
                peripheral.subscribe(&target).await
            } else {
                peripheral.unsubscribe(&target).await
            };
            if let Err(error) = result {
                warn!(%error, uuid = %target.uuid, enabled, "notification toggle failed");
            }
        });
        true
    }

    fn services(&self) -> Vec<GattService> {
        lock(&self.shared.catalog).services.clone()
    }
}

/// Scans until the addressed peripheral appears, connects, and starts forwarding notifications.
#[instrument(skip(shared, scope), level = "debug", fields(address = %shared.address))]
async fn establish_link(shared: Arc<LinkShared>, scope: CancellationToken) {
    let peripheral = match shared.peripheral() {
        Some(peripheral) => peripheral,
        None => match find_peripheral(&shared.adapter, &shared.address).await {
            Ok(peripheral) => {
                *lock(&shared.peripheral) = Some(peripheral.clone());
                peripheral
            }
            Err(error) => {
                warn!(%error, "unable to locate peripheral");
                shared.report_connect_failure();
                return;
            }
        },
    };

    let connected = match peripheral.is_connected().await {
        Ok(true) => Ok(()),
        Ok(false) => peripheral.connect().await,
        Err(error) => Err(error),
    };
    if let Err(error) = connected {
        warn!(%error, "peripheral connect failed");
        shared.report_connect_failure();
        return;
    }

    info!("peripheral link established");
    shared.report_link_up();
    shared.spawn_in(
        &scope,
        "forward_notifications",
        forward_notifications(Arc::clone(&shared), peripheral),
    );
}

async fn find_peripheral(adapter: &Adapter, address: &str) -> Result<Peripheral, InteractionError> {
    adapter.start_scan(ScanFilter::default()).await?;
    debug!("scanning for peripheral");
    loop {
        for peripheral in adapter.peripherals().await? {
            if matches_address(&peripheral, address) {
                if let Err(error) = adapter.stop_scan().await {
                    debug!(?error, "failed to stop adapter scan cleanly");
                }
                return Ok(peripheral);
            }
        }
        sleep(SCAN_POLL_INTERVAL).await;
    }
}

fn matches_address(peripheral: &Peripheral, address: &str) -> bool {
    peripheral.address().to_string().eq_ignore_ascii_case(address)
        || peripheral.id().to_string().eq_ignore_ascii_case(address)
}

async fn forward_notifications(shared: Arc<LinkShared>, peripheral: Peripheral) {
    let mut notifications = match peripheral.notifications().await {
        Ok(notifications) => notifications,
        Err(error) => {
            warn!(%error, "unable to open notification stream");
            return;
        }
    };
    while let Some(notification) = notifications.next().await {
        let uuid = notification.uuid.to_string();
        let target = lock(&shared.catalog)
            .characteristics
            .values()
            .find(|characteristic| characteristic.uuid == notification.uuid)
            .cloned();
        let Some(target) = target else {
            trace!(uuid, "notification for an uncatalogued characteristic");
            continue;
        };
        shared.sink.emit(DriverCallback::CharacteristicChanged {
            characteristic: snapshot(&target, notification.value),
        });
    }
    debug!("notification stream closed");
}

/// Reports link loss raised by the platform stack.
async fn watch_link(shared: Arc<LinkShared>) {
    let mut events = match shared.adapter.events().await {
        Ok(events) => events,
        Err(error) => {
            warn!(%error, "unable to watch adapter events");
            return;
        }
    };
    while let Some(event) = events.next().await {
        let CentralEvent::DeviceDisconnected(id) = event else {
            continue;
        };
        let is_ours = shared
            .peripheral()
            .is_some_and(|peripheral| peripheral.id() == id);
        if is_ours {
            info!("peripheral link lost");
            shared.report_link_down(GattStatus::SUCCESS);
        }
    }
}

fn collect_catalog(peripheral: &Peripheral) -> Catalog {
    let mut catalog = Catalog::default();
    for service in peripheral.services() {
        let service_uuid = service.uuid.to_string();
        let characteristics = service
            .characteristics
            .iter()
            .map(|characteristic| {
                let described = snapshot(characteristic, Vec::new());
                catalog
                    .characteristics
                    .insert(described.reference(), characteristic.clone());
                described
            })
            .collect();
        catalog
            .services
            .push(GattService::new(service_uuid, characteristics));
    }
    catalog
}

fn snapshot(characteristic: &Characteristic, value: Vec<u8>) -> GattCharacteristic {
    GattCharacteristic::new(
        characteristic.service_uuid.to_string(),
        characteristic.uuid.to_string(),
        characteristic.properties,
    )
    .with_value(value)
}

fn write_type(kind: WriteKind) -> WriteType {
    match kind {
        WriteKind::WithoutResponse => WriteType::WithoutResponse,
        WriteKind::WithResponse | WriteKind::Signed => WriteType::WithResponse,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
