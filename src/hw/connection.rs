use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::driver::{
    CallbackSink, DiscoveryStatus, DriverCallback, GattAdapter, GattDriver, GattOperation,
    HandleId, LinkState, PeripheralHandle, TaggedCallback,
};
use super::model::{
    CharacteristicPayload, CharacteristicRef, ConnectionState, GattCharacteristic, GattService,
    WriteKind,
};
use crate::error::InteractionError;
use crate::events::{EventDispatcher, EventSubscription, GattEvent};

/// Owns the connection to a single peripheral and turns driver callbacks into [`GattEvent`]s.
///
/// Cloning yields another handle to the same manager.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

#[derive(Debug)]
struct ManagerInner {
    driver: Arc<dyn GattDriver>,
    dispatcher: EventDispatcher,
    state: Mutex<ManagerState>,
    callback_sender: UnboundedSender<TaggedCallback>,
    callback_receiver: Mutex<Option<UnboundedReceiver<TaggedCallback>>>,
    next_handle: AtomicU64,
    shutdown: CancellationToken,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Debug, Default)]
struct ManagerState {
    adapter: Option<Arc<dyn GattAdapter>>,
    address: Option<String>,
    connection: Option<ActiveHandle>,
    connection_state: ConnectionState,
    services: Option<Vec<GattService>>,
    discovery: Option<DiscoveryStatus>,
    disconnect_requested: bool,
}

#[derive(Debug)]
struct ActiveHandle {
    id: HandleId,
    handle: Box<dyn PeripheralHandle>,
}

impl ManagerState {
    fn live_handle(&self, operation: &'static str) -> Result<&dyn PeripheralHandle, InteractionError> {
        if self.adapter.is_none() {
            warn!(operation, "BLE adapter not initialised");
            return Err(InteractionError::NotInitialized);
        }
        match &self.connection {
            Some(active) => Ok(active.handle.as_ref()),
            None => {
                warn!(operation, "no peripheral handle is open");
                Err(InteractionError::NotInitialized)
            }
        }
    }

    fn find_characteristic(&self, reference: &CharacteristicRef) -> Option<&GattCharacteristic> {
        self.services
            .as_ref()?
            .iter()
            .filter(|service| service.uuid() == reference.service_uuid())
            .flat_map(|service| service.characteristics().iter())
            .find(|characteristic| characteristic.uuid() == reference.uuid())
    }

    fn characteristic_mut(&mut self, reference: &CharacteristicRef) -> Option<&mut GattCharacteristic> {
        self.services
            .as_mut()?
            .iter_mut()
            .filter(|service| service.uuid() == reference.service_uuid())
            .flat_map(|service| service.characteristics_mut().iter_mut())
            .find(|characteristic| characteristic.uuid() == reference.uuid())
    }

    /// Stores a value reported by the driver and returns the payload to publish.
    fn record_value(&mut self, reported: &GattCharacteristic) -> CharacteristicPayload {
        match self.characteristic_mut(&reported.reference()) {
            Some(characteristic) => {
                characteristic.set_value(reported.value().to_vec());
                CharacteristicPayload::from_characteristic(characteristic)
            }
            None => CharacteristicPayload::from_characteristic(reported),
        }
    }
}

impl ConnectionManager {
    /// Creates a manager bound to `driver`; call [`ConnectionManager::initialize`] before use.
    #[must_use]
    pub fn new(driver: Arc<dyn GattDriver>) -> Self {
        let (callback_sender, callback_receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ManagerInner {
                driver,
                dispatcher: EventDispatcher::new(),
                state: Mutex::new(ManagerState::default()),
                callback_sender,
                callback_receiver: Mutex::new(Some(callback_receiver)),
                next_handle: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Acquires the BLE adapter and starts processing driver callbacks.
    ///
    /// # Errors
    ///
    /// Returns `AdapterUnavailable` when the platform has no usable Bluetooth adapter.
    #[instrument(skip(self), level = "debug")]
    pub async fn initialize(&self) -> Result<(), InteractionError> {
        let adapter = match self.inner.driver.adapter().await {
            Ok(adapter) => adapter,
            Err(error) => {
                warn!(%error, "unable to obtain a BLE adapter");
                return Err(error);
            }
        };
        self.lock_state().adapter = Some(adapter);

        let receiver = self
            .inner
            .callback_receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(receiver) = receiver {
            tokio::spawn(run_callback_pump(
                Arc::downgrade(&self.inner),
                receiver,
                self.inner.shutdown.clone(),
            ));
            debug!("callback pump started");
        }
        Ok(())
    }

    /// Subscribes to the normalised event stream.
    pub fn subscribe(&self) -> EventSubscription {
        self.inner.dispatcher.subscribe()
    }

    /// Starts connecting to `address`, reusing the live handle when the address is unchanged.
    ///
    /// `Ok` means the attempt was dispatched; the outcome arrives as a `Connected` or
    /// `Disconnected` event.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` before [`ConnectionManager::initialize`], `MissingAddress` for
    /// a blank address, or `OperationRejected` if the driver refuses to reconnect.
    #[instrument(skip(self), level = "debug")]
    pub fn connect(&self, address: &str) -> Result<(), InteractionError> {
        let address = address.trim();
        let mut state = self.lock_state();
        let Some(adapter) = state.adapter.clone() else {
            warn!("BLE adapter not initialised");
            return Err(InteractionError::NotInitialized);
        };
        if address.is_empty() {
            warn!("refusing to connect without an address");
            return Err(InteractionError::MissingAddress);
        }

        if state.address.as_deref() == Some(address)
            && let Some(active) = &state.connection
        {
            debug!(handle = %active.id, "reusing existing handle for connection");
            if !active.handle.reconnect() {
                warn!(handle = %active.id, "driver did not initiate the reconnect");
                return Err(InteractionError::OperationRejected {
                    operation: GattOperation::Reconnect,
                    uuid: None,
                });
            }
            state.connection_state = ConnectionState::Connecting;
            state.discovery = None;
            state.disconnect_requested = false;
            info!("connecting");
            return Ok(());
        }

        if let Some(previous) = state.connection.take() {
            debug!(handle = %previous.id, "closing handle bound to the previous address");
            previous.handle.close();
        }
        state.services = None;
        state.discovery = None;
        state.disconnect_requested = false;

        let id = HandleId(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        let sink = CallbackSink::new(id, self.inner.callback_sender.clone());
        let handle = match adapter.open_connection(address, sink) {
            Ok(handle) => handle,
            Err(error) => {
                warn!(%error, "driver could not open a connection");
                state.connection_state = ConnectionState::Disconnected;
                return Err(error);
            }
        };
        debug!(handle = %id, "trying to create a new connection");

        state.connection = Some(ActiveHandle { id, handle });
        state.address = Some(address.to_string());
        state.connection_state = ConnectionState::Connecting;
        Ok(())
    }

    /// Requests termination of the active connection; the result arrives as `Disconnected`.
    #[instrument(skip(self), level = "debug")]
    pub fn disconnect(&self) {
        let mut state = self.lock_state();
        let Ok(handle) = state.live_handle("disconnect") else {
            return;
        };
        handle.disconnect();
        state.disconnect_requested = true;
    }

    /// Releases the peripheral handle. Safe to call repeatedly.
    #[instrument(skip(self), level = "debug")]
    pub fn close(&self) {
        let mut state = self.lock_state();
        let Some(active) = state.connection.take() else {
            return;
        };
        active.handle.close();
        state.connection_state = ConnectionState::Disconnected;
        state.services = None;
        state.discovery = None;
        state.disconnect_requested = false;
        debug!(handle = %active.id, "peripheral handle closed");
    }

    /// Requests a read; the value arrives as `DataAvailable`.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` without a handle and `OperationRejected` if the driver refuses.
    #[instrument(skip(self), level = "debug", fields(uuid = reference.uuid()))]
    pub fn read_characteristic(&self, reference: &CharacteristicRef) -> Result<(), InteractionError> {
        let state = self.lock_state();
        let handle = state.live_handle("read")?;
        if !handle.read_characteristic(reference) {
            warn!("read request was not accepted");
            return Err(rejected(GattOperation::Read, reference));
        }
        Ok(())
    }

    /// Stores `value` on the characteristic and requests a write; completion arrives as
    /// `WriteComplete`.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` without a handle, `UnknownCharacteristic` when the reference is
    /// not in the catalog, and `OperationRejected` if the driver refuses the request.
    #[instrument(skip(self, value), level = "debug", fields(uuid = reference.uuid(), value_len = value.len(), write_kind = %write_kind))]
    pub fn write_characteristic(
        &self,
        reference: &CharacteristicRef,
        value: &[u8],
        write_kind: WriteKind,
    ) -> Result<(), InteractionError> {
        let mut state = self.lock_state();
        state.live_handle("write")?;
        let Some(characteristic) = state.characteristic_mut(reference) else {
            return Err(InteractionError::UnknownCharacteristic {
                uuid: reference.uuid().to_string(),
            });
        };
        characteristic.set_value(value.to_vec());
        characteristic.set_write_kind(write_kind);
        let outgoing = characteristic.clone();

        info!("attempting to write characteristic");
        let handle = state.live_handle("write")?;
        if !handle.write_characteristic(&outgoing) {
            warn!("write request was not accepted");
            return Err(rejected(GattOperation::Write, reference));
        }
        Ok(())
    }

    /// Enables or disables notification delivery for a characteristic.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` without a handle and `OperationRejected` if the driver refuses.
    #[instrument(skip(self), level = "debug", fields(uuid = reference.uuid()))]
    pub fn set_notification(
        &self,
        reference: &CharacteristicRef,
        enabled: bool,
    ) -> Result<(), InteractionError> {
        let state = self.lock_state();
        let handle = state.live_handle("set_notification")?;
        if !handle.set_notification(reference, enabled) {
            warn!("notification toggle was not accepted");
            return Err(rejected(GattOperation::SetNotification, reference));
        }
        Ok(())
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.lock_state().connection_state
    }

    /// Address of the last peripheral a connection was opened to.
    #[must_use]
    pub fn address(&self) -> Option<String> {
        self.lock_state().address.clone()
    }

    /// Snapshot of the service catalog, `None` until discovery completes.
    #[must_use]
    pub fn supported_services(&self) -> Option<Vec<GattService>> {
        self.lock_state().services.clone()
    }

    /// Outcome of the latest service discovery on the current link, `None` while pending.
    #[must_use]
    pub fn discovery_status(&self) -> Option<DiscoveryStatus> {
        self.lock_state().discovery
    }

    /// Snapshot of one catalogued characteristic.
    #[must_use]
    pub fn characteristic(&self, reference: &CharacteristicRef) -> Option<GattCharacteristic> {
        self.lock_state().find_characteristic(reference).cloned()
    }

    /// Generation of the live handle, if one is open.
    #[must_use]
    pub fn live_handle(&self) -> Option<HandleId> {
        self.lock_state().connection.as_ref().map(|active| active.id)
    }

    /// Stops the callback pump. Pending callbacks are dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Applies one driver callback to the state machine and publishes the matching event.
    #[instrument(skip(self, tagged), level = "trace", fields(handle = %tagged.handle))]
    pub(crate) fn handle_callback(&self, tagged: TaggedCallback) {
        let mut state = self.lock_state();
        let is_current = state
            .connection
            .as_ref()
            .is_some_and(|active| active.id == tagged.handle);
        if !is_current {
            debug!(callback = ?tagged.callback, "ignoring callback from a closed or replaced handle");
            return;
        }

        let dispatcher = &self.inner.dispatcher;
        match tagged.callback {
            DriverCallback::ConnectionStateChange { status, new_state } => match new_state {
                LinkState::Connected => {
                    state.connection_state = ConnectionState::Connected;
                    dispatcher.publish(GattEvent::Connected);
                    info!(%status, "connected to GATT server");
                    state.discovery = None;
                    let accepted = state
                        .connection
                        .as_ref()
                        .is_some_and(|active| active.handle.discover_services());
                    if accepted {
                        info!("attempting to start service discovery");
                    } else {
                        let outcome = DiscoveryStatus::Rejected;
                        if let Err(error) = outcome.into_result() {
                            warn!(%error, "service discovery was not started");
                        }
                        state.discovery = Some(outcome);
                        dispatcher.publish(GattEvent::ServicesDiscovered(outcome));
                    }
                }
                other => {
                    if other != LinkState::Disconnected {
                        warn!(?other, %status, "unexpected link state; treating as disconnected");
                    }
                    state.connection_state = ConnectionState::Disconnected;
                    state.services = None;
                    state.discovery = None;
                    if state.disconnect_requested
                        && let Some(active) = state.connection.take()
                    {
                        active.handle.close();
                        state.disconnect_requested = false;
                        debug!(handle = %active.id, "handle released after requested disconnect");
                    }
                    info!(%status, "disconnected from GATT server");
                    dispatcher.publish(GattEvent::Disconnected);
                }
            },
            DriverCallback::ServicesDiscovered { status } => {
                if !status.is_success() {
                    let outcome = DiscoveryStatus::Failed(status);
                    if let Err(error) = outcome.into_result() {
                        warn!(%error, "service discovery failed");
                    }
                    state.discovery = Some(outcome);
                    dispatcher.publish(GattEvent::ServicesDiscovered(outcome));
                    return;
                }
                let services = state
                    .connection
                    .as_ref()
                    .map(|active| active.handle.services())
                    .unwrap_or_default();
                info!(service_count = services.len(), "services discovered");
                state.services = Some(services);
                state.discovery = Some(DiscoveryStatus::Complete);
                dispatcher.publish(GattEvent::ServicesDiscovered(DiscoveryStatus::Complete));
            }
            DriverCallback::CharacteristicRead {
                characteristic,
                status,
            } => {
                if !status.is_success() {
                    warn!(uuid = characteristic.uuid(), %status, "characteristic read failed");
                    return;
                }
                let payload = state.record_value(&characteristic);
                trace!(uuid = payload.uuid(), "characteristic read");
                dispatcher.publish(GattEvent::DataAvailable(payload));
            }
            DriverCallback::CharacteristicChanged { characteristic } => {
                let payload = state.record_value(&characteristic);
                trace!(uuid = payload.uuid(), "characteristic changed");
                dispatcher.publish(GattEvent::DataAvailable(payload));
            }
            DriverCallback::CharacteristicWrite {
                characteristic,
                status,
            } => {
                if status.is_success() {
                    info!(uuid = characteristic.uuid(), "characteristic write succeeded");
                } else {
                    warn!(uuid = characteristic.uuid(), %status, "characteristic write failed");
                }
                let payload = state.record_value(&characteristic);
                dispatcher.publish(GattEvent::WriteComplete(payload, status));
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn rejected(operation: GattOperation, reference: &CharacteristicRef) -> InteractionError {
    InteractionError::OperationRejected {
        operation,
        uuid: Some(reference.uuid().to_string()),
    }
}

async fn run_callback_pump(
    inner: Weak<ManagerInner>,
    mut receiver: UnboundedReceiver<TaggedCallback>,
    shutdown: CancellationToken,
) {
    loop {
        let tagged = tokio::select! {
            () = shutdown.cancelled() => break,
            maybe_callback = receiver.recv() => match maybe_callback {
                Some(tagged) => tagged,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        ConnectionManager { inner }.handle_callback(tagged);
    }
    debug!("callback pump stopped");
}
