use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use btleplug::api::CharPropFlags;
use tokio::time::sleep;
use tracing::{debug, trace};

use super::driver::{
    CallbackSink, DriverCallback, GattAdapter, GattDriver, GattOperation, GattStatus, HandleId,
    LinkState, PeripheralHandle,
};
use super::model::{
    AttributePermissions, CharacteristicRef, GattCharacteristic, GattService, WriteKind,
};
use crate::error::{FixtureError, InteractionError};
use crate::protocol::{self, RoleId};

const DEFAULT_IDENTITY: &str = "DF Bluno";
const DEFAULT_NOTIFICATIONS: [&[u8]; 2] = [b"Hello from Bluno\r\n", b"ready\r\n"];
const BLUNO_PORT_PROPERTIES: &str = "read|write|write_without_response|notify";

/// Parsed fake service catalog.
///
/// Services are separated by `;`, each written as `service_uuid=char_uuid:props,...` where
/// `props` is a `|`-separated list such as `read|write|notify`.
#[derive(Debug, Clone, Eq, PartialEq, derive_more::Into)]
pub struct ServiceFixture {
    services: Vec<GattService>,
}

impl ServiceFixture {
    /// A catalog with the device information and Bluno serial services.
    #[must_use]
    pub fn bluno() -> Self {
        let identity = protocol::role_metadata(RoleId::Identity);
        let serial = protocol::role_metadata(RoleId::Serial);
        let command = protocol::role_metadata(RoleId::Command);
        let raw = format!(
            "{}={}:read;{}={}:{BLUNO_PORT_PROPERTIES},{}:{BLUNO_PORT_PROPERTIES}",
            protocol::DEVICE_INFORMATION_SERVICE_UUID,
            identity.uuid(),
            protocol::BLUNO_SERVICE_UUID,
            serial.uuid(),
            command.uuid(),
        );
        Self {
            services: parse_service_fixture(&raw).unwrap_or_default(),
        }
    }
}

impl Default for ServiceFixture {
    fn default() -> Self {
        Self::bluno()
    }
}

impl FromStr for ServiceFixture {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let services = parse_service_fixture(value)?;
        Ok(Self { services })
    }
}

/// Parsed fake notification payload fixtures, comma separated hex.
#[derive(Debug, Clone, Eq, PartialEq, derive_more::Into)]
pub struct NotificationPayloads {
    payloads: Vec<Vec<u8>>,
}

impl FromStr for NotificationPayloads {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let payloads = parse_notifications(value)?;
        Ok(Self { payloads })
    }
}

/// Settings for constructing a [`FakeGattDriver`].
#[derive(Debug, Clone, Builder)]
pub struct FakeDriverConfig {
    #[builder(default)]
    services: ServiceFixture,
    /// Model number reported by the identity characteristic.
    #[builder(into)]
    identity: Option<String>,
    /// Pushed on the serial characteristic whenever its notifications are enabled.
    notifications: Option<NotificationPayloads>,
    #[builder(default = true)]
    adapter_available: bool,
    /// Answer every accepted request with a successful callback.
    #[builder(default = true)]
    auto_respond: bool,
    #[builder(default)]
    connect_latency: Duration,
    #[builder(default = GattStatus::SUCCESS)]
    write_status: GattStatus,
    #[builder(default = GattStatus::SUCCESS)]
    discovery_status: GattStatus,
    /// When false every request on a handle is refused.
    #[builder(default = true)]
    accept_requests: bool,
    /// When false the adapter refuses to open connections.
    #[builder(default = true)]
    accept_connections: bool,
}

/// A request the fake driver received, in arrival order.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DriverCall {
    OpenConnection { address: String },
    Reconnect,
    Disconnect,
    Close,
    DiscoverServices,
    Read { uuid: String },
    Write { uuid: String, value: Vec<u8> },
    SetNotification { uuid: String, enabled: bool },
}

/// In-memory driver used in tests and hardware-free runs.
#[derive(Debug, Clone)]
pub struct FakeGattDriver {
    shared: Arc<FakeShared>,
}

#[derive(Debug)]
struct FakeShared {
    config: FakeDriverConfig,
    calls: Mutex<Vec<DriverCall>>,
    sinks: Mutex<Vec<CallbackSink>>,
}

impl FakeShared {
    fn record(&self, call: DriverCall) {
        trace!(?call, "fake driver call");
        lock(&self.calls).push(call);
    }
}

impl FakeGattDriver {
    #[must_use]
    pub fn new(config: FakeDriverConfig) -> Self {
        Self {
            shared: Arc::new(FakeShared {
                config,
                calls: Mutex::new(Vec::new()),
                sinks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Every request received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<DriverCall> {
        lock(&self.shared.calls).clone()
    }

    /// Number of peripheral handles opened.
    #[must_use]
    pub fn open_count(&self) -> usize {
        lock(&self.shared.sinks).len()
    }

    /// Delivers `callback` as if the most recently opened handle raised it.
    ///
    /// Returns the handle used, or `None` when no handle was ever opened.
    pub fn emit(&self, callback: DriverCallback) -> Option<HandleId> {
        let sinks = lock(&self.shared.sinks);
        let sink = sinks.last()?;
        sink.emit(callback);
        Some(sink.handle())
    }

    /// Delivers `callback` through the sink of a specific handle, even a closed one.
    pub fn emit_from(&self, handle: HandleId, callback: DriverCallback) -> bool {
        let sinks = lock(&self.shared.sinks);
        match sinks.iter().find(|sink| sink.handle() == handle) {
            Some(sink) => {
                sink.emit(callback);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl GattDriver for FakeGattDriver {
    async fn adapter(&self) -> Result<Arc<dyn GattAdapter>, InteractionError> {
        if !self.shared.config.adapter_available {
            return Err(InteractionError::AdapterUnavailable);
        }
        Ok(Arc::new(FakeAdapter {
            shared: Arc::clone(&self.shared),
        }))
    }
}

#[derive(Debug)]
struct FakeAdapter {
    shared: Arc<FakeShared>,
}

impl GattAdapter for FakeAdapter {
    fn open_connection(
        &self,
        address: &str,
        sink: CallbackSink,
    ) -> Result<Box<dyn PeripheralHandle>, InteractionError> {
        self.shared.record(DriverCall::OpenConnection {
            address: address.to_string(),
        });
        if !self.shared.config.accept_connections {
            return Err(InteractionError::OperationRejected {
                operation: GattOperation::Connect,
                uuid: None,
            });
        }
        lock(&self.shared.sinks).push(sink.clone());
        debug!(address, handle = %sink.handle(), "fake peripheral opened");

        let handle = FakeHandle::new(Arc::clone(&self.shared), sink);
        if self.shared.config.auto_respond {
            handle.announce_link(LinkState::Connected);
        }
        Ok(Box::new(handle))
    }
}

#[derive(Debug)]
struct FakeHandle {
    shared: Arc<FakeShared>,
    sink: CallbackSink,
    catalog: Mutex<Vec<GattService>>,
    closed: AtomicBool,
}

impl FakeHandle {
    fn new(shared: Arc<FakeShared>, sink: CallbackSink) -> Self {
        let identity = shared
            .config
            .identity
            .clone()
            .unwrap_or_else(|| DEFAULT_IDENTITY.to_string());
        let identity_uuid = protocol::role_metadata(RoleId::Identity).uuid();
        let mut services = shared.config.services.services.clone();
        for characteristic in services
            .iter_mut()
            .flat_map(|service| service.characteristics_mut().iter_mut())
            .filter(|characteristic| characteristic.uuid() == identity_uuid)
        {
            characteristic.set_value(identity.clone().into_bytes());
        }

        Self {
            shared,
            sink,
            catalog: Mutex::new(services),
            closed: AtomicBool::new(false),
        }
    }

    fn accepts(&self) -> bool {
        self.shared.config.accept_requests && !self.closed.load(Ordering::SeqCst)
    }

    fn responds(&self) -> bool {
        self.shared.config.auto_respond
    }

    fn announce_link(&self, new_state: LinkState) {
        let callback = DriverCallback::ConnectionStateChange {
            status: GattStatus::SUCCESS,
            new_state,
        };
        let latency = self.shared.config.connect_latency;
        if latency.is_zero() {
            self.sink.emit(callback);
            return;
        }
        let sink = self.sink.clone();
        tokio::spawn(async move {
            sleep(latency).await;
            sink.emit(callback);
        });
    }

    fn with_characteristic<T>(
        &self,
        reference: &CharacteristicRef,
        apply: impl FnOnce(&mut GattCharacteristic) -> T,
    ) -> Option<T> {
        let mut catalog = lock(&self.catalog);
        catalog
            .iter_mut()
            .filter(|service| service.uuid() == reference.service_uuid())
            .flat_map(|service| service.characteristics_mut().iter_mut())
            .find(|characteristic| characteristic.uuid() == reference.uuid())
            .map(apply)
    }

    fn push_notifications(&self, reference: &CharacteristicRef) {
        let serial_uuid = protocol::role_metadata(RoleId::Serial).uuid();
        if reference.uuid() != serial_uuid {
            return;
        }
        let payloads = self.shared.config.notifications.clone().map_or_else(
            || DEFAULT_NOTIFICATIONS.map(<[u8]>::to_vec).to_vec(),
            Into::into,
        );
        for payload in payloads {
            let Some(characteristic) = self.with_characteristic(reference, |characteristic| {
                characteristic.set_value(payload);
                characteristic.clone()
            }) else {
                return;
            };
            self.sink
                .emit(DriverCallback::CharacteristicChanged { characteristic });
        }
    }
}

impl PeripheralHandle for FakeHandle {
    fn reconnect(&self) -> bool {
        self.shared.record(DriverCall::Reconnect);
        if !self.accepts() {
            return false;
        }
        if self.responds() {
            self.announce_link(LinkState::Connected);
        }
        true
    }

    fn disconnect(&self) {
        self.shared.record(DriverCall::Disconnect);
        if self.accepts() && self.responds() {
            self.sink.emit(DriverCallback::ConnectionStateChange {
                status: GattStatus::SUCCESS,
                new_state: LinkState::Disconnected,
            });
        }
    }

    fn close(&self) {
        self.shared.record(DriverCall::Close);
        self.closed.store(true, Ordering::SeqCst);
    }

    fn discover_services(&self) -> bool {
        self.shared.record(DriverCall::DiscoverServices);
        if !self.accepts() {
            return false;
        }
        if self.responds() {
            self.sink.emit(DriverCallback::ServicesDiscovered {
                status: self.shared.config.discovery_status,
            });
        }
        true
    }

    fn read_characteristic(&self, characteristic: &CharacteristicRef) -> bool {
        self.shared.record(DriverCall::Read {
            uuid: characteristic.uuid().to_string(),
        });
        if !self.accepts() {
            return false;
        }
        let Some(snapshot) = self.with_characteristic(characteristic, |found| found.clone()) else {
            return false;
        };
        if self.responds() {
            let status = if snapshot.supports_read() {
                GattStatus::SUCCESS
            } else {
                GattStatus::READ_NOT_PERMITTED
            };
            self.sink.emit(DriverCallback::CharacteristicRead {
                characteristic: snapshot,
                status,
            });
        }
        true
    }

    fn write_characteristic(&self, characteristic: &GattCharacteristic) -> bool {
        self.shared.record(DriverCall::Write {
            uuid: characteristic.uuid().to_string(),
            value: characteristic.value().to_vec(),
        });
        if !self.accepts() {
            return false;
        }
        let value = characteristic.value().to_vec();
        let Some(snapshot) = self.with_characteristic(&characteristic.reference(), |found| {
            found.set_value(value);
            found.clone()
        }) else {
            return false;
        };
        if self.responds() {
            self.sink.emit(DriverCallback::CharacteristicWrite {
                characteristic: snapshot,
                status: self.shared.config.write_status,
            });
        }
        true
    }

    fn set_notification(&self, characteristic: &CharacteristicRef, enabled: bool) -> bool {
        self.shared.record(DriverCall::SetNotification {
            uuid: characteristic.uuid().to_string(),
            enabled,
        });
        if !self.accepts() {
            return false;
        }
        if enabled && self.responds() {
            self.push_notifications(characteristic);
        }
        true
    }

    fn services(&self) -> Vec<GattService> {
        lock(&self.catalog).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn parse_service_fixture(raw_fixture: &str) -> Result<Vec<GattService>, FixtureError> {
    if raw_fixture.trim().is_empty() {
        return Err(FixtureError::EmptyFixture);
    }

    raw_fixture
        .split(';')
        .map(parse_service_record)
        .collect::<Result<Vec<_>, _>>()
}

fn parse_service_record(raw_record: &str) -> Result<GattService, FixtureError> {
    let Some((service_uuid, characteristics)) = raw_record.split_once('=') else {
        return Err(FixtureError::InvalidServiceRecord);
    };
    let service_uuid = service_uuid.trim();
    if service_uuid.is_empty() {
        return Err(FixtureError::InvalidServiceRecord);
    }

    let characteristics = characteristics
        .split(',')
        .filter(|record| !record.trim().is_empty())
        .map(|record| parse_characteristic_record(service_uuid, record))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(GattService::new(service_uuid, characteristics))
}

fn parse_characteristic_record(
    service_uuid: &str,
    raw_record: &str,
) -> Result<GattCharacteristic, FixtureError> {
    let Some((uuid, raw_properties)) = raw_record.split_once(':') else {
        return Err(FixtureError::InvalidCharacteristicRecord);
    };
    let uuid = uuid.trim();
    if uuid.is_empty() {
        return Err(FixtureError::InvalidCharacteristicRecord);
    }

    let mut properties = CharPropFlags::empty();
    for name in raw_properties.split('|').map(str::trim).filter(|name| !name.is_empty()) {
        let flag = CharPropFlags::from_name(&name.to_ascii_uppercase()).ok_or_else(|| {
            FixtureError::UnknownProperty {
                value: name.to_string(),
            }
        })?;
        properties |= flag;
    }

    let characteristic = GattCharacteristic::new(service_uuid, uuid, properties)
        .with_permissions(permissions_for(properties));
    Ok(
        if properties.contains(CharPropFlags::AUTHENTICATED_SIGNED_WRITES) {
            characteristic.with_write_kind(WriteKind::Signed)
        } else {
            characteristic
        },
    )
}

fn permissions_for(properties: CharPropFlags) -> AttributePermissions {
    let mut permissions = AttributePermissions::empty();
    if properties.contains(CharPropFlags::READ) {
        permissions = permissions | AttributePermissions::READ;
    }
    if properties.intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE) {
        permissions = permissions | AttributePermissions::WRITE;
    }
    if properties.contains(CharPropFlags::AUTHENTICATED_SIGNED_WRITES) {
        permissions = permissions | AttributePermissions::WRITE_SIGNED;
    }
    permissions
}

fn parse_notifications(raw_value: &str) -> Result<Vec<Vec<u8>>, FixtureError> {
    if raw_value.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw_value.split(',').map(parse_hex).collect()
}

fn parse_hex(raw_value: &str) -> Result<Vec<u8>, FixtureError> {
    let cleaned: String = raw_value.chars().filter(|c| !c.is_whitespace()).collect();
    if !cleaned.len().is_multiple_of(2) {
        return Err(FixtureError::InvalidHexLength);
    }
    cleaned
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let digits = String::from_utf8_lossy(pair);
            u8::from_str_radix(&digits, 16).map_err(|_| FixtureError::InvalidHexByte {
                value: digits.to_string(),
            })
        })
        .collect()
}
