mod btleplug_backend;
mod capabilities;
mod connection;
mod driver;
mod fake_backend;
mod hardware;
mod model;

pub use self::capabilities::RoleBindings;
pub use self::connection::ConnectionManager;
pub use self::driver::{
    CallbackSink, DiscoveryStatus, DriverCallback, GattAdapter, GattDriver, GattOperation, GattStatus, HandleId,
    LinkState, PeripheralHandle, TaggedCallback,
};
pub use self::fake_backend::{
    DriverCall, FakeDriverConfig, FakeGattDriver, NotificationPayloads, ServiceFixture,
};
pub(crate) use self::hardware::{DriverBackend, driver_from_backend};
pub use self::hardware::{fake_driver, real_driver};
pub use self::model::{
    AttributePermissions, CharacteristicPayload, CharacteristicRef, ConnectionState,
    GattCharacteristic, GattService, WriteKind, format_permissions,
};
