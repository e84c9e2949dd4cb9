mod app;
mod cli;
mod controller;
mod error;
mod events;
mod handlers;
mod hw;
mod protocol;
mod telemetry;
mod terminal;
mod utils;

pub use app::{
    ConnectedSession, SessionHandler, driver_for, run, run_with_clients, run_with_log_level,
};
pub use cli::{
    Args, Command, FakeArgs, ListenArgs, LogLevel, OutputFormat, SendArgs, SessionOptions,
};
pub use controller::{DeviceController, DeviceNotice, IncompatibleReason, RunStop};
pub use error::{FixtureError, InteractionError, ProtocolError};
pub use events::{EventDispatcher, EventSubscription, GattEvent};
pub use handlers::{
    AtCommand, DebugRoute, HandshakeConfig, HandshakeHandler, HandshakeMode, HandshakeProgress,
    HandshakeStart, LINE_TERMINATOR,
};
pub use hw::{
    AttributePermissions, CallbackSink, CharacteristicPayload, CharacteristicRef,
    ConnectionManager, ConnectionState, DiscoveryStatus, DriverCall, DriverCallback, FakeDriverConfig,
    FakeGattDriver, GattAdapter, GattCharacteristic, GattDriver, GattOperation, GattService,
    GattStatus, HandleId, LinkState, NotificationPayloads, PeripheralHandle, RoleBindings,
    ServiceFixture, TaggedCallback, WriteKind, fake_driver, format_permissions, real_driver,
};
pub use protocol::{DEFAULT_BAUD_RATE, RoleId, lookup};
pub use terminal::TerminalClient;
