use std::ops::ControlFlow;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::error::InteractionError;
use crate::events::{EventSubscription, GattEvent};
use crate::handlers::{
    AtCommand, HandshakeConfig, HandshakeHandler, HandshakeProgress, HandshakeStart,
    LINE_TERMINATOR,
};
use crate::hw::{
    CharacteristicPayload, CharacteristicRef, ConnectionManager, ConnectionState,
    DiscoveryStatus, GattStatus, RoleBindings, WriteKind,
};
use crate::protocol::RoleId;
use crate::utils::trim_line_ending;

/// Why a peripheral cannot be driven as a Bluno.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum IncompatibleReason {
    /// Discovery did not expose every required characteristic.
    MissingRoles { roles: Vec<RoleId> },
    /// The model number does not identify a Bluno.
    UnrecognisedIdentity { identity: String },
}

/// Consumer-facing outcome of one processed event.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum DeviceNotice {
    Connected,
    Disconnected,
    /// Every role is bound and the startup reads were requested.
    ServicesReady,
    /// Service discovery was refused or failed; no catalog is available.
    DiscoveryFailed { outcome: DiscoveryStatus },
    Incompatible(IncompatibleReason),
    /// Value of a characteristic outside the serial and command channels.
    CharacteristicData(CharacteristicPayload),
    /// Text received on the command channel.
    CommandText { text: String },
    /// Text received on the serial channel.
    SerialText { text: String },
    HandshakeStarted { commands: Vec<String> },
    HandshakeComplete,
    HandshakeFailed { command: String, status: GattStatus },
    WriteSucceeded { uuid: String },
    WriteFailed { uuid: String, status: GattStatus },
}

/// Why [`DeviceController::run`] returned.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RunStop {
    /// The notice callback asked to stop.
    Stopped,
    /// The manager went away.
    StreamClosed,
}

/// Drives a connected Bluno: role binding, startup reads, handshake and notification target.
#[derive(Debug)]
pub struct DeviceController {
    manager: ConnectionManager,
    handshake: HandshakeHandler,
    bindings: RoleBindings,
    notification_target: Option<CharacteristicRef>,
}

impl DeviceController {
    #[must_use]
    pub fn new(manager: ConnectionManager, config: HandshakeConfig) -> Self {
        Self {
            manager,
            handshake: HandshakeHandler::new(config),
            bindings: RoleBindings::default(),
            notification_target: None,
        }
    }

    #[must_use]
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    #[must_use]
    pub fn bindings(&self) -> &RoleBindings {
        &self.bindings
    }

    #[must_use]
    pub fn notification_target(&self) -> Option<&CharacteristicRef> {
        self.notification_target.as_ref()
    }

    #[must_use]
    pub fn handshake_complete(&self) -> bool {
        self.handshake.is_complete()
    }

    /// Applies one event and returns the notices it produced, in order.
    #[instrument(skip(self, event), level = "debug", fields(event = event.name()))]
    pub fn handle_event(&mut self, event: &GattEvent) -> Vec<DeviceNotice> {
        match event {
            GattEvent::Connected => vec![DeviceNotice::Connected],
            GattEvent::Disconnected => {
                self.bindings = RoleBindings::default();
                self.handshake.reset();
                self.notification_target = None;
                vec![DeviceNotice::Disconnected]
            }
            GattEvent::ServicesDiscovered(DiscoveryStatus::Complete) => {
                self.on_services_discovered()
            }
            GattEvent::ServicesDiscovered(outcome) => self.on_discovery_failed(*outcome),
            GattEvent::DataAvailable(payload) => self.on_data(payload),
            GattEvent::WriteComplete(payload, status) => self.on_write_complete(payload, *status),
        }
    }

    /// Feeds events into [`DeviceController::handle_event`] until `on_notice` breaks or the
    /// stream ends.
    pub async fn run<F>(&mut self, events: &mut EventSubscription, mut on_notice: F) -> RunStop
    where
        F: FnMut(&DeviceNotice) -> ControlFlow<()>,
    {
        while let Some(event) = events.recv().await {
            for notice in self.handle_event(&event) {
                if on_notice(&notice).is_break() {
                    return RunStop::Stopped;
                }
            }
        }
        RunStop::StreamClosed
    }

    /// Writes `text` plus CR/LF to the serial characteristic.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected`, `IncompatibleDevice` or a manager error.
    pub fn serial_send(&self, text: &str) -> Result<(), InteractionError> {
        self.send_line(RoleId::Serial, text)
    }

    /// Writes `text` plus CR/LF to the command characteristic.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected`, `IncompatibleDevice` or a manager error.
    pub fn command_send(&self, text: &str) -> Result<(), InteractionError> {
        self.send_line(RoleId::Command, text)
    }

    /// Makes `reference` the tracked notification target.
    ///
    /// Notifications on the previous target are disabled first. The new characteristic is read
    /// when readable and subscribed when it can notify.
    ///
    /// # Errors
    ///
    /// Returns `UnknownCharacteristic` when the reference is not catalogued, or a manager error.
    #[instrument(skip(self), level = "debug", fields(target = %reference))]
    pub fn select_characteristic(
        &mut self,
        reference: &CharacteristicRef,
    ) -> Result<(), InteractionError> {
        let Some(characteristic) = self.manager.characteristic(reference) else {
            return Err(InteractionError::UnknownCharacteristic {
                uuid: reference.uuid().to_string(),
            });
        };

        if let Some(previous) = &self.notification_target
            && previous != reference
        {
            debug!(previous = %previous, "disabling previous notification target");
            self.manager.set_notification(previous, false)?;
        }
        self.notification_target = None;
        if characteristic.supports_read() {
            self.manager.read_characteristic(reference)?;
        }
        if characteristic.supports_notify() {
            self.manager.set_notification(reference, true)?;
            self.notification_target = Some(reference.clone());
        }
        Ok(())
    }

    fn send_line(&self, role: RoleId, text: &str) -> Result<(), InteractionError> {
        if self.manager.connection_state() != ConnectionState::Connected {
            return Err(InteractionError::NotConnected);
        }
        self.bindings.ensure_compatible()?;
        let Some(characteristic) = self.bindings.get(role) else {
            return Err(InteractionError::IncompatibleDevice {
                missing: vec![role],
            });
        };
        let line = format!("{text}{LINE_TERMINATOR}");
        info!(%role, line = trim_line_ending(&line), "sending line");
        self.manager.write_characteristic(
            &characteristic.reference(),
            line.as_bytes(),
            WriteKind::WithResponse,
        )
    }

    fn on_services_discovered(&mut self) -> Vec<DeviceNotice> {
        self.handshake.reset();
        self.notification_target = None;
        let services = self.manager.supported_services().unwrap_or_default();
        self.bindings = RoleBindings::resolve(&services);

        if !self.bindings.is_compatible() {
            let roles = self.bindings.missing_roles();
            warn!(?roles, "discovered services lack Bluno characteristics");
            return vec![DeviceNotice::Incompatible(IncompatibleReason::MissingRoles {
                roles,
            })];
        }

        self.request_startup_reads();
        vec![DeviceNotice::ServicesReady]
    }

    fn on_discovery_failed(&mut self, outcome: DiscoveryStatus) -> Vec<DeviceNotice> {
        self.handshake.reset();
        self.notification_target = None;
        self.bindings = RoleBindings::default();
        warn!(%outcome, "service discovery did not complete");
        vec![DeviceNotice::DiscoveryFailed { outcome }]
    }

    /// Subscribes to every role and reads the identity and serial values.
    fn request_startup_reads(&self) {
        let reference = |role| self.bindings.get(role).map(|characteristic| characteristic.reference());
        let (Some(identity), Some(serial), Some(command)) = (
            reference(RoleId::Identity),
            reference(RoleId::Serial),
            reference(RoleId::Command),
        ) else {
            return;
        };

        let requests = [
            self.manager.set_notification(&identity, true),
            self.manager.read_characteristic(&identity),
            self.manager.set_notification(&command, true),
            self.manager.set_notification(&serial, true),
            self.manager.read_characteristic(&serial),
        ];
        for error in requests.into_iter().filter_map(Result::err) {
            warn!(%error, "startup request was not dispatched");
        }
    }

    fn on_data(&mut self, payload: &CharacteristicPayload) -> Vec<DeviceNotice> {
        match self.bindings.role_of(payload.uuid()) {
            Some(RoleId::Identity) => {
                let mut notices = vec![DeviceNotice::CharacteristicData(payload.clone())];
                notices.extend(self.on_identity(payload));
                notices
            }
            Some(RoleId::Command) => vec![DeviceNotice::CommandText {
                text: payload.text(),
            }],
            Some(RoleId::Serial) => vec![DeviceNotice::SerialText {
                text: payload.text(),
            }],
            None => {
                debug!(uuid = payload.uuid(), "data from an untracked characteristic");
                vec![DeviceNotice::CharacteristicData(payload.clone())]
            }
        }
    }

    fn on_identity(&mut self, payload: &CharacteristicPayload) -> Vec<DeviceNotice> {
        if !self.bindings.is_compatible() {
            return Vec::new();
        }
        match self.handshake.on_identity(payload.value()) {
            HandshakeStart::Send(commands) => {
                let mut notices = vec![DeviceNotice::HandshakeStarted {
                    commands: commands.iter().map(ToString::to_string).collect(),
                }];
                for command in &commands {
                    if let Some(failure) = self.dispatch_handshake_command(command) {
                        notices.push(failure);
                        break;
                    }
                }
                notices
            }
            HandshakeStart::IdentityMismatch => {
                vec![DeviceNotice::Incompatible(
                    IncompatibleReason::UnrecognisedIdentity {
                        identity: payload.text(),
                    },
                )]
            }
            HandshakeStart::AlreadyTriggered => Vec::new(),
        }
    }

    fn on_write_complete(
        &mut self,
        payload: &CharacteristicPayload,
        status: GattStatus,
    ) -> Vec<DeviceNotice> {
        let uuid = payload.uuid().to_string();
        let mut notices = vec![if status.is_success() {
            DeviceNotice::WriteSucceeded { uuid }
        } else {
            DeviceNotice::WriteFailed { uuid, status }
        }];

        if self.bindings.role_of(payload.uuid()) != Some(RoleId::Command) {
            return notices;
        }
        match self.handshake.on_write_complete(payload.value(), status) {
            HandshakeProgress::Send(next) => {
                notices.extend(self.dispatch_handshake_command(&next));
            }
            HandshakeProgress::Complete => notices.push(DeviceNotice::HandshakeComplete),
            HandshakeProgress::Failed { command, status } => {
                notices.push(DeviceNotice::HandshakeFailed {
                    command: command.to_string(),
                    status,
                });
            }
            HandshakeProgress::Pending | HandshakeProgress::Unrelated => {}
        }
        notices
    }

    /// Writes one handshake command, returning a failure notice if it was not dispatched.
    fn dispatch_handshake_command(&mut self, command: &AtCommand) -> Option<DeviceNotice> {
        let reference = self.bindings.get(RoleId::Command)?.reference();
        match self
            .manager
            .write_characteristic(&reference, &command.encode(), WriteKind::WithResponse)
        {
            Ok(()) => None,
            Err(error) => {
                warn!(%error, %command, "handshake command was not dispatched");
                self.handshake.abort();
                Some(DeviceNotice::HandshakeFailed {
                    command: command.to_string(),
                    status: GattStatus::FAILURE,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::hw::{
        DriverCall, DriverCallback, FakeDriverConfig, FakeGattDriver, GattOperation,
        ServiceFixture, TaggedCallback,
    };
    use crate::protocol::{self, role_metadata};

    async fn connected_controller(config: FakeDriverConfig) -> (DeviceController, FakeGattDriver) {
        let driver = FakeGattDriver::new(config);
        let manager = ConnectionManager::new(Arc::new(driver.clone()));
        manager.initialize().await.expect("fake adapter should be available");
        manager.connect("AA:BB").expect("connect should be dispatched");
        (DeviceController::new(manager, HandshakeConfig::default()), driver)
    }

    #[tokio::test]
    async fn send_requires_a_connected_link() {
        let (controller, _driver) =
            connected_controller(FakeDriverConfig::builder().auto_respond(false).build()).await;

        assert_matches!(
            controller.serial_send("hello"),
            Err(InteractionError::NotConnected)
        );
    }

    #[tokio::test]
    async fn disconnect_clears_bindings_and_target() {
        let (mut controller, _driver) =
            connected_controller(FakeDriverConfig::builder().auto_respond(false).build()).await;
        let services: Vec<crate::hw::GattService> = ServiceFixture::bluno().into();
        controller.bindings = RoleBindings::resolve(&services);
        assert!(controller.bindings().is_compatible());
        controller.notification_target = Some(CharacteristicRef::new(
            protocol::BLUNO_SERVICE_UUID,
            role_metadata(RoleId::Serial).uuid(),
        ));

        let notices = controller.handle_event(&GattEvent::Disconnected);

        assert_eq!(vec![DeviceNotice::Disconnected], notices);
        assert_eq!(None, controller.notification_target());
        assert!(!controller.bindings().is_compatible());
    }

    #[tokio::test]
    async fn untracked_data_is_reported_raw() {
        let (mut controller, _driver) =
            connected_controller(FakeDriverConfig::builder().auto_respond(false).build()).await;
        let characteristic = crate::hw::GattCharacteristic::new(
            "00001800-0000-1000-8000-00805f9b34fb",
            "00002a00-0000-1000-8000-00805f9b34fb",
            btleplug::api::CharPropFlags::READ,
        )
        .with_value(b"Bluno".to_vec());
        let payload = CharacteristicPayload::from_characteristic(&characteristic);

        let notices = controller.handle_event(&GattEvent::DataAvailable(payload.clone()));

        assert_eq!(vec![DeviceNotice::CharacteristicData(payload)], notices);
    }

    #[tokio::test]
    async fn failed_discovery_clears_bindings_and_reports_the_outcome() {
        let (mut controller, _driver) =
            connected_controller(FakeDriverConfig::builder().auto_respond(false).build()).await;
        let services: Vec<crate::hw::GattService> = ServiceFixture::bluno().into();
        controller.bindings = RoleBindings::resolve(&services);
        let outcome = DiscoveryStatus::Failed(GattStatus::FAILURE);

        let notices = controller.handle_event(&GattEvent::ServicesDiscovered(outcome));

        assert_eq!(vec![DeviceNotice::DiscoveryFailed { outcome }], notices);
        assert!(!controller.bindings().is_compatible());
    }

    #[tokio::test]
    async fn refused_disable_keeps_the_previous_target() {
        let (mut controller, driver) = connected_controller(
            FakeDriverConfig::builder()
                .auto_respond(false)
                .accept_requests(false)
                .build(),
        )
        .await;
        let handle = controller
            .manager()
            .live_handle()
            .expect("handle should be open");
        controller.manager().handle_callback(TaggedCallback {
            handle,
            callback: DriverCallback::ServicesDiscovered {
                status: GattStatus::SUCCESS,
            },
        });
        let serial = CharacteristicRef::new(
            protocol::BLUNO_SERVICE_UUID,
            role_metadata(RoleId::Serial).uuid(),
        );
        let command = CharacteristicRef::new(
            protocol::BLUNO_SERVICE_UUID,
            role_metadata(RoleId::Command).uuid(),
        );
        controller.notification_target = Some(serial.clone());

        assert_matches!(
            controller.select_characteristic(&command),
            Err(InteractionError::OperationRejected {
                operation: GattOperation::SetNotification,
                ..
            })
        );
        assert_eq!(Some(&serial), controller.notification_target());
        assert!(
            !driver
                .calls()
                .iter()
                .any(|call| matches!(call, DriverCall::Read { .. }))
        );
    }

    #[tokio::test]
    async fn selecting_an_unknown_characteristic_fails() {
        let (mut controller, driver) =
            connected_controller(FakeDriverConfig::builder().auto_respond(false).build()).await;
        let reference = CharacteristicRef::new("svc", "chr");

        assert_matches!(
            controller.select_characteristic(&reference),
            Err(InteractionError::UnknownCharacteristic { uuid }) if uuid == "chr"
        );
        assert!(
            !driver
                .calls()
                .iter()
                .any(|call| matches!(call, DriverCall::SetNotification { .. }))
        );
    }
}
