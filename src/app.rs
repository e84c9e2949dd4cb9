use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use owo_colors::OwoColorize;
use tracing::{Span, debug, instrument};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cli::{Command, FakeArgs, LogLevel, OutputFormat, SessionOptions};
use crate::controller::{DeviceController, DeviceNotice, IncompatibleReason};
use crate::error::{InteractionError, ProtocolError};
use crate::events::EventSubscription;
use crate::hw::{
    ConnectionManager, DriverBackend, GattDriver, GattOperation, GattService, RoleBindings,
    driver_from_backend,
};
use crate::protocol::{RoleId, role_metadata};
use crate::telemetry;
use crate::terminal::{SystemTerminalClient, TerminalClient};

/// Creates the BLE driver for a run: the fake driver when fixture settings are given, the host
/// Bluetooth stack otherwise.
///
/// ```
/// # async fn demo() -> anyhow::Result<()> {
/// let fake = bluno::FakeArgs::builder().identity("DF Bluno").build();
/// let driver = bluno::driver_for(Some(fake)).await?;
/// let _ = driver;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error when the platform BLE manager cannot be created.
pub async fn driver_for(fake_args: Option<FakeArgs>) -> Result<Arc<dyn GattDriver>> {
    let backend = match fake_args {
        Some(fake_args) => DriverBackend::Fake(fake_args.into_driver_config()),
        None => DriverBackend::Real,
    };
    Ok(driver_from_backend(backend).await?)
}

/// Session-level helper for bringing one Bluno peripheral up.
pub struct SessionHandler {
    driver: Arc<dyn GattDriver>,
    options: SessionOptions,
}

impl SessionHandler {
    #[must_use]
    pub fn new(driver: Arc<dyn GattDriver>, options: SessionOptions) -> Self {
        Self { driver, options }
    }

    /// Connects and waits until service discovery has been evaluated.
    ///
    /// A peripheral lacking Bluno characteristics still yields a session so its catalog can be
    /// inspected; use [`ConnectedSession::ensure_compatible`] before talking to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter is unavailable, the link drops, discovery is refused or
    /// fails, or discovery does not finish within the connect timeout.
    #[instrument(skip(self), level = "info", fields(address = %self.options.address()))]
    pub async fn connect(self) -> Result<ConnectedSession, InteractionError> {
        let span = Span::current();
        span.pb_set_message(&format!("Connecting to {}", self.options.address()));
        span.pb_set_finish_message(&format!("{} Connected", "✓".green()));

        match self.establish().await {
            Ok(session) => Ok(session),
            Err(error) => {
                span.pb_set_finish_message(&format!("{} Connection failed", "✗".red()));
                Err(error)
            }
        }
    }

    async fn establish(self) -> Result<ConnectedSession, InteractionError> {
        let Self { driver, options } = self;
        let manager = ConnectionManager::new(driver);
        manager.initialize().await?;
        let events = manager.subscribe();
        manager.connect(options.address())?;

        let mut session = ConnectedSession {
            controller: DeviceController::new(manager, options.handshake().clone()),
            events,
            notices: Vec::new(),
            checked: 0,
            timeout: options.connect_timeout(),
        };
        if let Err(error) = session.wait_until_discovered().await {
            session.close();
            return Err(error);
        }
        Ok(session)
    }
}

/// A connected peripheral plus the notices its controller has produced so far.
#[derive(Debug)]
pub struct ConnectedSession {
    controller: DeviceController,
    events: EventSubscription,
    notices: Vec<DeviceNotice>,
    checked: usize,
    timeout: Duration,
}

impl ConnectedSession {
    #[must_use]
    pub fn controller(&self) -> &DeviceController {
        &self.controller
    }

    #[must_use]
    pub fn address(&self) -> Option<String> {
        self.controller.manager().address()
    }

    #[must_use]
    pub fn services(&self) -> Vec<GattService> {
        self.controller
            .manager()
            .supported_services()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn bindings(&self) -> &RoleBindings {
        self.controller.bindings()
    }

    /// Fails when discovery did not expose every Bluno characteristic.
    ///
    /// # Errors
    ///
    /// Returns `IncompatibleDevice` listing the missing roles.
    pub fn ensure_compatible(&self) -> Result<(), InteractionError> {
        self.controller.bindings().ensure_compatible()
    }

    /// Waits for the identity check and every handshake command to be acknowledged.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeAborted` when a command fails, `UnrecognisedIdentity` when the model
    /// number is not a Bluno, or a timeout.
    #[instrument(skip(self), level = "info")]
    pub async fn wait_for_handshake(&mut self) -> Result<(), ProtocolError> {
        if self.controller.handshake_complete() {
            return Ok(());
        }
        Span::current().pb_set_message("Configuring the Bluno serial bridge");
        self.wait_for("the Bluno handshake", |notice| match notice {
            DeviceNotice::HandshakeComplete => Some(Ok(())),
            DeviceNotice::HandshakeFailed { command, status } => {
                Some(Err(ProtocolError::HandshakeAborted {
                    command: command.clone(),
                    status: *status,
                }))
            }
            DeviceNotice::Incompatible(IncompatibleReason::UnrecognisedIdentity { identity }) => {
                Some(Err(InteractionError::UnrecognisedIdentity {
                    identity: identity.clone(),
                }
                .into()))
            }
            DeviceNotice::Disconnected => Some(Err(InteractionError::NotConnected.into())),
            _ => None,
        })
        .await
    }

    /// Writes one line to the serial port and waits for its acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns an error if the write is refused, fails, or is not acknowledged in time.
    pub async fn send_serial(&mut self, text: &str) -> Result<(), InteractionError> {
        self.controller.serial_send(text)?;
        self.wait_for_write(RoleId::Serial).await
    }

    /// Writes one line to the AT command channel and waits for its acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns an error if the write is refused, fails, or is not acknowledged in time.
    pub async fn send_command(&mut self, text: &str) -> Result<(), InteractionError> {
        self.controller.command_send(text)?;
        self.wait_for_write(RoleId::Command).await
    }

    /// Takes every notice produced so far.
    pub fn drain_notices(&mut self) -> Vec<DeviceNotice> {
        self.checked = 0;
        std::mem::take(&mut self.notices)
    }

    /// Returns the next notice, or `None` once the event stream closes.
    pub async fn next_notice(&mut self) -> Option<DeviceNotice> {
        while self.notices.is_empty() {
            let event = self.events.recv().await?;
            self.notices = self.controller.handle_event(&event);
        }
        self.checked = 0;
        Some(self.notices.remove(0))
    }

    /// Requests a disconnect and releases the peripheral handle.
    pub fn close(&self) {
        debug!("closing session");
        self.controller.manager().disconnect();
        self.controller.manager().close();
    }

    async fn wait_until_discovered(&mut self) -> Result<(), InteractionError> {
        self.wait_for("service discovery", |notice| match notice {
            DeviceNotice::ServicesReady
            | DeviceNotice::Incompatible(IncompatibleReason::MissingRoles { .. }) => Some(Ok(())),
            DeviceNotice::DiscoveryFailed { outcome } => Some(outcome.into_result()),
            DeviceNotice::Disconnected => Some(Err(InteractionError::NotConnected)),
            _ => None,
        })
        .await
    }

    async fn wait_for_write(&mut self, role: RoleId) -> Result<(), InteractionError> {
        let uuid = self
            .controller
            .bindings()
            .get(role)
            .map(|characteristic| characteristic.uuid().to_string())
            .unwrap_or_else(|| role_metadata(role).uuid().to_string());
        self.wait_for("the write acknowledgement", |notice| match notice {
            DeviceNotice::WriteSucceeded { uuid: written } if *written == uuid => Some(Ok(())),
            DeviceNotice::WriteFailed {
                uuid: written,
                status,
            } if *written == uuid => Some(Err(InteractionError::AsyncOperationFailed {
                operation: GattOperation::Write,
                status: *status,
            })),
            DeviceNotice::Disconnected => Some(Err(InteractionError::NotConnected)),
            _ => None,
        })
        .await
    }

    /// Processes events until `verdict` settles on an unchecked notice.
    ///
    /// Every notice stays queued for [`ConnectedSession::drain_notices`].
    async fn wait_for<T, E, F>(&mut self, waiting_for: &'static str, mut verdict: F) -> Result<T, E>
    where
        E: From<InteractionError>,
        F: FnMut(&DeviceNotice) -> Option<Result<T, E>>,
    {
        let timeout = self.timeout;
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                while self.checked < self.notices.len() {
                    let settled = verdict(&self.notices[self.checked]);
                    self.checked += 1;
                    if let Some(settled) = settled {
                        return settled;
                    }
                }
                let Some(event) = self.events.recv().await else {
                    return Err(InteractionError::EventStreamClosed { waiting_for }.into());
                };
                self.notices.extend(self.controller.handle_event(&event));
            }
        })
        .await;

        outcome.unwrap_or_else(|_elapsed| Err(InteractionError::Timeout { waiting_for }.into()))
    }
}

/// Runs the CLI command against the host Bluetooth stack or an injected driver.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// let args = bluno::Args::try_parse_from(["bluno", "--fake", "inspect"])?;
/// let (command, options, fake_args) = args.into_parts()?;
/// let driver = bluno::driver_for(fake_args).await?;
/// let mut out = Vec::new();
/// bluno::run(command, options, &mut out, driver, bluno::OutputFormat::Json).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, BLE interaction fails, or output writing
/// fails.
pub async fn run<W>(
    command: Command,
    options: SessionOptions,
    out: &mut W,
    driver: Arc<dyn GattDriver>,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    run_with_log_level(command, options, out, driver, output_format, None).await
}

/// Runs the CLI command with an explicit telemetry log-level override.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, BLE interaction fails, or output writing
/// fails.
pub async fn run_with_log_level<W>(
    command: Command,
    options: SessionOptions,
    out: &mut W,
    driver: Arc<dyn GattDriver>,
    output_format: OutputFormat,
    log_level: Option<LogLevel>,
) -> Result<()>
where
    W: io::Write,
{
    run_with_clients(
        command,
        options,
        out,
        &SystemTerminalClient,
        driver,
        output_format,
        log_level,
    )
    .await
}

/// Runs the CLI command with injected clients and explicit telemetry settings.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// struct FakeTerminal;
/// impl bluno::TerminalClient for FakeTerminal {
///     fn stdout_is_terminal(&self) -> bool { false }
///     fn stderr_is_terminal(&self) -> bool { false }
/// }
///
/// let args = bluno::Args::try_parse_from(["bluno", "--fake", "send", "hello"])?;
/// let log_level = args.log_level();
/// let (command, options, fake_args) = args.into_parts()?;
/// let driver = bluno::driver_for(fake_args).await?;
/// let mut out = Vec::new();
/// bluno::run_with_clients(
///     command,
///     options,
///     &mut out,
///     &FakeTerminal,
///     driver,
///     bluno::OutputFormat::Pretty,
///     log_level,
/// ).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, BLE interaction fails, or output writing
/// fails.
#[instrument(
    skip(options, out, terminal_client, driver),
    level = "info",
    fields(command = command.name(), address = options.address(), ?log_level)
)]
pub async fn run_with_clients<W>(
    command: Command,
    options: SessionOptions,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    driver: Arc<dyn GattDriver>,
    output_format: OutputFormat,
    log_level: Option<LogLevel>,
) -> Result<()>
where
    W: io::Write,
{
    telemetry::initialise_tracing(
        "bluno",
        terminal_client.stderr_is_terminal(),
        log_level.map(LogLevel::as_level_filter),
    )?;

    let handler = SessionHandler::new(driver, options);
    match command {
        Command::Inspect => {
            crate::cli::inspect::run(handler, out, terminal_client, output_format).await
        }
        Command::Listen(args) => {
            crate::cli::listen::run(handler, &args, out, terminal_client, output_format).await
        }
        Command::Send(args) => {
            crate::cli::send::run_serial(handler, &args, out, terminal_client, output_format).await
        }
        Command::Command(args) => {
            crate::cli::send::run_command(handler, &args, out, terminal_client, output_format)
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::handlers::HandshakeConfig;
    use crate::hw::{FakeDriverConfig, GattStatus, ServiceFixture, fake_driver};

    fn options(timeout: Duration) -> SessionOptions {
        SessionOptions::builder()
            .address("AA:BB:CC:DD:EE:FF")
            .handshake(HandshakeConfig::default())
            .connect_timeout(timeout)
            .build()
    }

    async fn connect(config: FakeDriverConfig) -> Result<ConnectedSession, InteractionError> {
        SessionHandler::new(fake_driver(config), options(Duration::from_secs(5)))
            .connect()
            .await
    }

    #[tokio::test]
    async fn connect_waits_for_discovery() {
        let session = connect(FakeDriverConfig::builder().build())
            .await
            .expect("fake Bluno should connect");

        assert!(session.bindings().is_compatible());
        assert_eq!(Some("AA:BB:CC:DD:EE:FF".to_string()), session.address());
        assert_eq!(2, session.services().len());
    }

    #[tokio::test]
    async fn handshake_completes_against_the_fake_bluno() {
        let mut session = connect(FakeDriverConfig::builder().build())
            .await
            .expect("fake Bluno should connect");

        session
            .wait_for_handshake()
            .await
            .expect("handshake should complete");

        let notices = session.drain_notices();
        assert!(notices.contains(&DeviceNotice::HandshakeComplete));
        assert!(session.controller().handshake_complete());
    }

    #[tokio::test]
    async fn handshake_reports_a_foreign_identity() {
        let mut session = connect(FakeDriverConfig::builder().identity("Arduino Uno").build())
            .await
            .expect("discovery should still succeed");

        let error = session
            .wait_for_handshake()
            .await
            .expect_err("a non-Bluno identity should stop the handshake");
        assert_matches!(
            error,
            ProtocolError::Interaction(inner)
                if matches!(*inner, InteractionError::UnrecognisedIdentity { ref identity } if identity == "Arduino Uno")
        );
    }

    #[tokio::test]
    async fn failed_handshake_write_aborts() {
        let mut session = connect(
            FakeDriverConfig::builder()
                .write_status(GattStatus::WRITE_NOT_PERMITTED)
                .build(),
        )
        .await
        .expect("discovery should succeed");

        let error = session
            .wait_for_handshake()
            .await
            .expect_err("failed write should abort the handshake");
        assert_matches!(
            error,
            ProtocolError::HandshakeAborted { command, status }
                if command == "AT+CURRUART=115200" && status == GattStatus::WRITE_NOT_PERMITTED
        );
    }

    #[tokio::test]
    async fn refused_discovery_fails_without_waiting_for_the_timeout() {
        let error = connect(FakeDriverConfig::builder().accept_requests(false).build())
            .await
            .expect_err("refused discovery should fail the connect");

        assert_matches!(
            error,
            InteractionError::OperationRejected {
                operation: GattOperation::DiscoverServices,
                uuid: None,
            }
        );
    }

    #[tokio::test]
    async fn failed_discovery_reports_its_status() {
        let error = connect(
            FakeDriverConfig::builder()
                .discovery_status(GattStatus::FAILURE)
                .build(),
        )
        .await
        .expect_err("failed discovery should fail the connect");

        assert_matches!(
            error,
            InteractionError::AsyncOperationFailed {
                operation: GattOperation::DiscoverServices,
                status: GattStatus::FAILURE,
            }
        );
    }

    #[tokio::test]
    async fn missing_roles_still_connect_but_are_incompatible() {
        let services: ServiceFixture = "0000180a-0000-1000-8000-00805f9b34fb=00002a24-0000-1000-8000-00805f9b34fb:read"
            .parse()
            .expect("fixture should parse");
        let session = connect(FakeDriverConfig::builder().services(services).build())
            .await
            .expect("discovery should succeed");

        assert_matches!(
            session.ensure_compatible(),
            Err(InteractionError::IncompatibleDevice { missing })
                if missing == vec![RoleId::Serial, RoleId::Command]
        );
    }

    #[tokio::test]
    async fn silent_peripheral_times_out() {
        let result = SessionHandler::new(
            fake_driver(FakeDriverConfig::builder().auto_respond(false).build()),
            options(Duration::from_millis(50)),
        )
        .connect()
        .await;

        assert_matches!(
            result,
            Err(InteractionError::Timeout { waiting_for }) if waiting_for == "service discovery"
        );
    }

    #[tokio::test]
    async fn serial_send_waits_for_the_acknowledgement() {
        let mut session = connect(FakeDriverConfig::builder().build())
            .await
            .expect("fake Bluno should connect");
        session
            .wait_for_handshake()
            .await
            .expect("handshake should complete");
        session.drain_notices();

        session
            .send_serial("ping")
            .await
            .expect("serial write should be acknowledged");

        let serial_uuid = role_metadata(RoleId::Serial).uuid().to_string();
        assert!(
            session
                .drain_notices()
                .contains(&DeviceNotice::WriteSucceeded { uuid: serial_uuid })
        );
    }
}
