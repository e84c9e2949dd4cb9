use std::time::Duration;

use bon::Builder;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::level_filters::LevelFilter;

use crate::cli::listen::ListenArgs;
use crate::cli::send::SendArgs;
use crate::error::{CliConfigError, FixtureError};
use crate::handlers::{DebugRoute, HandshakeConfig, HandshakeMode};
use crate::hw::{FakeDriverConfig, NotificationPayloads, ServiceFixture};
use crate::protocol::DEFAULT_BAUD_RATE;

/// Address reported by the fake driver when `--address` is omitted.
pub(crate) const FAKE_DEVICE_ADDRESS: &str = "FA:KE:00:00:00:01";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Command-line options for the Bluno BLE tool.
#[derive(Debug, Parser)]
#[command(name = "bluno", about = "Talk to DFRobot Bluno boards over BLE.")]
pub struct Args {
    /// Peripheral address (MAC on Linux and Windows, platform UUID on macOS).
    #[arg(long, global = true)]
    address: Option<String>,
    /// Log verbosity; overrides `RUST_LOG`.
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
    /// Output format; defaults to `pretty` on a terminal and `json` otherwise.
    #[arg(long, global = true, value_enum)]
    output: Option<OutputFormat>,
    /// UART baud rate configured during the handshake.
    #[arg(long, global = true, default_value_t = DEFAULT_BAUD_RATE)]
    baud_rate: u32,
    /// Handshake pacing.
    #[arg(long, global = true, value_enum, default_value_t = HandshakeArg::Serialized)]
    handshake: HandshakeArg,
    /// Where the firmware routes serial debug output.
    #[arg(long, global = true, value_enum, default_value_t = DebugRouteArg::Usb)]
    debug_route: DebugRouteArg,
    /// Sends `AT+PASSWORD=<value>` before the other handshake commands.
    #[arg(long, global = true)]
    password: Option<String>,
    /// How long to wait for the peripheral to become ready (e.g. `10s`, `1m`).
    #[arg(long, global = true, value_parser = parse_duration)]
    connect_timeout: Option<Duration>,
    /// Uses the in-memory BLE driver instead of the host Bluetooth stack.
    #[arg(long, global = true)]
    fake: bool,
    /// Fake service catalog: `service=char:props,...;service=...`.
    #[arg(long, global = true, requires = "fake")]
    fake_services: Option<ServiceFixture>,
    /// Model number reported by the fake peripheral.
    #[arg(long, global = true, requires = "fake")]
    fake_identity: Option<String>,
    /// Fake serial notifications as comma-separated hexadecimal payloads.
    #[arg(long, global = true, requires = "fake")]
    fake_notifications: Option<NotificationPayloads>,
    /// Artificial delay before the fake link comes up (e.g. `250ms`).
    #[arg(long, global = true, requires = "fake", value_parser = parse_duration)]
    fake_latency: Option<Duration>,
    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Creates argument values directly without CLI parsing.
    ///
    /// ```
    /// use bluno::{Args, Command, ListenArgs};
    ///
    /// let inspect = Args::new(Command::Inspect).with_address("AA:BB:CC:DD:EE:FF");
    /// let listen = Args::new(Command::Listen(ListenArgs::new(Some(10))));
    /// let _ = (inspect, listen);
    /// ```
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            address: None,
            log_level: None,
            output: None,
            baud_rate: DEFAULT_BAUD_RATE,
            handshake: HandshakeArg::Serialized,
            debug_route: DebugRouteArg::Usb,
            password: None,
            connect_timeout: None,
            fake: false,
            fake_services: None,
            fake_identity: None,
            fake_notifications: None,
            fake_latency: None,
            command,
        }
    }

    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Enables the fake driver with pre-parsed fixture settings.
    #[must_use]
    pub fn with_fake(mut self, fake: FakeArgs) -> Self {
        let FakeArgs {
            services,
            identity,
            notifications,
            latency,
        } = fake;

        self.fake = true;
        self.fake_services = services;
        self.fake_identity = identity;
        self.fake_notifications = notifications;
        self.fake_latency = Some(latency);
        self
    }

    /// Returns the optional telemetry level override.
    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    /// Returns the requested output format, if one was given.
    #[must_use]
    pub fn output_format(&self) -> Option<OutputFormat> {
        self.output
    }

    /// Splits parsed arguments into the command, session options and optional fake settings.
    ///
    /// # Errors
    ///
    /// Returns an error when no address is given for the real driver.
    pub fn into_parts(self) -> anyhow::Result<(Command, SessionOptions, Option<FakeArgs>)> {
        let Args {
            address,
            log_level: _,
            output: _,
            baud_rate,
            handshake,
            debug_route,
            password,
            connect_timeout,
            fake,
            fake_services,
            fake_identity,
            fake_notifications,
            fake_latency,
            command,
        } = self;

        let address = match (address, fake) {
            (Some(address), _) => address,
            (None, true) => FAKE_DEVICE_ADDRESS.to_string(),
            (None, false) => return Err(CliConfigError::MissingAddress.into()),
        };
        let handshake = HandshakeConfig::builder()
            .baud_rate(baud_rate)
            .mode(handshake.into())
            .debug_route(debug_route.into())
            .maybe_password(password)
            .build();
        let options = SessionOptions::builder()
            .address(address)
            .handshake(handshake)
            .connect_timeout(connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT))
            .build();
        let fake_args = fake.then(|| FakeArgs {
            services: fake_services,
            identity: fake_identity,
            notifications: fake_notifications,
            latency: fake_latency.unwrap_or(Duration::ZERO),
        });

        Ok((command, options, fake_args))
    }
}

/// Connection settings shared by every command.
#[derive(Debug, Clone, Builder)]
pub struct SessionOptions {
    #[builder(into)]
    address: String,
    #[builder(default)]
    handshake: HandshakeConfig,
    #[builder(default = DEFAULT_CONNECT_TIMEOUT)]
    connect_timeout: Duration,
}

impl SessionOptions {
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn handshake(&self) -> &HandshakeConfig {
        &self.handshake
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

/// Fake driver arguments for programmatic runs.
#[derive(Debug, Builder)]
pub struct FakeArgs {
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    services: Option<ServiceFixture>,
    #[builder(into)]
    identity: Option<String>,
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    notifications: Option<NotificationPayloads>,
    #[builder(default)]
    latency: Duration,
}

impl FakeArgs {
    pub(crate) fn into_driver_config(self) -> FakeDriverConfig {
        let Self {
            services,
            identity,
            notifications,
            latency,
        } = self;

        FakeDriverConfig::builder()
            .maybe_services(services)
            .maybe_identity(identity)
            .maybe_notifications(notifications)
            .connect_latency(latency)
            .build()
    }
}

/// Supported CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect, discover services and print the GATT catalog with Bluno compatibility.
    Inspect,
    /// Connect, run the handshake, then print serial and command traffic.
    Listen(ListenArgs),
    /// Connect, wait for the handshake, then write one line to the serial port.
    Send(SendArgs),
    /// Connect, then write one raw AT command to the command channel.
    Command(SendArgs),
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Inspect => "inspect",
            Self::Listen(_args) => "listen",
            Self::Send(_args) => "send",
            Self::Command(_args) => "command",
        }
    }
}

/// Telemetry verbosity accepted by `--log-level`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub(crate) fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

/// Rendering of command results.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable tables.
    Pretty,
    /// One JSON document per result.
    Json,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
enum HandshakeArg {
    Serialized,
    FireAndForget,
}

impl From<HandshakeArg> for HandshakeMode {
    fn from(value: HandshakeArg) -> Self {
        match value {
            HandshakeArg::Serialized => Self::Serialized,
            HandshakeArg::FireAndForget => Self::FireAndForget,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
enum DebugRouteArg {
    Usb,
    Bluno,
}

impl From<DebugRouteArg> for DebugRoute {
    fn from(value: DebugRouteArg) -> Self {
        match value {
            DebugRouteArg::Usb => Self::Usb,
            DebugRouteArg::Bluno => Self::Bluno,
        }
    }
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use clap::error::ErrorKind;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::handlers::AtCommand;

    #[test]
    fn fake_fixture_flags_require_fake_mode() {
        let result = Args::try_parse_from(["bluno", "--fake-identity", "DF Bluno", "inspect"]);

        let error = result.expect_err("fake fixture flags should require --fake");
        assert_eq!(ErrorKind::MissingRequiredArgument, error.kind());
    }

    #[test]
    fn real_driver_requires_an_address() {
        let cli = Args::try_parse_from(["bluno", "inspect"]).expect("arguments should parse");

        let error = cli
            .into_parts()
            .expect_err("a real run without --address should be rejected");
        assert_eq!(
            "an --address is required unless --fake is set",
            error.to_string()
        );
    }

    #[test]
    fn fake_mode_supplies_a_default_address() {
        let cli = Args::try_parse_from(["bluno", "--fake", "inspect"])
            .expect("valid fake arguments should parse");

        let (command, options, fake_args) = cli
            .into_parts()
            .expect("valid fake arguments should resolve");
        assert_matches!(command, Command::Inspect);
        assert_eq!(FAKE_DEVICE_ADDRESS, options.address());
        assert_matches!(fake_args, Some(_));
    }

    #[test]
    fn handshake_flags_shape_the_command_sequence() {
        let cli = Args::try_parse_from([
            "bluno",
            "--address",
            "AA:BB:CC:DD:EE:FF",
            "--baud-rate",
            "9600",
            "--handshake",
            "fire-and-forget",
            "--debug-route",
            "bluno",
            "--connect-timeout",
            "5s",
            "send",
            "hi",
        ])
        .expect("handshake flags should parse");

        let (_command, options, fake_args) = cli.into_parts().expect("options should resolve");
        assert_eq!(HandshakeMode::FireAndForget, options.handshake().mode());
        assert_eq!(
            vec![
                AtCommand::baud_rate(9_600),
                AtCommand::debug_route(DebugRoute::Bluno)
            ],
            options.handshake().commands()
        );
        assert_eq!(Duration::from_secs(5), options.connect_timeout());
        assert_matches!(fake_args, None);
    }

    #[test]
    fn invalid_fake_services_are_rejected_at_parse_time() {
        let result = Args::try_parse_from(["bluno", "--fake", "--fake-services", "nonsense", "inspect"]);

        let error = result.expect_err("malformed fixtures should fail argument parsing");
        assert_eq!(ErrorKind::ValueValidation, error.kind());
    }
}
