use std::collections::VecDeque;
use std::fmt::{self, Display, Formatter};

use bon::Builder;
use tracing::{debug, info, instrument, warn};

use crate::hw::GattStatus;
use crate::protocol::{BLUNO_MODEL_SIGNATURE, DEFAULT_BAUD_RATE};

/// Terminator appended to every line sent over the Bluno channels.
pub const LINE_TERMINATOR: &str = "\r\n";

/// How consecutive handshake commands are paced.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum HandshakeMode {
    /// Wait for each write to complete before sending the next command.
    #[default]
    Serialized,
    /// Send every command back to back without waiting.
    FireAndForget,
}

/// Where the Bluno firmware routes serial debug output.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum DebugRoute {
    /// `AT+USBDEBUG=ON`
    #[default]
    Usb,
    /// `AT+BLUNODEBUG=ON`
    Bluno,
}

/// One `AT+<NAME>=<value>` configuration command.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AtCommand {
    name: &'static str,
    value: String,
}

impl AtCommand {
    #[must_use]
    pub fn password(password: &str) -> Self {
        Self {
            name: "PASSWORD",
            value: password.to_string(),
        }
    }

    #[must_use]
    pub fn baud_rate(baud_rate: u32) -> Self {
        Self {
            name: "CURRUART",
            value: baud_rate.to_string(),
        }
    }

    #[must_use]
    pub fn debug_route(route: DebugRoute) -> Self {
        let name = match route {
            DebugRoute::Usb => "USBDEBUG",
            DebugRoute::Bluno => "BLUNODEBUG",
        };
        Self {
            name,
            value: "ON".to_string(),
        }
    }

    /// Wire bytes including the line terminator.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        format!("{self}{LINE_TERMINATOR}").into_bytes()
    }
}

impl Display for AtCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "AT+{}={}", self.name, self.value)
    }
}

/// Settings for the post-discovery initialization handshake.
#[derive(Debug, Clone, Eq, PartialEq, Builder)]
pub struct HandshakeConfig {
    #[builder(default = DEFAULT_BAUD_RATE)]
    baud_rate: u32,
    #[builder(default)]
    mode: HandshakeMode,
    #[builder(default)]
    debug_route: DebugRoute,
    #[builder(into)]
    password: Option<String>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl HandshakeConfig {
    #[must_use]
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    #[must_use]
    pub fn mode(&self) -> HandshakeMode {
        self.mode
    }

    /// Commands in the order they are sent.
    #[must_use]
    pub fn commands(&self) -> Vec<AtCommand> {
        let mut commands = Vec::with_capacity(3);
        if let Some(password) = &self.password {
            commands.push(AtCommand::password(password));
        }
        commands.push(AtCommand::baud_rate(self.baud_rate));
        commands.push(AtCommand::debug_route(self.debug_route));
        commands
    }
}

/// What to do after the identity characteristic reported a value.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HandshakeStart {
    /// Write these commands to the command characteristic now.
    Send(Vec<AtCommand>),
    /// The peripheral did not identify as a Bluno.
    IdentityMismatch,
    /// The handshake already ran in this discovery cycle.
    AlreadyTriggered,
}

/// Progress after a write to the command characteristic completed.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HandshakeProgress {
    /// Send the next command.
    Send(AtCommand),
    /// Still waiting on outstanding writes.
    Pending,
    /// Every command was acknowledged.
    Complete,
    /// A command failed; no further commands are sent.
    Failed { command: AtCommand, status: GattStatus },
    /// The write did not belong to the handshake.
    Unrelated,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
enum Phase {
    #[default]
    Idle,
    Running,
    Complete,
    Finished,
}

/// Sequencer for the Bluno initialization handshake.
///
/// Holds no I/O; the caller performs the writes it returns and feeds back completions.
#[derive(Debug, Clone, Default)]
pub struct HandshakeHandler {
    config: HandshakeConfig,
    phase: Phase,
    queued: VecDeque<AtCommand>,
    in_flight: VecDeque<AtCommand>,
}

impl HandshakeHandler {
    #[must_use]
    pub fn new(config: HandshakeConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Returns whether an identity value names a Bluno, ignoring case.
    #[must_use]
    pub fn identity_matches(value: &[u8]) -> bool {
        let text = String::from_utf8_lossy(value);
        text.get(..BLUNO_MODEL_SIGNATURE.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(BLUNO_MODEL_SIGNATURE))
    }

    /// Starts the handshake if this is the first identity value of the discovery cycle.
    #[instrument(skip(self, value), level = "debug", fields(mode = ?self.config.mode))]
    pub fn on_identity(&mut self, value: &[u8]) -> HandshakeStart {
        if self.phase != Phase::Idle {
            debug!("handshake already triggered for this discovery cycle");
            return HandshakeStart::AlreadyTriggered;
        }
        if !Self::identity_matches(value) {
            warn!(identity = %String::from_utf8_lossy(value), "peripheral is not a Bluno");
            self.phase = Phase::Finished;
            return HandshakeStart::IdentityMismatch;
        }

        self.phase = Phase::Running;
        let mut commands: VecDeque<AtCommand> = self.config.commands().into();
        let to_send: Vec<AtCommand> = match self.config.mode {
            HandshakeMode::Serialized => commands.pop_front().into_iter().collect(),
            HandshakeMode::FireAndForget => commands.drain(..).collect(),
        };
        self.queued = commands;
        self.in_flight = to_send.iter().cloned().collect();
        info!(commands = to_send.len(), "starting Bluno handshake");
        HandshakeStart::Send(to_send)
    }

    /// Accounts for a completed write to the command characteristic.
    #[instrument(skip(self, value), level = "debug")]
    pub fn on_write_complete(&mut self, value: &[u8], status: GattStatus) -> HandshakeProgress {
        if self.phase != Phase::Running {
            return HandshakeProgress::Unrelated;
        }
        let Some(position) = self
            .in_flight
            .iter()
            .position(|command| command.encode() == value)
        else {
            return HandshakeProgress::Unrelated;
        };
        let Some(command) = self.in_flight.remove(position) else {
            return HandshakeProgress::Unrelated;
        };

        if !status.is_success() {
            warn!(%command, "handshake command failed");
            self.phase = Phase::Finished;
            self.queued.clear();
            self.in_flight.clear();
            return HandshakeProgress::Failed { command, status };
        }

        debug!(%command, "handshake command acknowledged");
        if let Some(next) = self.queued.pop_front() {
            self.in_flight.push_back(next.clone());
            return HandshakeProgress::Send(next);
        }
        if self.in_flight.is_empty() {
            info!("Bluno handshake complete");
            self.phase = Phase::Complete;
            return HandshakeProgress::Complete;
        }
        HandshakeProgress::Pending
    }

    /// True while handshake writes are outstanding.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.phase == Phase::Running
    }

    /// True once every command was acknowledged.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Complete
    }

    /// Stops the sequence after a command could not be dispatched.
    pub fn abort(&mut self) {
        if self.phase == Phase::Running {
            self.phase = Phase::Finished;
        }
        self.queued.clear();
        self.in_flight.clear();
    }

    /// Forgets all progress so the next discovery cycle can trigger again.
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.queued.clear();
        self.in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use insta::assert_snapshot;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn rendered(commands: &[AtCommand]) -> String {
        commands
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn default_commands_set_baud_then_usb_debug() {
        assert_snapshot!(rendered(&HandshakeConfig::default().commands()), @r"
        AT+CURRUART=115200
        AT+USBDEBUG=ON
        ");
    }

    #[test]
    fn optional_settings_extend_the_sequence() {
        let config = HandshakeConfig::builder()
            .password("000000")
            .baud_rate(9_600)
            .debug_route(DebugRoute::Bluno)
            .build();

        assert_snapshot!(rendered(&config.commands()), @r"
        AT+PASSWORD=000000
        AT+CURRUART=9600
        AT+BLUNODEBUG=ON
        ");
    }

    #[test]
    fn encoded_commands_end_with_crlf() {
        assert_eq!(b"AT+CURRUART=115200\r\n".to_vec(), AtCommand::baud_rate(115_200).encode());
    }

    #[rstest]
    #[case(b"DF Bluno", true)]
    #[case(b"df bluno v1.97", true)]
    #[case(b"DF BLUNO", true)]
    #[case(b"Arduino", false)]
    #[case(b"DF", false)]
    #[case(b"", false)]
    fn identity_prefix_is_case_insensitive(#[case] value: &[u8], #[case] expected: bool) {
        assert_eq!(expected, HandshakeHandler::identity_matches(value));
    }

    #[test]
    fn serialized_mode_waits_for_each_completion() {
        let mut handler = HandshakeHandler::new(HandshakeConfig::default());

        let start = handler.on_identity(b"DF Bluno");
        assert_eq!(HandshakeStart::Send(vec![AtCommand::baud_rate(115_200)]), start);

        let progress =
            handler.on_write_complete(&AtCommand::baud_rate(115_200).encode(), GattStatus::SUCCESS);
        assert_eq!(
            HandshakeProgress::Send(AtCommand::debug_route(DebugRoute::Usb)),
            progress
        );

        let progress = handler.on_write_complete(
            &AtCommand::debug_route(DebugRoute::Usb).encode(),
            GattStatus::SUCCESS,
        );
        assert_eq!(HandshakeProgress::Complete, progress);
        assert!(handler.is_complete());
    }

    #[test]
    fn serialized_failure_aborts_remaining_commands() {
        let mut handler = HandshakeHandler::new(HandshakeConfig::default());
        let _ = handler.on_identity(b"DF Bluno");

        let progress = handler.on_write_complete(
            &AtCommand::baud_rate(115_200).encode(),
            GattStatus::WRITE_NOT_PERMITTED,
        );

        assert_matches!(
            progress,
            HandshakeProgress::Failed { command, status }
            if command == AtCommand::baud_rate(115_200) && status == GattStatus::WRITE_NOT_PERMITTED
        );
        assert!(!handler.is_running());
    }

    #[test]
    fn fire_and_forget_sends_everything_at_once() {
        let config = HandshakeConfig::builder()
            .mode(HandshakeMode::FireAndForget)
            .build();
        let mut handler = HandshakeHandler::new(config);

        assert_eq!(
            HandshakeStart::Send(vec![
                AtCommand::baud_rate(115_200),
                AtCommand::debug_route(DebugRoute::Usb),
            ]),
            handler.on_identity(b"DF Bluno")
        );
        assert_eq!(
            HandshakeProgress::Pending,
            handler.on_write_complete(&AtCommand::baud_rate(115_200).encode(), GattStatus::SUCCESS)
        );
        assert_eq!(
            HandshakeProgress::Complete,
            handler.on_write_complete(
                &AtCommand::debug_route(DebugRoute::Usb).encode(),
                GattStatus::SUCCESS
            )
        );
    }

    #[test]
    fn identity_triggers_at_most_once_until_reset() {
        let mut handler = HandshakeHandler::new(HandshakeConfig::default());

        assert_matches!(handler.on_identity(b"DF Bluno"), HandshakeStart::Send(_));
        assert_eq!(HandshakeStart::AlreadyTriggered, handler.on_identity(b"DF Bluno"));

        handler.reset();
        assert_matches!(handler.on_identity(b"DF Bluno"), HandshakeStart::Send(_));
    }

    #[test]
    fn mismatched_identity_never_starts() {
        let mut handler = HandshakeHandler::new(HandshakeConfig::default());

        assert_eq!(HandshakeStart::IdentityMismatch, handler.on_identity(b"HM-10"));
        assert_eq!(HandshakeStart::AlreadyTriggered, handler.on_identity(b"DF Bluno"));
        assert!(!handler.is_running());
    }

    #[test]
    fn unrelated_writes_do_not_advance_the_sequence() {
        let mut handler = HandshakeHandler::new(HandshakeConfig::default());
        let _ = handler.on_identity(b"DF Bluno");

        assert_eq!(
            HandshakeProgress::Unrelated,
            handler.on_write_complete(b"AT+VERSION=?\r\n", GattStatus::SUCCESS)
        );
        assert!(handler.is_running());
    }
}
