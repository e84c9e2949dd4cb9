use std::fmt::{self, Display, Formatter};

use crate::cli::listen::{ListenStopReason, ListenSummary};
use crate::cli::send::SendReport;
use crate::controller::{DeviceNotice, IncompatibleReason};
use crate::protocol::{self, RoleId, role_metadata};
use crate::utils::{format_hex, trim_line_ending};

use super::painter::Painter;
use super::table::Table;

/// Renders the banner printed before `listen` starts streaming.
pub(crate) struct ListenReadyView<'a> {
    address: &'a str,
    painter: &'a Painter,
}

impl<'a> ListenReadyView<'a> {
    pub(crate) fn new(address: &'a str, painter: &'a Painter) -> Self {
        Self { address, painter }
    }
}

impl Display for ListenReadyView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let channel = |role: RoleId| {
            let metadata = role_metadata(role);
            format!(
                "{} {}",
                self.painter.value(metadata.uuid()),
                self.painter.muted(format!("({})", metadata.name()))
            )
        };
        let table = Table::key_value(
            self.painter,
            vec![
                ("address", self.painter.value(self.address)),
                ("serial", channel(RoleId::Serial)),
                ("command", channel(RoleId::Command)),
            ],
        );
        write!(f, "{}", self.painter.heading("Listening:"))?;
        write!(f, "\n{table}")
    }
}

/// Renders one device notice as a single line.
pub(crate) struct NoticeView<'a> {
    index: usize,
    notice: &'a DeviceNotice,
    painter: &'a Painter,
}

impl<'a> NoticeView<'a> {
    pub(crate) fn new(index: usize, notice: &'a DeviceNotice, painter: &'a Painter) -> Self {
        Self {
            index,
            notice,
            painter,
        }
    }

    fn label(&self) -> String {
        let painter = self.painter;
        match self.notice {
            DeviceNotice::Connected => painter.success("connected"),
            DeviceNotice::Disconnected => painter.warning("disconnected"),
            DeviceNotice::ServicesReady => painter.success("services_ready"),
            DeviceNotice::DiscoveryFailed { .. } => painter.warning("discovery_failed"),
            DeviceNotice::Incompatible(_) => painter.warning("incompatible"),
            DeviceNotice::CharacteristicData(_) => painter.value("data"),
            DeviceNotice::CommandText { .. } => painter.value("command"),
            DeviceNotice::SerialText { .. } => painter.value("serial"),
            DeviceNotice::HandshakeStarted { .. } => painter.value("handshake"),
            DeviceNotice::HandshakeComplete => painter.success("handshake_complete"),
            DeviceNotice::HandshakeFailed { .. } => painter.warning("handshake_failed"),
            DeviceNotice::WriteSucceeded { .. } => painter.success("write_ok"),
            DeviceNotice::WriteFailed { .. } => painter.warning("write_failed"),
        }
    }

    fn detail(&self) -> String {
        match self.notice {
            DeviceNotice::Connected
            | DeviceNotice::Disconnected
            | DeviceNotice::ServicesReady
            | DeviceNotice::HandshakeComplete => String::new(),
            DeviceNotice::DiscoveryFailed { outcome } => outcome.to_string(),
            DeviceNotice::Incompatible(IncompatibleReason::MissingRoles { roles }) => {
                let names: Vec<String> = roles.iter().map(ToString::to_string).collect();
                format!("missing {}", names.join(", "))
            }
            DeviceNotice::Incompatible(IncompatibleReason::UnrecognisedIdentity { identity }) => {
                format!("identity `{identity}`")
            }
            DeviceNotice::CharacteristicData(payload) => format!(
                "{} {} {}",
                protocol::lookup(payload.uuid(), payload.uuid()),
                trim_line_ending(&payload.text()),
                self.painter.muted(format!("raw={}", format_hex(payload.value())))
            ),
            DeviceNotice::CommandText { text } | DeviceNotice::SerialText { text } => {
                trim_line_ending(text).to_string()
            }
            DeviceNotice::HandshakeStarted { commands } => commands.join(", "),
            DeviceNotice::HandshakeFailed { command, status } => format!("{command}: {status}"),
            DeviceNotice::WriteSucceeded { uuid } => {
                protocol::lookup(uuid, uuid).to_string()
            }
            DeviceNotice::WriteFailed { uuid, status } => {
                format!("{}: {status}", protocol::lookup(uuid, uuid))
            }
        }
    }
}

impl Display for NoticeView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let index_label = self.painter.muted(format!("[{:04}]", self.index));
        let detail = self.detail();
        if detail.is_empty() {
            write!(f, "{index_label} {}", self.label())
        } else {
            write!(f, "{index_label} {} {detail}", self.label())
        }
    }
}

/// Renders the listen session summary.
pub(crate) struct ListenSummaryView<'a> {
    summary: &'a ListenSummary,
    painter: &'a Painter,
}

impl<'a> ListenSummaryView<'a> {
    pub(crate) fn new(summary: &'a ListenSummary, painter: &'a Painter) -> Self {
        Self { summary, painter }
    }
}

impl Display for ListenSummaryView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let stop_reason = match self.summary.stop_reason() {
            reason @ ListenStopReason::ReachedLimit(_) => self.painter.success(reason.to_string()),
            reason @ (ListenStopReason::Interrupted
            | ListenStopReason::Disconnected
            | ListenStopReason::StreamClosed) => self.painter.warning(reason.to_string()),
        };
        let handshake = if self.summary.handshake_complete() {
            "handshake complete"
        } else {
            "handshake incomplete"
        };
        write!(
            f,
            "{} {} {}",
            self.painter.heading("Stopped:"),
            stop_reason,
            self.painter.value(format!(
                "- received {} notice(s), {handshake}",
                self.summary.received()
            ))
        )
    }
}

/// Renders the result of a `send` or `command` run.
pub(crate) struct SendReportView<'a> {
    report: &'a SendReport,
    painter: &'a Painter,
}

impl<'a> SendReportView<'a> {
    pub(crate) fn new(report: &'a SendReport, painter: &'a Painter) -> Self {
        Self { report, painter }
    }
}

impl Display for SendReportView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let channel = role_metadata(self.report.channel());
        let table = Table::key_value(
            self.painter,
            vec![
                ("address", self.painter.value(self.report.address())),
                ("channel", self.painter.value(channel.name())),
                ("line", self.painter.value(self.report.text())),
                ("status", self.painter.success("acknowledged")),
                ("replies", self.report.replies().len().to_string()),
            ],
        );
        write!(f, "{}", self.painter.heading("Sent:"))?;
        write!(f, "\n{table}")
    }
}
