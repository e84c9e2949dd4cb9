use std::io;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use tracing::instrument;

use crate::app::{ConnectedSession, SessionHandler};
use crate::cli::OutputFormat;
use crate::controller::DeviceNotice;
use crate::protocol::RoleId;
use crate::terminal::TerminalClient;

use super::ui::{NoticeView, Painter, SendReportView};

/// Arguments for the `send` and `command` commands.
#[derive(Debug, Args)]
pub struct SendArgs {
    /// Text to write; CR/LF is appended.
    text: String,
    /// Keep printing replies for this long after the write is acknowledged (e.g. `500ms`).
    #[arg(long, value_parser = parse_duration)]
    wait: Option<Duration>,
}

impl SendArgs {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            wait: None,
        }
    }

    /// Sets how long to collect replies after the write.
    #[must_use]
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }
}

/// Outcome of one `send` or `command` run.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct SendReport {
    address: String,
    channel: RoleId,
    text: String,
    replies: Vec<DeviceNotice>,
}

impl SendReport {
    pub(crate) fn new(
        address: impl Into<String>,
        channel: RoleId,
        text: impl Into<String>,
        replies: Vec<DeviceNotice>,
    ) -> Self {
        Self {
            address: address.into(),
            channel,
            text: text.into(),
            replies,
        }
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    pub(crate) fn channel(&self) -> RoleId {
        self.channel
    }

    pub(crate) fn text(&self) -> &str {
        &self.text
    }

    pub(crate) fn replies(&self) -> &[DeviceNotice] {
        &self.replies
    }
}

/// Executes the `send` command.
pub(crate) async fn run_serial<W>(
    handler: SessionHandler,
    args: &SendArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    run(handler, RoleId::Serial, args, out, terminal_client, output_format).await
}

/// Executes the `command` command.
pub(crate) async fn run_command<W>(
    handler: SessionHandler,
    args: &SendArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    run(handler, RoleId::Command, args, out, terminal_client, output_format).await
}

#[instrument(skip(handler, args, out, terminal_client), level = "info")]
async fn run<W>(
    handler: SessionHandler,
    channel: RoleId,
    args: &SendArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let mut session = handler.connect().await?;
    let outcome = exchange(&mut session, channel, args).await;
    let address = session.address().unwrap_or_default();
    session.close();

    let report = SendReport::new(address, channel, args.text.as_str(), outcome?);
    match output_format {
        OutputFormat::Pretty => {
            let painter = Painter::new(terminal_client.stdout_is_terminal());
            writeln!(out, "{}", SendReportView::new(&report, &painter))?;
            for (index, reply) in report.replies().iter().enumerate() {
                writeln!(out, "{}", NoticeView::new(index + 1, reply, &painter))?;
            }
        }
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, &report)?;
            writeln!(out)?;
        }
    }

    Ok(())
}

/// Waits for the handshake, writes the line, then gathers replies on the Bluno channels.
async fn exchange(
    session: &mut ConnectedSession,
    channel: RoleId,
    args: &SendArgs,
) -> Result<Vec<DeviceNotice>> {
    session.ensure_compatible()?;
    session.wait_for_handshake().await?;
    session.drain_notices();

    match channel {
        RoleId::Command => session.send_command(&args.text).await?,
        _ => session.send_serial(&args.text).await?,
    }

    let mut replies: Vec<DeviceNotice> = session
        .drain_notices()
        .into_iter()
        .filter(is_reply)
        .collect();
    if let Some(wait) = args.wait {
        let deadline = tokio::time::Instant::now() + wait;
        while let Ok(Some(notice)) =
            tokio::time::timeout_at(deadline, session.next_notice()).await
        {
            if is_reply(&notice) {
                replies.push(notice);
            }
        }
    }
    Ok(replies)
}

fn is_reply(notice: &DeviceNotice) -> bool {
    matches!(
        notice,
        DeviceNotice::SerialText { .. } | DeviceNotice::CommandText { .. }
    )
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}
