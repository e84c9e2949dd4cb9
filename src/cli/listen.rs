use std::io;

use anyhow::Result;
use clap::Args;
use derive_more::Display;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::app::{ConnectedSession, SessionHandler};
use crate::cli::OutputFormat;
use crate::controller::DeviceNotice;
use crate::error::InteractionError;
use crate::terminal::TerminalClient;

use super::ui::{ListenReadyView, ListenSummaryView, NoticeView, Painter};

/// Arguments for the `listen` command.
#[derive(Debug, Args)]
pub struct ListenArgs {
    /// Stop after this many notices. If omitted, listen until Ctrl+C or disconnect.
    #[arg(long)]
    max_events: Option<usize>,
}

impl ListenArgs {
    /// Creates listen arguments with an optional notice limit.
    #[must_use]
    pub fn new(max_events: Option<usize>) -> Self {
        Self { max_events }
    }

    pub(crate) fn max_events(&self) -> Option<usize> {
        self.max_events
    }
}

/// Why a listen session ended.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize)]
#[serde(tag = "reason", content = "limit", rename_all = "snake_case")]
pub(crate) enum ListenStopReason {
    #[display("reached limit of {_0} notice(s)")]
    ReachedLimit(usize),
    #[display("interrupted")]
    Interrupted,
    #[display("peripheral disconnected")]
    Disconnected,
    #[display("event stream closed")]
    StreamClosed,
}

/// Totals reported when `listen` stops.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ListenSummary {
    address: String,
    received: usize,
    handshake_complete: bool,
    stop_reason: ListenStopReason,
}

impl ListenSummary {
    pub(crate) fn new(
        address: impl Into<String>,
        received: usize,
        handshake_complete: bool,
        stop_reason: ListenStopReason,
    ) -> Self {
        Self {
            address: address.into(),
            received,
            handshake_complete,
            stop_reason,
        }
    }

    pub(crate) fn received(&self) -> usize {
        self.received
    }

    pub(crate) fn handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub(crate) fn stop_reason(&self) -> ListenStopReason {
        self.stop_reason
    }
}

/// Executes the `listen` command.
#[instrument(skip(handler, args, out, terminal_client), level = "info", fields(max_events = ?args.max_events()))]
pub(crate) async fn run<W>(
    handler: SessionHandler,
    args: &ListenArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let painter = Painter::new(terminal_client.stdout_is_terminal());
    let mut session = handler.connect().await?;
    if let Err(error) = session.ensure_compatible() {
        session.close();
        return Err(error.into());
    }
    let address = session.address().unwrap_or_default();

    if output_format == OutputFormat::Pretty {
        writeln!(out, "{}", ListenReadyView::new(&address, &painter))?;
    }
    let outcome = receive(
        &mut session,
        args.max_events(),
        out,
        &painter,
        output_format,
    )
    .await;
    let handshake_complete = session.controller().handshake_complete();
    session.close();

    let (received, stop_reason) = outcome?;
    let summary = ListenSummary::new(address, received, handshake_complete, stop_reason);
    match output_format {
        OutputFormat::Pretty => {
            writeln!(out)?;
            writeln!(out, "{}", ListenSummaryView::new(&summary, &painter))?;
        }
        OutputFormat::Json => {
            serde_json::to_writer(&mut *out, &summary)?;
            writeln!(out)?;
        }
    }

    Ok(())
}

/// Prints notices until the limit, a disconnect, or Ctrl+C.
async fn receive<W>(
    session: &mut ConnectedSession,
    max_events: Option<usize>,
    out: &mut W,
    painter: &Painter,
    output_format: OutputFormat,
) -> Result<(usize, ListenStopReason)>
where
    W: io::Write,
{
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut received = 0;

    loop {
        if let Some(limit) = max_events
            && received >= limit
        {
            return Ok((received, ListenStopReason::ReachedLimit(limit)));
        }

        tokio::select! {
            signal = &mut ctrl_c => {
                signal.map_err(|source| InteractionError::CtrlC { source })?;
                debug!("listen interrupted");
                return Ok((received, ListenStopReason::Interrupted));
            }
            notice = session.next_notice() => {
                let Some(notice) = notice else {
                    return Ok((received, ListenStopReason::StreamClosed));
                };
                received += 1;
                match output_format {
                    OutputFormat::Pretty => {
                        writeln!(out, "{}", NoticeView::new(received, &notice, painter))?;
                    }
                    OutputFormat::Json => {
                        serde_json::to_writer(&mut *out, &notice)?;
                        writeln!(out)?;
                    }
                }
                if notice == DeviceNotice::Disconnected {
                    return Ok((received, ListenStopReason::Disconnected));
                }
            }
        }
    }
}
