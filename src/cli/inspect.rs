use std::io;

use anyhow::Result;
use serde::Serialize;
use strum::IntoEnumIterator;
use tracing::instrument;

use crate::app::{ConnectedSession, SessionHandler};
use crate::cli::OutputFormat;
use crate::hw::{GattService, RoleBindings};
use crate::protocol::{RoleId, role_metadata};
use crate::terminal::TerminalClient;

use super::ui::{InspectReportView, Painter};

/// Catalog and compatibility snapshot printed by `inspect`.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct InspectReport {
    address: String,
    compatible: bool,
    missing_roles: Vec<RoleId>,
    roles: Vec<RoleBinding>,
    services: Vec<GattService>,
}

/// Where one Bluno role landed in the discovered catalog.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub(crate) struct RoleBinding {
    role: RoleId,
    expected_uuid: &'static str,
    service_uuid: Option<String>,
}

impl RoleBinding {
    pub(crate) fn role(&self) -> RoleId {
        self.role
    }

    pub(crate) fn expected_uuid(&self) -> &'static str {
        self.expected_uuid
    }

    pub(crate) fn service_uuid(&self) -> Option<&str> {
        self.service_uuid.as_deref()
    }
}

impl InspectReport {
    pub(crate) fn new(address: impl Into<String>, services: Vec<GattService>) -> Self {
        let bindings = RoleBindings::resolve(&services);
        let roles = RoleId::iter()
            .map(|role| RoleBinding {
                role,
                expected_uuid: role_metadata(role).uuid(),
                service_uuid: bindings
                    .get(role)
                    .map(|characteristic| characteristic.service_uuid().to_string()),
            })
            .collect();

        Self {
            address: address.into(),
            compatible: bindings.is_compatible(),
            missing_roles: bindings.missing_roles(),
            roles,
            services,
        }
    }

    pub(crate) fn from_session(session: &ConnectedSession) -> Self {
        Self::new(session.address().unwrap_or_default(), session.services())
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    pub(crate) fn compatible(&self) -> bool {
        self.compatible
    }

    pub(crate) fn roles(&self) -> &[RoleBinding] {
        &self.roles
    }

    pub(crate) fn services(&self) -> &[GattService] {
        &self.services
    }
}

/// Executes the `inspect` command.
#[instrument(skip(handler, out, terminal_client), level = "info", fields(?output_format))]
pub(crate) async fn run<W>(
    handler: SessionHandler,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let session = handler.connect().await?;
    let report = InspectReport::from_session(&session);
    session.close();

    match output_format {
        OutputFormat::Pretty => {
            let painter = Painter::new(terminal_client.stdout_is_terminal());
            writeln!(out, "{}", InspectReportView::new(&report, &painter))?;
        }
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, &report)?;
            writeln!(out)?;
        }
    }

    Ok(())
}
