use std::fmt::{self, Display, Formatter};

use crate::cli::inspect::InspectReport;
use crate::hw::{GattCharacteristic, GattService, format_permissions};
use crate::protocol::{self, role_metadata};
use crate::utils::format_hex;

use super::painter::Painter;
use super::table::Table;

/// Renders an inspect report: device summary, role bindings and one table per service.
pub(crate) struct InspectReportView<'a> {
    report: &'a InspectReport,
    painter: &'a Painter,
}

impl<'a> InspectReportView<'a> {
    pub(crate) fn new(report: &'a InspectReport, painter: &'a Painter) -> Self {
        Self { report, painter }
    }

    fn device_table(&self) -> Table {
        let compatibility = if self.report.compatible() {
            self.painter.success("yes")
        } else {
            self.painter.warning("no")
        };
        Table::key_value(
            self.painter,
            vec![
                ("address", self.painter.value(self.report.address())),
                (
                    "services",
                    self.painter.value(self.report.services().len().to_string()),
                ),
                ("bluno_compatible", compatibility),
            ],
        )
    }

    fn roles_table(&self) -> Table {
        let rows = self
            .report
            .roles()
            .iter()
            .map(|binding| {
                let bound = match binding.service_uuid() {
                    Some(service_uuid) => self
                        .painter
                        .success(format!("bound in {}", protocol::lookup(service_uuid, service_uuid))),
                    None => self.painter.warning("missing"),
                };
                vec![
                    self.painter.value(binding.role().to_string()),
                    role_metadata(binding.role()).name().to_string(),
                    self.painter.muted(binding.expected_uuid()),
                    bound,
                ]
            })
            .collect();
        Table::grid(["role", "name", "uuid", "status"], rows)
    }

    fn service_table(&self, service: &GattService) -> Table {
        let rows = service
            .characteristics()
            .iter()
            .map(|characteristic| self.characteristic_row(characteristic))
            .collect();
        Table::grid(
            ["characteristic", "name", "properties", "permissions", "value"],
            rows,
        )
    }

    fn characteristic_row(&self, characteristic: &GattCharacteristic) -> Vec<String> {
        let value = if characteristic.value().is_empty() {
            self.painter.muted("<none>")
        } else {
            format_hex(characteristic.value())
        };
        vec![
            self.painter.value(characteristic.uuid()),
            protocol::lookup(characteristic.uuid(), "Unknown characteristic").to_string(),
            characteristic.property_labels().join(","),
            format_permissions(characteristic.permissions()),
            value,
        ]
    }
}

impl Display for InspectReportView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.painter.heading("Connected device:"))?;
        write!(f, "\n{}", self.device_table())?;
        writeln!(f)?;
        write!(f, "\n{}", self.painter.heading("Bluno roles:"))?;
        write!(f, "\n{}", self.roles_table())?;

        for service in self.report.services() {
            writeln!(f)?;
            write!(
                f,
                "\n{} {}",
                self.painter.heading(protocol::lookup(service.uuid(), "Unknown service")),
                self.painter.muted(format!("({})", service.uuid()))
            )?;
            write!(f, "\n{}", self.service_table(service))?;
        }
        Ok(())
    }
}
