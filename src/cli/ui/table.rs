use std::fmt::{self, Display, Formatter};

use tabled::{builder::Builder, settings::Style as TableStyle};

use super::painter::Painter;

/// Rows rendered through `tabled` with rounded borders.
#[derive(Debug)]
pub(crate) struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// Creates a table with column headers and data rows.
    pub(crate) fn grid(
        headers: impl IntoIterator<Item = impl Into<String>>,
        rows: Vec<Vec<String>>,
    ) -> Self {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
            rows,
        }
    }

    /// Two columns of field names and values; field names are muted.
    pub(crate) fn key_value(painter: &Painter, rows: Vec<(&str, String)>) -> Self {
        let records = rows
            .into_iter()
            .map(|(field, value)| vec![painter.muted(field), value])
            .collect();
        Self::grid(["field", "value"], records)
    }
}

impl Display for Table {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut builder = Builder::default();
        builder.push_record(&self.headers);
        for row in &self.rows {
            builder.push_record(row);
        }
        let mut table = builder.build();
        table.with(TableStyle::rounded());
        write!(f, "{table}")
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;

    use super::*;

    #[test]
    fn grid_renders_rounded_borders() {
        let table = Table::grid(
            ["role", "uuid"],
            vec![
                vec!["serial".into(), "dfb1".into()],
                vec!["command".into(), "dfb2".into()],
            ],
        );
        assert_snapshot!(table.to_string(), @r"
        ╭─────────┬──────╮
        │ role    │ uuid │
        ├─────────┼──────┤
        │ serial  │ dfb1 │
        │ command │ dfb2 │
        ╰─────────┴──────╯
        ");
    }

    #[test]
    fn key_value_uses_field_and_value_headers() {
        let painter = Painter::new(false);
        let table = Table::key_value(&painter, vec![("address", "AA:BB".into())]);
        let rendered = table.to_string();

        assert!(rendered.contains("│ field   │ value │"));
        assert!(rendered.contains("│ address │ AA:BB │"));
    }
}
