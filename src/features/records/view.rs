use crate::config::{RowAction, ServiceConfiguration};
use crate::engine::template::value_to_text;
use crate::features::records::controller::Record;
use colored::Colorize;
use serde_json::Value;

const MAX_CELL_WIDTH: usize = 40;
const EMPTY_CELL: &str = "-";

/// Column headers: the declared output fields, else the keys of the first record.
pub fn columns(config: &ServiceConfiguration, records: &[Record]) -> Vec<String> {
    let declared = config.display_fields();
    if !declared.is_empty() {
        return declared;
    }
    records
        .first()
        .map(|record| record.fields.keys().cloned().collect())
        .unwrap_or_default()
}

pub fn render_table(config: &ServiceConfiguration, records: &[Record]) -> String {
    if records.is_empty() {
        return "No records found.".bright_black().to_string();
    }

    let columns = columns(config, records);
    let mut header = vec!["#".to_string(), "id".to_string()];
    header.extend(columns.iter().cloned());

    let rows: Vec<Vec<String>> = records
        .iter()
        .enumerate()
        .map(|(index, record)| {
            let mut row = vec![(index + 1).to_string(), record.id.clone()];
            row.extend(columns.iter().map(|column| cell_text(record.fields.get(column))));
            row
        })
        .collect();

    let widths: Vec<usize> = (0..header.len())
        .map(|col| {
            rows.iter()
                .map(|row| row[col].chars().count())
                .chain(std::iter::once(header[col].chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let mut lines = Vec::with_capacity(rows.len() + 2);
    lines.push(format_row(&header, &widths).bold().to_string());
    lines.push(
        widths
            .iter()
            .map(|width| "-".repeat(*width))
            .collect::<Vec<_>>()
            .join("  ")
            .bright_black()
            .to_string(),
    );
    for row in &rows {
        lines.push(format_row(row, &widths));
    }

    let actions = available_actions(config);
    if !actions.is_empty() {
        lines.push(
            format!("Row actions: {}", actions.join(", "))
                .bright_black()
                .to_string(),
        );
    }

    lines.join("\n")
}

fn available_actions(config: &ServiceConfiguration) -> Vec<&'static str> {
    [(RowAction::Edit, "edit"), (RowAction::Delete, "delete")]
        .into_iter()
        .filter(|(action, _)| config.action_enabled(*action))
        .map(|(_, name)| name)
        .collect()
}

fn format_row(cells: &[String], widths: &[usize]) -> String {
    cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{cell:<width$}"))
        .collect::<Vec<_>>()
        .join("  ")
        .trim_end()
        .to_string()
}

fn cell_text(value: Option<&Value>) -> String {
    let text = match value {
        None | Some(Value::Null) => return EMPTY_CELL.to_string(),
        Some(nested @ (Value::Object(_) | Value::Array(_))) => {
            serde_json::to_string(nested).unwrap_or_default()
        }
        Some(scalar) => value_to_text(scalar),
    };

    let flattened = text.replace(['\n', '\r'], " ");
    if flattened.chars().count() > MAX_CELL_WIDTH {
        let truncated: String = flattened.chars().take(MAX_CELL_WIDTH - 1).collect();
        format!("{truncated}…")
    } else {
        flattened
    }
}
