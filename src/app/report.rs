//! Session report table

use crate::app::simulate::{ClientOutcome, SimulationReport};
use crate::core::styles::StyleRole;
use prettytable::{format, Cell, Row, Table};

const COLUMNS: [&str; 8] = [
    "Client",
    "User",
    "Requests",
    "Processed",
    "Failed",
    "Responses",
    "Faults",
    "Status",
];

fn styled(text: &str, role: StyleRole, use_color: bool, bold: bool) -> Cell {
    let mut spec = if bold { "b".to_string() } else { String::new() };
    if use_color {
        if let Some(colour) = role.to_prettytable_spec() {
            spec.push_str(&colour);
        }
    }
    let cell = Cell::new(text);
    if spec.is_empty() {
        cell
    } else {
        cell.style_spec(&spec)
    }
}

fn client_row(client: &ClientOutcome, use_color: bool) -> Row {
    let info = &client.info;
    let (status, role) = if client.is_complete() {
        ("complete", StyleRole::Complete)
    } else {
        ("incomplete", StyleRole::Incomplete)
    };
    Row::new(vec![
        styled(&info.client_id, StyleRole::Key, use_color, false),
        Cell::new(&info.user_name),
        Cell::new(&info.total_requests.to_string()).style_spec("r"),
        Cell::new(&info.processed_requests.to_string()).style_spec("r"),
        Cell::new(&info.failed_requests.to_string()).style_spec("r"),
        Cell::new(&client.responses.to_string()).style_spec("r"),
        Cell::new(&client.faults.to_string()).style_spec("r"),
        styled(status, role, use_color, false),
    ])
}

/// Build the per-client table
pub fn render(report: &SimulationReport, use_color: bool) -> Table {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_NO_LINESEP_WITH_TITLE);
    table.set_titles(Row::new(
        COLUMNS
            .iter()
            .map(|title| styled(title, StyleRole::Header, use_color, true))
            .collect(),
    ));
    for client in &report.clients {
        table.add_row(client_row(client, use_color));
    }
    table
}

pub fn summary(report: &SimulationReport) -> String {
    format!(
        "Session {} ({}): {} requests from {} clients in {:.2?}; {} handed back, {} reemitted, {} duplicate dispatches discarded",
        report.session_id,
        report.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        report.total_requests(),
        report.clients.len(),
        report.elapsed,
        report.handed_back,
        report.reemitted,
        report.duplicates_discarded
    )
}

pub fn print_report(report: &SimulationReport, use_color: bool) {
    render(report, use_color).printstd();
    println!("{}", StyleRole::Dim.paint(&summary(report), use_color));
}
