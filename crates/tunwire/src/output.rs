use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};

use crate::session::SessionReport;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

pub fn print_report(report: &SessionReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(report).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"]);
            for (field, value) in rows(report) {
                table.add_row(vec![field.to_string(), value]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("Session:");
            for (field, value) in rows(report) {
                println!("  {:<26}{value}", format!("{field}:"));
            }
        }
    }
}

fn rows(report: &SessionReport) -> Vec<(&'static str, String)> {
    let mut rows = vec![
        ("Daemon", report.daemon.clone()),
        ("Protocol", format!("codervpn {}", report.protocol_version)),
        ("Started", report.started.to_string()),
    ];
    if let Some(err) = &report.start_error {
        rows.push(("Start error", err.clone()));
    }
    rows.extend([
        (
            "Network settings requests",
            report.network_settings_requests.to_string(),
        ),
        ("Tunnel logs", report.tunnel_logs.len().to_string()),
        ("Workspaces", report.workspaces.to_string()),
        ("Agents", report.agents.to_string()),
        ("Stopped", report.stopped.to_string()),
        ("Elapsed", format!("{:.2}ms", report.elapsed_ms)),
    ]);
    rows
}
