//! `--list-tools`: server status and the merged catalog, printed once.

use std::fmt::Write as _;

use crate::mcp_client::{CatalogSnapshot, ConnectionState, ServerStatus};

/// Render server statuses followed by every catalog tool.
pub fn render_status(statuses: &[ServerStatus], catalog: &CatalogSnapshot) -> String {
    let mut out = String::new();
    let ready = statuses.iter().filter(|s| s.state == ConnectionState::Ready).count();
    let _ = writeln!(out, "Servers ({ready}/{} reachable):", statuses.len());

    for status in statuses {
        let label = status
            .server_label
            .as_deref()
            .map(|l| format!(" [{l}]"))
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "  {:<20} {:<16} {:<10} {:>3} tools  {}{label}",
            status.id,
            status.transport,
            status.state.to_string(),
            status.tool_count,
            status.target,
        );
        if let Some(err) = &status.last_error {
            let _ = writeln!(out, "      last error: {err}");
        }
    }

    let _ = writeln!(out, "\nTools ({}):", catalog.len());
    for tool in catalog.tools() {
        let first_line = tool.description.lines().next().unwrap_or("");
        let _ = writeln!(out, "  {:<32} {first_line}", tool.name);
    }
    out
}
