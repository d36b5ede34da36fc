//! Console rendering for the preflight report, the confirmation gate and the
//! reconciliation table.

use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color, ContentArrangement, Table};
use console::{style, Style};
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm as ConfirmPrompt;

use crate::error::{Error, Result};
use crate::pipeline::Confirm;
use crate::report::{AnalysisReport, MigrationStats, ValidationSummary};

/// Formats a byte count with binary units.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Renders the analysis report shown before the confirmation prompt.
#[must_use]
pub fn render_report(report: &AnalysisReport, dry_run: bool) -> String {
    let bold = Style::new().bold();
    let mut lines = Vec::new();

    lines.push(String::new());
    lines.push(format!(
        "{} {}",
        bold.apply_to("Migration preview:"),
        style(&report.source_type).cyan()
    ));
    let rows = [
        ("Auth users", report.auth_users.to_string()),
        ("OAuth links", report.oauth_links.to_string()),
        ("RLS policies", report.rls_policies.to_string()),
        ("Tables", report.tables.to_string()),
        ("Views", report.views.to_string()),
        ("Records", report.records.to_string()),
        (
            "Files",
            format!("{} ({})", report.files, format_bytes(report.file_bytes)),
        ),
    ];
    for (label, value) in rows {
        lines.push(format!("  {:<14} {value}", format!("{label}:")));
    }
    if dry_run {
        lines.push(String::new());
        lines.push(format!(
            "{} Dry run: nothing was written to the target.",
            style("i").blue()
        ));
    }
    lines.join("\n")
}

/// Renders the before/after reconciliation table.
#[must_use]
pub fn render_summary(summary: &ValidationSummary, stats: &MigrationStats) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("").fg(Color::Cyan),
            Cell::new(&summary.source_label).fg(Color::Cyan),
            Cell::new(&summary.target_label).fg(Color::Cyan),
            Cell::new("").fg(Color::Cyan),
        ]);

    for row in &summary.rows {
        let status = if row.matches() {
            Cell::new("ok").fg(Color::Green)
        } else {
            Cell::new("mismatch").fg(Color::Yellow)
        };
        table.add_row(vec![
            Cell::new(&row.label),
            Cell::new(row.source),
            Cell::new(row.target),
            status,
        ]);
    }

    let mut out = format!("\n{table}\n");
    if stats.auth_users_updated > 0 {
        out.push_str(&format!(
            "  {} existing user(s) were refreshed in place\n",
            stats.auth_users_updated
        ));
    }
    out.push_str(&format!(
        "  Finished in {:.1}s ({:.0} records/s)\n",
        stats.duration_secs,
        stats.throughput()
    ));
    if summary.is_consistent() {
        out.push_str(&format!("{} Migration complete.", style("✓").green().bold()));
    } else {
        let labels: Vec<&str> = summary.discrepancies().map(|r| r.label.as_str()).collect();
        out.push_str(&format!(
            "{} Counts differ for: {}",
            style("!").yellow().bold(),
            labels.join(", ")
        ));
    }
    out
}

/// Interactive confirmation on the terminal.
pub struct DialoguerConfirm {
    theme: ColorfulTheme,
}

impl Default for DialoguerConfirm {
    fn default() -> Self {
        Self::new()
    }
}

impl DialoguerConfirm {
    /// Creates a prompt with the colorful theme.
    #[must_use]
    pub fn new() -> Self {
        Self {
            theme: ColorfulTheme::default(),
        }
    }
}

impl Confirm for DialoguerConfirm {
    fn confirm(&self, _report: &AnalysisReport) -> Result<bool> {
        ConfirmPrompt::with_theme(&self.theme)
            .with_prompt("Start migration?")
            .default(true)
            .interact()
            .map_err(prompt_error)
    }
}

fn prompt_error(err: dialoguer::Error) -> Error {
    match err {
        dialoguer::Error::IO(e) => Error::Prompt(e),
    }
}
