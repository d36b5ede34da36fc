//! Preflight and confirmation orchestration.
//!
//! A run is always `analyze` → (report and confirmation) → `migrate` →
//! `close`. Human output goes to the diagnostic stream; the primary stream
//! only ever carries the stats JSON in `--json` mode.

use std::io::{self, Write};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapters::{create_adapter, SourceAdapter};
use crate::config::{MigrationOptions, SourceConfig};
use crate::error::{Phase, Result};
use crate::report::{AnalysisReport, MigrationStats, ValidationSummary};
use crate::ui;

/// Confirmation gate shown after the analysis report.
pub trait Confirm: Send + Sync {
    /// Returns whether the migration should proceed.
    ///
    /// # Errors
    ///
    /// Returns an error when the answer cannot be read.
    fn confirm(&self, report: &AnalysisReport) -> Result<bool>;
}

/// Always answers the same way. Used for `--yes` and in tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswer(pub bool);

impl Confirm for FixedAnswer {
    fn confirm(&self, _report: &AnalysisReport) -> Result<bool> {
        Ok(self.0)
    }
}

/// Output streams for a run.
pub struct Console {
    /// Human-readable report and summary (stderr).
    pub diag: Box<dyn Write + Send>,
    /// Machine-readable results (stdout).
    pub primary: Box<dyn Write + Send>,
}

impl Console {
    /// Standard error and standard output.
    #[must_use]
    pub fn stdio() -> Self {
        Self {
            diag: Box::new(io::stderr()),
            primary: Box::new(io::stdout()),
        }
    }
}

/// How a run presents itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunMode {
    /// Read the source only.
    pub dry_run: bool,
    /// Emit only the stats JSON; never prompt.
    pub json: bool,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Dry run in human mode: the report was shown and nothing migrated.
    Previewed(AnalysisReport),
    /// The user declined the prompt.
    Declined(AnalysisReport),
    /// `migrate` ran to completion.
    Completed {
        /// Preflight report.
        report: AnalysisReport,
        /// Write counters.
        stats: MigrationStats,
        /// Reconciliation table; absent for dry runs.
        summary: Option<ValidationSummary>,
    },
}

/// Drives one adapter through a full run.
pub struct Pipeline {
    adapter: Box<dyn SourceAdapter>,
    mode: RunMode,
    console: Console,
    confirm: Box<dyn Confirm>,
}

impl Pipeline {
    /// Builds the adapter for `source`.
    ///
    /// # Errors
    ///
    /// Returns the configuration or not-implemented error raised by adapter
    /// construction.
    pub fn new(
        source: &SourceConfig,
        options: MigrationOptions,
        json: bool,
        console: Console,
        confirm: Box<dyn Confirm>,
    ) -> Result<Self> {
        let mode = RunMode {
            dry_run: options.dry_run,
            json,
        };
        let adapter = create_adapter(source, options)?;
        Ok(Self::with_adapter(adapter, mode, console, confirm))
    }

    /// Wraps an already constructed adapter.
    #[must_use]
    pub fn with_adapter(
        adapter: Box<dyn SourceAdapter>,
        mode: RunMode,
        console: Console,
        confirm: Box<dyn Confirm>,
    ) -> Self {
        Self {
            adapter,
            mode,
            console,
            confirm,
        }
    }

    /// Runs the migration. The adapter is closed whatever the outcome; a
    /// close failure is only logged.
    ///
    /// # Errors
    ///
    /// Returns the analysis or migration failure wrapped with its phase.
    pub async fn run(mut self, cancel: &CancellationToken) -> Result<Outcome> {
        let result = self.drive(cancel).await;
        if let Err(e) = self.adapter.close().await {
            warn!(error = %e, "Failed to close source adapter cleanly");
        }
        result
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> Result<Outcome> {
        let source_type = self.adapter.source_type();
        info!(source = source_type, dry_run = self.mode.dry_run, "Analyzing source");
        let report = self
            .adapter
            .analyze(cancel)
            .await
            .map_err(|e| e.in_phase(Phase::Analysis))?;

        if !self.mode.json {
            writeln!(self.console.diag, "{}", ui::render_report(&report, self.mode.dry_run))?;
            if self.mode.dry_run {
                return Ok(Outcome::Previewed(report));
            }
            if !self.confirm.confirm(&report)? {
                writeln!(self.console.diag, "Migration cancelled.")?;
                return Ok(Outcome::Declined(report));
            }
        }

        info!(source = source_type, "Migrating source");
        let stats = self
            .adapter
            .migrate(cancel)
            .await
            .map_err(|e| e.in_phase(Phase::Migration))?;

        let summary = (!stats.dry_run).then(|| self.adapter.validation_summary(&report, &stats));
        if self.mode.json {
            serde_json::to_writer_pretty(&mut self.console.primary, &stats)?;
            writeln!(self.console.primary)?;
        } else if let Some(summary) = &summary {
            writeln!(self.console.diag, "{}", ui::render_summary(summary, &stats))?;
        }
        self.console.primary.flush()?;
        self.console.diag.flush()?;

        info!(
            users = stats.auth_users,
            records = stats.records,
            files = stats.files,
            duration_secs = stats.duration_secs,
            "Migration finished"
        );
        Ok(Outcome::Completed {
            report,
            stats,
            summary,
        })
    }
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
