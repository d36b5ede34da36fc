//! Analysis, statistics and reconciliation types shared by every adapter.

use serde::{Deserialize, Serialize};

use crate::config::SkipFlags;

/// Read-only snapshot of what a source contains.
///
/// Counts default to zero when the corresponding artifact does not exist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Source type label (e.g. `supabase`).
    pub source_type: String,
    /// Relational tables or document collections.
    pub tables: u64,
    /// Views.
    pub views: u64,
    /// Data rows or documents.
    pub records: u64,
    /// Authentication users.
    pub auth_users: u64,
    /// Linked OAuth identities.
    pub oauth_links: u64,
    /// Row-level security policies.
    pub rls_policies: u64,
    /// Storage files.
    pub files: u64,
    /// Aggregate size of storage files.
    pub file_bytes: u64,
}

impl AnalysisReport {
    /// Creates an empty report for the given source type.
    #[must_use]
    pub fn new(source_type: impl Into<String>) -> Self {
        Self {
            source_type: source_type.into(),
            ..Default::default()
        }
    }

    /// Returns a copy with every skipped scope zeroed out.
    ///
    /// The report itself is left untouched so it can still be displayed as
    /// analyzed.
    #[must_use]
    pub fn normalized(&self, skip: &SkipFlags) -> Self {
        let mut copy = self.clone();
        if skip.data {
            copy.tables = 0;
            copy.views = 0;
            copy.records = 0;
        }
        if skip.rls {
            copy.rls_policies = 0;
        }
        if skip.oauth {
            copy.oauth_links = 0;
        }
        if skip.storage {
            copy.files = 0;
            copy.file_bytes = 0;
        }
        copy
    }
}

/// Outcome of the write phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationStats {
    /// Tables (or document tables) created in the target.
    pub tables: u64,
    /// Views created in the target.
    pub views: u64,
    /// Rows or documents written.
    pub records: u64,
    /// Users created in the target.
    pub auth_users: u64,
    /// Users that already existed and were refreshed.
    pub auth_users_updated: u64,
    /// OAuth identities written.
    pub oauth_links: u64,
    /// RLS policies created.
    pub rls_policies: u64,
    /// Files copied into target storage.
    pub files: u64,
    /// Bytes copied into target storage.
    pub file_bytes: u64,
    /// Whether this was a dry run (no writes).
    pub dry_run: bool,
    /// Wall-clock duration of the write phase.
    pub duration_secs: f64,
}

impl MigrationStats {
    /// Users present in the target after the run, new or refreshed.
    #[must_use]
    pub fn users_in_target(&self) -> u64 {
        self.auth_users + self.auth_users_updated
    }

    /// Records written per second.
    #[must_use]
    pub fn throughput(&self) -> f64 {
        if self.duration_secs > 0.0 {
            self.records as f64 / self.duration_secs
        } else {
            0.0
        }
    }
}

/// Artifact category compared by the validation summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Authentication users.
    AuthUsers,
    /// OAuth identity links.
    OAuthLinks,
    /// RLS policies.
    RlsPolicies,
    /// Tables or collections.
    Tables,
    /// Views.
    Views,
    /// Rows or documents.
    Records,
    /// Storage files.
    Files,
}

impl Metric {
    fn source_count(self, report: &AnalysisReport) -> u64 {
        match self {
            Self::AuthUsers => report.auth_users,
            Self::OAuthLinks => report.oauth_links,
            Self::RlsPolicies => report.rls_policies,
            Self::Tables => report.tables,
            Self::Views => report.views,
            Self::Records => report.records,
            Self::Files => report.files,
        }
    }

    fn target_count(self, stats: &MigrationStats) -> u64 {
        match self {
            Self::AuthUsers => stats.users_in_target(),
            Self::OAuthLinks => stats.oauth_links,
            Self::RlsPolicies => stats.rls_policies,
            Self::Tables => stats.tables,
            Self::Views => stats.views,
            Self::Records => stats.records,
            Self::Files => stats.files,
        }
    }
}

/// One line of the reconciliation table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationRow {
    /// Human label.
    pub label: String,
    /// Normalized source count.
    pub source: u64,
    /// Count written to the target.
    pub target: u64,
}

impl ValidationRow {
    /// Whether source and target agree.
    #[must_use]
    pub fn matches(&self) -> bool {
        self.source == self.target
    }
}

/// Before/after reconciliation table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationSummary {
    /// Label for the source column.
    pub source_label: String,
    /// Label for the target column.
    pub target_label: String,
    /// Rows in adapter-defined order.
    pub rows: Vec<ValidationRow>,
}

impl ValidationSummary {
    /// Builds a summary from a report and stats.
    ///
    /// The report is normalized against `skip` first so intentionally skipped
    /// scopes never show up as discrepancies.
    #[must_use]
    pub fn build(
        source_label: impl Into<String>,
        target_label: impl Into<String>,
        layout: &[(Metric, &str)],
        report: &AnalysisReport,
        stats: &MigrationStats,
        skip: &SkipFlags,
    ) -> Self {
        let normalized = report.normalized(skip);
        let rows = layout
            .iter()
            .map(|(metric, label)| ValidationRow {
                label: (*label).to_string(),
                source: metric.source_count(&normalized),
                target: metric.target_count(stats),
            })
            .collect();

        Self {
            source_label: source_label.into(),
            target_label: target_label.into(),
            rows,
        }
    }

    /// Rows whose counts disagree.
    pub fn discrepancies(&self) -> impl Iterator<Item = &ValidationRow> {
        self.rows.iter().filter(|r| !r.matches())
    }

    /// Whether every row matches.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.discrepancies().next().is_none()
    }

    /// Looks up a row by label.
    #[must_use]
    pub fn row(&self, label: &str) -> Option<&ValidationRow> {
        self.rows.iter().find(|r| r.label == label)
    }
}
