//! Source adapters for the supported platforms.
//!
//! Every platform implements [`SourceAdapter`]. Callers drive an adapter
//! through `analyze` → (confirmation) → `migrate` → `close`, then build a
//! [`ValidationSummary`] from the report and the stats.

pub mod common;
pub mod firebase;
pub mod pocketbase;
pub mod supabase;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{MigrationOptions, PocketBaseConfig, SourceConfig, SupabaseConfig};
use crate::detect::{
    detect_source, embedded_data_dir, OfflineExportPaths, RelationalFlavor, SourceKind,
};
use crate::error::{Error, Result};
use crate::report::{AnalysisReport, MigrationStats, ValidationSummary};

/// Trait implemented by every source platform.
#[async_trait]
pub trait SourceAdapter: Send {
    /// Kind of source this adapter reads.
    fn source_kind(&self) -> SourceKind;

    /// Short source type name (`supabase`, `firebase`, `pocketbase`).
    fn source_type(&self) -> &'static str;

    /// Inspects the source without writing anything. Repeatable.
    async fn analyze(&mut self, cancel: &CancellationToken) -> Result<AnalysisReport>;

    /// Writes the source's data into the target.
    ///
    /// In dry-run mode the source is read but the target is never contacted
    /// and all write counters stay zero.
    async fn migrate(&mut self, cancel: &CancellationToken) -> Result<MigrationStats>;

    /// Releases every open handle. A second call returns
    /// [`Error::AlreadyClosed`].
    async fn close(&mut self) -> Result<()>;

    /// Builds this platform's reconciliation table.
    fn validation_summary(&self, report: &AnalysisReport, stats: &MigrationStats)
        -> ValidationSummary;
}

/// Creates an adapter from an explicit source configuration.
///
/// # Errors
///
/// Returns [`Error::Config`] when the options or source configuration are
/// invalid. No network or file I/O happens here.
pub fn create_adapter(
    source: &SourceConfig,
    options: MigrationOptions,
) -> Result<Box<dyn SourceAdapter>> {
    match source {
        SourceConfig::Supabase(cfg) => Ok(Box::new(supabase::SupabaseAdapter::new(
            cfg.clone(),
            options,
        )?)),
        SourceConfig::Firebase(cfg) => Ok(Box::new(firebase::FirebaseAdapter::new(
            cfg.clone(),
            options,
        )?)),
        SourceConfig::PocketBase(cfg) => Ok(Box::new(pocketbase::PocketBaseAdapter::new(
            cfg.clone(),
            options,
        )?)),
    }
}

/// Resolves a bare locator into a source configuration.
///
/// # Errors
///
/// Returns [`Error::NotImplemented`] for generic Postgres sources and
/// [`Error::Config`] for locators that cannot be classified.
pub fn source_config_for_locator(locator: &str) -> Result<SourceConfig> {
    match detect_source(locator) {
        SourceKind::Relational(RelationalFlavor::Supabase) => {
            Ok(SourceConfig::Supabase(SupabaseConfig {
                connection_string: locator.trim().to_string(),
                schemas: vec!["public".to_string()],
                storage_export: None,
            }))
        }
        SourceKind::Relational(RelationalFlavor::Generic) => Err(Error::NotImplemented(
            "generic Postgres sources are detected but not supported yet; \
             use a Supabase connection string"
                .to_string(),
        )),
        SourceKind::EmbeddedFile => Ok(SourceConfig::PocketBase(PocketBaseConfig {
            data_dir: embedded_data_dir(locator),
        })),
        SourceKind::OfflineExport => {
            let paths = OfflineExportPaths::discover(locator);
            if paths.is_empty() {
                return Err(Error::Config(format!(
                    "no Firebase export artifacts found at {locator}"
                )));
            }
            Ok(SourceConfig::Firebase(paths.into_config()))
        }
        SourceKind::Unknown => Err(Error::Config(format!(
            "cannot determine the source type of '{locator}'; expected a postgres:// URL, \
             a pb_data directory or a Firebase export"
        ))),
    }
}

/// Creates an adapter for a bare locator, using [`detect_source`].
///
/// # Errors
///
/// See [`source_config_for_locator`] and [`create_adapter`].
pub fn create_adapter_for_locator(
    locator: &str,
    options: MigrationOptions,
) -> Result<Box<dyn SourceAdapter>> {
    let source = source_config_for_locator(locator)?;
    create_adapter(&source, options)
}
