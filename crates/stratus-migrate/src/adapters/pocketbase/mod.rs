//! PocketBase source adapter.
//!
//! Opens `pb_data/data.db` read-only and imports auth collections as users,
//! `_externalAuths` as OAuth identities and base collections as document
//! tables. Uploaded files under `pb_data/storage` are copied into the target
//! storage, keyed by collection name instead of collection ID.

pub mod collections;

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, PgConnection, SqliteConnection};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::common::{cancellable, open_target, run_step, Lifecycle};
use crate::adapters::SourceAdapter;
use crate::config::{MigrationOptions, PocketBaseConfig};
use crate::detect::SourceKind;
use crate::error::{Error, Result};
use crate::report::{AnalysisReport, Metric, MigrationStats, ValidationSummary};
use crate::storage::{copy_files, scan_tree_async, CopyJob, StorageTotals};
use crate::target::{self, DocumentRecord, IdentityRecord, UpsertCounts, UserRecord};

use collections::{Collection, CollectionKind, ExternalAuth};

/// Reconciliation rows, in display order.
pub const LAYOUT: &[(Metric, &str)] = &[
    (Metric::AuthUsers, "Auth users"),
    (Metric::OAuthLinks, "OAuth links"),
    (Metric::Tables, "Collections"),
    (Metric::Records, "Records"),
    (Metric::Files, "Files"),
];

/// Progress phase for users.
pub const USERS_PHASE: &str = "users";
/// Progress phase for OAuth identities.
pub const IDENTITIES_PHASE: &str = "identities";
/// Progress phase for records.
pub const RECORDS_PHASE: &str = "records";

const EXTERNAL_AUTHS: &str = "_externalAuths";

/// Adapter for PocketBase data directories.
pub struct PocketBaseAdapter {
    config: PocketBaseConfig,
    options: MigrationOptions,
    source: Option<SqliteConnection>,
    lifecycle: Lifecycle,
}

impl PocketBaseAdapter {
    /// Validates the configuration. Does not open the database.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid options or an empty data
    /// directory path.
    pub fn new(config: PocketBaseConfig, options: MigrationOptions) -> Result<Self> {
        options.validate()?;
        if config.data_dir.as_os_str().is_empty() {
            return Err(Error::Config("PocketBase data directory is required".to_string()));
        }
        Ok(Self {
            config,
            options,
            source: None,
            lifecycle: Lifecycle::default(),
        })
    }

    fn storage_dir(&self) -> PathBuf {
        self.config.data_dir.join("storage")
    }
}

/// Returns the open source connection, opening `data.db` read-only on first
/// use.
async fn source_connection<'a>(
    slot: &'a mut Option<SqliteConnection>,
    data_dir: &Path,
) -> Result<&'a mut SqliteConnection> {
    if slot.is_none() {
        let path = data_dir.join("data.db");
        if !path.is_file() {
            return Err(Error::SourceConnection(format!(
                "{} does not exist; point --source at a pb_data directory",
                path.display()
            )));
        }
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .read_only(true)
            .create_if_missing(false);
        let conn = SqliteConnection::connect_with(&options)
            .await
            .map_err(|e| Error::SourceConnection(format!("cannot open {}: {e}", path.display())))?;
        info!(path = %path.display(), "Opened PocketBase database");
        *slot = Some(conn);
    }
    slot.as_mut().ok_or(Error::AlreadyClosed)
}

fn auth_collection_ids(collections: &[Collection]) -> Vec<&str> {
    collections
        .iter()
        .filter(|c| c.is_migrated() && c.kind == CollectionKind::Auth)
        .map(|c| c.id.as_str())
        .collect()
}

async fn count_external_auths(source: &mut SqliteConnection, collections: &[Collection]) -> Result<u64> {
    if !collections::table_exists(source, EXTERNAL_AUTHS).await? {
        return Ok(0);
    }
    let ids = auth_collection_ids(collections);
    let counts: Vec<(String, i64)> = sqlx::query_as(
        "SELECT collectionId, count(*) FROM _externalAuths GROUP BY collectionId",
    )
    .fetch_all(&mut *source)
    .await?;
    Ok(counts
        .into_iter()
        .filter(|(id, _)| ids.contains(&id.as_str()))
        .map(|(_, n)| n.max(0) as u64)
        .sum())
}

/// Plans the storage copy. A missing storage directory plans nothing.
async fn storage_jobs(dir: &Path, collections: &[Collection]) -> Result<Vec<CopyJob>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let entries = scan_tree_async(dir.to_path_buf()).await?;
    let (jobs, orphaned) = collections::storage_plan(entries, collections);
    if orphaned > 0 {
        warn!(files = orphaned, "Skipping stored files of collections that no longer exist");
    }
    Ok(jobs)
}

async fn flush_users(
    target: Option<&mut PgConnection>,
    batch: &mut Vec<UserRecord>,
    options: &MigrationOptions,
) -> Result<UpsertCounts> {
    if batch.is_empty() {
        return Ok(UpsertCounts::default());
    }
    let counts = match target {
        Some(conn) => target::upsert_users(conn, batch).await?,
        None => UpsertCounts::default(),
    };
    options.progress.phase_advanced(USERS_PHASE, batch.len() as u64);
    batch.clear();
    Ok(counts)
}

/// Imports auth collections as users, then their OAuth links unless skipped.
async fn import_users(
    source: &mut SqliteConnection,
    mut target: Option<&mut PgConnection>,
    collections: &[Collection],
    options: &MigrationOptions,
) -> Result<(UpsertCounts, u64)> {
    let mut counts = UpsertCounts::default();
    options.progress.phase_started(USERS_PHASE, None);

    for collection in collections
        .iter()
        .filter(|c| c.is_migrated() && c.kind == CollectionKind::Auth)
    {
        let sql = collections::record_query(source, collection).await?;
        let mut rows = sqlx::query(&sql).fetch(&mut *source);
        let mut batch: Vec<UserRecord> = Vec::with_capacity(options.batch_size);
        while let Some(row) = rows.try_next().await? {
            let record = collections::row_record(&row)?;
            batch.push(collections::record_user(collection, record)?);
            if batch.len() >= options.batch_size {
                counts += flush_users(target.as_deref_mut(), &mut batch, options).await?;
            }
        }
        counts += flush_users(target.as_deref_mut(), &mut batch, options).await?;
        debug!(collection = %collection.name, "Imported auth collection");
    }
    options.progress.phase_finished(USERS_PHASE);

    let links = if options.skip.oauth {
        info!("Skipping OAuth identities");
        0
    } else {
        import_identities(source, target, collections, options).await?
    };
    Ok((counts, links))
}

async fn import_identities(
    source: &mut SqliteConnection,
    mut target: Option<&mut PgConnection>,
    collections: &[Collection],
    options: &MigrationOptions,
) -> Result<u64> {
    if !collections::table_exists(source, EXTERNAL_AUTHS).await? {
        return Ok(0);
    }
    let ids = auth_collection_ids(collections);
    let progress = options.progress.as_ref();
    progress.phase_started(IDENTITIES_PHASE, None);
    let mut rows = sqlx::query_as::<_, ExternalAuth>(
        "SELECT id, collectionId, recordId, provider, providerId, created \
         FROM _externalAuths ORDER BY id",
    )
    .fetch(&mut *source);

    let mut written = 0;
    let mut batch: Vec<IdentityRecord> = Vec::with_capacity(options.batch_size);
    while let Some(link) = rows.try_next().await? {
        if !ids.contains(&link.collection_id.as_str()) {
            continue;
        }
        batch.push(link.into());
        if batch.len() >= options.batch_size {
            if let Some(conn) = target.as_deref_mut() {
                written += target::upsert_identities(conn, &batch).await?;
            }
            progress.phase_advanced(IDENTITIES_PHASE, batch.len() as u64);
            batch.clear();
        }
    }
    if !batch.is_empty() {
        if let Some(conn) = target {
            written += target::upsert_identities(conn, &batch).await?;
        }
        progress.phase_advanced(IDENTITIES_PHASE, batch.len() as u64);
    }
    progress.phase_finished(IDENTITIES_PHASE);
    Ok(written)
}

/// Imports base collections into document tables. Returns
/// `(tables, records)`.
async fn import_records(
    source: &mut SqliteConnection,
    mut target: Option<&mut PgConnection>,
    collections: &[Collection],
    options: &MigrationOptions,
) -> Result<(u64, u64)> {
    let progress = options.progress.as_ref();
    let mut tables = 0;
    let mut records = 0;
    progress.phase_started(RECORDS_PHASE, None);

    for collection in collections
        .iter()
        .filter(|c| c.is_migrated() && c.kind == CollectionKind::Base)
    {
        let table = collection.table();
        if let Some(conn) = target.as_deref_mut() {
            target::ensure_document_table(conn, &table).await?;
            tables += 1;
        }
        let sql = collections::record_query(source, collection).await?;
        let mut rows = sqlx::query(&sql).fetch(&mut *source);
        let mut batch: Vec<DocumentRecord> = Vec::with_capacity(options.batch_size);
        while let Some(row) = rows.try_next().await? {
            let record = collections::row_record(&row)?;
            batch.push(collections::record_document(collection, record)?);
            if batch.len() >= options.batch_size {
                records += flush_records(target.as_deref_mut(), &table, &mut batch).await?;
                progress.phase_advanced(RECORDS_PHASE, options.batch_size as u64);
            }
        }
        let remaining = batch.len() as u64;
        records += flush_records(target.as_deref_mut(), &table, &mut batch).await?;
        progress.phase_advanced(RECORDS_PHASE, remaining);
        debug!(collection = %collection.name, table = %table, "Imported collection");
    }
    progress.phase_finished(RECORDS_PHASE);
    Ok((tables, records))
}

async fn flush_records(
    target: Option<&mut PgConnection>,
    table: &str,
    batch: &mut Vec<DocumentRecord>,
) -> Result<u64> {
    let written = match target {
        Some(conn) if !batch.is_empty() => target::upsert_documents(conn, table, batch).await?,
        _ => 0,
    };
    batch.clear();
    Ok(written)
}

/// Counts collections, records, users, links and files.
async fn analyze_data(source: &mut SqliteConnection, storage_dir: &Path) -> Result<AnalysisReport> {
    let collections = collections::load_collections(source).await?;
    let mut report = AnalysisReport::new("pocketbase");

    for collection in &collections {
        match (collection.kind, collection.is_migrated()) {
            (CollectionKind::Base, true) => {
                report.tables += 1;
                report.records += collections::count_records(source, collection).await?;
            }
            (CollectionKind::Auth, true) => {
                report.auth_users += collections::count_records(source, collection).await?;
            }
            (CollectionKind::View, _) if !collection.system => report.views += 1,
            _ => {}
        }
    }
    report.oauth_links = count_external_auths(source, &collections).await?;

    let totals = StorageTotals::of(&storage_jobs(storage_dir, &collections).await?);
    report.files = totals.files;
    report.file_bytes = totals.bytes;
    Ok(report)
}

/// Copies uploaded files, renaming collection directories to collection names.
async fn copy_storage(
    storage_dir: &Path,
    collections: &[Collection],
    options: &MigrationOptions,
    cancel: &CancellationToken,
) -> Result<StorageTotals> {
    let jobs = storage_jobs(storage_dir, collections).await?;
    copy_files(&jobs, &options.storage_path, options.progress.as_ref(), cancel).await
}

#[async_trait]
impl SourceAdapter for PocketBaseAdapter {
    fn source_kind(&self) -> SourceKind {
        SourceKind::EmbeddedFile
    }

    fn source_type(&self) -> &'static str {
        "pocketbase"
    }

    async fn analyze(&mut self, cancel: &CancellationToken) -> Result<AnalysisReport> {
        self.lifecycle.ensure_open()?;
        let storage_dir = self.storage_dir();
        let data_dir = &self.config.data_dir;
        let slot = &mut self.source;

        let source = cancellable(cancel, Box::pin(source_connection(slot, data_dir))).await?;
        let report = cancellable(cancel, Box::pin(analyze_data(source, &storage_dir))).await?;

        if report.views > 0 {
            info!(views = report.views, "View collections are counted but not migrated");
        }
        info!(
            collections = report.tables,
            records = report.records,
            users = report.auth_users,
            identities = report.oauth_links,
            files = report.files,
            "Analyzed PocketBase data"
        );
        Ok(report)
    }

    async fn migrate(&mut self, cancel: &CancellationToken) -> Result<MigrationStats> {
        self.lifecycle.ensure_open()?;
        let started = Instant::now();
        let options = self.options.clone();
        let skip = options.skip;
        let storage_dir = self.storage_dir();
        let mut stats = MigrationStats {
            dry_run: options.dry_run,
            ..Default::default()
        };

        let source = cancellable(
            cancel,
            Box::pin(source_connection(&mut self.source, &self.config.data_dir)),
        )
        .await?;
        let collections =
            cancellable(cancel, Box::pin(collections::load_collections(&mut *source))).await?;

        let mut target_conn = if options.dry_run {
            None
        } else {
            let mut conn = cancellable(cancel, Box::pin(open_target(&options))).await?;
            cancellable(cancel, Box::pin(target::ensure_schema(&mut conn))).await?;
            Some(conn)
        };

        let (users, links) = run_step(
            "auth",
            cancel,
            Box::pin(import_users(&mut *source, target_conn.as_mut(), &collections, &options)),
        )
        .await?;
        stats.auth_users = users.created;
        stats.auth_users_updated = users.updated;
        stats.oauth_links = links;

        if skip.data {
            info!("Skipping collection records");
        } else {
            let (tables, records) = run_step(
                "records",
                cancel,
                Box::pin(import_records(
                    &mut *source,
                    target_conn.as_mut(),
                    &collections,
                    &options,
                )),
            )
            .await?;
            stats.tables = tables;
            stats.records = records;
        }

        if let Some(conn) = target_conn.take() {
            if let Err(e) = conn.close().await {
                warn!(error = %e, "Failed to close target connection cleanly");
            }
        }

        if skip.storage {
            info!("Skipping stored files");
        } else if !options.dry_run {
            let totals = run_step(
                "storage",
                cancel,
                Box::pin(copy_storage(&storage_dir, &collections, &options, cancel)),
            )
            .await?;
            stats.files = totals.files;
            stats.file_bytes = totals.bytes;
        }

        stats.duration_secs = started.elapsed().as_secs_f64();
        Ok(stats)
    }

    async fn close(&mut self) -> Result<()> {
        self.lifecycle.close()?;
        if let Some(conn) = self.source.take() {
            conn.close().await?;
        }
        Ok(())
    }

    fn validation_summary(&self, report: &AnalysisReport, stats: &MigrationStats) -> ValidationSummary {
        ValidationSummary::build("PocketBase", "Stratus", LAYOUT, report, stats, &self.options.skip)
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
