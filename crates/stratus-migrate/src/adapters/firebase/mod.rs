//! Firebase offline-export adapter.
//!
//! Imports whichever artifacts were supplied: an Auth export, a Firestore
//! export directory, a Realtime Database tree and a storage export. Each is
//! an independent step; a failing step is reported by name and the steps
//! before it stay committed. Every write is an upsert keyed on a
//! deterministic ID, so re-running an import converges instead of
//! duplicating.

pub mod auth;
pub mod documents;

use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::common::{cancellable, keep_user, open_target, run_step, Lifecycle};
use crate::adapters::SourceAdapter;
use crate::config::{FirebaseConfig, FirebaseHashConfig, MigrationOptions};
use crate::detect::SourceKind;
use crate::error::{Error, Result};
use crate::json_stream::{spawn_stream, stream_array_field, StreamHandle};
use crate::progress::Progress;
use crate::report::{AnalysisReport, Metric, MigrationStats, ValidationSummary};
use crate::storage::{copy_files, scan_tree_async, CopyJob, StorageTotals};
use crate::target::{self, DocumentRecord, UpsertCounts};

use auth::{convert_account, ExportedAccount};
use documents::Collection;

/// Reconciliation rows, in display order.
pub const LAYOUT: &[(Metric, &str)] = &[
    (Metric::AuthUsers, "Auth users"),
    (Metric::OAuthLinks, "OAuth links"),
    (Metric::Tables, "Collections"),
    (Metric::Records, "Documents"),
    (Metric::Files, "Files"),
];

/// Progress phase for users.
pub const USERS_PHASE: &str = "users";
/// Progress phase for documents.
pub const DOCUMENTS_PHASE: &str = "documents";

/// Tables the data steps will write, as found by analysis.
#[derive(Debug, Clone, Default)]
struct DataPlan {
    collections: Vec<Collection>,
    rtdb_nodes: BTreeMap<String, u64>,
}

impl DataPlan {
    /// Scans the Firestore and RTDB artifacts and checks that no two sources
    /// share a table.
    async fn load(config: &FirebaseConfig) -> Result<Self> {
        let firestore = config.firestore_export.clone();
        let rtdb = config.rtdb_export.clone();
        let plan = tokio::task::spawn_blocking(move || -> Result<Self> {
            let collections = match &firestore {
                Some(dir) => documents::discover_collections(dir)?,
                None => Vec::new(),
            };
            let rtdb_nodes = match &rtdb {
                Some(path) => documents::scan_rtdb(path)?,
                None => BTreeMap::new(),
            };
            Ok(Self {
                collections,
                rtdb_nodes,
            })
        })
        .await
        .map_err(|e| Error::Extraction(format!("export scan panicked: {e}")))??;

        let tables: Vec<(String, String)> = plan
            .collections
            .iter()
            .map(|c| (format!("Firestore collection '{}'", c.name), c.table.clone()))
            .chain(plan.rtdb_nodes.keys().map(|node| {
                (format!("RTDB node '{node}'"), documents::rtdb_table(node))
            }))
            .collect();
        documents::check_table_collisions(tables.iter().map(|(l, t)| (l.clone(), t.as_str())))?;
        Ok(plan)
    }
}

/// Adapter for Firebase export artifacts.
pub struct FirebaseAdapter {
    config: FirebaseConfig,
    options: MigrationOptions,
    plan: Option<DataPlan>,
    lifecycle: Lifecycle,
}

impl FirebaseAdapter {
    /// Validates the configuration. Does not touch the filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid options, when no artifact was
    /// supplied, or when the hash parameters are malformed.
    pub fn new(config: FirebaseConfig, options: MigrationOptions) -> Result<Self> {
        options.validate()?;
        if config.is_empty() {
            return Err(Error::Config(
                "at least one Firebase export (auth, Firestore, RTDB or storage) is required"
                    .to_string(),
            ));
        }
        if let Some(hash) = &config.hash_config {
            hash.validate()?;
        }
        Ok(Self {
            config,
            options,
            plan: None,
            lifecycle: Lifecycle::default(),
        })
    }
}

/// Counts the accounts (and their OAuth links) an auth export will import.
async fn count_accounts(path: PathBuf, include_anonymous: bool) -> Result<(u64, u64)> {
    tokio::task::spawn_blocking(move || {
        let mut users = 0;
        let mut links = 0;
        stream_array_field(open(&path)?, "users", |value| {
            let account = convert_account(&value, None)?;
            if account.user.is_anonymous && !include_anonymous {
                return Ok(());
            }
            users += 1;
            links += account.identities.len() as u64;
            Ok(())
        })?;
        Ok((users, links))
    })
    .await
    .map_err(|e| Error::Extraction(format!("auth export reader panicked: {e}")))?
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::Extraction(format!("cannot open {}: {e}", path.display())))
}

async fn storage_jobs(dir: &Path) -> Result<Vec<CopyJob>> {
    let entries = scan_tree_async(dir.to_path_buf()).await?;
    Ok(entries.into_iter().map(CopyJob::from).collect())
}

/// Imports users, and their OAuth links unless `skip_oauth`.
async fn import_accounts(
    path: PathBuf,
    mut target: Option<&mut PgConnection>,
    hash_config: Option<FirebaseHashConfig>,
    options: &MigrationOptions,
) -> Result<(UpsertCounts, u64)> {
    let progress = options.progress.as_ref();
    let mut handle: StreamHandle<ExportedAccount> = spawn_stream(options.batch_size, move |emit| {
        stream_array_field(open(&path)?, "users", |value| {
            emit(convert_account(&value, hash_config.as_ref())?)
        })
    });

    let mut counts = UpsertCounts::default();
    let mut links = 0;
    let mut batch: Vec<ExportedAccount> = Vec::with_capacity(options.batch_size);

    progress.phase_started(USERS_PHASE, None);
    while let Some(account) = handle.next().await {
        if !keep_user(account.user.is_anonymous, options) {
            continue;
        }
        batch.push(account);
        if batch.len() >= options.batch_size {
            let (c, l) = flush_accounts(target.as_deref_mut(), &mut batch, options, progress).await?;
            counts += c;
            links += l;
        }
    }
    let (c, l) = flush_accounts(target.as_deref_mut(), &mut batch, options, progress).await?;
    counts += c;
    links += l;
    handle.finish().await?;
    progress.phase_finished(USERS_PHASE);

    info!(
        created = counts.created,
        updated = counts.updated,
        links,
        "Imported Firebase auth accounts"
    );
    Ok((counts, links))
}

async fn flush_accounts(
    target: Option<&mut PgConnection>,
    batch: &mut Vec<ExportedAccount>,
    options: &MigrationOptions,
    progress: &dyn Progress,
) -> Result<(UpsertCounts, u64)> {
    if batch.is_empty() {
        return Ok((UpsertCounts::default(), 0));
    }
    let mut result = (UpsertCounts::default(), 0);
    if let Some(conn) = target {
        let users: Vec<_> = batch.iter().map(|a| a.user.clone()).collect();
        result.0 = target::upsert_users(conn, &users).await?;
        if !options.skip.oauth {
            let identities: Vec<_> = batch.iter().flat_map(|a| a.identities.clone()).collect();
            if !identities.is_empty() {
                result.1 = target::upsert_identities(conn, &identities).await?;
            }
        }
    }
    progress.phase_advanced(USERS_PHASE, batch.len() as u64);
    batch.clear();
    Ok(result)
}

/// Drains `(table, document)` pairs into the target, batching per table.
///
/// Tables seen for the first time are created and recorded in `tables`.
async fn load_documents(
    mut handle: StreamHandle<(String, DocumentRecord)>,
    mut target: Option<&mut PgConnection>,
    batch_size: usize,
    progress: &dyn Progress,
    tables: &mut BTreeSet<String>,
) -> Result<u64> {
    let mut written = 0;
    let mut current: Option<String> = None;
    let mut batch: Vec<DocumentRecord> = Vec::with_capacity(batch_size);

    while let Some((table, doc)) = handle.next().await {
        if current.as_deref() != Some(table.as_str()) {
            if let Some(previous) = current.take() {
                written +=
                    flush_documents(target.as_deref_mut(), &previous, &mut batch, progress).await?;
            }
            if let Some(conn) = target.as_deref_mut() {
                if tables.insert(table.clone()) {
                    target::ensure_document_table(conn, &table).await?;
                }
            }
            current = Some(table);
        }
        batch.push(doc);
        if batch.len() >= batch_size {
            if let Some(table) = &current {
                written += flush_documents(target.as_deref_mut(), table, &mut batch, progress).await?;
            }
        }
    }
    if let Some(table) = &current {
        written += flush_documents(target.as_deref_mut(), table, &mut batch, progress).await?;
    }
    handle.finish().await?;
    Ok(written)
}

async fn flush_documents(
    target: Option<&mut PgConnection>,
    table: &str,
    batch: &mut Vec<DocumentRecord>,
    progress: &dyn Progress,
) -> Result<u64> {
    if batch.is_empty() {
        return Ok(0);
    }
    let written = match target {
        Some(conn) => target::upsert_documents(conn, table, batch).await?,
        None => 0,
    };
    debug!(table, documents = batch.len(), "Flushed document batch");
    progress.phase_advanced(DOCUMENTS_PHASE, batch.len() as u64);
    batch.clear();
    Ok(written)
}

/// Imports every Firestore collection. Empty collections still get a table.
async fn import_firestore(
    collections: &[Collection],
    mut target: Option<&mut PgConnection>,
    options: &MigrationOptions,
    tables: &mut BTreeSet<String>,
) -> Result<u64> {
    let progress = options.progress.as_ref();
    let mut written = 0;
    progress.phase_started(DOCUMENTS_PHASE, None);
    for collection in collections {
        if let Some(conn) = target.as_deref_mut() {
            if tables.insert(collection.table.clone()) {
                target::ensure_document_table(conn, &collection.table).await?;
            }
        }
        let source = collection.clone();
        let handle = spawn_stream(options.batch_size, move |emit| {
            let table = source.table.clone();
            documents::read_collection(&source, &mut |doc| emit((table.clone(), doc)))
        });
        let count = load_documents(
            handle,
            target.as_deref_mut(),
            options.batch_size,
            progress,
            tables,
        )
        .await?;
        debug!(collection = %collection.name, table = %collection.table, count, "Imported collection");
        written += count;
    }
    progress.phase_finished(DOCUMENTS_PHASE);
    Ok(written)
}

/// Imports the RTDB tree, one table per top-level node.
async fn import_rtdb(
    path: PathBuf,
    target: Option<&mut PgConnection>,
    options: &MigrationOptions,
    tables: &mut BTreeSet<String>,
) -> Result<u64> {
    let progress = options.progress.as_ref();
    progress.phase_started(DOCUMENTS_PHASE, None);
    let handle = spawn_stream(options.batch_size, move |emit| documents::read_rtdb(&path, emit));
    let written = load_documents(handle, target, options.batch_size, progress, tables).await?;
    progress.phase_finished(DOCUMENTS_PHASE);
    Ok(written)
}

/// Counts accounts, documents and files without touching the target.
async fn analyze_export(
    config: &FirebaseConfig,
    include_anonymous: bool,
) -> Result<(AnalysisReport, DataPlan)> {
    let mut report = AnalysisReport::new("firebase");

    if let Some(path) = &config.auth_export {
        let (users, links) = count_accounts(path.clone(), include_anonymous).await?;
        report.auth_users = users;
        report.oauth_links = links;
    }

    let plan = DataPlan::load(config).await?;
    report.tables = (plan.collections.len() + plan.rtdb_nodes.len()) as u64;
    for collection in &plan.collections {
        let source = collection.clone();
        report.records += tokio::task::spawn_blocking(move || {
            documents::count_collection(&source)
        })
        .await
        .map_err(|e| Error::Extraction(format!("collection scan panicked: {e}")))??;
    }
    report.records += plan.rtdb_nodes.values().sum::<u64>();

    if let Some(dir) = &config.storage_export {
        let totals = StorageTotals::of(&storage_jobs(dir).await?);
        report.files = totals.files;
        report.file_bytes = totals.bytes;
    }
    Ok((report, plan))
}

/// Copies the storage export into the target's storage root.
async fn copy_storage(
    dir: &Path,
    options: &MigrationOptions,
    cancel: &CancellationToken,
) -> Result<StorageTotals> {
    let jobs = storage_jobs(dir).await?;
    copy_files(&jobs, &options.storage_path, options.progress.as_ref(), cancel).await
}

#[async_trait]
impl SourceAdapter for FirebaseAdapter {
    fn source_kind(&self) -> SourceKind {
        SourceKind::OfflineExport
    }

    fn source_type(&self) -> &'static str {
        "firebase"
    }

    async fn analyze(&mut self, cancel: &CancellationToken) -> Result<AnalysisReport> {
        self.lifecycle.ensure_open()?;
        let config = &self.config;
        let include_anonymous = self.options.include_anonymous;

        let (report, plan) =
            cancellable(cancel, Box::pin(analyze_export(config, include_anonymous))).await?;

        info!(
            users = report.auth_users,
            identities = report.oauth_links,
            collections = report.tables,
            documents = report.records,
            files = report.files,
            "Analyzed Firebase export"
        );
        self.plan = Some(plan);
        Ok(report)
    }

    async fn migrate(&mut self, cancel: &CancellationToken) -> Result<MigrationStats> {
        self.lifecycle.ensure_open()?;
        let started = Instant::now();
        let options = self.options.clone();
        let skip = options.skip;
        let mut stats = MigrationStats {
            dry_run: options.dry_run,
            ..Default::default()
        };

        if self.config.auth_export.is_some() && self.config.hash_config.is_none() {
            warn!(
                "No project hash parameters given; Firebase password hashes are imported \
                 but cannot be verified until the signer key is configured"
            );
        }

        let plan = match self.plan.take() {
            Some(plan) => plan,
            None => cancellable(cancel, Box::pin(DataPlan::load(&self.config))).await?,
        };

        let mut target_conn = if options.dry_run {
            None
        } else {
            let mut conn = cancellable(cancel, Box::pin(open_target(&options))).await?;
            cancellable(cancel, Box::pin(target::ensure_schema(&mut conn))).await?;
            Some(conn)
        };

        if let Some(path) = self.config.auth_export.clone() {
            let hash = self.config.hash_config.clone();
            let (counts, links) = run_step(
                "auth",
                cancel,
                Box::pin(import_accounts(path, target_conn.as_mut(), hash, &options)),
            )
            .await?;
            if target_conn.is_some() {
                stats.auth_users = counts.created;
                stats.auth_users_updated = counts.updated;
                stats.oauth_links = links;
            }
        }

        let mut tables = BTreeSet::new();
        if skip.data {
            info!("Skipping Firestore and RTDB data");
        } else {
            if !plan.collections.is_empty() {
                stats.records += run_step(
                    "firestore",
                    cancel,
                    Box::pin(import_firestore(
                        &plan.collections,
                        target_conn.as_mut(),
                        &options,
                        &mut tables,
                    )),
                )
                .await?;
            }
            if let Some(path) = self.config.rtdb_export.clone() {
                stats.records += run_step(
                    "rtdb",
                    cancel,
                    Box::pin(import_rtdb(path, target_conn.as_mut(), &options, &mut tables)),
                )
                .await?;
            }
            stats.tables = tables.len() as u64;
        }

        if let Some(conn) = target_conn.take() {
            if let Err(e) = conn.close().await {
                warn!(error = %e, "Failed to close target connection cleanly");
            }
        }

        match (&self.config.storage_export, skip.storage) {
            (Some(dir), false) if !options.dry_run => {
                let totals =
                    run_step("storage", cancel, Box::pin(copy_storage(dir, &options, cancel)))
                        .await?;
                stats.files = totals.files;
                stats.file_bytes = totals.bytes;
            }
            (Some(_), true) => info!("Skipping storage files"),
            _ => {}
        }

        stats.duration_secs = started.elapsed().as_secs_f64();
        Ok(stats)
    }

    async fn close(&mut self) -> Result<()> {
        self.lifecycle.close()?;
        self.plan = None;
        Ok(())
    }

    fn validation_summary(&self, report: &AnalysisReport, stats: &MigrationStats) -> ValidationSummary {
        ValidationSummary::build("Firebase", "Stratus", LAYOUT, report, stats, &self.options.skip)
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
