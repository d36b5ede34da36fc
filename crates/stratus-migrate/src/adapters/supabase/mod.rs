//! Supabase source adapter.
//!
//! Reads a live Supabase database over a direct connection and replays it
//! into the target inside a single transaction: relational data, auth users,
//! OAuth identities and RLS policies either all land or none do. Storage files
//! are copied after the commit.

pub mod auth;
pub mod rls;
pub mod schema;

use async_trait::async_trait;
use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::common::{cancellable, open_target, Lifecycle};
use crate::adapters::SourceAdapter;
use crate::config::{parse_pg_url, redact_url, MigrationOptions, SupabaseConfig};
use crate::detect::{RelationalFlavor, SourceKind};
use crate::error::{Error, Result};
use crate::report::{AnalysisReport, Metric, MigrationStats, ValidationSummary};
use crate::storage::{copy_files, scan_tree_async, CopyJob, StorageTotals};
use crate::target::{self, open_postgres};

use auth::AuthColumns;
use schema::Catalog;

/// Reconciliation rows, in display order.
pub const LAYOUT: &[(Metric, &str)] = &[
    (Metric::AuthUsers, "Auth users"),
    (Metric::OAuthLinks, "OAuth links"),
    (Metric::RlsPolicies, "RLS policies"),
    (Metric::Tables, "Tables"),
    (Metric::Views, "Views"),
    (Metric::Records, "Records"),
    (Metric::Files, "Files"),
];

/// Port used by the Supabase transaction pooler.
const POOLER_PORT: u16 = 6543;

/// Adapter for live Supabase databases.
pub struct SupabaseAdapter {
    config: SupabaseConfig,
    options: MigrationOptions,
    source_options: PgConnectOptions,
    source: Option<PgConnection>,
    lifecycle: Lifecycle,
}

impl SupabaseAdapter {
    /// Validates the configuration. Does not connect.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid options, a malformed or pooled
    /// connection string, or an empty schema list.
    pub fn new(config: SupabaseConfig, options: MigrationOptions) -> Result<Self> {
        options.validate()?;
        reject_pooler(&config.connection_string)?;
        let source_options = parse_pg_url(&config.connection_string, "source")?;
        if source_options.get_port() == POOLER_PORT {
            return Err(pooler_error(&config.connection_string));
        }
        if config.schemas.is_empty() || config.schemas.iter().any(|s| s.trim().is_empty()) {
            return Err(Error::Config(
                "at least one non-empty source schema is required".to_string(),
            ));
        }

        Ok(Self {
            config,
            options,
            source_options,
            source: None,
            lifecycle: Lifecycle::default(),
        })
    }
}

fn pooler_error(url: &str) -> Error {
    Error::Config(format!(
        "{} points at a connection pooler; use the direct database connection string \
         (db.<project>.supabase.co:5432)",
        redact_url(url)
    ))
}

/// Rejects pooled connection strings, which cannot hold the long-lived
/// transaction the import needs.
fn reject_pooler(url: &str) -> Result<()> {
    let lowered = url.to_ascii_lowercase();
    let authority = lowered
        .split_once("://")
        .map_or(lowered.as_str(), |(_, rest)| rest)
        .split(['/', '?'])
        .next()
        .unwrap_or_default();
    let host = authority.rsplit('@').next().unwrap_or(authority);
    let host = host.split(':').next().unwrap_or(host);

    let pgbouncer = lowered
        .split_once('?')
        .is_some_and(|(_, query)| query.split('&').any(|p| p == "pgbouncer=true"));

    if host.ends_with("pooler.supabase.com") || pgbouncer {
        return Err(pooler_error(url));
    }
    Ok(())
}

/// Returns the open source connection, connecting on first use.
async fn source_connection<'a>(
    slot: &'a mut Option<PgConnection>,
    options: &PgConnectOptions,
) -> Result<&'a mut PgConnection> {
    if slot.is_none() {
        let conn = open_postgres(options, "source connect", Error::SourceConnection).await?;
        info!("Connected to Supabase source");
        *slot = Some(conn);
    }
    slot.as_mut().ok_or(Error::AlreadyClosed)
}

#[async_trait]
impl SourceAdapter for SupabaseAdapter {
    fn source_kind(&self) -> SourceKind {
        SourceKind::Relational(RelationalFlavor::Supabase)
    }

    fn source_type(&self) -> &'static str {
        "supabase"
    }

    async fn analyze(&mut self, cancel: &CancellationToken) -> Result<AnalysisReport> {
        self.lifecycle.ensure_open()?;
        let source =
            cancellable(cancel, Box::pin(source_connection(&mut self.source, &self.source_options)))
                .await?;
        cancellable(
            cancel,
            Box::pin(analyze_source(source, &self.config, self.options.include_anonymous)),
        )
        .await
    }

    async fn migrate(&mut self, cancel: &CancellationToken) -> Result<MigrationStats> {
        self.lifecycle.ensure_open()?;
        let started = Instant::now();
        let config = &self.config;
        let options = &self.options;
        let skip = options.skip;

        let mut stats = MigrationStats {
            dry_run: options.dry_run,
            ..Default::default()
        };

        let source =
            cancellable(cancel, Box::pin(source_connection(&mut self.source, &self.source_options)))
                .await?;

        if options.dry_run {
            cancellable(cancel, Box::pin(preview(source, config, options))).await?;
            info!("Dry run complete; the target was not contacted");
            stats.duration_secs = started.elapsed().as_secs_f64();
            return Ok(stats);
        }

        let mut target_conn = cancellable(cancel, Box::pin(open_target(options))).await?;

        // Dropping this future on cancellation drops the transaction, which
        // rolls it back.
        cancellable(
            cancel,
            Box::pin(import_in_transaction(
                source,
                &mut target_conn,
                config,
                options,
                &mut stats,
            )),
        )
        .await?;

        if let Err(e) = target_conn.close().await {
            warn!(error = %e, "Failed to close target connection cleanly");
        }

        match (&config.storage_export, skip.storage) {
            (Some(dir), false) => {
                let jobs = cancellable(cancel, Box::pin(storage_jobs(dir))).await?;
                let totals =
                    copy_files(&jobs, &options.storage_path, options.progress.as_ref(), cancel)
                        .await?;
                stats.files = totals.files;
                stats.file_bytes = totals.bytes;
            }
            (Some(_), true) => info!("Skipping storage files"),
            (None, _) => {}
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
        ValidationSummary::build("Supabase", "Stratus", LAYOUT, report, stats, &self.options.skip)
    }
}

/// Counts everything the import would move.
async fn analyze_source(
    source: &mut PgConnection,
    config: &SupabaseConfig,
    include_anonymous: bool,
) -> Result<AnalysisReport> {
    let mut report = AnalysisReport::new("supabase");

    let catalog = Catalog::load(source, &config.schemas).await?;
    report.tables = catalog.tables.len() as u64;
    report.views = catalog.views.len() as u64;
    for table in &catalog.tables {
        report.records += schema::count_rows(source, table).await?;
    }
    for schema in schema::external_references(&catalog) {
        info!(schema = %schema, "Foreign keys into this schema will not be recreated");
    }

    let columns = AuthColumns::load(source).await?;
    report.auth_users = auth::count_users(source, &columns, include_anonymous).await?;
    report.oauth_links = auth::count_identities(source, &columns, include_anonymous).await?;
    report.rls_policies = rls::load_policies(source, &config.schemas).await?.len() as u64;

    if let Some(dir) = &config.storage_export {
        let jobs = storage_jobs(dir).await?;
        let totals = StorageTotals::of(&jobs);
        report.files = totals.files;
        report.file_bytes = totals.bytes;
    }

    info!(
        tables = report.tables,
        views = report.views,
        records = report.records,
        users = report.auth_users,
        identities = report.oauth_links,
        policies = report.rls_policies,
        "Analyzed Supabase source"
    );
    Ok(report)
}

/// Dry run: reads everything the import would read, writes nothing.
async fn preview(
    source: &mut PgConnection,
    config: &SupabaseConfig,
    options: &MigrationOptions,
) -> Result<()> {
    let progress = options.progress.as_ref();
    let catalog = Catalog::load(source, &config.schemas).await?;
    let columns = AuthColumns::load(source).await?;
    let users = auth::copy_users(
        source,
        None,
        &columns,
        options.include_anonymous,
        options.batch_size,
        progress,
    )
    .await?;
    debug!(
        tables = catalog.tables.len(),
        users = users.created + users.updated,
        "Dry run read the source"
    );
    if !options.skip.oauth {
        auth::copy_identities(
            source,
            None,
            &columns,
            options.include_anonymous,
            options.batch_size,
            progress,
        )
        .await?;
    }
    if !options.skip.rls {
        let policies = rls::load_policies(source, &config.schemas).await?;
        for policy in &policies {
            debug!(sql = %policy.to_sql(), "Would create policy");
        }
    }
    Ok(())
}

/// Data, auth users, OAuth identities and RLS policies in one transaction.
/// Nothing is visible in the target unless every step succeeds.
async fn import_in_transaction(
    source: &mut PgConnection,
    target_conn: &mut PgConnection,
    config: &SupabaseConfig,
    options: &MigrationOptions,
    stats: &mut MigrationStats,
) -> Result<()> {
    let progress = options.progress.as_ref();
    let skip = options.skip;
    let mut tx = target_conn.begin().await?;
    target::ensure_schema(&mut tx).await?;

    let catalog = Catalog::load(source, &config.schemas).await?;

    if skip.data {
        info!("Skipping tables, views and rows");
    } else {
        info!("Copying relational data");
        let counts =
            schema::copy_data(source, &mut tx, &catalog, options.batch_size, progress).await?;
        stats.tables = counts.tables;
        stats.views = counts.views;
        stats.records = counts.records;
    }

    info!("Copying auth users");
    let columns = AuthColumns::load(source).await?;
    let users = auth::copy_users(
        source,
        Some(&mut *tx),
        &columns,
        options.include_anonymous,
        options.batch_size,
        progress,
    )
    .await?;
    stats.auth_users = users.created;
    stats.auth_users_updated = users.updated;

    if skip.oauth {
        info!("Skipping OAuth identities");
    } else {
        info!("Copying OAuth identities");
        stats.oauth_links = auth::copy_identities(
            source,
            Some(&mut *tx),
            &columns,
            options.include_anonymous,
            options.batch_size,
            progress,
        )
        .await?;
    }

    if skip.rls {
        info!("Skipping RLS policies");
    } else {
        info!("Recreating RLS policies");
        let policies = rls::load_policies(source, &config.schemas).await?;
        stats.rls_policies = rls::apply_policies(&mut tx, &policies, &catalog.rls_tables()).await?;
    }

    tx.commit().await?;
    info!("Committed relational import");
    Ok(())
}

/// Plans the copy of a bucket export. Each top-level directory is a bucket,
/// so paths map over unchanged.
async fn storage_jobs(dir: &std::path::Path) -> Result<Vec<CopyJob>> {
    let entries = scan_tree_async(dir.to_path_buf()).await?;
    Ok(entries.into_iter().map(CopyJob::from).collect())
}
