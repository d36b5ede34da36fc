//! Catalog introspection, DDL generation and row copy for user schemas.

use futures::TryStreamExt;
use sqlx::{Connection, PgConnection};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::rls::rewrite_auth_calls;
use crate::error::{Error, Result};
use crate::progress::Progress;
use crate::target::{quote_ident, quote_literal};

/// Progress phase for table creation.
pub const TABLES_PHASE: &str = "tables";
/// Progress phase for row copies.
pub const RECORDS_PHASE: &str = "records";

/// Maximum dependency passes when recreating views.
const VIEW_PASSES: usize = 8;

/// How a column generates values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    /// Plain column.
    None,
    /// `GENERATED ALWAYS AS IDENTITY`.
    Always,
    /// `GENERATED BY DEFAULT AS IDENTITY`.
    ByDefault,
}

impl IdentityKind {
    fn from_catalog(code: &str) -> Self {
        match code {
            "a" => Self::Always,
            "d" => Self::ByDefault,
            _ => Self::None,
        }
    }
}

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Formatted type, e.g. `character varying(64)`.
    pub data_type: String,
    /// `NOT NULL`.
    pub not_null: bool,
    /// Default expression.
    pub default_expr: Option<String>,
    /// Identity kind.
    pub identity: IdentityKind,
    /// Stored generation expression.
    pub generated: Option<String>,
}

impl Column {
    fn definition(&self) -> String {
        let mut sql = format!("{} {}", quote_ident(&self.name), self.data_type);
        if let Some(expr) = &self.generated {
            sql.push_str(&format!(" GENERATED ALWAYS AS ({expr}) STORED"));
        } else if self.identity != IdentityKind::None {
            // Imported rows carry their own values.
            sql.push_str(" GENERATED BY DEFAULT AS IDENTITY");
        } else if let Some(default) = &self.default_expr {
            sql.push_str(&format!(" DEFAULT {}", rewrite_auth_calls(default)));
        }
        if self.not_null {
            sql.push_str(" NOT NULL");
        }
        sql
    }

    /// Whether rows can supply a value for this column.
    #[must_use]
    pub fn is_insertable(&self) -> bool {
        self.generated.is_none()
    }
}

/// A table-level constraint kept with the table definition.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Constraint {
    /// Constraint name.
    pub name: String,
    /// `pg_get_constraintdef` output.
    pub definition: String,
}

/// A foreign key, added after data is loaded.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ForeignKey {
    /// Constraint name.
    pub name: String,
    /// `pg_get_constraintdef` output.
    pub definition: String,
    /// Schema of the referenced table.
    pub referenced_schema: String,
}

/// A secondary index.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Index {
    /// Index name.
    pub name: String,
    /// `CREATE INDEX` statement.
    pub definition: String,
}

/// A user table and everything recreated with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    /// Schema.
    pub schema: String,
    /// Table name.
    pub name: String,
    /// RLS enabled.
    pub rls_enabled: bool,
    /// RLS forced for the owner.
    pub rls_forced: bool,
    /// Columns in ordinal order.
    pub columns: Vec<Column>,
    /// Primary key, unique, check and exclusion constraints.
    pub constraints: Vec<Constraint>,
    /// Foreign keys.
    pub foreign_keys: Vec<ForeignKey>,
    /// Indexes not backing a constraint.
    pub indexes: Vec<Index>,
}

impl Table {
    /// `"schema"."name"`.
    #[must_use]
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }

    /// Idempotent `CREATE TABLE` with columns and non-FK constraints.
    #[must_use]
    pub fn create_sql(&self) -> String {
        let mut lines: Vec<String> = self.columns.iter().map(Column::definition).collect();
        lines.extend(self.constraints.iter().map(|c| {
            format!(
                "CONSTRAINT {} {}",
                quote_ident(&c.name),
                rewrite_auth_calls(&c.definition)
            )
        }));
        if lines.is_empty() {
            return format!("CREATE TABLE IF NOT EXISTS {} ()", self.qualified());
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            self.qualified(),
            lines.join(",\n    ")
        )
    }

    /// Quoted column list of insertable columns.
    #[must_use]
    pub fn insert_columns(&self) -> String {
        self.columns
            .iter()
            .filter(|c| c.is_insertable())
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Column list of the primary key, as written in its definition.
    #[must_use]
    pub fn primary_key_columns(&self) -> Option<&str> {
        let definition = self
            .constraints
            .iter()
            .map(|c| c.definition.as_str())
            .find(|d| d.starts_with("PRIMARY KEY"))?;
        let open = definition.find('(')?;
        let close = open + definition[open..].find(')')?;
        Some(definition[open + 1..close].trim()).filter(|cols| !cols.is_empty())
    }

    /// Statement inserting one JSON array of rows, bound as `$1`.
    ///
    /// Rows whose primary key already exists overwrite the stored row, so a
    /// forced re-run converges on the source and every row is affected.
    #[must_use]
    pub fn insert_sql(&self) -> String {
        let columns = self.insert_columns();
        if columns.is_empty() {
            return format!(
                "INSERT INTO {} SELECT FROM json_array_elements($1::json)",
                self.qualified()
            );
        }
        let conflict = match self.primary_key_columns() {
            Some(key) => {
                let assignments = self
                    .columns
                    .iter()
                    .filter(|c| c.is_insertable())
                    .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(&c.name)))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(" ON CONFLICT ({key}) DO UPDATE SET {assignments}")
            }
            None => String::new(),
        };
        format!(
            "INSERT INTO {t} ({columns}) SELECT {columns} FROM json_populate_recordset(NULL::{t}, $1::json){conflict}",
            t = self.qualified()
        )
    }

    /// Statements moving identity sequences past the imported values.
    #[must_use]
    pub fn identity_resync_sql(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.identity != IdentityKind::None)
            .map(|c| {
                format!(
                    "SELECT setval(pg_get_serial_sequence({table}, {column}), m) \
                     FROM (SELECT max({ident}) AS m FROM {qualified}) s WHERE m IS NOT NULL",
                    table = quote_literal(&self.qualified()),
                    column = quote_literal(&c.name),
                    ident = quote_ident(&c.name),
                    qualified = self.qualified(),
                )
            })
            .collect()
    }

    /// Idempotent foreign-key DDL for keys whose referenced table lives in a
    /// `migrated` schema.
    #[must_use]
    pub fn foreign_key_sql(&self, migrated: &[String]) -> Vec<String> {
        self.foreign_keys
            .iter()
            .filter(|fk| {
                let keep = migrated.contains(&fk.referenced_schema);
                if !keep {
                    debug!(
                        table = %self.qualified(),
                        constraint = %fk.name,
                        referenced = %fk.referenced_schema,
                        "Skipping foreign key into a schema that is not migrated"
                    );
                }
                keep
            })
            .map(|fk| {
                format!(
                    "DO $stratus$ BEGIN ALTER TABLE {} ADD CONSTRAINT {} {}; \
                     EXCEPTION WHEN duplicate_object THEN NULL; END $stratus$;",
                    self.qualified(),
                    quote_ident(&fk.name),
                    fk.definition
                )
            })
            .collect()
    }

    /// Idempotent index DDL.
    #[must_use]
    pub fn index_sql(&self) -> Vec<String> {
        self.indexes
            .iter()
            .map(|i| idempotent_index(&i.definition))
            .collect()
    }
}

fn idempotent_index(definition: &str) -> String {
    for prefix in ["CREATE UNIQUE INDEX ", "CREATE INDEX "] {
        if let Some(rest) = definition.strip_prefix(prefix) {
            if rest.starts_with("IF NOT EXISTS ") {
                return definition.to_string();
            }
            return format!("{prefix}IF NOT EXISTS {rest}");
        }
    }
    definition.to_string()
}

/// A user-defined enum type.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct EnumType {
    /// Schema.
    pub schema: String,
    /// Type name.
    pub name: String,
    /// Labels in sort order.
    pub labels: Vec<String>,
}

impl EnumType {
    /// Idempotent `CREATE TYPE`.
    #[must_use]
    pub fn create_sql(&self) -> String {
        let labels = self
            .labels
            .iter()
            .map(|l| quote_literal(l))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "DO $stratus$ BEGIN CREATE TYPE {}.{} AS ENUM ({labels}); \
             EXCEPTION WHEN duplicate_object THEN NULL; END $stratus$;",
            quote_ident(&self.schema),
            quote_ident(&self.name)
        )
    }
}

/// An extension used by migrated columns, defaults or indexes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, sqlx::FromRow)]
pub struct Extension {
    /// Extension name.
    pub name: String,
    /// Schema it is installed in.
    pub schema: String,
}

impl Extension {
    /// Idempotent `CREATE EXTENSION` in the same schema.
    #[must_use]
    pub fn create_sql(&self) -> String {
        format!(
            "CREATE SCHEMA IF NOT EXISTS {schema};\nCREATE EXTENSION IF NOT EXISTS {name} WITH SCHEMA {schema};",
            schema = quote_ident(&self.schema),
            name = quote_ident(&self.name)
        )
    }
}

/// A free-standing sequence (not owned by an identity column).
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Sequence {
    /// Schema.
    pub schema: String,
    /// Sequence name.
    pub name: String,
    /// Value type.
    pub data_type: String,
    /// Start value.
    pub start_value: i64,
    /// Increment.
    pub increment_by: i64,
    /// Minimum.
    pub min_value: i64,
    /// Maximum.
    pub max_value: i64,
    /// Wraps around.
    pub cycle: bool,
    /// Last value handed out, if any.
    pub last_value: Option<i64>,
}

impl Sequence {
    fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }

    /// Idempotent `CREATE SEQUENCE`.
    #[must_use]
    pub fn create_sql(&self) -> String {
        format!(
            "CREATE SEQUENCE IF NOT EXISTS {} AS {} INCREMENT BY {} MINVALUE {} MAXVALUE {} START WITH {} {}",
            self.qualified(),
            self.data_type,
            self.increment_by,
            self.min_value,
            self.max_value,
            self.start_value,
            if self.cycle { "CYCLE" } else { "NO CYCLE" }
        )
    }

    /// Statement restoring the sequence position, if it was ever used.
    #[must_use]
    pub fn setval_sql(&self) -> Option<String> {
        self.last_value.map(|last| {
            format!(
                "SELECT setval({}, {last}, true)",
                quote_literal(&self.qualified())
            )
        })
    }
}

/// A view definition.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct View {
    /// Schema.
    pub schema: String,
    /// View name.
    pub name: String,
    /// Query text.
    pub definition: String,
}

impl View {
    /// `CREATE OR REPLACE VIEW` with `auth.*()` calls rewritten.
    #[must_use]
    pub fn create_sql(&self) -> String {
        let body = self.definition.trim().trim_end_matches(';');
        format!(
            "CREATE OR REPLACE VIEW {}.{} AS {}",
            quote_ident(&self.schema),
            quote_ident(&self.name),
            rewrite_auth_calls(body)
        )
    }
}

/// Everything read from the source catalog for the migrated schemas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    /// Migrated schemas.
    pub schemas: Vec<String>,
    /// Enum types.
    pub enums: Vec<EnumType>,
    /// Extensions the schema depends on.
    pub extensions: Vec<Extension>,
    /// Free-standing sequences.
    pub sequences: Vec<Sequence>,
    /// Tables.
    pub tables: Vec<Table>,
    /// Views.
    pub views: Vec<View>,
}

#[derive(sqlx::FromRow)]
struct TableRow {
    schema: String,
    name: String,
    rls_enabled: bool,
    rls_forced: bool,
}

#[derive(sqlx::FromRow)]
struct ColumnRow {
    name: String,
    data_type: String,
    not_null: bool,
    default_expr: Option<String>,
    identity: String,
    generated: String,
}

impl Catalog {
    /// Reads the catalog of the given schemas.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] on failure.
    pub async fn load(source: &mut PgConnection, schemas: &[String]) -> Result<Self> {
        let tables = load_tables(source, schemas).await?;
        let views = sqlx::query_as::<_, View>(
            "SELECT schemaname::text AS schema, viewname::text AS name, definition \
             FROM pg_views WHERE schemaname::text = ANY($1) ORDER BY schemaname, viewname",
        )
        .bind(schemas)
        .fetch_all(&mut *source)
        .await?;

        let enums = sqlx::query_as::<_, EnumType>(
            "SELECT n.nspname::text AS schema, t.typname::text AS name, \
             array_agg(e.enumlabel::text ORDER BY e.enumsortorder) AS labels \
             FROM pg_type t \
             JOIN pg_enum e ON e.enumtypid = t.oid \
             JOIN pg_namespace n ON n.oid = t.typnamespace \
             WHERE n.nspname::text = ANY($1) \
             GROUP BY n.nspname, t.typname ORDER BY 1, 2",
        )
        .bind(schemas)
        .fetch_all(&mut *source)
        .await?;

        let extensions = sqlx::query_as::<_, Extension>(EXTENSIONS_SQL)
            .bind(schemas)
            .fetch_all(&mut *source)
            .await?;

        let sequences = sqlx::query_as::<_, Sequence>(
            "SELECT s.schemaname::text AS schema, s.sequencename::text AS name, \
             s.data_type::text AS data_type, s.start_value, s.increment_by, s.min_value, \
             s.max_value, s.cycle, s.last_value \
             FROM pg_sequences s \
             JOIN pg_namespace n ON n.nspname = s.schemaname \
             JOIN pg_class c ON c.relnamespace = n.oid AND c.relname = s.sequencename \
             WHERE s.schemaname::text = ANY($1) \
             AND NOT EXISTS (SELECT 1 FROM pg_depend d WHERE d.classid = 'pg_class'::regclass \
                 AND d.objid = c.oid AND d.deptype IN ('i', 'e')) \
             ORDER BY 1, 2",
        )
        .bind(schemas)
        .fetch_all(&mut *source)
        .await?;

        debug!(
            tables = tables.len(),
            views = views.len(),
            enums = enums.len(),
            extensions = extensions.len(),
            sequences = sequences.len(),
            "Loaded source catalog"
        );

        Ok(Self {
            schemas: schemas.to_vec(),
            enums,
            extensions,
            sequences,
            tables,
            views,
        })
    }

    /// Tables with row-level security enabled, as `(schema, table, forced)`.
    #[must_use]
    pub fn rls_tables(&self) -> Vec<(String, String, bool)> {
        self.tables
            .iter()
            .filter(|t| t.rls_enabled)
            .map(|t| (t.schema.clone(), t.name.clone(), t.rls_forced))
            .collect()
    }

    /// DDL run before any table is created.
    #[must_use]
    pub fn prelude_sql(&self) -> Vec<String> {
        let mut statements: Vec<String> = self
            .schemas
            .iter()
            .map(|s| format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(s)))
            .collect();
        statements.extend(self.extensions.iter().map(Extension::create_sql));
        statements.extend(self.enums.iter().map(EnumType::create_sql));
        statements.extend(self.sequences.iter().map(Sequence::create_sql));
        statements
    }
}

const EXTENSIONS_SQL: &str = "\
SELECT DISTINCT e.extname::text AS name, en.nspname::text AS schema FROM (
    SELECT CASE WHEN t.typcategory = 'A' AND t.typelem <> 0 THEN t.typelem ELSE t.oid END AS objid,
           'pg_type'::regclass AS classid
    FROM pg_attribute a
    JOIN pg_class c ON c.oid = a.attrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    JOIN pg_type t ON t.oid = a.atttypid
    WHERE c.relkind IN ('r', 'v') AND n.nspname::text = ANY($1) AND a.attnum > 0 AND NOT a.attisdropped
    UNION
    SELECT dd.refobjid, 'pg_proc'::regclass
    FROM pg_attrdef ad
    JOIN pg_class c ON c.oid = ad.adrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    JOIN pg_depend dd ON dd.classid = 'pg_attrdef'::regclass AND dd.objid = ad.oid
                     AND dd.refclassid = 'pg_proc'::regclass
    WHERE n.nspname::text = ANY($1)
    UNION
    SELECT oc.oid, 'pg_opclass'::regclass
    FROM pg_index i
    JOIN pg_class c ON c.oid = i.indrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    JOIN pg_opclass oc ON oc.oid = ANY(i.indclass::oid[])
    WHERE n.nspname::text = ANY($1)
) used
JOIN pg_depend d ON d.classid = used.classid AND d.objid = used.objid AND d.deptype = 'e'
JOIN pg_extension e ON e.oid = d.refobjid
JOIN pg_namespace en ON en.oid = e.extnamespace
WHERE e.extname <> 'plpgsql'
ORDER BY 1";

async fn load_tables(source: &mut PgConnection, schemas: &[String]) -> Result<Vec<Table>> {
    let rows = sqlx::query_as::<_, TableRow>(
        "SELECT n.nspname::text AS schema, c.relname::text AS name, \
         c.relrowsecurity AS rls_enabled, c.relforcerowsecurity AS rls_forced \
         FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
         WHERE c.relkind = 'r' AND NOT c.relispartition AND n.nspname::text = ANY($1) \
         AND NOT EXISTS (SELECT 1 FROM pg_depend d WHERE d.classid = 'pg_class'::regclass \
             AND d.objid = c.oid AND d.deptype = 'e') \
         ORDER BY 1, 2",
    )
    .bind(schemas)
    .fetch_all(&mut *source)
    .await?;

    let mut tables = Vec::with_capacity(rows.len());
    for row in rows {
        let qualified = format!("{}.{}", quote_ident(&row.schema), quote_ident(&row.name));

        let columns = sqlx::query_as::<_, ColumnRow>(
            "SELECT a.attname::text AS name, format_type(a.atttypid, a.atttypmod) AS data_type, \
             a.attnotnull AS not_null, pg_get_expr(d.adbin, d.adrelid) AS default_expr, \
             a.attidentity::text AS identity, a.attgenerated::text AS generated \
             FROM pg_attribute a \
             LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum \
             WHERE a.attrelid = $1::regclass AND a.attnum > 0 AND NOT a.attisdropped \
             ORDER BY a.attnum",
        )
        .bind(&qualified)
        .fetch_all(&mut *source)
        .await?
        .into_iter()
        .map(|c| {
            let generated = (c.generated == "s").then(|| c.default_expr.clone()).flatten();
            Column {
                name: c.name,
                data_type: c.data_type,
                not_null: c.not_null,
                default_expr: if generated.is_some() { None } else { c.default_expr },
                identity: IdentityKind::from_catalog(&c.identity),
                generated,
            }
        })
        .collect();

        let constraints = sqlx::query_as::<_, Constraint>(
            "SELECT conname::text AS name, pg_get_constraintdef(oid) AS definition \
             FROM pg_constraint WHERE conrelid = $1::regclass AND contype IN ('p', 'u', 'c', 'x') \
             ORDER BY CASE contype WHEN 'p' THEN 0 WHEN 'u' THEN 1 ELSE 2 END, conname",
        )
        .bind(&qualified)
        .fetch_all(&mut *source)
        .await?;

        let foreign_keys = sqlx::query_as::<_, ForeignKey>(
            "SELECT con.conname::text AS name, pg_get_constraintdef(con.oid) AS definition, \
             fn.nspname::text AS referenced_schema \
             FROM pg_constraint con \
             JOIN pg_class fc ON fc.oid = con.confrelid \
             JOIN pg_namespace fn ON fn.oid = fc.relnamespace \
             WHERE con.conrelid = $1::regclass AND con.contype = 'f' ORDER BY con.conname",
        )
        .bind(&qualified)
        .fetch_all(&mut *source)
        .await?;

        let indexes = sqlx::query_as::<_, Index>(
            "SELECT ic.relname::text AS name, pg_get_indexdef(i.indexrelid) AS definition \
             FROM pg_index i JOIN pg_class ic ON ic.oid = i.indexrelid \
             WHERE i.indrelid = $1::regclass \
             AND NOT EXISTS (SELECT 1 FROM pg_constraint c WHERE c.conindid = i.indexrelid) \
             ORDER BY ic.relname",
        )
        .bind(&qualified)
        .fetch_all(&mut *source)
        .await?;

        tables.push(Table {
            schema: row.schema,
            name: row.name,
            rls_enabled: row.rls_enabled,
            rls_forced: row.rls_forced,
            columns,
            constraints,
            foreign_keys,
            indexes,
        });
    }
    Ok(tables)
}

/// Exact row count of one table.
///
/// # Errors
///
/// Returns [`Error::Database`] on failure.
pub async fn count_rows(source: &mut PgConnection, table: &Table) -> Result<u64> {
    let count: i64 = sqlx::query_scalar(&format!("SELECT count(*) FROM {}", table.qualified()))
        .fetch_one(&mut *source)
        .await?;
    Ok(count.max(0) as u64)
}

/// Counts written by the data step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataCounts {
    /// Tables created.
    pub tables: u64,
    /// Views created.
    pub views: u64,
    /// Rows copied.
    pub records: u64,
}

/// Recreates the catalog in the target and copies every row.
///
/// `target` is expected to be inside a transaction; view retries use
/// savepoints.
///
/// # Errors
///
/// Returns the first failing statement's error, or [`Error::Loading`] listing
/// views whose dependencies could not be satisfied.
pub async fn copy_data(
    source: &mut PgConnection,
    target: &mut PgConnection,
    catalog: &Catalog,
    batch_size: usize,
    progress: &dyn Progress,
) -> Result<DataCounts> {
    let mut counts = DataCounts::default();

    for statement in catalog.prelude_sql() {
        execute(target, &statement).await?;
    }

    progress.phase_started(TABLES_PHASE, Some(catalog.tables.len() as u64));
    for table in &catalog.tables {
        execute(target, &table.create_sql()).await?;
        counts.tables += 1;
        progress.phase_advanced(TABLES_PHASE, 1);
    }
    progress.phase_finished(TABLES_PHASE);

    progress.phase_started(RECORDS_PHASE, None);
    for table in &catalog.tables {
        counts.records += copy_rows(source, target, table, batch_size, progress).await?;
    }
    progress.phase_finished(RECORDS_PHASE);

    for sequence in &catalog.sequences {
        if let Some(sql) = sequence.setval_sql() {
            execute(target, &sql).await?;
        }
    }
    for table in &catalog.tables {
        for sql in table.identity_resync_sql() {
            execute(target, &sql).await?;
        }
        for sql in table.index_sql() {
            execute(target, &sql).await?;
        }
    }
    for table in &catalog.tables {
        for sql in table.foreign_key_sql(&catalog.schemas) {
            execute(target, &sql).await?;
        }
    }

    counts.views = create_views(target, &catalog.views).await?;

    info!(
        tables = counts.tables,
        views = counts.views,
        records = counts.records,
        "Copied relational data"
    );
    Ok(counts)
}

/// Streams one table's rows in batches of `batch_size`.
async fn copy_rows(
    source: &mut PgConnection,
    target: &mut PgConnection,
    table: &Table,
    batch_size: usize,
    progress: &dyn Progress,
) -> Result<u64> {
    let select = format!("SELECT row_to_json(t)::text FROM {} t", table.qualified());
    let insert = table.insert_sql();
    let mut rows = sqlx::query_scalar::<_, String>(&select).fetch(&mut *source);
    let mut batch: Vec<String> = Vec::with_capacity(batch_size);
    let mut copied = 0u64;

    while let Some(row) = rows.try_next().await? {
        batch.push(row);
        if batch.len() >= batch_size {
            copied += flush_rows(target, table, &insert, &mut batch).await?;
            progress.phase_advanced(RECORDS_PHASE, batch_size as u64);
        }
    }
    if !batch.is_empty() {
        let remaining = batch.len() as u64;
        copied += flush_rows(target, table, &insert, &mut batch).await?;
        progress.phase_advanced(RECORDS_PHASE, remaining);
    }

    debug!(table = %table.qualified(), rows = copied, "Copied rows");
    Ok(copied)
}

async fn flush_rows(
    target: &mut PgConnection,
    table: &Table,
    insert: &str,
    batch: &mut Vec<String>,
) -> Result<u64> {
    let payload = format!("[{}]", batch.join(","));
    let result = sqlx::query(insert)
        .bind(payload)
        .execute(&mut *target)
        .await
        .map_err(|e| Error::Loading(format!("{insert}: {e}")))?;
    let written = check_written(table, batch.len() as u64, result.rows_affected())?;
    batch.clear();
    Ok(written)
}

/// Fails when the target took fewer rows than it was sent.
fn check_written(table: &Table, sent: u64, written: u64) -> Result<u64> {
    if written < sent {
        return Err(Error::Loading(format!(
            "{}: target accepted {written} of {sent} rows; {} were dropped",
            table.qualified(),
            sent - written
        )));
    }
    Ok(sent)
}

/// Creates views in dependency order by retrying failures in later passes.
async fn create_views(target: &mut PgConnection, views: &[View]) -> Result<u64> {
    let mut pending: Vec<&View> = views.iter().collect();
    let mut created = 0u64;
    let mut last_errors: Vec<String> = Vec::new();

    for pass in 0..VIEW_PASSES {
        if pending.is_empty() {
            break;
        }
        let mut failed = Vec::new();
        let mut progressed = false;
        last_errors.clear();
        for view in pending {
            let mut savepoint = target.begin().await?;
            match sqlx::Executor::execute(&mut *savepoint, sqlx::raw_sql(&view.create_sql())).await {
                Ok(_) => {
                    savepoint.commit().await?;
                    created += 1;
                    progressed = true;
                }
                Err(e) => {
                    savepoint.rollback().await?;
                    last_errors.push(format!("{}.{}: {e}", view.schema, view.name));
                    failed.push(view);
                }
            }
        }
        pending = failed;
        if !progressed {
            break;
        }
        if !pending.is_empty() {
            debug!(pass, remaining = pending.len(), "Retrying views with unmet dependencies");
        }
    }

    if !pending.is_empty() {
        warn!(views = pending.len(), "Some views could not be recreated");
        return Err(Error::Loading(format!(
            "could not recreate {} view(s): {}",
            pending.len(),
            last_errors.join("; ")
        )));
    }
    Ok(created)
}

async fn execute(target: &mut PgConnection, sql: &str) -> Result<()> {
    sqlx::Executor::execute(&mut *target, sqlx::raw_sql(sql))
        .await
        .map_err(|e| Error::Loading(format!("{}: {e}", first_line(sql))))?;
    Ok(())
}

fn first_line(sql: &str) -> &str {
    sql.lines().next().unwrap_or(sql)
}

/// Schemas referenced by foreign keys but not migrated (typically `auth`).
#[must_use]
pub fn external_references(catalog: &Catalog) -> HashSet<String> {
    catalog
        .tables
        .iter()
        .flat_map(|t| t.foreign_keys.iter())
        .filter(|fk| !catalog.schemas.contains(&fk.referenced_schema))
        .map(|fk| fk.referenced_schema.clone())
        .collect()
}

#[cfg(test)]
#[path = "schema_tests.rs"]
mod tests;
