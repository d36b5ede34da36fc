//! Target-side schema bootstrap and batch writers.
//!
//! Every adapter funnels users, identities and documents through the writers
//! here, so the target layout is defined in exactly one place. All writers are
//! upserts keyed on preserved source identifiers, which is what makes re-runs
//! duplicate-free.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgConnectOptions;
use sqlx::types::Json;
use sqlx::{Connection, PgConnection, Postgres, QueryBuilder};
use std::collections::HashMap;
use std::hash::Hash;
use tracing::{debug, info};

use crate::config::parse_pg_url;
use crate::error::{Error, Result};
use crate::retry::{with_retry, Backoff};

/// Postgres caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

/// Postgres truncates identifiers longer than this many bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Idempotent DDL for the target's auth schema.
pub const BOOTSTRAP_SQL: &str = r#"
CREATE SCHEMA IF NOT EXISTS auth;

CREATE TABLE IF NOT EXISTS auth.users (
    id TEXT PRIMARY KEY,
    email TEXT,
    phone TEXT,
    password_hash TEXT,
    password_hash_format TEXT NOT NULL DEFAULT 'bcrypt',
    password_hash_params JSONB,
    email_verified BOOLEAN NOT NULL DEFAULT false,
    is_anonymous BOOLEAN NOT NULL DEFAULT false,
    disabled BOOLEAN NOT NULL DEFAULT false,
    display_name TEXT,
    avatar_url TEXT,
    user_metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    app_metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_sign_in_at TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS users_email_idx ON auth.users (lower(email));

CREATE TABLE IF NOT EXISTS auth.oauth_identities (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES auth.users (id) ON DELETE CASCADE,
    provider TEXT NOT NULL,
    provider_user_id TEXT NOT NULL,
    email TEXT,
    identity_data JSONB NOT NULL DEFAULT '{}'::jsonb,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (provider, provider_user_id)
);

CREATE INDEX IF NOT EXISTS oauth_identities_user_id_idx ON auth.oauth_identities (user_id);
"#;

/// How a stored password hash must be verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashFormat {
    /// Native bcrypt hash.
    Bcrypt,
    /// Firebase modified-scrypt hash, verified with per-user parameters and
    /// re-hashed on first successful login.
    FirebaseScrypt,
}

impl HashFormat {
    /// Marker stored in `auth.users.password_hash_format`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bcrypt => "bcrypt",
            Self::FirebaseScrypt => "firebase-scrypt",
        }
    }
}

/// A user row for `auth.users`.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    /// Source user ID, carried verbatim.
    pub id: String,
    /// Email address.
    pub email: Option<String>,
    /// Phone number.
    pub phone: Option<String>,
    /// Password hash, carried verbatim.
    pub password_hash: Option<String>,
    /// Hash algorithm marker.
    pub password_hash_format: HashFormat,
    /// Per-user verification parameters for foreign hashes.
    pub password_hash_params: Option<Value>,
    /// Whether the email address was verified.
    pub email_verified: bool,
    /// Anonymous account.
    pub is_anonymous: bool,
    /// Account disabled.
    pub disabled: bool,
    /// Display name.
    pub display_name: Option<String>,
    /// Avatar URL.
    pub avatar_url: Option<String>,
    /// User-editable metadata.
    pub user_metadata: Value,
    /// Server-controlled metadata.
    pub app_metadata: Value,
    /// Creation time.
    pub created_at: Option<DateTime<Utc>>,
    /// Last update time.
    pub updated_at: Option<DateTime<Utc>>,
    /// Last sign-in time.
    pub last_sign_in_at: Option<DateTime<Utc>>,
}

impl UserRecord {
    /// A user with the given ID and every other field empty.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
            phone: None,
            password_hash: None,
            password_hash_format: HashFormat::Bcrypt,
            password_hash_params: None,
            email_verified: false,
            is_anonymous: false,
            disabled: false,
            display_name: None,
            avatar_url: None,
            user_metadata: Value::Object(serde_json::Map::new()),
            app_metadata: Value::Object(serde_json::Map::new()),
            created_at: None,
            updated_at: None,
            last_sign_in_at: None,
        }
    }
}

/// A linked OAuth identity for `auth.oauth_identities`.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityRecord {
    /// Identity ID, preserved or derived deterministically.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Normalized provider name (`google`, `github`, ...).
    pub provider: String,
    /// Subject ID at the provider.
    pub provider_user_id: String,
    /// Email reported by the provider.
    pub email: Option<String>,
    /// Raw provider payload.
    pub identity_data: Value,
    /// Link time.
    pub created_at: Option<DateTime<Utc>>,
}

/// A schemaless document row.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRecord {
    /// Document ID, preserved from the source.
    pub id: String,
    /// Document body.
    pub data: Value,
    /// Creation time, when the source records one.
    pub created_at: Option<DateTime<Utc>>,
    /// Last update time, when the source records one.
    pub updated_at: Option<DateTime<Utc>>,
}

/// Outcome of a user upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertCounts {
    /// Rows inserted.
    pub created: u64,
    /// Rows that already existed and were refreshed.
    pub updated: u64,
}

impl std::ops::AddAssign for UpsertCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.created += rhs.created;
        self.updated += rhs.updated;
    }
}

/// Opens a single direct connection, retrying transient failures.
///
/// `wrap` turns the final driver error into the caller's error class.
pub(crate) async fn open_postgres(
    options: &PgConnectOptions,
    what: &'static str,
    wrap: fn(String) -> Error,
) -> Result<PgConnection> {
    let options = options.clone().application_name("stratus-migrate");
    with_retry(Backoff::for_connections(), what, move || {
        let options = options.clone();
        async move {
            PgConnection::connect_with(&options)
                .await
                .map_err(|e| wrap(e.to_string()))
        }
    })
    .await
}

/// Connects to the target database.
///
/// # Errors
///
/// Returns [`Error::Config`] for a malformed URL or
/// [`Error::TargetConnection`] when the server cannot be reached.
pub async fn connect(url: &str) -> Result<PgConnection> {
    let options = parse_pg_url(url, "target")?;
    let conn = open_postgres(&options, "target connect", Error::TargetConnection).await?;
    info!("Connected to target database");
    Ok(conn)
}

/// Creates the auth schema if it does not exist yet.
///
/// # Errors
///
/// Returns [`Error::Database`] on failure.
pub async fn ensure_schema(conn: &mut PgConnection) -> Result<()> {
    sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(BOOTSTRAP_SQL)).await?;
    Ok(())
}

/// Number of users already in the target. A missing `auth.users` counts as
/// empty.
///
/// # Errors
///
/// Returns [`Error::Database`] on failure.
pub async fn count_users(conn: &mut PgConnection) -> Result<i64> {
    let exists: bool = sqlx::query_scalar("SELECT to_regclass('auth.users') IS NOT NULL")
        .fetch_one(&mut *conn)
        .await?;
    if !exists {
        return Ok(0);
    }
    let count: i64 = sqlx::query_scalar("SELECT count(*) FROM auth.users")
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

/// Refuses to import into a target that already holds users, unless forced.
///
/// # Errors
///
/// Returns [`Error::TargetNotEmpty`] when users exist and `force` is unset.
pub async fn guard_empty(conn: &mut PgConnection, force: bool) -> Result<()> {
    let users = count_users(conn).await?;
    if users > 0 {
        if !force {
            return Err(Error::TargetNotEmpty { users });
        }
        info!(users, "Target already holds users; importing anyway (--force)");
    }
    Ok(())
}

/// Upserts users by ID.
///
/// # Errors
///
/// Returns [`Error::Database`] on failure.
pub async fn upsert_users(conn: &mut PgConnection, users: &[UserRecord]) -> Result<UpsertCounts> {
    const COLUMNS: usize = 16;
    let users = dedupe_last_by(users, |u| &u.id);
    let now = Utc::now();
    let mut counts = UpsertCounts::default();

    for chunk in users.chunks(rows_per_statement(COLUMNS)) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO auth.users (id, email, phone, password_hash, password_hash_format, \
             password_hash_params, email_verified, is_anonymous, disabled, display_name, \
             avatar_url, user_metadata, app_metadata, created_at, updated_at, last_sign_in_at) ",
        );
        qb.push_values(chunk.iter(), |mut row, u| {
            row.push_bind(&u.id)
                .push_bind(&u.email)
                .push_bind(&u.phone)
                .push_bind(&u.password_hash)
                .push_bind(u.password_hash_format.as_str())
                .push_bind(u.password_hash_params.as_ref().map(Json))
                .push_bind(u.email_verified)
                .push_bind(u.is_anonymous)
                .push_bind(u.disabled)
                .push_bind(&u.display_name)
                .push_bind(&u.avatar_url)
                .push_bind(Json(&u.user_metadata))
                .push_bind(Json(&u.app_metadata))
                .push_bind(u.created_at.unwrap_or(now))
                .push_bind(u.updated_at.or(u.created_at).unwrap_or(now))
                .push_bind(u.last_sign_in_at);
        });
        qb.push(
            " ON CONFLICT (id) DO UPDATE SET \
             email = EXCLUDED.email, phone = EXCLUDED.phone, \
             password_hash = EXCLUDED.password_hash, \
             password_hash_format = EXCLUDED.password_hash_format, \
             password_hash_params = EXCLUDED.password_hash_params, \
             email_verified = EXCLUDED.email_verified, is_anonymous = EXCLUDED.is_anonymous, \
             disabled = EXCLUDED.disabled, display_name = EXCLUDED.display_name, \
             avatar_url = EXCLUDED.avatar_url, user_metadata = EXCLUDED.user_metadata, \
             app_metadata = EXCLUDED.app_metadata, created_at = EXCLUDED.created_at, \
             updated_at = EXCLUDED.updated_at, last_sign_in_at = EXCLUDED.last_sign_in_at \
             RETURNING (xmax = 0) AS inserted",
        );

        let inserted: Vec<bool> = qb.build_query_scalar().fetch_all(&mut *conn).await?;
        let created = inserted.iter().filter(|i| **i).count() as u64;
        counts += UpsertCounts {
            created,
            updated: inserted.len() as u64 - created,
        };
    }

    debug!(created = counts.created, updated = counts.updated, "Upserted users");
    Ok(counts)
}

/// Upserts OAuth identities by ID. Returns the number of rows written.
///
/// # Errors
///
/// Returns [`Error::Database`] on failure, including an identity whose user
/// was not imported.
pub async fn upsert_identities(conn: &mut PgConnection, identities: &[IdentityRecord]) -> Result<u64> {
    const COLUMNS: usize = 7;
    let identities = dedupe_last_by(identities, |i| &i.id);
    let now = Utc::now();
    let mut written = 0;

    for chunk in identities.chunks(rows_per_statement(COLUMNS)) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO auth.oauth_identities \
             (id, user_id, provider, provider_user_id, email, identity_data, created_at) ",
        );
        qb.push_values(chunk.iter(), |mut row, i| {
            row.push_bind(&i.id)
                .push_bind(&i.user_id)
                .push_bind(&i.provider)
                .push_bind(&i.provider_user_id)
                .push_bind(&i.email)
                .push_bind(Json(&i.identity_data))
                .push_bind(i.created_at.unwrap_or(now));
        });
        qb.push(
            " ON CONFLICT (id) DO UPDATE SET \
             user_id = EXCLUDED.user_id, provider = EXCLUDED.provider, \
             provider_user_id = EXCLUDED.provider_user_id, email = EXCLUDED.email, \
             identity_data = EXCLUDED.identity_data",
        );
        written += qb.build().execute(&mut *conn).await?.rows_affected();
    }

    debug!(written, "Upserted OAuth identities");
    Ok(written)
}

/// Creates a document table and its GIN index if missing.
///
/// # Errors
///
/// Returns [`Error::Database`] on failure.
pub async fn ensure_document_table(conn: &mut PgConnection, table: &str) -> Result<()> {
    sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(&document_table_ddl(table)))
        .await?;
    Ok(())
}

/// DDL for one document table.
#[must_use]
pub fn document_table_ddl(table: &str) -> String {
    let index = truncate_identifier(&format!("{table}_data_gin"));
    format!(
        "CREATE TABLE IF NOT EXISTS public.{t} (\n    \
         id TEXT PRIMARY KEY,\n    \
         data JSONB NOT NULL,\n    \
         created_at TIMESTAMPTZ NOT NULL DEFAULT now(),\n    \
         updated_at TIMESTAMPTZ NOT NULL DEFAULT now()\n);\n\
         CREATE INDEX IF NOT EXISTS {i} ON public.{t} USING GIN (data jsonb_path_ops);",
        t = quote_ident(table),
        i = quote_ident(&index),
    )
}

/// Upserts documents into `public.<table>`. Returns the number of rows
/// written.
///
/// # Errors
///
/// Returns [`Error::Database`] on failure.
pub async fn upsert_documents(
    conn: &mut PgConnection,
    table: &str,
    documents: &[DocumentRecord],
) -> Result<u64> {
    const COLUMNS: usize = 4;
    let documents = dedupe_last_by(documents, |d| &d.id);
    let now = Utc::now();
    let mut written = 0;

    for chunk in documents.chunks(rows_per_statement(COLUMNS)) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO public.{} (id, data, created_at, updated_at) ",
            quote_ident(table)
        ));
        qb.push_values(chunk.iter(), |mut row, d| {
            row.push_bind(&d.id)
                .push_bind(Json(&d.data))
                .push_bind(d.created_at.unwrap_or(now))
                .push_bind(d.updated_at.or(d.created_at).unwrap_or(now));
        });
        qb.push(" ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data, updated_at = EXCLUDED.updated_at");
        written += qb.build().execute(&mut *conn).await?.rows_affected();
    }

    debug!(table, written, "Upserted documents");
    Ok(written)
}

/// Quotes an identifier for interpolation into SQL.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes a string literal for interpolation into SQL.
#[must_use]
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Turns an arbitrary collection name into a stable lowercase table name.
///
/// Characters outside `[a-z0-9_]` become `_`; a leading digit gets a `c_`
/// prefix; the result fits Postgres' identifier limit.
#[must_use]
pub fn sanitize_identifier(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() {
        out.push('_');
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert_str(0, "c_");
    }
    truncate_identifier(&out)
}

fn truncate_identifier(name: &str) -> String {
    if name.len() <= MAX_IDENTIFIER_LEN {
        return name.to_string();
    }
    let mut end = MAX_IDENTIFIER_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

fn rows_per_statement(columns: usize) -> usize {
    (MAX_BIND_PARAMS / columns).max(1)
}

/// Keeps the last occurrence of every key, in first-seen order.
///
/// A single `INSERT .. ON CONFLICT DO UPDATE` cannot touch the same row twice.
fn dedupe_last_by<T, K, F>(items: &[T], key: F) -> Vec<&T>
where
    K: Eq + Hash + ?Sized,
    F: Fn(&T) -> &K,
{
    let mut slots: HashMap<&K, usize> = HashMap::with_capacity(items.len());
    let mut out: Vec<&T> = Vec::with_capacity(items.len());
    for item in items {
        let k = key(item);
        match slots.get(k) {
            Some(&slot) => out[slot] = item,
            None => {
                slots.insert(k, out.len());
                out.push(item);
            }
        }
    }
    out
}
