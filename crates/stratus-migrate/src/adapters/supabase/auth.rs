//! Supabase `auth.users` and `auth.identities` transfer.
//!
//! Column sets differ between Supabase releases (`is_anonymous` and
//! `identities.provider_id` are recent additions), so the select lists are
//! built from what the source actually has.

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::PgConnection;
use std::collections::HashSet;
use tracing::debug;

use crate::adapters::common::normalize_provider;
use crate::error::Result;
use crate::progress::Progress;
use crate::target::{self, HashFormat, IdentityRecord, UpsertCounts, UserRecord};

/// Progress phase for users.
pub const USERS_PHASE: &str = "users";
/// Progress phase for identities.
pub const IDENTITIES_PHASE: &str = "identities";

/// Which optional auth columns the source has.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthColumns {
    users: HashSet<String>,
    identities: HashSet<String>,
}

impl AuthColumns {
    /// Reads the column sets of `auth.users` and `auth.identities`. Missing
    /// tables yield empty sets.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Database`] on failure.
    pub async fn load(source: &mut PgConnection) -> Result<Self> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT table_name::text, column_name::text FROM information_schema.columns \
             WHERE table_schema = 'auth' AND table_name IN ('users', 'identities')",
        )
        .fetch_all(&mut *source)
        .await?;

        let mut columns = Self::default();
        for (table, column) in rows {
            match table.as_str() {
                "users" => columns.users.insert(column),
                _ => columns.identities.insert(column),
            };
        }
        Ok(columns)
    }

    /// Builds a column set directly, for tests.
    #[cfg(test)]
    pub(crate) fn from_names(users: &[&str], identities: &[&str]) -> Self {
        Self {
            users: users.iter().map(|s| (*s).to_string()).collect(),
            identities: identities.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    /// Whether `auth.users` exists.
    #[must_use]
    pub fn has_users(&self) -> bool {
        !self.users.is_empty()
    }

    /// Whether `auth.identities` exists.
    #[must_use]
    pub fn has_identities(&self) -> bool {
        !self.identities.is_empty()
    }

    fn user_col(&self, column: &str, present: &str, fallback: &str) -> String {
        if self.users.contains(column) {
            present.to_string()
        } else {
            fallback.to_string()
        }
    }

    fn anonymous_filter(&self, alias: &str, include_anonymous: bool) -> String {
        if include_anonymous || !self.users.contains("is_anonymous") {
            String::new()
        } else {
            format!(" AND NOT coalesce({alias}.is_anonymous, false)")
        }
    }

    /// Select list for users.
    #[must_use]
    pub fn users_sql(&self, include_anonymous: bool) -> String {
        let verified = if self.users.contains("email_confirmed_at") {
            "(u.email_confirmed_at IS NOT NULL)"
        } else if self.users.contains("confirmed_at") {
            "(u.confirmed_at IS NOT NULL)"
        } else {
            "false"
        };
        format!(
            "SELECT u.id::text AS id, u.email::text AS email, {phone} AS phone, \
             u.encrypted_password::text AS password_hash, {verified} AS email_verified, \
             {anonymous} AS is_anonymous, {disabled} AS disabled, \
             {user_meta} AS user_metadata, {app_meta} AS app_metadata, \
             u.created_at, u.updated_at, u.last_sign_in_at \
             FROM auth.users u WHERE true{filter} ORDER BY u.created_at NULLS FIRST, u.id",
            phone = self.user_col("phone", "u.phone::text", "NULL::text"),
            anonymous = self.user_col("is_anonymous", "coalesce(u.is_anonymous, false)", "false"),
            disabled = self.user_col(
                "banned_until",
                "coalesce(u.banned_until > now(), false)",
                "false"
            ),
            user_meta = self.user_col("raw_user_meta_data", "u.raw_user_meta_data", "NULL::jsonb"),
            app_meta = self.user_col("raw_app_meta_data", "u.raw_app_meta_data", "NULL::jsonb"),
            filter = self.anonymous_filter("u", include_anonymous),
        )
    }

    /// Count query matching [`AuthColumns::users_sql`].
    #[must_use]
    pub fn users_count_sql(&self, include_anonymous: bool) -> String {
        format!(
            "SELECT count(*) FROM auth.users u WHERE true{}",
            self.anonymous_filter("u", include_anonymous)
        )
    }

    /// Select list for non-email/phone identities of imported users.
    ///
    /// Newer releases key identities by UUID with the provider subject in
    /// `provider_id`; older ones keyed them by `(provider, id)` with the
    /// subject in `id`.
    #[must_use]
    pub fn identities_sql(&self, include_anonymous: bool) -> String {
        let (id, subject) = if self.identities.contains("provider_id") {
            ("i.id::text", "i.provider_id::text")
        } else {
            ("i.provider || ':' || i.id::text", "i.id::text")
        };
        let email = if self.identities.contains("email") {
            "i.email::text"
        } else {
            "i.identity_data ->> 'email'"
        };
        format!(
            "SELECT {id} AS id, i.user_id::text AS user_id, i.provider::text AS provider, \
             {subject} AS provider_user_id, {email} AS email, i.identity_data, i.created_at \
             FROM auth.identities i JOIN auth.users u ON u.id = i.user_id \
             WHERE i.provider NOT IN ('email', 'phone'){filter} ORDER BY i.created_at NULLS FIRST",
            filter = self.anonymous_filter("u", include_anonymous),
        )
    }

    /// Count query matching [`AuthColumns::identities_sql`].
    #[must_use]
    pub fn identities_count_sql(&self, include_anonymous: bool) -> String {
        format!(
            "SELECT count(*) FROM auth.identities i JOIN auth.users u ON u.id = i.user_id \
             WHERE i.provider NOT IN ('email', 'phone'){}",
            self.anonymous_filter("u", include_anonymous)
        )
    }
}

#[derive(sqlx::FromRow)]
struct AuthUserRow {
    id: String,
    email: Option<String>,
    phone: Option<String>,
    password_hash: Option<String>,
    email_verified: bool,
    is_anonymous: bool,
    disabled: bool,
    user_metadata: Option<Value>,
    app_metadata: Option<Value>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    last_sign_in_at: Option<DateTime<Utc>>,
}

impl From<AuthUserRow> for UserRecord {
    fn from(row: AuthUserRow) -> Self {
        let user_metadata = row.user_metadata.unwrap_or_else(|| Value::Object(Default::default()));
        let meta_str = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| user_metadata.get(*k).and_then(Value::as_str))
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let display_name = meta_str(&["full_name", "name", "display_name"]);
        let avatar_url = meta_str(&["avatar_url", "picture"]);

        Self {
            id: row.id,
            email: row.email.filter(|s| !s.is_empty()),
            phone: row.phone.filter(|s| !s.is_empty()),
            password_hash: row.password_hash.filter(|s| !s.is_empty()),
            password_hash_format: HashFormat::Bcrypt,
            password_hash_params: None,
            email_verified: row.email_verified,
            is_anonymous: row.is_anonymous,
            disabled: row.disabled,
            display_name,
            avatar_url,
            user_metadata,
            app_metadata: row
                .app_metadata
                .unwrap_or_else(|| Value::Object(Default::default())),
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_sign_in_at: row.last_sign_in_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct IdentityRow {
    id: String,
    user_id: String,
    provider: String,
    provider_user_id: String,
    email: Option<String>,
    identity_data: Option<Value>,
    created_at: Option<DateTime<Utc>>,
}

impl From<IdentityRow> for IdentityRecord {
    fn from(row: IdentityRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            provider: normalize_provider(&row.provider),
            provider_user_id: row.provider_user_id,
            email: row.email.filter(|s| !s.is_empty()),
            identity_data: row
                .identity_data
                .unwrap_or_else(|| Value::Object(Default::default())),
            created_at: row.created_at,
        }
    }
}

/// Counts users that will be imported.
///
/// # Errors
///
/// Returns [`crate::Error::Database`] on failure.
pub async fn count_users(
    source: &mut PgConnection,
    columns: &AuthColumns,
    include_anonymous: bool,
) -> Result<u64> {
    if !columns.has_users() {
        return Ok(0);
    }
    let count: i64 = sqlx::query_scalar(&columns.users_count_sql(include_anonymous))
        .fetch_one(&mut *source)
        .await?;
    Ok(count.max(0) as u64)
}

/// Counts identities that will be imported.
///
/// # Errors
///
/// Returns [`crate::Error::Database`] on failure.
pub async fn count_identities(
    source: &mut PgConnection,
    columns: &AuthColumns,
    include_anonymous: bool,
) -> Result<u64> {
    if !columns.has_users() || !columns.has_identities() {
        return Ok(0);
    }
    let count: i64 = sqlx::query_scalar(&columns.identities_count_sql(include_anonymous))
        .fetch_one(&mut *source)
        .await?;
    Ok(count.max(0) as u64)
}

/// Streams users into the target in batches. With no target (dry run) the
/// rows are read and converted but nothing is written.
///
/// # Errors
///
/// Returns [`crate::Error::Database`] on failure.
pub async fn copy_users(
    source: &mut PgConnection,
    mut target: Option<&mut PgConnection>,
    columns: &AuthColumns,
    include_anonymous: bool,
    batch_size: usize,
    progress: &dyn Progress,
) -> Result<UpsertCounts> {
    let mut counts = UpsertCounts::default();
    if !columns.has_users() {
        return Ok(counts);
    }

    let sql = columns.users_sql(include_anonymous);
    let mut rows = sqlx::query_as::<_, AuthUserRow>(&sql).fetch(&mut *source);
    let mut batch: Vec<UserRecord> = Vec::with_capacity(batch_size);

    progress.phase_started(USERS_PHASE, None);
    while let Some(row) = rows.try_next().await? {
        batch.push(row.into());
        if batch.len() >= batch_size {
            counts += flush_users(target.as_deref_mut(), &mut batch, progress).await?;
        }
    }
    counts += flush_users(target.as_deref_mut(), &mut batch, progress).await?;
    progress.phase_finished(USERS_PHASE);

    debug!(created = counts.created, updated = counts.updated, "Copied auth users");
    Ok(counts)
}

async fn flush_users(
    target: Option<&mut PgConnection>,
    batch: &mut Vec<UserRecord>,
    progress: &dyn Progress,
) -> Result<UpsertCounts> {
    if batch.is_empty() {
        return Ok(UpsertCounts::default());
    }
    let counts = match target {
        Some(conn) => target::upsert_users(conn, batch).await?,
        None => UpsertCounts::default(),
    };
    progress.phase_advanced(USERS_PHASE, batch.len() as u64);
    batch.clear();
    Ok(counts)
}

/// Streams identities into the target in batches.
///
/// # Errors
///
/// Returns [`crate::Error::Database`] on failure.
pub async fn copy_identities(
    source: &mut PgConnection,
    mut target: Option<&mut PgConnection>,
    columns: &AuthColumns,
    include_anonymous: bool,
    batch_size: usize,
    progress: &dyn Progress,
) -> Result<u64> {
    if !columns.has_users() || !columns.has_identities() {
        return Ok(0);
    }

    let sql = columns.identities_sql(include_anonymous);
    let mut rows = sqlx::query_as::<_, IdentityRow>(&sql).fetch(&mut *source);
    let mut batch: Vec<IdentityRecord> = Vec::with_capacity(batch_size);
    let mut written = 0;

    progress.phase_started(IDENTITIES_PHASE, None);
    while let Some(row) = rows.try_next().await? {
        batch.push(row.into());
        if batch.len() >= batch_size {
            written += flush_identities(target.as_deref_mut(), &mut batch, progress).await?;
        }
    }
    written += flush_identities(target.as_deref_mut(), &mut batch, progress).await?;
    progress.phase_finished(IDENTITIES_PHASE);

    debug!(written, "Copied OAuth identities");
    Ok(written)
}

async fn flush_identities(
    target: Option<&mut PgConnection>,
    batch: &mut Vec<IdentityRecord>,
    progress: &dyn Progress,
) -> Result<u64> {
    if batch.is_empty() {
        return Ok(0);
    }
    let written = match target {
        Some(conn) => target::upsert_identities(conn, batch).await?,
        None => 0,
    };
    progress.phase_advanced(IDENTITIES_PHASE, batch.len() as u64);
    batch.clear();
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_users_sql_current_release() {
        let columns = AuthColumns::from_names(
            &["id", "email", "phone", "email_confirmed_at", "is_anonymous", "banned_until",
              "raw_user_meta_data", "raw_app_meta_data"],
            &["id", "provider_id", "email"],
        );
        let sql = columns.users_sql(false);
        assert!(sql.contains("u.phone::text AS phone"));
        assert!(sql.contains("(u.email_confirmed_at IS NOT NULL) AS email_verified"));
        assert!(sql.contains("coalesce(u.is_anonymous, false) AS is_anonymous"));
        assert!(sql.contains("WHERE true AND NOT coalesce(u.is_anonymous, false)"));

        assert!(!columns.users_sql(true).contains("AND NOT coalesce"));
    }

    #[test]
    fn test_users_sql_older_release_without_anonymous_column() {
        let columns = AuthColumns::from_names(&["id", "email", "confirmed_at"], &["id"]);
        let sql = columns.users_sql(false);
        assert!(sql.contains("false AS is_anonymous"));
        assert!(sql.contains("NULL::text AS phone"));
        assert!(sql.contains("(u.confirmed_at IS NOT NULL) AS email_verified"));
        assert!(sql.contains("WHERE true ORDER BY"));
    }

    #[test]
    fn test_identities_sql_keys() {
        let current = AuthColumns::from_names(&["id"], &["id", "provider_id", "email"]);
        let sql = current.identities_sql(true);
        assert!(sql.contains("i.id::text AS id"));
        assert!(sql.contains("i.provider_id::text AS provider_user_id"));
        assert!(sql.contains("NOT IN ('email', 'phone')"));

        let legacy = AuthColumns::from_names(&["id"], &["id", "provider"]);
        let sql = legacy.identities_sql(true);
        assert!(sql.contains("i.provider || ':' || i.id::text AS id"));
        assert!(sql.contains("i.id::text AS provider_user_id"));
        assert!(sql.contains("i.identity_data ->> 'email' AS email"));
    }

    #[test]
    fn test_user_row_conversion_preserves_id_and_hash() {
        let row = AuthUserRow {
            id: "7c9e6679-7425-40de-944b-e07fc1f90ae7".to_string(),
            email: Some("ada@example.com".to_string()),
            phone: Some(String::new()),
            password_hash: Some("$2a$10$abcdefghijklmnopqrstuuJ3c4eSgm2QmdVZ6Z2Tj7lR1ZrN9y2".to_string()),
            email_verified: true,
            is_anonymous: false,
            disabled: false,
            user_metadata: Some(json!({"full_name": "Ada", "avatar_url": "https://x/a.png"})),
            app_metadata: None,
            created_at: None,
            updated_at: None,
            last_sign_in_at: None,
        };
        let user: UserRecord = row.into();
        assert_eq!(user.id, "7c9e6679-7425-40de-944b-e07fc1f90ae7");
        assert_eq!(
            user.password_hash.as_deref(),
            Some("$2a$10$abcdefghijklmnopqrstuuJ3c4eSgm2QmdVZ6Z2Tj7lR1ZrN9y2")
        );
        assert_eq!(user.password_hash_format, HashFormat::Bcrypt);
        assert_eq!(user.phone, None);
        assert_eq!(user.display_name.as_deref(), Some("Ada"));
        assert_eq!(user.avatar_url.as_deref(), Some("https://x/a.png"));
        assert_eq!(user.app_metadata, json!({}));
    }

    #[test]
    fn test_identity_row_conversion_normalizes_provider() {
        let row = IdentityRow {
            id: "b1".to_string(),
            user_id: "u1".to_string(),
            provider: "github".to_string(),
            provider_user_id: "12345".to_string(),
            email: Some("ada@example.com".to_string()),
            identity_data: None,
            created_at: None,
        };
        let identity: IdentityRecord = row.into();
        assert_eq!(identity.id, "b1");
        assert_eq!(identity.provider, "github");
        assert_eq!(identity.identity_data, json!({}));
    }
}
