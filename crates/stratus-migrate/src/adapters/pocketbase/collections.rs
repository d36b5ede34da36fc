//! PocketBase `_collections` catalog and record conversion.
//!
//! PocketBase 0.23 moved collection field definitions from a `schema` column
//! (with per-field `options`) to a flat `fields` column. Both layouts are
//! read into the same [`Collection`] model.

use serde_json::{json, Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::adapters::common::{normalize_provider, parse_timestamp, parse_timestamp_str, str_field};
use crate::error::{Error, Result};
use crate::storage::{CopyJob, FileEntry};
use crate::target::{
    quote_ident, quote_literal, sanitize_identifier, DocumentRecord, IdentityRecord, UserRecord,
};

/// Columns packed into one `json_object` call; SQLite caps function
/// arguments.
const COLUMNS_PER_OBJECT: usize = 40;

/// Auth columns that never go into user metadata.
const AUTH_SYSTEM_COLUMNS: &[&str] = &[
    "id",
    "email",
    "emailVisibility",
    "verified",
    "password",
    "passwordHash",
    "tokenKey",
    "created",
    "updated",
    "lastResetSentAt",
    "lastVerificationSentAt",
    "lastLoginAlertSentAt",
];

/// Where field definitions live in `_collections`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaLayout {
    /// `fields` column (0.23 and later).
    Fields,
    /// `schema` column with nested `options`.
    Legacy,
}

/// Collection type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    /// Plain records.
    Base,
    /// Records that are accounts.
    Auth,
    /// Read-only SQL view.
    View,
}

impl CollectionKind {
    fn parse(kind: &str) -> Option<Self> {
        match kind {
            "base" => Some(Self::Base),
            "auth" => Some(Self::Auth),
            "view" => Some(Self::View),
            _ => None,
        }
    }
}

/// One field definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Column name.
    pub name: String,
    /// PocketBase field type (`text`, `bool`, `relation`, ...).
    pub kind: String,
    /// Whether the column stores a JSON array of values.
    pub multi: bool,
}

/// A PocketBase collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    /// Collection ID, also the storage directory name.
    pub id: String,
    /// Collection name, also the SQLite table name.
    pub name: String,
    /// Collection type.
    pub kind: CollectionKind,
    /// Internal collections (`_superusers`, `_mfas`, ...).
    pub system: bool,
    /// Field definitions.
    pub fields: Vec<Field>,
}

impl Collection {
    /// Target document table.
    #[must_use]
    pub fn table(&self) -> String {
        sanitize_identifier(&self.name)
    }

    /// Whether the collection is imported.
    #[must_use]
    pub fn is_migrated(&self) -> bool {
        !self.system && matches!(self.kind, CollectionKind::Base | CollectionKind::Auth)
    }

    fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(sqlx::FromRow)]
struct CollectionRow {
    id: String,
    name: String,
    kind: String,
    system: bool,
    definition: Option<String>,
}

/// A row of `_externalAuths`.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ExternalAuth {
    /// Link ID.
    pub id: String,
    /// Auth collection of the linked record.
    #[sqlx(rename = "collectionId")]
    pub collection_id: String,
    /// Linked user record.
    #[sqlx(rename = "recordId")]
    pub record_id: String,
    /// Provider name.
    pub provider: String,
    /// Subject at the provider.
    #[sqlx(rename = "providerId")]
    pub provider_id: String,
    /// Creation time.
    pub created: Option<String>,
}

impl From<ExternalAuth> for IdentityRecord {
    fn from(link: ExternalAuth) -> Self {
        Self {
            identity_data: json!({
                "provider": link.provider,
                "providerId": link.provider_id,
                "collectionId": link.collection_id,
            }),
            created_at: link.created.as_deref().and_then(parse_timestamp_str),
            provider: normalize_provider(&link.provider),
            id: link.id,
            user_id: link.record_id,
            provider_user_id: link.provider_id,
            email: None,
        }
    }
}

async fn column_names(conn: &mut SqliteConnection, table: &str) -> Result<Vec<String>> {
    let names: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info(?)")
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;
    Ok(names)
}

/// Whether a table exists in the database.
///
/// # Errors
///
/// Returns [`Error::Database`] on failure.
pub async fn table_exists(conn: &mut SqliteConnection, table: &str) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_one(&mut *conn)
            .await?;
    Ok(count > 0)
}

/// Detects which `_collections` layout the database uses.
///
/// # Errors
///
/// Returns [`Error::Extraction`] when `_collections` is missing or has
/// neither layout.
pub async fn detect_layout(conn: &mut SqliteConnection) -> Result<SchemaLayout> {
    let columns = column_names(conn, "_collections").await?;
    if columns.iter().any(|c| c == "fields") {
        Ok(SchemaLayout::Fields)
    } else if columns.iter().any(|c| c == "schema") {
        Ok(SchemaLayout::Legacy)
    } else {
        Err(Error::Extraction(
            "data.db has no _collections table; is this a PocketBase data directory?".to_string(),
        ))
    }
}

/// Parses a collection's field definitions.
///
/// # Errors
///
/// Returns [`Error::Extraction`] when the definition is not a JSON array.
pub fn parse_fields(collection: &str, raw: &str, layout: SchemaLayout) -> Result<Vec<Field>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let defs: Vec<Value> = serde_json::from_str(raw).map_err(|e| {
        Error::Extraction(format!("invalid field definitions for collection {collection}: {e}"))
    })?;

    Ok(defs
        .iter()
        .filter_map(|def| {
            let name = str_field(def, "name")?;
            let kind = str_field(def, "type").unwrap_or_else(|| "text".to_string());
            let max_select = match layout {
                SchemaLayout::Fields => def.get("maxSelect"),
                SchemaLayout::Legacy => def.get("options").and_then(|o| o.get("maxSelect")),
            }
            .and_then(Value::as_u64);
            let multi = matches!(kind.as_str(), "select" | "file" | "relation")
                && match max_select {
                    Some(max) => max > 1,
                    // Legacy relations without a limit hold any number of IDs.
                    None => layout == SchemaLayout::Legacy && kind == "relation",
                };
            Some(Field { name, kind, multi })
        })
        .collect())
}

/// Reads every collection definition.
///
/// # Errors
///
/// Returns [`Error::Extraction`] for unreadable definitions, or a database
/// error.
pub async fn load_collections(conn: &mut SqliteConnection) -> Result<Vec<Collection>> {
    let layout = detect_layout(conn).await?;
    let definition = match layout {
        SchemaLayout::Fields => "fields",
        SchemaLayout::Legacy => "schema",
    };
    let rows: Vec<CollectionRow> = sqlx::query_as(&format!(
        "SELECT id, name, type AS kind, system, {definition} AS definition \
         FROM _collections ORDER BY name"
    ))
    .fetch_all(&mut *conn)
    .await?;

    let mut collections = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(kind) = CollectionKind::parse(&row.kind) else {
            tracing::warn!(collection = %row.name, kind = %row.kind, "Skipping collection of unknown type");
            continue;
        };
        let fields = parse_fields(&row.name, row.definition.as_deref().unwrap_or(""), layout)?;
        collections.push(Collection {
            id: row.id,
            name: row.name,
            kind,
            system: row.system,
            fields,
        });
    }
    Ok(collections)
}

/// Converts a stored value according to its field type.
#[must_use]
pub fn convert_value(field: Option<&Field>, value: Value) -> Value {
    let Some(field) = field else {
        return value;
    };
    match (field.kind.as_str(), value) {
        ("bool", Value::Number(n)) => Value::Bool(n.as_i64().unwrap_or(0) != 0),
        ("bool", Value::String(s)) => Value::Bool(matches!(s.as_str(), "1" | "true")),
        ("number", Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map_or(Value::Null, Value::Number),
        ("json", Value::String(s)) => {
            if s.trim().is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&s).unwrap_or(Value::String(s))
            }
        }
        ("select" | "file" | "relation", Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.starts_with('[') {
                if let Ok(list @ Value::Array(_)) = serde_json::from_str::<Value>(trimmed) {
                    return list;
                }
            }
            match (field.multi, trimmed.is_empty()) {
                (true, true) => Value::Array(Vec::new()),
                (true, false) => Value::Array(vec![Value::String(s)]),
                (false, _) => Value::String(s),
            }
        }
        (_, other) => other,
    }
}

/// `SELECT` returning each row as one or more JSON objects.
#[must_use]
pub fn select_sql(table: &str, columns: &[String]) -> String {
    let objects: Vec<String> = columns
        .chunks(COLUMNS_PER_OBJECT)
        .map(|chunk| {
            let pairs: Vec<String> = chunk
                .iter()
                .map(|c| format!("{}, {}", quote_literal(c), quote_ident(c)))
                .collect();
            format!("json_object({})", pairs.join(", "))
        })
        .collect();
    let order = if columns.iter().any(|c| c == "id") {
        " ORDER BY \"id\""
    } else {
        ""
    };
    format!("SELECT {} FROM {}{order}", objects.join(", "), quote_ident(table))
}

/// Query returning every row of a collection as JSON objects, one per
/// block of columns.
///
/// # Errors
///
/// Returns [`Error::Extraction`] when the collection has no table.
pub async fn record_query(conn: &mut SqliteConnection, collection: &Collection) -> Result<String> {
    let columns = column_names(conn, &collection.name).await?;
    if columns.is_empty() {
        return Err(Error::Extraction(format!(
            "collection {} has no table in data.db",
            collection.name
        )));
    }
    Ok(select_sql(&collection.name, &columns))
}

/// Merges the JSON objects of a [`record_query`] row.
///
/// # Errors
///
/// Returns [`Error::Extraction`] when a column is not a JSON object.
pub fn row_record(row: &SqliteRow) -> Result<Map<String, Value>> {
    let mut record = Map::new();
    for index in 0..row.len() {
        let raw: String = row.try_get(index)?;
        match serde_json::from_str::<Value>(&raw)? {
            Value::Object(part) => record.extend(part),
            other => {
                return Err(Error::Extraction(format!("unexpected row shape: {other}")));
            }
        }
    }
    Ok(record)
}

/// Number of rows in a collection's table.
///
/// # Errors
///
/// Returns [`Error::Database`] on failure.
pub async fn count_records(conn: &mut SqliteConnection, collection: &Collection) -> Result<u64> {
    let count: i64 = sqlx::query_scalar(&format!("SELECT count(*) FROM {}", quote_ident(&collection.name)))
        .fetch_one(&mut *conn)
        .await?;
    Ok(count.max(0) as u64)
}

fn take_id(collection: &Collection, record: &mut Map<String, Value>) -> Result<String> {
    match record.remove("id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id),
        _ => Err(Error::Extraction(format!(
            "record without id in collection {}",
            collection.name
        ))),
    }
}

fn take_timestamp(record: &mut Map<String, Value>, key: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    record.remove(key).as_ref().and_then(parse_timestamp)
}

/// Converts a base-collection row into a document.
///
/// # Errors
///
/// Returns [`Error::Extraction`] when the row has no ID.
pub fn record_document(collection: &Collection, mut record: Map<String, Value>) -> Result<DocumentRecord> {
    let id = take_id(collection, &mut record)?;
    let created_at = take_timestamp(&mut record, "created");
    let updated_at = take_timestamp(&mut record, "updated");
    let data = record
        .into_iter()
        .map(|(key, value)| {
            let converted = convert_value(collection.field(&key), value);
            (key, converted)
        })
        .collect();
    Ok(DocumentRecord {
        id,
        data: Value::Object(data),
        created_at,
        updated_at,
    })
}

/// Converts an auth-collection row into a user. The bcrypt hash is kept
/// verbatim; custom fields go into `user_metadata`.
///
/// # Errors
///
/// Returns [`Error::Extraction`] when the row has no ID.
pub fn record_user(collection: &Collection, mut record: Map<String, Value>) -> Result<UserRecord> {
    let id = take_id(collection, &mut record)?;
    let as_object = Value::Object(record.clone());
    let mut user = UserRecord::new(id);

    user.email = str_field(&as_object, "email");
    user.email_verified = match record.get("verified") {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    };
    user.password_hash =
        str_field(&as_object, "password").or_else(|| str_field(&as_object, "passwordHash"));
    user.display_name = str_field(&as_object, "name");
    user.created_at = record.get("created").and_then(parse_timestamp);
    user.updated_at = record.get("updated").and_then(parse_timestamp);

    let metadata: Map<String, Value> = record
        .into_iter()
        .filter(|(key, _)| !AUTH_SYSTEM_COLUMNS.contains(&key.as_str()))
        .map(|(key, value)| {
            let converted = convert_value(collection.field(&key), value);
            (key, converted)
        })
        .collect();
    user.user_metadata = Value::Object(metadata);
    user.app_metadata = json!({ "provider": "email", "collection": collection.name });
    Ok(user)
}

/// Maps the PocketBase storage tree onto the target layout:
/// `<collectionId>/<recordId>/<file>` becomes
/// `<collection name>/<recordId>/<file>`. Generated thumbnails are skipped,
/// as are files of collections that no longer exist.
///
/// Returns the plan and the number of orphaned files.
#[must_use]
pub fn storage_plan(entries: Vec<FileEntry>, collections: &[Collection]) -> (Vec<CopyJob>, u64) {
    let names: HashMap<&str, &str> = collections
        .iter()
        .map(|c| (c.id.as_str(), c.name.as_str()))
        .collect();
    let mut jobs = Vec::with_capacity(entries.len());
    let mut orphaned = 0;

    for entry in entries {
        let is_thumb = entry
            .relative
            .components()
            .any(|c| c.as_os_str().to_string_lossy().starts_with("thumbs_"));
        if is_thumb {
            continue;
        }
        let mut parts = entry.relative.components();
        let Some(first) = parts.next() else {
            continue;
        };
        let collection_id = first.as_os_str().to_string_lossy();
        let Some(name) = names.get(collection_id.as_ref()) else {
            orphaned += 1;
            continue;
        };
        let rest: &Path = parts.as_path();
        if rest.as_os_str().is_empty() {
            orphaned += 1;
            continue;
        }
        jobs.push(CopyJob {
            destination: PathBuf::from(name).join(rest),
            source: entry.source,
            size: entry.size,
        });
    }
    (jobs, orphaned)
}

#[cfg(test)]
#[path = "collections_tests.rs"]
mod tests;
