//! Firestore and Realtime Database export readers.
//!
//! Both stores land in document tables (`public.<table>(id, data, ...)`).
//! Readers here are blocking and callback-driven; the adapter runs them
//! through [`crate::json_stream::spawn_stream`].

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::adapters::common::parse_timestamp;
use crate::error::{Error, Result};
use crate::json_stream::{stream_children, stream_lines, stream_tree, EntryKey, TreeEntry};
use crate::target::{sanitize_identifier, DocumentRecord};

/// Fields that may carry a document's own ID in batched exports.
const EMBEDDED_ID_FIELDS: &[&str] = &["id", "_id", "__id__"];

const CREATED_FIELDS: &[&str] = &["createdAt", "created_at", "createTime"];
const UPDATED_FIELDS: &[&str] = &["updatedAt", "updated_at", "updateTime"];

/// Where a collection's documents are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionSource {
    /// Directories of `<docId>.json` files, each paired with the ID prefix of
    /// its parent documents (empty for top-level collections).
    Directories(Vec<(PathBuf, String)>),
    /// One JSON file holding an id → document map or an array of documents.
    Batched(PathBuf),
    /// One document per line.
    Lines(PathBuf),
}

/// A Firestore collection and the table it lands in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    /// Collection name; sub-collections are `<parent>_<sub>`.
    pub name: String,
    /// Target table.
    pub table: String,
    /// Document source.
    pub source: CollectionSource,
}

fn walk_error(path: &Path, e: impl std::fmt::Display) -> Error {
    Error::Extraction(format!("cannot read {}: {e}", path.display()))
}

/// Immediate children of `dir`, sorted by name.
fn children(dir: &Path) -> Result<Vec<walkdir::DirEntry>> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .map(|entry| entry.map_err(|e| walk_error(dir, e)))
        .collect()
}

fn file_name(entry: &walkdir::DirEntry) -> String {
    entry.file_name().to_string_lossy().into_owned()
}

/// Directories of one logical collection, keyed by its path pattern
/// (`posts`, `posts/*/comments`), with the collection name they import as.
type NestedCollections = BTreeMap<String, (String, Vec<(PathBuf, String)>)>;

fn collect_directory(
    name: String,
    pattern: String,
    dir: PathBuf,
    prefix: String,
    out: &mut NestedCollections,
) -> Result<()> {
    for document in children(&dir)? {
        if !document.file_type().is_dir() {
            continue;
        }
        let document_id = file_name(&document);
        for sub in children(document.path())? {
            if sub.file_type().is_dir() {
                let sub_name = file_name(&sub);
                collect_directory(
                    format!("{name}_{sub_name}"),
                    format!("{pattern}/*/{sub_name}"),
                    sub.path().to_path_buf(),
                    format!("{prefix}{document_id}/"),
                    out,
                )?;
            }
        }
    }
    out.entry(pattern)
        .or_insert_with(|| (name, Vec::new()))
        .1
        .push((dir, prefix));
    Ok(())
}

/// Lists the collections of a Firestore export directory.
///
/// # Errors
///
/// Returns [`Error::Extraction`] when the directory cannot be read, or when
/// two collections (say `posts_comments/` and `posts/*/comments/`) would
/// land in the same table.
pub fn discover_collections(root: &Path) -> Result<Vec<Collection>> {
    if !root.is_dir() {
        return Err(Error::Extraction(format!(
            "Firestore export {} is not a directory",
            root.display()
        )));
    }

    let mut nested = NestedCollections::new();
    let mut found: Vec<(String, Collection)> = Vec::new();

    for entry in children(root)? {
        let name = file_name(&entry);
        let path = entry.path().to_path_buf();
        if entry.file_type().is_dir() {
            collect_directory(name.clone(), name, path, String::new(), &mut nested)?;
            continue;
        }
        let (stem, ext) = match name.rsplit_once('.') {
            Some((stem, ext)) => (stem.to_string(), ext.to_ascii_lowercase()),
            None => continue,
        };
        let source = match ext.as_str() {
            "json" => CollectionSource::Batched(path),
            "jsonl" | "ndjson" => CollectionSource::Lines(path),
            _ => {
                debug!(file = %path.display(), "Ignoring non-JSON file in Firestore export");
                continue;
            }
        };
        found.push((
            name,
            Collection {
                table: sanitize_identifier(&stem),
                name: stem,
                source,
            },
        ));
    }

    found.extend(nested.into_iter().map(|(pattern, (name, dirs))| {
        (
            pattern,
            Collection {
                table: sanitize_identifier(&name),
                name,
                source: CollectionSource::Directories(dirs),
            },
        )
    }));
    check_table_collisions(
        found
            .iter()
            .map(|(origin, c)| (format!("Firestore collection '{origin}'"), c.table.as_str())),
    )?;

    let mut collections: Vec<Collection> = found.into_iter().map(|(_, c)| c).collect();
    collections.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(collections)
}

/// Fails when two sources would write into the same table.
///
/// Each item is `(label, table)`, where the label names the source for the
/// error message.
///
/// # Errors
///
/// Returns [`Error::Extraction`] naming both colliding sources.
pub fn check_table_collisions<'a>(
    sources: impl IntoIterator<Item = (String, &'a str)>,
) -> Result<()> {
    let mut seen: HashMap<&str, String> = HashMap::new();
    for (label, table) in sources {
        if let Some(previous) = seen.get(table) {
            return Err(Error::Extraction(format!(
                "{previous} and {label} both map to table \"{table}\"; rename one before migrating"
            )));
        }
        seen.insert(table, label);
    }
    Ok(())
}

/// Reads Firestore's `{"_seconds", "_nanoseconds"}` timestamps as well as the
/// shapes [`parse_timestamp`] understands.
fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    if let Value::Object(map) = value {
        let seconds = map
            .get("_seconds")
            .or_else(|| map.get("seconds"))
            .and_then(Value::as_i64)?;
        let nanos = map
            .get("_nanoseconds")
            .or_else(|| map.get("nanoseconds"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        return Utc.timestamp_opt(seconds, u32::try_from(nanos).unwrap_or(0)).single();
    }
    parse_timestamp(value)
}

fn first_timestamp(value: &Value, fields: &[&str]) -> Option<DateTime<Utc>> {
    fields.iter().find_map(|f| value.get(*f).and_then(timestamp))
}

/// Builds a document row. Non-object values are wrapped as `{"value": ..}`.
#[must_use]
pub fn document(id: String, value: Value) -> DocumentRecord {
    let created_at = first_timestamp(&value, CREATED_FIELDS);
    let updated_at = first_timestamp(&value, UPDATED_FIELDS);
    let data = if value.is_object() {
        value
    } else {
        json!({ "value": value })
    };
    DocumentRecord {
        id,
        data,
        created_at,
        updated_at,
    }
}

fn embedded_id(value: &Value) -> Option<String> {
    EMBEDDED_ID_FIELDS.iter().find_map(|f| match value.get(*f)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| walk_error(path, e))
}

/// Where each document ID of one collection came from. Two documents with
/// the same ID would collapse into one row.
struct SeenIds<'a> {
    collection: &'a str,
    origins: HashMap<String, String>,
}

impl<'a> SeenIds<'a> {
    fn new(collection: &'a str) -> Self {
        Self {
            collection,
            origins: HashMap::new(),
        }
    }

    fn claim(&mut self, id: &str, origin: impl FnOnce() -> String) -> Result<()> {
        if let Some(previous) = self.origins.get(id) {
            return Err(Error::Extraction(format!(
                "collection '{}': {previous} and {} both have document ID \"{id}\"",
                self.collection,
                origin()
            )));
        }
        self.origins.insert(id.to_string(), origin());
        Ok(())
    }
}

/// ID of an array or line entry: its embedded ID, else its position.
/// Returns the ID and `origin`, marked when the position was used.
fn positional_id(value: &Value, position: u64, origin: String) -> (String, String) {
    match embedded_id(value) {
        Some(id) => (id, origin),
        None => (position.to_string(), format!("{origin} (no id field)")),
    }
}

/// Reads every document of a collection.
///
/// # Errors
///
/// Returns [`Error::Extraction`] for unreadable or malformed files, when two
/// documents share an ID, or the callback's error.
pub fn read_collection(
    collection: &Collection,
    emit: &mut dyn FnMut(DocumentRecord) -> Result<()>,
) -> Result<u64> {
    let mut seen = SeenIds::new(&collection.name);
    match &collection.source {
        CollectionSource::Directories(dirs) => {
            let mut count = 0;
            for (dir, prefix) in dirs {
                for entry in children(dir)? {
                    let name = file_name(&entry);
                    let Some(stem) = name.strip_suffix(".json") else {
                        continue;
                    };
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let value: Value = serde_json::from_reader(open(entry.path())?).map_err(|e| {
                        Error::Extraction(format!("invalid JSON in {}: {e}", entry.path().display()))
                    })?;
                    let id = format!("{prefix}{stem}");
                    seen.claim(&id, || entry.path().display().to_string())?;
                    emit(document(id, value))?;
                    count += 1;
                }
            }
            Ok(count)
        }
        CollectionSource::Batched(path) => {
            stream_children(open(path)?, &collection.name, |entry| {
                let (id, origin) = match entry.key {
                    EntryKey::Name(key) => {
                        let origin = format!("{} key \"{key}\"", path.display());
                        (key, origin)
                    }
                    EntryKey::Index(index) => positional_id(
                        &entry.value,
                        index,
                        format!("{} item {index}", path.display()),
                    ),
                    EntryKey::Root => {
                        return Err(Error::Extraction(format!(
                            "{} must hold an object or an array of documents",
                            path.display()
                        )))
                    }
                };
                seen.claim(&id, || origin)?;
                emit(document(id, entry.value))
            })
        }
        CollectionSource::Lines(path) => {
            let mut index = 0u64;
            stream_lines(open(path)?, |value| {
                let origin = format!("{} document {}", path.display(), index + 1);
                let (id, origin) = positional_id(&value, index, origin);
                index += 1;
                seen.claim(&id, || origin)?;
                emit(document(id, value))
            })
        }
    }
}

/// Counts a collection's documents without keeping them.
///
/// # Errors
///
/// Same as [`read_collection`].
pub fn count_collection(collection: &Collection) -> Result<u64> {
    match &collection.source {
        CollectionSource::Directories(dirs) => {
            let mut count = 0;
            for (dir, _) in dirs {
                count += children(dir)?
                    .iter()
                    .filter(|e| e.file_type().is_file() && file_name(e).ends_with(".json"))
                    .count() as u64;
            }
            Ok(count)
        }
        _ => read_collection(collection, &mut |_| Ok(())),
    }
}

/// Target table of an RTDB top-level node.
#[must_use]
pub fn rtdb_table(node: &str) -> String {
    sanitize_identifier(node)
}

/// Converts an RTDB tree entry into `(table, document)`.
///
/// Object children keep their key, array children use their index and a
/// scalar node becomes one row keyed by the node name.
#[must_use]
pub fn rtdb_document(entry: TreeEntry) -> (String, DocumentRecord) {
    let id = match entry.key {
        EntryKey::Name(key) => key,
        EntryKey::Index(index) => index.to_string(),
        EntryKey::Root => entry.node.clone(),
    };
    (rtdb_table(&entry.node), document(id, entry.value))
}

/// Reads every RTDB record.
///
/// # Errors
///
/// Returns [`Error::Extraction`] for unreadable or malformed files, or the
/// callback's error.
pub fn read_rtdb(
    path: &Path,
    emit: &mut dyn FnMut((String, DocumentRecord)) -> Result<()>,
) -> Result<u64> {
    stream_tree(open(path)?, |entry| emit(rtdb_document(entry)))
}

/// Record counts per top-level RTDB node. Nodes without records are omitted.
///
/// # Errors
///
/// Same as [`read_rtdb`].
pub fn scan_rtdb(path: &Path) -> Result<BTreeMap<String, u64>> {
    let mut nodes: BTreeMap<String, u64> = BTreeMap::new();
    stream_tree(open(path)?, |entry| {
        *nodes.entry(entry.node).or_default() += 1;
        Ok(())
    })?;
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn collect(collection: &Collection) -> Vec<DocumentRecord> {
        let mut docs = Vec::new();
        read_collection(collection, &mut |d| {
            docs.push(d);
            Ok(())
        })
        .unwrap();
        docs
    }

    #[test]
    fn test_discover_collections_all_layouts() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "posts/p1.json", r#"{"title":"Hello"}"#);
        write(dir.path(), "posts/p1/comments/c1.json", r#"{"body":"Nice"}"#);
        write(dir.path(), "products.json", r#"{"sku1":{"price":3}}"#);
        write(dir.path(), "events.jsonl", "{\"id\":\"e1\"}\n");
        write(dir.path(), "README.txt", "not a collection");

        let collections = discover_collections(dir.path()).unwrap();

        let names: Vec<&str> = collections.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["events", "posts", "posts_comments", "products"]);
        assert!(matches!(collections[0].source, CollectionSource::Lines(_)));
        assert!(matches!(collections[3].source, CollectionSource::Batched(_)));
    }

    #[test]
    fn test_subcollection_ids_carry_parent_id() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "posts/p1.json", r#"{"title":"Hello"}"#);
        write(dir.path(), "posts/p1/comments/c1.json", r#"{"body":"Nice"}"#);
        write(dir.path(), "posts/p2/comments/c9.json", r#"{"body":"Orphan parent"}"#);

        let collections = discover_collections(dir.path()).unwrap();
        let comments = collections.iter().find(|c| c.name == "posts_comments").unwrap();

        let ids: Vec<String> = collect(comments).into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["p1/c1".to_string(), "p2/c9".to_string()]);
        assert_eq!(count_collection(comments).unwrap(), 2);

        let posts = collections.iter().find(|c| c.name == "posts").unwrap();
        assert_eq!(count_collection(posts).unwrap(), 1);
    }

    #[test]
    fn test_batched_array_uses_embedded_ids() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "users.json",
            r#"[{"id":"u1","name":"a"},{"_id":7},{"name":"anon"}]"#,
        );
        let collection = Collection {
            name: "users".to_string(),
            table: "users".to_string(),
            source: CollectionSource::Batched(dir.path().join("users.json")),
        };
        let ids: Vec<String> = collect(&collection).into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["u1", "7", "2"]);
    }

    #[test]
    fn test_positional_id_clashing_with_embedded_id_is_rejected() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "notes.json",
            r#"[{"body":"no id"},{"id":"0","body":"claims the first slot"}]"#,
        );
        let collection = Collection {
            name: "notes".to_string(),
            table: "notes".to_string(),
            source: CollectionSource::Batched(dir.path().join("notes.json")),
        };

        let mut emitted = 0;
        let err = read_collection(&collection, &mut |_| {
            emitted += 1;
            Ok(())
        })
        .unwrap_err();

        assert!(matches!(err, Error::Extraction(_)));
        let message = err.to_string();
        assert!(message.contains("collection 'notes'"), "{message}");
        assert!(message.contains("item 0 (no id field)"), "{message}");
        assert!(message.contains("item 1"), "{message}");
        assert!(message.contains("document ID \"0\""), "{message}");
        assert_eq!(emitted, 1);
        // Analysis reports the clash before anything is written.
        assert!(count_collection(&collection).is_err());
    }

    #[test]
    fn test_duplicate_ids_in_lines_are_rejected() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "events.jsonl", "{\"id\":\"e1\"}\n{\"id\":\"e2\"}\n{\"_id\":\"e1\"}\n");
        let collection = Collection {
            name: "events".to_string(),
            table: "events".to_string(),
            source: CollectionSource::Lines(dir.path().join("events.jsonl")),
        };

        let message = read_collection(&collection, &mut |_| Ok(())).unwrap_err().to_string();
        assert!(message.contains("document 1"), "{message}");
        assert!(message.contains("document 3"), "{message}");
    }

    #[test]
    fn test_distinct_positional_and_embedded_ids_are_kept() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "events.jsonl", "{\"kind\":\"a\"}\n{\"id\":\"e1\"}\n{\"kind\":\"b\"}\n");
        let collection = Collection {
            name: "events".to_string(),
            table: "events".to_string(),
            source: CollectionSource::Lines(dir.path().join("events.jsonl")),
        };
        let ids: Vec<String> = collect(&collection).into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["0", "e1", "2"]);
    }

    #[test]
    fn test_top_level_collection_clashing_with_subcollection_is_rejected() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "posts/p1.json", r#"{"title":"Hello"}"#);
        write(dir.path(), "posts/p1/comments/c1.json", r#"{"body":"Nice"}"#);
        write(dir.path(), "posts_comments/x1.json", r#"{"body":"Elsewhere"}"#);

        let err = discover_collections(dir.path()).unwrap_err();

        assert!(matches!(err, Error::Extraction(_)));
        let message = err.to_string();
        assert!(message.contains("'posts/*/comments'"), "{message}");
        assert!(message.contains("'posts_comments'"), "{message}");
        assert!(message.contains("table \"posts_comments\""), "{message}");
    }

    #[test]
    fn test_batched_file_clashing_with_directory_is_rejected() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "posts/p1.json", r#"{"title":"Hello"}"#);
        write(dir.path(), "posts.json", r#"{"p2":{"title":"Batched"}}"#);

        let message = discover_collections(dir.path()).unwrap_err().to_string();
        assert!(message.contains("'posts.json'"), "{message}");
        assert!(message.contains("'posts'"), "{message}");
    }

    #[test]
    fn test_batched_scalar_root_is_rejected() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "odd.json", "42");
        let collection = Collection {
            name: "odd".to_string(),
            table: "odd".to_string(),
            source: CollectionSource::Batched(dir.path().join("odd.json")),
        };
        let result = read_collection(&collection, &mut |_| Ok(()));
        assert!(matches!(result, Err(Error::Extraction(_))));
    }

    #[test]
    fn test_document_timestamps_and_wrapping() {
        let doc = document(
            "d1".to_string(),
            json!({"createdAt": {"_seconds": 1_700_000_000, "_nanoseconds": 0}, "updatedAt": "2024-01-01T00:00:00Z"}),
        );
        assert_eq!(doc.created_at.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(doc.updated_at.unwrap().timestamp(), 1_704_067_200);
        assert!(doc.data.get("createdAt").is_some());

        let scalar = document("d2".to_string(), json!(5));
        assert_eq!(scalar.data, json!({"value": 5}));
        assert!(scalar.created_at.is_none());
    }

    #[test]
    fn test_table_collisions() {
        assert!(check_table_collisions(vec![
            ("collection 'posts'".to_string(), "posts"),
            ("RTDB node 'scores'".to_string(), "scores"),
        ])
        .is_ok());

        let err = check_table_collisions(vec![
            ("collection 'User-Profiles'".to_string(), "user_profiles"),
            ("collection 'user profiles'".to_string(), "user_profiles"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("user_profiles"));
    }

    #[test]
    fn test_rtdb_records() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "rtdb.json",
            r#"{"scores":{"alice":10,"bob":7},"queue":[null,{"job":1},{"job":2}],"motd":"hi","empty":null}"#,
        );
        let path = dir.path().join("rtdb.json");

        let mut rows = Vec::new();
        read_rtdb(&path, &mut |row| {
            rows.push(row);
            Ok(())
        })
        .unwrap();

        let keys: Vec<(String, String)> = rows.iter().map(|(t, d)| (t.clone(), d.id.clone())).collect();
        assert_eq!(
            keys,
            vec![
                ("scores".to_string(), "alice".to_string()),
                ("scores".to_string(), "bob".to_string()),
                ("queue".to_string(), "1".to_string()),
                ("queue".to_string(), "2".to_string()),
                ("motd".to_string(), "motd".to_string()),
            ]
        );
        assert_eq!(rows[0].1.data, json!({"value": 10}));

        let nodes = scan_rtdb(&path).unwrap();
        assert_eq!(nodes.get("scores"), Some(&2));
        assert_eq!(nodes.get("queue"), Some(&2));
        assert_eq!(nodes.get("motd"), Some(&1));
        assert!(!nodes.contains_key("empty"));
    }
}
