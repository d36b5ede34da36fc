use super::*;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::Connection;
use tempfile::TempDir;

fn field(name: &str, kind: &str, multi: bool) -> Field {
    Field {
        name: name.to_string(),
        kind: kind.to_string(),
        multi,
    }
}

fn posts() -> Collection {
    Collection {
        id: "pbc_posts".to_string(),
        name: "posts".to_string(),
        kind: CollectionKind::Base,
        system: false,
        fields: vec![
            field("title", "text", false),
            field("published", "bool", false),
            field("tags", "select", true),
            field("author", "relation", false),
            field("meta", "json", false),
        ],
    }
}

fn users() -> Collection {
    Collection {
        id: "_pb_users_auth_".to_string(),
        name: "users".to_string(),
        kind: CollectionKind::Auth,
        system: false,
        fields: vec![field("name", "text", false), field("plan", "text", false)],
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

async fn sqlite(dir: &Path, statements: &[&str]) -> SqliteConnection {
    let options = SqliteConnectOptions::new()
        .filename(dir.join("data.db"))
        .create_if_missing(true);
    let mut conn = SqliteConnection::connect_with(&options).await.unwrap();
    for statement in statements {
        sqlx::query(statement).execute(&mut conn).await.unwrap();
    }
    conn
}

#[test]
fn test_parse_fields_flat_layout() {
    let raw = r#"[
        {"name":"title","type":"text"},
        {"name":"tags","type":"select","maxSelect":3},
        {"name":"owner","type":"relation","maxSelect":1},
        {"name":"avatar","type":"file"}
    ]"#;
    let fields = parse_fields("posts", raw, SchemaLayout::Fields).unwrap();
    let multi: Vec<(&str, bool)> = fields.iter().map(|f| (f.name.as_str(), f.multi)).collect();
    assert_eq!(
        multi,
        vec![("title", false), ("tags", true), ("owner", false), ("avatar", false)]
    );
}

#[test]
fn test_parse_fields_legacy_layout() {
    let raw = r#"[
        {"name":"tags","type":"select","options":{"maxSelect":2}},
        {"name":"friends","type":"relation","options":{"maxSelect":null}},
        {"name":"owner","type":"relation","options":{"maxSelect":1}}
    ]"#;
    let fields = parse_fields("posts", raw, SchemaLayout::Legacy).unwrap();
    assert!(fields[0].multi);
    assert!(fields[1].multi);
    assert!(!fields[2].multi);
}

#[test]
fn test_parse_fields_rejects_non_array() {
    let err = parse_fields("posts", "{}", SchemaLayout::Fields).unwrap_err();
    assert!(err.to_string().contains("posts"));
    assert!(parse_fields("posts", "  ", SchemaLayout::Fields).unwrap().is_empty());
}

#[test]
fn test_convert_value_by_field_type() {
    let collection = posts();
    let get = |name: &str| collection.field(name);

    assert_eq!(convert_value(get("published"), json!(1)), json!(true));
    assert_eq!(convert_value(get("published"), json!("0")), json!(false));
    assert_eq!(convert_value(get("meta"), json!(r#"{"a":1}"#)), json!({"a": 1}));
    assert_eq!(convert_value(get("meta"), json!("")), Value::Null);
    assert_eq!(convert_value(get("tags"), json!(r#"["a","b"]"#)), json!(["a", "b"]));
    assert_eq!(convert_value(get("tags"), json!("a")), json!(["a"]));
    assert_eq!(convert_value(get("tags"), json!("")), json!([]));
    assert_eq!(convert_value(get("author"), json!("u1")), json!("u1"));
    assert_eq!(convert_value(get("missing"), json!("x")), json!("x"));
}

#[test]
fn test_convert_number_field() {
    let number = field("score", "number", false);
    assert_eq!(convert_value(Some(&number), json!("2.5")), json!(2.5));
    assert_eq!(convert_value(Some(&number), json!("nope")), Value::Null);
    assert_eq!(convert_value(Some(&number), json!(7)), json!(7));
}

#[test]
fn test_select_sql_chunks_columns_and_orders_by_id() {
    let columns: Vec<String> = (0..45).map(|i| format!("c{i}")).chain(["id".to_string()]).collect();
    let sql = select_sql("posts", &columns);
    assert_eq!(sql.matches("json_object(").count(), 2);
    assert!(sql.contains("'c0', \"c0\""));
    assert!(sql.ends_with("FROM \"posts\" ORDER BY \"id\""));

    let unordered = select_sql("logs", &["message".to_string()]);
    assert!(!unordered.contains("ORDER BY"));
}

#[test]
fn test_record_document_splits_system_columns() {
    let record = object(json!({
        "id": "p1",
        "created": "2024-01-02 03:04:05.000Z",
        "updated": "2024-01-03 03:04:05.000Z",
        "title": "Hello",
        "published": 1,
        "tags": "[\"a\"]",
    }));

    let doc = record_document(&posts(), record).unwrap();

    assert_eq!(doc.id, "p1");
    assert_eq!(doc.data, json!({"title": "Hello", "published": true, "tags": ["a"]}));
    assert_eq!(doc.created_at.unwrap().to_rfc3339(), "2024-01-02T03:04:05+00:00");
    assert!(doc.updated_at.is_some());
}

#[test]
fn test_record_without_id_is_rejected() {
    let err = record_document(&posts(), object(json!({"title": "x"}))).unwrap_err();
    assert!(matches!(err, Error::Extraction(_)));
}

#[test]
fn test_record_user_keeps_bcrypt_hash_and_custom_fields() {
    let record = object(json!({
        "id": "u1",
        "email": "ada@example.com",
        "verified": 1,
        "password": "$2a$10$abcdefghijklmnopqrstuv",
        "tokenKey": "secret",
        "name": "Ada",
        "plan": "pro",
        "created": "2024-01-02 03:04:05.000Z",
    }));

    let user = record_user(&users(), record).unwrap();

    assert_eq!(user.id, "u1");
    assert_eq!(user.email.as_deref(), Some("ada@example.com"));
    assert!(user.email_verified);
    assert_eq!(user.password_hash.as_deref(), Some("$2a$10$abcdefghijklmnopqrstuv"));
    assert_eq!(user.display_name.as_deref(), Some("Ada"));
    assert_eq!(user.user_metadata, json!({"name": "Ada", "plan": "pro"}));
    assert_eq!(user.app_metadata, json!({"provider": "email", "collection": "users"}));
    assert!(user.created_at.is_some());
}

#[test]
fn test_external_auth_becomes_identity() {
    let link = ExternalAuth {
        id: "ea1".to_string(),
        collection_id: "_pb_users_auth_".to_string(),
        record_id: "u1".to_string(),
        provider: "Google".to_string(),
        provider_id: "1234".to_string(),
        created: Some("2024-01-02 03:04:05.000Z".to_string()),
    };

    let identity = IdentityRecord::from(link);

    assert_eq!(identity.id, "ea1");
    assert_eq!(identity.user_id, "u1");
    assert_eq!(identity.provider, "google");
    assert_eq!(identity.provider_user_id, "1234");
    assert!(identity.created_at.is_some());
}

#[test]
fn test_storage_plan_renames_collections_and_skips_thumbs() {
    let entry = |relative: &str| FileEntry {
        source: PathBuf::from("/pb_data/storage").join(relative),
        relative: PathBuf::from(relative),
        size: 10,
    };
    let entries = vec![
        entry("pbc_posts/p1/cover.png"),
        entry("pbc_posts/p1/thumbs_cover.png/100x100_cover.png"),
        entry("gone_collection/r1/file.txt"),
        entry("stray.txt"),
    ];

    let (jobs, orphaned) = storage_plan(entries, &[posts()]);

    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].destination, PathBuf::from("posts/p1/cover.png"));
    assert_eq!(orphaned, 2);
}

#[tokio::test]
async fn test_load_collections_flat_layout() {
    let dir = TempDir::new().unwrap();
    let mut conn = sqlite(
        dir.path(),
        &[
            "CREATE TABLE _collections (id TEXT, name TEXT, type TEXT, system BOOLEAN, fields JSON)",
            r#"INSERT INTO _collections VALUES
                ('pbc_posts', 'posts', 'base', 0, '[{"name":"tags","type":"select","maxSelect":5}]'),
                ('pbc_su', '_superusers', 'auth', 1, '[]'),
                ('pbc_stats', 'stats', 'view', 0, '[]'),
                ('pbc_odd', 'odd', 'graph', 0, '[]')"#,
        ],
    )
    .await;

    assert_eq!(detect_layout(&mut conn).await.unwrap(), SchemaLayout::Fields);
    let collections = load_collections(&mut conn).await.unwrap();

    let names: Vec<&str> = collections.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["_superusers", "posts", "stats"]);
    let migrated: Vec<&str> = collections
        .iter()
        .filter(|c| c.is_migrated())
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(migrated, vec!["posts"]);
    assert!(collections[1].fields[0].multi);
}

#[tokio::test]
async fn test_load_collections_legacy_layout() {
    let dir = TempDir::new().unwrap();
    let mut conn = sqlite(
        dir.path(),
        &[
            "CREATE TABLE _collections (id TEXT, name TEXT, type TEXT, system BOOLEAN, schema JSON)",
            r#"INSERT INTO _collections VALUES
                ('_pb_users_auth_', 'users', 'auth', 0, '[{"name":"name","type":"text","options":{}}]')"#,
        ],
    )
    .await;

    assert_eq!(detect_layout(&mut conn).await.unwrap(), SchemaLayout::Legacy);
    let collections = load_collections(&mut conn).await.unwrap();
    assert_eq!(collections.len(), 1);
    assert_eq!(collections[0].kind, CollectionKind::Auth);
    assert_eq!(collections[0].fields[0].name, "name");
}

#[tokio::test]
async fn test_detect_layout_without_catalog() {
    let dir = TempDir::new().unwrap();
    let mut conn = sqlite(dir.path(), &[]).await;
    assert!(matches!(detect_layout(&mut conn).await, Err(Error::Extraction(_))));
    assert!(!table_exists(&mut conn, "_collections").await.unwrap());
}

#[tokio::test]
async fn test_record_query_reads_rows_as_json() {
    let dir = TempDir::new().unwrap();
    let mut conn = sqlite(
        dir.path(),
        &[
            "CREATE TABLE posts (id TEXT PRIMARY KEY, title TEXT, published BOOLEAN, tags JSON)",
            r#"INSERT INTO posts VALUES ('p2', 'Second', 0, '[]'), ('p1', 'First', 1, '["a"]')"#,
        ],
    )
    .await;
    let collection = posts();

    assert_eq!(count_records(&mut conn, &collection).await.unwrap(), 2);

    let sql = record_query(&mut conn, &collection).await.unwrap();
    let rows = sqlx::query(&sql).fetch_all(&mut conn).await.unwrap();
    let records: Vec<Map<String, Value>> = rows.iter().map(|r| row_record(r).unwrap()).collect();

    assert_eq!(records[0]["id"], json!("p1"));
    assert_eq!(records[0]["title"], json!("First"));
    assert_eq!(records[1]["published"], json!(0));

    let doc = record_document(&collection, records[0].clone()).unwrap();
    assert_eq!(doc.data["published"], json!(true));
    assert_eq!(doc.data["tags"], json!(["a"]));
}

#[tokio::test]
async fn test_record_query_for_missing_table() {
    let dir = TempDir::new().unwrap();
    let mut conn = sqlite(dir.path(), &[]).await;
    let err = record_query(&mut conn, &posts()).await.unwrap_err();
    assert!(err.to_string().contains("posts"));
}
