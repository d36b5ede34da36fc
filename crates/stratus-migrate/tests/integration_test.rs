//! Integration tests for stratus-migrate against a real Postgres server.
//!
//! These tests require an environment variable to be set:
//! - `STRATUS_TEST_DATABASE_URL`: a Postgres URL whose role may create
//!   databases. Every test works in its own throwaway databases.
//!
//! Run with: `cargo test --test integration_test -- --ignored`

#![allow(clippy::pedantic)]

use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, PgConnection, SqliteConnection};
use std::env;
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use stratus_migrate::config::{
    FirebaseConfig, MigrationOptions, PocketBaseConfig, SkipFlags, SupabaseConfig,
};
use stratus_migrate::{create_adapter, Error, SourceConfig};

const USER_IDS: [&str; 5] = [
    "00000000-0000-0000-0000-000000000001",
    "00000000-0000-0000-0000-000000000002",
    "00000000-0000-0000-0000-000000000003",
    "00000000-0000-0000-0000-000000000004",
    "00000000-0000-0000-0000-000000000005",
];

/// A Supabase-shaped source: 4 tables, 2 views, 40 rows, 5 users, 3 OAuth
/// links and 2 policies.
const SUPABASE_FIXTURE: &str = r#"
CREATE SCHEMA auth;
CREATE TABLE auth.users (
    id uuid PRIMARY KEY,
    email text,
    encrypted_password text,
    email_confirmed_at timestamptz,
    raw_user_meta_data jsonb,
    raw_app_meta_data jsonb,
    is_anonymous boolean NOT NULL DEFAULT false,
    created_at timestamptz DEFAULT now(),
    updated_at timestamptz DEFAULT now(),
    last_sign_in_at timestamptz
);
CREATE TABLE auth.identities (
    id uuid PRIMARY KEY,
    provider_id text NOT NULL,
    user_id uuid NOT NULL REFERENCES auth.users (id),
    identity_data jsonb NOT NULL,
    provider text NOT NULL,
    created_at timestamptz DEFAULT now()
);
CREATE FUNCTION auth.uid() RETURNS uuid LANGUAGE sql STABLE
    AS $$ SELECT nullif(current_setting('request.jwt.claim.sub', true), '')::uuid $$;

INSERT INTO auth.users (id, email, encrypted_password, email_confirmed_at, raw_user_meta_data)
SELECT ('00000000-0000-0000-0000-00000000000' || g)::uuid,
       'user' || g || '@example.com',
       '$2a$10$' || repeat(g::text, 53),
       now(),
       jsonb_build_object('full_name', 'User ' || g)
FROM generate_series(1, 5) g;

INSERT INTO auth.identities (id, provider_id, user_id, identity_data, provider) VALUES
    ('10000000-0000-0000-0000-000000000001', 'g-1', '00000000-0000-0000-0000-000000000001', '{"email":"user1@example.com"}', 'google'),
    ('10000000-0000-0000-0000-000000000002', 'gh-2', '00000000-0000-0000-0000-000000000002', '{}', 'github'),
    ('10000000-0000-0000-0000-000000000003', 'g-3', '00000000-0000-0000-0000-000000000003', '{}', 'google'),
    ('10000000-0000-0000-0000-000000000004', 'user4@example.com', '00000000-0000-0000-0000-000000000004', '{}', 'email');

CREATE TABLE public.profiles (id uuid PRIMARY KEY, username text NOT NULL);
CREATE TABLE public.todos (id bigserial PRIMARY KEY, user_id uuid NOT NULL, title text, done boolean NOT NULL DEFAULT false);
CREATE TABLE public.tags (id serial PRIMARY KEY, name text UNIQUE);
CREATE TABLE public.todo_tags (
    todo_id bigint REFERENCES public.todos (id),
    tag_id int REFERENCES public.tags (id),
    PRIMARY KEY (todo_id, tag_id)
);

INSERT INTO public.profiles SELECT ('00000000-0000-0000-0000-00000000000' || g)::uuid, 'user' || g FROM generate_series(1, 5) g;
INSERT INTO public.todos (user_id, title, done)
SELECT ('00000000-0000-0000-0000-00000000000' || (g % 5 + 1))::uuid, 'todo ' || g, g % 3 = 0 FROM generate_series(1, 20) g;
INSERT INTO public.tags (name) SELECT 'tag' || g FROM generate_series(1, 5) g;
INSERT INTO public.todo_tags SELECT g, g % 5 + 1 FROM generate_series(1, 10) g;

CREATE VIEW public.open_todos AS SELECT * FROM public.todos WHERE NOT done;
CREATE VIEW public.tag_counts AS
    SELECT t.name, count(*) AS uses FROM public.tags t JOIN public.todo_tags tt ON tt.tag_id = t.id GROUP BY t.name;

ALTER TABLE public.todos ENABLE ROW LEVEL SECURITY;
CREATE POLICY "own todos" ON public.todos FOR ALL USING (auth.uid() = user_id);
CREATE POLICY "read profiles" ON public.profiles FOR SELECT USING (true);
"#;

/// Returns the server URL, or `None` when the tests are not configured.
fn server_url() -> Option<String> {
    match env::var("STRATUS_TEST_DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => Some(url),
        _ => {
            eprintln!("Skipping: STRATUS_TEST_DATABASE_URL not set");
            None
        }
    }
}

/// Replaces the database name of a connection URL.
fn with_database(url: &str, name: &str) -> String {
    let (base, query) = match url.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (url, None),
    };
    let authority_start = base.find("://").map_or(0, |i| i + 3);
    let path_start = base[authority_start..]
        .find('/')
        .map_or(base.len(), |i| authority_start + i);
    let mut out = format!("{}/{name}", &base[..path_start]);
    if let Some(query) = query {
        out.push('?');
        out.push_str(query);
    }
    out
}

/// Creates an empty database and returns its URL.
async fn fresh_database(server: &str, label: &str) -> String {
    let name = format!("stratus_it_{label}_{}", uuid::Uuid::new_v4().simple());
    let mut admin = PgConnection::connect(server).await.unwrap();
    sqlx::raw_sql(&format!("CREATE DATABASE {name}"))
        .execute(&mut admin)
        .await
        .unwrap();
    admin.close().await.unwrap();
    with_database(server, &name)
}

async fn scalar_i64(url: &str, sql: &str) -> i64 {
    let mut conn = PgConnection::connect(url).await.unwrap();
    let value: i64 = sqlx::query_scalar(sql).fetch_one(&mut conn).await.unwrap();
    conn.close().await.unwrap();
    value
}

fn options(target: &str, storage: &Path) -> MigrationOptions {
    MigrationOptions {
        target_url: target.to_string(),
        storage_path: storage.to_path_buf(),
        ..Default::default()
    }
}

async fn supabase_source(server: &str) -> String {
    let url = fresh_database(server, "supabase").await;
    let mut conn = PgConnection::connect(&url).await.unwrap();
    sqlx::raw_sql(SUPABASE_FIXTURE).execute(&mut conn).await.unwrap();
    conn.close().await.unwrap();
    url
}

#[tokio::test]
#[ignore] // Run with --ignored flag when STRATUS_TEST_DATABASE_URL is set
async fn test_supabase_example_reconciles() {
    let Some(server) = server_url() else {
        return;
    };
    let source_url = supabase_source(&server).await;
    let target_url = fresh_database(&server, "target").await;
    let storage = TempDir::new().unwrap();

    let source = SourceConfig::Supabase(SupabaseConfig {
        connection_string: source_url,
        schemas: vec!["public".to_string()],
        storage_export: None,
    });
    let options = MigrationOptions {
        skip: SkipFlags {
            oauth: true,
            rls: true,
            ..Default::default()
        },
        ..options(&target_url, storage.path())
    };
    let mut adapter = create_adapter(&source, options).unwrap();
    let cancel = CancellationToken::new();

    let report = adapter.analyze(&cancel).await.unwrap();
    assert_eq!(report.tables, 4);
    assert_eq!(report.views, 2);
    assert_eq!(report.records, 40);
    assert_eq!(report.auth_users, 5);
    assert_eq!(report.oauth_links, 3);
    assert_eq!(report.rls_policies, 2);

    let stats = adapter.migrate(&cancel).await.unwrap();
    let summary = adapter.validation_summary(&report, &stats);
    adapter.close().await.unwrap();

    assert!(summary.is_consistent(), "{summary:?}");
    assert_eq!(summary.row("OAuth links").unwrap().source, 0);
    assert_eq!(summary.row("RLS policies").unwrap().source, 0);
    assert_eq!(stats.auth_users, 5);
    assert_eq!(stats.records, 40);
    assert_eq!(scalar_i64(&target_url, "SELECT count(*) FROM public.todos").await, 20);
    assert_eq!(scalar_i64(&target_url, "SELECT count(*) FROM public.open_todos").await, 14);
    assert_eq!(
        scalar_i64(&target_url, "SELECT count(*) FROM auth.oauth_identities").await,
        0
    );
}

#[tokio::test]
#[ignore]
async fn test_supabase_preserves_identities_and_hashes() {
    let Some(server) = server_url() else {
        return;
    };
    let source_url = supabase_source(&server).await;
    let target_url = fresh_database(&server, "target").await;
    let storage = TempDir::new().unwrap();

    let source = SourceConfig::Supabase(SupabaseConfig {
        connection_string: source_url.clone(),
        schemas: vec!["public".to_string()],
        storage_export: None,
    });
    let mut adapter = create_adapter(&source, options(&target_url, storage.path())).unwrap();
    let cancel = CancellationToken::new();
    adapter.analyze(&cancel).await.unwrap();
    let stats = adapter.migrate(&cancel).await.unwrap();
    adapter.close().await.unwrap();

    assert_eq!(stats.oauth_links, 3);
    assert_eq!(stats.rls_policies, 2);

    let mut src = PgConnection::connect(&source_url).await.unwrap();
    let mut dst = PgConnection::connect(&target_url).await.unwrap();
    let expected: Vec<(String, String)> = sqlx::query_as(
        "SELECT id::text, encrypted_password FROM auth.users ORDER BY id",
    )
    .fetch_all(&mut src)
    .await
    .unwrap();
    let actual: Vec<(String, String)> =
        sqlx::query_as("SELECT id, password_hash FROM auth.users ORDER BY id")
            .fetch_all(&mut dst)
            .await
            .unwrap();
    assert_eq!(actual, expected);
    assert_eq!(actual[0].0, USER_IDS[0]);

    let links: Vec<(String, String, String)> = sqlx::query_as(
        "SELECT id, provider, provider_user_id FROM auth.oauth_identities ORDER BY id",
    )
    .fetch_all(&mut dst)
    .await
    .unwrap();
    assert_eq!(
        links,
        vec![
            ("10000000-0000-0000-0000-000000000001".into(), "google".into(), "g-1".into()),
            ("10000000-0000-0000-0000-000000000002".into(), "github".into(), "gh-2".into()),
            ("10000000-0000-0000-0000-000000000003".into(), "google".into(), "g-3".into()),
        ]
    );
    let policies: i64 = sqlx::query_scalar("SELECT count(*) FROM pg_policies WHERE schemaname = 'public'")
        .fetch_one(&mut dst)
        .await
        .unwrap();
    assert_eq!(policies, 2);
}

#[tokio::test]
#[ignore]
async fn test_supabase_failure_rolls_back_everything() {
    let Some(server) = server_url() else {
        return;
    };
    let source_url = supabase_source(&server).await;
    let target_url = fresh_database(&server, "target").await;
    let storage = TempDir::new().unwrap();

    // Policies are applied after users, and their tables are never created
    // when data is skipped.
    let source = SourceConfig::Supabase(SupabaseConfig {
        connection_string: source_url,
        schemas: vec!["public".to_string()],
        storage_export: None,
    });
    let options = MigrationOptions {
        skip: SkipFlags {
            data: true,
            ..Default::default()
        },
        ..options(&target_url, storage.path())
    };
    let mut adapter = create_adapter(&source, options).unwrap();
    let cancel = CancellationToken::new();
    adapter.analyze(&cancel).await.unwrap();

    let err = adapter.migrate(&cancel).await.unwrap_err();
    adapter.close().await.unwrap();

    assert!(matches!(err, Error::Loading(_)), "{err}");
    assert_eq!(
        scalar_i64(
            &target_url,
            "SELECT count(*) FROM pg_namespace WHERE nspname = 'auth'"
        )
        .await,
        0
    );
}

#[tokio::test]
#[ignore]
async fn test_supabase_refuses_non_empty_target() {
    let Some(server) = server_url() else {
        return;
    };
    let source_url = supabase_source(&server).await;
    let target_url = fresh_database(&server, "target").await;
    let storage = TempDir::new().unwrap();
    let source = SourceConfig::Supabase(SupabaseConfig {
        connection_string: source_url,
        schemas: vec!["public".to_string()],
        storage_export: None,
    });
    let cancel = CancellationToken::new();

    let mut first = create_adapter(&source, options(&target_url, storage.path())).unwrap();
    first.analyze(&cancel).await.unwrap();
    first.migrate(&cancel).await.unwrap();
    first.close().await.unwrap();

    let mut second = create_adapter(&source, options(&target_url, storage.path())).unwrap();
    second.analyze(&cancel).await.unwrap();
    let err = second.migrate(&cancel).await.unwrap_err();
    second.close().await.unwrap();
    assert!(matches!(err, Error::TargetNotEmpty { users: 5 }), "{err}");
}

#[tokio::test]
#[ignore]
async fn test_supabase_forced_rerun_overwrites_changed_rows() {
    let Some(server) = server_url() else {
        return;
    };
    let source_url = supabase_source(&server).await;
    let target_url = fresh_database(&server, "target").await;
    let storage = TempDir::new().unwrap();
    let source = SourceConfig::Supabase(SupabaseConfig {
        connection_string: source_url.clone(),
        schemas: vec!["public".to_string()],
        storage_export: None,
    });
    let cancel = CancellationToken::new();

    let mut first = create_adapter(&source, options(&target_url, storage.path())).unwrap();
    first.migrate(&cancel).await.unwrap();
    first.close().await.unwrap();

    let mut conn = PgConnection::connect(&source_url).await.unwrap();
    sqlx::raw_sql(
        "UPDATE public.profiles SET username = 'renamed' WHERE username = 'user1';
         UPDATE public.todos SET title = 'changed', done = true WHERE id <= 3;",
    )
    .execute(&mut conn)
    .await
    .unwrap();
    conn.close().await.unwrap();

    let forced = MigrationOptions {
        force: true,
        ..options(&target_url, storage.path())
    };
    let mut second = create_adapter(&source, forced).unwrap();
    let report = second.analyze(&cancel).await.unwrap();
    let stats = second.migrate(&cancel).await.unwrap();
    second.close().await.unwrap();

    // Every source row is accounted for, none silently kept stale.
    assert_eq!(stats.records, 40);
    assert_eq!(stats.records, report.records);
    assert_eq!(stats.auth_users, 0);
    assert_eq!(stats.auth_users_updated, 5);
    assert_eq!(scalar_i64(&target_url, "SELECT count(*) FROM public.todos").await, 20);
    assert_eq!(
        scalar_i64(&target_url, "SELECT count(*) FROM public.profiles WHERE username = 'renamed'").await,
        1
    );
    assert_eq!(
        scalar_i64(&target_url, "SELECT count(*) FROM public.todos WHERE title = 'changed' AND done").await,
        3
    );
    assert_eq!(scalar_i64(&target_url, "SELECT count(*) FROM public.open_todos").await, 12);
}

fn write(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

#[tokio::test]
#[ignore]
async fn test_firebase_rerun_creates_no_duplicates() {
    let Some(server) = server_url() else {
        return;
    };
    let target_url = fresh_database(&server, "target").await;
    let export = TempDir::new().unwrap();
    let storage = TempDir::new().unwrap();
    write(export.path(), "firestore/posts/p1.json", r#"{"title":"a","createdAt":"2024-01-01T00:00:00Z"}"#);
    write(export.path(), "firestore/posts/p2.json", r#"{"title":"b"}"#);
    write(export.path(), "firestore/comments.json", r#"{"c1":{"body":"x"},"c2":{"body":"y"},"c3":{"body":"z"}}"#);

    let source = SourceConfig::Firebase(FirebaseConfig {
        firestore_export: Some(export.path().join("firestore")),
        ..Default::default()
    });
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        let mut adapter = create_adapter(&source, options(&target_url, storage.path())).unwrap();
        let report = adapter.analyze(&cancel).await.unwrap();
        let stats = adapter.migrate(&cancel).await.unwrap();
        assert!(adapter.validation_summary(&report, &stats).is_consistent());
        adapter.close().await.unwrap();
    }

    assert_eq!(scalar_i64(&target_url, "SELECT count(*) FROM public.posts").await, 2);
    assert_eq!(scalar_i64(&target_url, "SELECT count(*) FROM public.comments").await, 3);
    assert_eq!(
        scalar_i64(
            &target_url,
            "SELECT count(*) FROM public.posts WHERE data ->> 'title' = 'a'"
        )
        .await,
        1
    );
}

#[tokio::test]
#[ignore]
async fn test_pocketbase_preserves_bcrypt_hashes() {
    let Some(server) = server_url() else {
        return;
    };
    let target_url = fresh_database(&server, "target").await;
    let pb_data = TempDir::new().unwrap();
    let storage = TempDir::new().unwrap();

    let sqlite = SqliteConnectOptions::new()
        .filename(pb_data.path().join("data.db"))
        .create_if_missing(true);
    let mut conn = SqliteConnection::connect_with(&sqlite).await.unwrap();
    for statement in [
        "CREATE TABLE _collections (id TEXT, name TEXT, type TEXT, system BOOLEAN, fields JSON)",
        r#"INSERT INTO _collections VALUES
            ('_pb_users_auth_', 'users', 'auth', 0, '[]'),
            ('pbc_notes', 'notes', 'base', 0, '[{"name":"pinned","type":"bool"}]')"#,
        "CREATE TABLE users (id TEXT PRIMARY KEY, email TEXT, verified BOOLEAN, password TEXT, tokenKey TEXT, created TEXT, updated TEXT)",
        r#"INSERT INTO users VALUES ('pbuser000000001', 'ada@example.com', 1, '$2a$10$N9qo8uLOickgx2ZMRZoMyeIjZAgcfl7p92ldGxad68LJZdL17lhWy', 'k', '2024-01-01 00:00:00.000Z', '')"#,
        "CREATE TABLE notes (id TEXT PRIMARY KEY, body TEXT, pinned BOOLEAN, created TEXT, updated TEXT)",
        "INSERT INTO notes VALUES ('n1', 'hello', 1, '', ''), ('n2', 'world', 0, '', '')",
        "CREATE TABLE _externalAuths (id TEXT PRIMARY KEY, collectionId TEXT, recordId TEXT, provider TEXT, providerId TEXT, created TEXT)",
        "INSERT INTO _externalAuths VALUES ('ea1', '_pb_users_auth_', 'pbuser000000001', 'github', '42', '')",
    ] {
        sqlx::query(statement).execute(&mut conn).await.unwrap();
    }
    conn.close().await.unwrap();

    let source = SourceConfig::PocketBase(PocketBaseConfig {
        data_dir: pb_data.path().to_path_buf(),
    });
    let mut adapter = create_adapter(&source, options(&target_url, storage.path())).unwrap();
    let cancel = CancellationToken::new();
    let report = adapter.analyze(&cancel).await.unwrap();
    let stats = adapter.migrate(&cancel).await.unwrap();
    assert!(adapter.validation_summary(&report, &stats).is_consistent());
    adapter.close().await.unwrap();

    let mut dst = PgConnection::connect(&target_url).await.unwrap();
    let (id, hash, format): (String, String, String) =
        sqlx::query_as("SELECT id, password_hash, password_hash_format FROM auth.users")
            .fetch_one(&mut dst)
            .await
            .unwrap();
    assert_eq!(id, "pbuser000000001");
    assert_eq!(hash, "$2a$10$N9qo8uLOickgx2ZMRZoMyeIjZAgcfl7p92ldGxad68LJZdL17lhWy");
    assert_eq!(format, "bcrypt");

    let link: (String, String) = sqlx::query_as("SELECT id, user_id FROM auth.oauth_identities")
        .fetch_one(&mut dst)
        .await
        .unwrap();
    assert_eq!(link, ("ea1".to_string(), "pbuser000000001".to_string()));

    let pinned: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM public.notes WHERE (data -> 'pinned')::boolean",
    )
    .fetch_one(&mut dst)
    .await
    .unwrap();
    assert_eq!(pinned, 1);
}

#[test]
fn test_with_database_keeps_query_parameters() {
    assert_eq!(
        with_database("postgres://u:p@localhost:5432/postgres?sslmode=disable", "it_1"),
        "postgres://u:p@localhost:5432/it_1?sslmode=disable"
    );
    assert_eq!(with_database("postgres://localhost", "it_2"), "postgres://localhost/it_2");
}
