use super::*;

fn policy(using: Option<&str>, check: Option<&str>) -> Policy {
    Policy {
        schema: "public".to_string(),
        table: "posts".to_string(),
        name: "owners can edit".to_string(),
        permissive: "PERMISSIVE".to_string(),
        roles: vec!["authenticated".to_string()],
        command: "UPDATE".to_string(),
        using_expr: using.map(str::to_string),
        check_expr: check.map(str::to_string),
    }
}

#[test]
fn test_rewrite_uid() {
    assert_eq!(
        rewrite_auth_calls("(auth.uid() = user_id)"),
        "((nullif(current_setting('app.user_id', true), ''))::uuid = user_id)"
    );
}

#[test]
fn test_rewrite_every_helper() {
    let rewritten = rewrite_auth_calls(
        "auth.role() = 'authenticated' AND (auth.jwt() ->> 'aal') = 'aal2' AND auth.email() IS NOT NULL",
    );
    assert!(rewritten.contains("current_setting('app.role', true) = 'authenticated'"));
    assert!(rewritten.contains("(nullif(current_setting('app.jwt_claims', true), ''))::jsonb ->> 'aal'"));
    assert!(rewritten.contains("current_setting('app.user_email', true) IS NOT NULL"));
    assert!(!references_auth_helpers(&rewritten));
}

#[test]
fn test_rewrite_quoted_and_spaced_forms() {
    let rewritten = rewrite_auth_calls("\"auth\".\"uid\"() = owner AND AUTH . UID ( ) IS NOT NULL");
    assert_eq!(
        rewritten.matches("current_setting('app.user_id', true)").count(),
        2
    );
}

#[test]
fn test_rewrite_wrapped_in_select() {
    // Supabase's recommended form for per-statement caching.
    let rewritten = rewrite_auth_calls("(( SELECT auth.uid() AS uid) = user_id)");
    assert_eq!(
        rewritten,
        "(( SELECT (nullif(current_setting('app.user_id', true), ''))::uuid AS uid) = user_id)"
    );
}

#[test]
fn test_rewrite_leaves_string_literals_alone() {
    let expr = "note <> 'call auth.uid() here' AND auth.uid() IS NOT NULL";
    let rewritten = rewrite_auth_calls(expr);
    assert!(rewritten.starts_with("note <> 'call auth.uid() here' AND "));
    assert!(rewritten.ends_with("::uuid IS NOT NULL"));
}

#[test]
fn test_rewrite_handles_escaped_quotes_in_literals() {
    let expr = "label = 'it''s auth.uid()' OR auth.uid() = id";
    let rewritten = rewrite_auth_calls(expr);
    assert!(rewritten.starts_with("label = 'it''s auth.uid()' OR "));
    assert!(rewritten.contains("current_setting('app.user_id', true)"));
}

#[test]
fn test_rewrite_ignores_lookalikes() {
    let expr = "myauth.uid() = id AND auth.uidx() = id AND auth.users_count() > 0";
    assert_eq!(rewrite_auth_calls(expr), expr);
    assert!(!references_auth_helpers(expr));
}

#[test]
fn test_rewrite_unterminated_literal_is_left_alone() {
    let expr = "x = 'auth.uid()";
    assert_eq!(rewrite_auth_calls(expr), expr);
}

#[test]
fn test_split_literals_segments() {
    let segments = split_literals("a = 'x' AND b = 'y''z'");
    assert_eq!(
        segments,
        vec![
            ("a = ", false),
            ("'x'", true),
            (" AND b = ", false),
            ("'y''z'", true),
        ]
    );
}

#[test]
fn test_policy_to_sql() {
    let sql = policy(Some("(auth.uid() = user_id)"), Some("(auth.uid() = user_id)")).to_sql();
    assert!(sql.starts_with("DROP POLICY IF EXISTS \"owners can edit\" ON \"public\".\"posts\";\n"));
    assert!(sql.contains(
        "CREATE POLICY \"owners can edit\" ON \"public\".\"posts\" AS PERMISSIVE FOR UPDATE TO \"authenticated\""
    ));
    assert!(sql.contains(" USING (((nullif(current_setting('app.user_id', true), ''))::uuid = user_id))"));
    assert!(sql.contains(" WITH CHECK ("));
    assert!(!references_auth_helpers(&sql));
    assert!(sql.ends_with(';'));
}

#[test]
fn test_policy_to_sql_public_role_and_no_expressions() {
    let mut p = policy(None, None);
    p.roles = vec!["public".to_string()];
    p.permissive = "RESTRICTIVE".to_string();
    p.command = "ALL".to_string();
    let sql = p.to_sql();
    assert!(sql.ends_with("AS RESTRICTIVE FOR ALL TO public;"));
    assert_eq!(p.named_roles().count(), 0);
}

#[test]
fn test_ensure_role_sql_quotes_name() {
    let sql = ensure_role_sql("o'brien");
    assert!(sql.contains("rolname = 'o''brien'"));
    assert!(sql.contains("CREATE ROLE \"o'brien\" NOLOGIN"));
}

#[test]
fn test_enable_rls_sql() {
    assert_eq!(
        enable_rls_sql("public", "posts", false),
        "ALTER TABLE \"public\".\"posts\" ENABLE ROW LEVEL SECURITY;"
    );
    assert!(enable_rls_sql("public", "posts", true).ends_with("FORCE ROW LEVEL SECURITY;"));
}
