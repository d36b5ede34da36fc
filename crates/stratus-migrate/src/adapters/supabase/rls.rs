//! Row-level security policy transfer.
//!
//! Supabase policies call `auth.uid()`, `auth.role()`, `auth.jwt()` and
//! `auth.email()`. Stratus exposes the same facts as session settings, so each
//! call is rewritten to a `current_setting` lookup cast back to the function's
//! original return type. Text inside string literals is never touched.

use regex::{Captures, Regex};
use sqlx::PgConnection;
use std::collections::BTreeSet;
use std::sync::LazyLock;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::target::{quote_ident, quote_literal};

static AUTH_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:"auth"|\bauth)\s*\.\s*(?:"(uid|role|jwt|email)"|\b(uid|role|jwt|email)\b)\s*\(\s*\)"#)
        .expect("auth call pattern is valid")
});

/// Session-setting replacement for an `auth.*()` helper.
fn replacement(function: &str) -> &'static str {
    match function {
        "uid" => "(nullif(current_setting('app.user_id', true), ''))::uuid",
        "role" => "current_setting('app.role', true)",
        "jwt" => "(nullif(current_setting('app.jwt_claims', true), ''))::jsonb",
        _ => "current_setting('app.user_email', true)",
    }
}

/// Rewrites `auth.*()` helper calls outside string literals.
#[must_use]
pub fn rewrite_auth_calls(expr: &str) -> String {
    let mut out = String::with_capacity(expr.len() + 32);
    for (segment, is_literal) in split_literals(expr) {
        if is_literal {
            out.push_str(segment);
        } else {
            let rewritten = AUTH_CALL.replace_all(segment, |caps: &Captures<'_>| {
                let function = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str().to_ascii_lowercase())
                    .unwrap_or_default();
                replacement(&function)
            });
            out.push_str(&rewritten);
        }
    }
    out
}

/// Whether an expression still calls an `auth.*()` helper outside literals.
#[must_use]
pub fn references_auth_helpers(expr: &str) -> bool {
    split_literals(expr)
        .into_iter()
        .any(|(segment, is_literal)| !is_literal && AUTH_CALL.is_match(segment))
}

/// Splits SQL text into alternating code and single-quoted literal segments.
///
/// A doubled quote inside a literal is an escaped quote. An unterminated
/// literal runs to the end of the input.
fn split_literals(sql: &str) -> Vec<(&str, bool)> {
    let bytes = sql.as_bytes();
    let mut segments = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'\'' {
            i += 1;
            continue;
        }
        if start < i {
            segments.push((&sql[start..i], false));
        }
        let literal_start = i;
        i += 1;
        loop {
            match bytes.get(i) {
                None => break,
                Some(b'\'') if bytes.get(i + 1) == Some(&b'\'') => i += 2,
                Some(b'\'') => {
                    i += 1;
                    break;
                }
                Some(_) => i += 1,
            }
        }
        segments.push((&sql[literal_start..i], true));
        start = i;
    }
    if start < sql.len() {
        segments.push((&sql[start..], false));
    }
    segments
}

/// A policy as recorded in `pg_policies`.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Policy {
    /// Schema of the protected table.
    pub schema: String,
    /// Protected table.
    pub table: String,
    /// Policy name.
    pub name: String,
    /// `PERMISSIVE` or `RESTRICTIVE`.
    pub permissive: String,
    /// Roles the policy applies to.
    pub roles: Vec<String>,
    /// `ALL`, `SELECT`, `INSERT`, `UPDATE` or `DELETE`.
    pub command: String,
    /// `USING` expression.
    pub using_expr: Option<String>,
    /// `WITH CHECK` expression.
    pub check_expr: Option<String>,
}

impl Policy {
    /// Roles other than `public` that must exist in the target.
    pub fn named_roles(&self) -> impl Iterator<Item = &str> {
        self.roles
            .iter()
            .map(String::as_str)
            .filter(|r| !r.eq_ignore_ascii_case("public"))
    }

    /// Idempotent DDL recreating this policy with rewritten expressions.
    #[must_use]
    pub fn to_sql(&self) -> String {
        let table = format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table));
        let roles = if self.roles.is_empty() {
            "public".to_string()
        } else {
            self.roles
                .iter()
                .map(|r| {
                    if r.eq_ignore_ascii_case("public") {
                        "public".to_string()
                    } else {
                        quote_ident(r)
                    }
                })
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut sql = format!(
            "DROP POLICY IF EXISTS {name} ON {table};\nCREATE POLICY {name} ON {table} AS {kind} FOR {cmd} TO {roles}",
            name = quote_ident(&self.name),
            kind = self.permissive.to_uppercase(),
            cmd = self.command.to_uppercase(),
        );
        if let Some(using) = &self.using_expr {
            sql.push_str(&format!(" USING ({})", rewrite_auth_calls(using)));
        }
        if let Some(check) = &self.check_expr {
            sql.push_str(&format!(" WITH CHECK ({})", rewrite_auth_calls(check)));
        }
        sql.push(';');
        sql
    }
}

/// DDL creating a role unless it already exists.
#[must_use]
pub fn ensure_role_sql(role: &str) -> String {
    format!(
        "DO $stratus$ BEGIN IF NOT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = {lit}) \
         THEN CREATE ROLE {ident} NOLOGIN; END IF; END $stratus$;",
        lit = quote_literal(role),
        ident = quote_ident(role),
    )
}

/// DDL enabling row-level security on a table.
#[must_use]
pub fn enable_rls_sql(schema: &str, table: &str, forced: bool) -> String {
    let qualified = format!("{}.{}", quote_ident(schema), quote_ident(table));
    let mut sql = format!("ALTER TABLE {qualified} ENABLE ROW LEVEL SECURITY;");
    if forced {
        sql.push_str(&format!("\nALTER TABLE {qualified} FORCE ROW LEVEL SECURITY;"));
    }
    sql
}

/// Reads the policies of the given schemas.
///
/// # Errors
///
/// Returns [`Error::Database`] on failure.
pub async fn load_policies(source: &mut PgConnection, schemas: &[String]) -> Result<Vec<Policy>> {
    let policies = sqlx::query_as::<_, Policy>(
        "SELECT schemaname::text AS schema, tablename::text AS \"table\", \
         policyname::text AS name, permissive::text AS permissive, roles::text[] AS roles, \
         cmd::text AS command, qual AS using_expr, with_check AS check_expr \
         FROM pg_policies WHERE schemaname::text = ANY($1) \
         ORDER BY schemaname, tablename, policyname",
    )
    .bind(schemas)
    .fetch_all(&mut *source)
    .await?;
    Ok(policies)
}

/// Recreates policies in the target and enables RLS on `rls_tables`
/// (`(schema, table, forced)`).
///
/// Every policy's table must already exist in the target.
///
/// # Errors
///
/// Returns [`Error::Loading`] naming a policy whose table is missing, or a
/// database error.
pub async fn apply_policies(
    target: &mut PgConnection,
    policies: &[Policy],
    rls_tables: &[(String, String, bool)],
) -> Result<u64> {
    let roles: BTreeSet<&str> = policies.iter().flat_map(|p| p.named_roles()).collect();
    for role in roles {
        sqlx::Executor::execute(&mut *target, sqlx::raw_sql(&ensure_role_sql(role))).await?;
    }

    for (schema, table, forced) in rls_tables {
        let qualified = format!("{}.{}", quote_ident(schema), quote_ident(table));
        if !table_exists(target, &qualified).await? {
            return Err(Error::Loading(format!(
                "cannot enable row-level security on {qualified}: table does not exist in the target"
            )));
        }
        sqlx::Executor::execute(&mut *target, sqlx::raw_sql(&enable_rls_sql(schema, table, *forced)))
            .await?;
    }

    let mut created = 0;
    for policy in policies {
        let qualified = format!("{}.{}", quote_ident(&policy.schema), quote_ident(&policy.table));
        if !table_exists(target, &qualified).await? {
            return Err(Error::Loading(format!(
                "policy \"{}\" protects {qualified}, which does not exist in the target",
                policy.name
            )));
        }
        debug!(policy = %policy.name, table = %qualified, "Creating policy");
        sqlx::Executor::execute(&mut *target, sqlx::raw_sql(&policy.to_sql()))
            .await
            .map_err(|e| Error::Loading(format!("policy \"{}\" on {qualified}: {e}", policy.name)))?;
        created += 1;
    }

    info!(policies = created, "Recreated RLS policies");
    Ok(created)
}

async fn table_exists(target: &mut PgConnection, qualified: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
        .bind(qualified)
        .fetch_one(&mut *target)
        .await?;
    Ok(exists)
}

#[cfg(test)]
#[path = "rls_tests.rs"]
mod tests;
