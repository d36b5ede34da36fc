//! Helpers shared by the adapters.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use futures::future::BoxFuture;
use sqlx::PgConnection;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::MigrationOptions;
use crate::error::{Error, Result};
use crate::target;

/// Races `fut` against cancellation. The losing future is dropped, which
/// rolls back any transaction it owned.
///
/// Steps are boxed before they get here so the adapters' `migrate` futures
/// stay `Send` across the borrows each step captures.
///
/// # Errors
///
/// Returns [`Error::Cancelled`] if `cancel` fires first, else the future's
/// result.
pub async fn cancellable<T>(cancel: &CancellationToken, fut: BoxFuture<'_, Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// Runs one independent import step, labeling its failure with the step name.
///
/// # Errors
///
/// Returns the step's error wrapped in [`Error::Step`], or
/// [`Error::Cancelled`].
pub async fn run_step<T>(
    step: &'static str,
    cancel: &CancellationToken,
    fut: BoxFuture<'_, Result<T>>,
) -> Result<T> {
    info!(step, "Starting step");
    cancellable(cancel, fut).await.map_err(|e| e.in_step(step))
}

/// Open/closed state tracking for adapters.
#[derive(Debug, Default)]
pub struct Lifecycle {
    closed: bool,
}

impl Lifecycle {
    /// Fails once the adapter has been closed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyClosed`] after [`Lifecycle::close`].
    pub fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        Ok(())
    }

    /// Marks the adapter closed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyClosed`] on the second call.
    pub fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.closed = true;
        Ok(())
    }
}

/// Connects to the target and enforces the non-empty guard. The caller
/// bootstraps the auth schema, inside its transaction when it has one.
///
/// # Errors
///
/// Returns [`Error::TargetConnection`] or [`Error::TargetNotEmpty`].
pub async fn open_target(options: &MigrationOptions) -> Result<PgConnection> {
    let mut conn = target::connect(&options.target_url).await?;
    target::guard_empty(&mut conn, options.force).await?;
    Ok(conn)
}

/// Whether a user should be imported under the anonymous-account policy.
#[must_use]
pub fn keep_user(is_anonymous: bool, options: &MigrationOptions) -> bool {
    !is_anonymous || options.include_anonymous
}

/// Parses the timestamp shapes found in exports: RFC 3339, `YYYY-MM-DD
/// HH:MM:SS[.fff]Z`, and epoch milliseconds as a number or numeric string.
#[must_use]
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => parse_timestamp_str(s),
        _ => None,
    }
}

/// String form of [`parse_timestamp`].
#[must_use]
pub fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(ms) = s.parse::<i64>() {
        return Utc.timestamp_millis_opt(ms).single();
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = s.trim_end_matches('Z');
    NaiveDateTime::parse_from_str(naive, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|n| n.and_utc())
}

/// Returns a non-empty string field of a JSON object.
#[must_use]
pub fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Normalizes a provider identifier to the target's short names.
#[must_use]
pub fn normalize_provider(provider: &str) -> String {
    let provider = provider.trim().to_lowercase();
    let short = provider
        .strip_suffix(".com")
        .or_else(|| provider.strip_suffix(".org"))
        .unwrap_or(&provider);
    match short {
        "apple" | "google" | "github" | "facebook" | "twitter" | "microsoft" | "yahoo" => {
            short.to_string()
        }
        "x" => "twitter".to_string(),
        _ => provider.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;
    use serde_json::json;

    #[tokio::test]
    async fn test_cancellable_returns_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = cancellable(&cancel, Box::pin(std::future::pending::<Result<()>>())).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancellable_passes_result_through() {
        let cancel = CancellationToken::new();
        let result = cancellable(&cancel, Box::pin(async { Ok::<_, Error>(7) })).await.unwrap();
        assert_eq!(result, 7);
    }

    #[tokio::test]
    async fn test_run_step_labels_failure() {
        let cancel = CancellationToken::new();
        let result: Result<()> = run_step(
            "firestore",
            &cancel,
            Box::pin(async { Err::<(), _>(Error::Extraction("bad".to_string())) }),
        )
        .await;
        let err = result.unwrap_err();
        assert!(err.to_string().starts_with("firestore step failed: "));
    }

    #[test]
    fn test_lifecycle_double_close() {
        let mut lifecycle = Lifecycle::default();
        assert!(lifecycle.ensure_open().is_ok());
        assert!(lifecycle.close().is_ok());
        assert!(matches!(lifecycle.close(), Err(Error::AlreadyClosed)));
        assert!(matches!(lifecycle.ensure_open(), Err(Error::AlreadyClosed)));
    }

    #[test]
    fn test_keep_user() {
        let mut options = MigrationOptions::default();
        assert!(keep_user(false, &options));
        assert!(!keep_user(true, &options));
        options.include_anonymous = true;
        assert!(keep_user(true, &options));
    }

    #[test]
    fn test_parse_timestamp_shapes() {
        let millis = parse_timestamp(&json!("1600000000000")).unwrap();
        assert_eq!(millis.year(), 2020);
        assert_eq!(parse_timestamp(&json!(1_600_000_000_000i64)), Some(millis));

        let rfc = parse_timestamp(&json!("2024-03-01T10:00:00Z")).unwrap();
        assert_eq!(rfc.month(), 3);

        let pb = parse_timestamp(&json!("2024-03-01 10:00:00.123Z")).unwrap();
        assert_eq!(pb.timestamp(), rfc.timestamp());

        assert_eq!(parse_timestamp(&json!("")), None);
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
        assert_eq!(parse_timestamp(&json!(true)), None);
    }

    #[test]
    fn test_normalize_provider() {
        assert_eq!(normalize_provider("google.com"), "google");
        assert_eq!(normalize_provider("github.com"), "github");
        assert_eq!(normalize_provider("apple.com"), "apple");
        assert_eq!(normalize_provider("GitHub"), "github");
        assert_eq!(normalize_provider("oidc.acme"), "oidc.acme");
        assert_eq!(normalize_provider("discord"), "discord");
    }

    #[test]
    fn test_str_field_skips_empty() {
        let v = json!({"a": "x", "b": "", "c": 3});
        assert_eq!(str_field(&v, "a"), Some("x".to_string()));
        assert_eq!(str_field(&v, "b"), None);
        assert_eq!(str_field(&v, "c"), None);
        assert_eq!(str_field(&v, "d"), None);
    }
}
