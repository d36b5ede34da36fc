//! Configuration types for stratus-migrate.

use base64::Engine;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::progress::{NoopProgress, Progress};

/// Main migration configuration, as loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Source platform configuration.
    pub source: SourceConfig,
    /// Target Stratus configuration.
    pub target: TargetConfig,
    /// Run options.
    #[serde(default)]
    pub options: RunOptions,
}

/// Source platform configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceConfig {
    /// Live Supabase database.
    #[serde(rename = "supabase")]
    Supabase(SupabaseConfig),
    /// Offline Firebase export artifacts.
    #[serde(rename = "firebase")]
    Firebase(FirebaseConfig),
    /// PocketBase data directory.
    #[serde(rename = "pocketbase")]
    PocketBase(PocketBaseConfig),
}

impl SourceConfig {
    /// Short source type name.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Supabase(_) => "supabase",
            Self::Firebase(_) => "firebase",
            Self::PocketBase(_) => "pocketbase",
        }
    }
}

/// Supabase source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupabaseConfig {
    /// Direct (non-pooled) connection string.
    pub connection_string: String,
    /// User schemas to migrate.
    #[serde(default = "default_schemas")]
    pub schemas: Vec<String>,
    /// Directory holding an exported copy of the storage buckets.
    #[serde(default)]
    pub storage_export: Option<PathBuf>,
}

/// Firebase export configuration. At least one artifact must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirebaseConfig {
    /// `firebase auth:export` JSON file.
    #[serde(default)]
    pub auth_export: Option<PathBuf>,
    /// Firestore export directory.
    #[serde(default)]
    pub firestore_export: Option<PathBuf>,
    /// Realtime Database JSON export.
    #[serde(default)]
    pub rtdb_export: Option<PathBuf>,
    /// Storage bucket export directory.
    #[serde(default)]
    pub storage_export: Option<PathBuf>,
    /// Project password hash parameters.
    #[serde(default)]
    pub hash_config: Option<FirebaseHashConfig>,
}

impl FirebaseConfig {
    /// Whether no export artifact was supplied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.auth_export.is_none()
            && self.firestore_export.is_none()
            && self.rtdb_export.is_none()
            && self.storage_export.is_none()
    }
}

/// Firebase modified-scrypt parameters, as shown in the console.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirebaseHashConfig {
    /// Base64 signer key.
    #[serde(alias = "base64_signer_key")]
    pub signer_key: String,
    /// Base64 salt separator.
    #[serde(alias = "base64_salt_separator")]
    pub salt_separator: String,
    /// Scrypt rounds.
    pub rounds: u32,
    /// Scrypt memory cost.
    pub mem_cost: u32,
}

impl FirebaseHashConfig {
    /// Validates the parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a key is not valid base64 or a cost is
    /// out of range.
    pub fn validate(&self) -> Result<()> {
        let engine = base64::engine::general_purpose::STANDARD;
        engine
            .decode(&self.signer_key)
            .map_err(|e| Error::Config(format!("hash signer key is not valid base64: {e}")))?;
        engine
            .decode(&self.salt_separator)
            .map_err(|e| Error::Config(format!("hash salt separator is not valid base64: {e}")))?;
        if !(1..=8).contains(&self.rounds) {
            return Err(Error::Config(format!(
                "hash rounds must be between 1 and 8, got {}",
                self.rounds
            )));
        }
        if !(1..=14).contains(&self.mem_cost) {
            return Err(Error::Config(format!(
                "hash mem_cost must be between 1 and 14, got {}",
                self.mem_cost
            )));
        }
        Ok(())
    }
}

/// PocketBase source configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PocketBaseConfig {
    /// `pb_data` directory (holds `data.db` and `storage/`).
    pub data_dir: PathBuf,
}

/// Target Stratus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Direct connection string to the target database.
    pub database_url: String,
    /// Root of the target's local file storage.
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
}

/// Scope-skip flags. A set flag excludes that class of artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkipFlags {
    /// Tables, views and rows (or documents).
    pub data: bool,
    /// Row-level security policies.
    pub rls: bool,
    /// OAuth identity links.
    pub oauth: bool,
    /// Storage files.
    pub storage: bool,
}

/// Run options section of the YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    /// Batch size for streaming reads and writes.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Preview only.
    #[serde(default)]
    pub dry_run: bool,
    /// Import even when the target already has users.
    #[serde(default)]
    pub force: bool,
    /// Import anonymous accounts.
    #[serde(default)]
    pub include_anonymous: bool,
    /// Scopes to skip.
    #[serde(default)]
    pub skip: SkipFlags,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            dry_run: false,
            force: false,
            include_anonymous: false,
            skip: SkipFlags::default(),
        }
    }
}

/// Immutable per-run options handed to an adapter.
#[derive(Clone)]
pub struct MigrationOptions {
    /// Target connection string.
    pub target_url: String,
    /// Root of the target's local file storage.
    pub storage_path: PathBuf,
    /// Preview only; never writes.
    pub dry_run: bool,
    /// Bypass the "target not empty" guard.
    pub force: bool,
    /// Verbose logging.
    pub verbose: bool,
    /// Batch size for streaming.
    pub batch_size: usize,
    /// Import anonymous accounts.
    pub include_anonymous: bool,
    /// Scopes to skip.
    pub skip: SkipFlags,
    /// Progress sink.
    pub progress: Arc<dyn Progress>,
}

impl fmt::Debug for MigrationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationOptions")
            .field("target_url", &redact_url(&self.target_url))
            .field("storage_path", &self.storage_path)
            .field("dry_run", &self.dry_run)
            .field("force", &self.force)
            .field("verbose", &self.verbose)
            .field("batch_size", &self.batch_size)
            .field("include_anonymous", &self.include_anonymous)
            .field("skip", &self.skip)
            .finish_non_exhaustive()
    }
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            target_url: String::new(),
            storage_path: default_storage_path(),
            dry_run: false,
            force: false,
            verbose: false,
            batch_size: default_batch_size(),
            include_anonymous: false,
            skip: SkipFlags::default(),
            progress: Arc::new(NoopProgress),
        }
    }
}

impl MigrationOptions {
    /// Validates the options without touching the network or filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the target URL is missing or malformed
    /// or the batch size is zero.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch size must be greater than 0".to_string()));
        }
        if self.target_url.trim().is_empty() {
            // A preview never connects to the target.
            if self.dry_run {
                return Ok(());
            }
            return Err(Error::Config(
                "target database URL is required (--target or STRATUS_DATABASE_URL)".to_string(),
            ));
        }
        parse_pg_url(&self.target_url, "target")?;
        Ok(())
    }
}

impl MigrationConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.options.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than 0".to_string()));
        }
        if self.target.database_url.trim().is_empty() && !self.options.dry_run {
            return Err(Error::Config("target.database_url cannot be empty".to_string()));
        }
        match &self.source {
            SourceConfig::Supabase(cfg) => {
                if cfg.connection_string.trim().is_empty() {
                    return Err(Error::Config(
                        "source.connection_string cannot be empty".to_string(),
                    ));
                }
                if cfg.schemas.is_empty() {
                    return Err(Error::Config("source.schemas cannot be empty".to_string()));
                }
            }
            SourceConfig::Firebase(cfg) => {
                if cfg.is_empty() {
                    return Err(Error::Config(
                        "at least one Firebase export path is required".to_string(),
                    ));
                }
                if let Some(hash) = &cfg.hash_config {
                    hash.validate()?;
                }
            }
            SourceConfig::PocketBase(cfg) => {
                if cfg.data_dir.as_os_str().is_empty() {
                    return Err(Error::Config("source.data_dir cannot be empty".to_string()));
                }
            }
        }
        Ok(())
    }

    /// Builds run-time options from this configuration.
    #[must_use]
    pub fn to_options(&self, verbose: bool, progress: Arc<dyn Progress>) -> MigrationOptions {
        MigrationOptions {
            target_url: self.target.database_url.clone(),
            storage_path: self.target.storage_path.clone(),
            dry_run: self.options.dry_run,
            force: self.options.force,
            verbose,
            batch_size: self.options.batch_size,
            include_anonymous: self.options.include_anonymous,
            skip: self.options.skip,
            progress,
        }
    }
}

/// Parses a Postgres connection string without connecting.
///
/// # Errors
///
/// Returns [`Error::Config`] naming `role` when the string is malformed.
pub fn parse_pg_url(url: &str, role: &str) -> Result<PgConnectOptions> {
    if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
        return Err(Error::Config(format!(
            "{role} URL must start with postgres:// or postgresql://"
        )));
    }
    PgConnectOptions::from_str(url)
        .map_err(|e| Error::Config(format!("invalid {role} URL: {e}")))
}

/// Replaces the password of a connection URL for display.
#[must_use]
pub fn redact_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    let authority_end = rest.find('/').unwrap_or(rest.len());
    let authority = &rest[..authority_end];
    match (authority.rfind('@'), authority.find(':')) {
        (Some(at), Some(colon)) if colon < at => format!(
            "{}{}:***{}",
            &url[..scheme_end + 3],
            &authority[..colon],
            &rest[at..]
        ),
        _ => url.to_string(),
    }
}

fn default_schemas() -> Vec<String> {
    vec!["public".to_string()]
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./storage")
}

fn default_batch_size() -> usize {
    1000
}
