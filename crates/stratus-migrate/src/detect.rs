//! Source locator classification.
//!
//! [`detect_source`] maps a single locator string to exactly one
//! [`SourceKind`]. It never guesses: shapes it does not recognize come back as
//! [`SourceKind::Unknown`] so the caller can report an actionable error.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::FirebaseConfig;

/// Flavor of a relational (Postgres URL) locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationalFlavor {
    /// A Supabase-hosted database.
    Supabase,
    /// Any other Postgres server.
    Generic,
}

/// Classification of a source locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "flavor")]
pub enum SourceKind {
    /// Live relational database reached by connection URL.
    Relational(RelationalFlavor),
    /// Embedded single-file database directory (PocketBase).
    EmbeddedFile,
    /// Offline export files (Firebase).
    OfflineExport,
    /// Not recognized.
    Unknown,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relational(RelationalFlavor::Supabase) => f.write_str("relational (supabase)"),
            Self::Relational(RelationalFlavor::Generic) => f.write_str("relational (postgres)"),
            Self::EmbeddedFile => f.write_str("embedded-file (pocketbase)"),
            Self::OfflineExport => f.write_str("offline-export (firebase)"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Prefix marking a Firebase export locator, e.g. `firebase:./export`.
pub const FIREBASE_PREFIX: &str = "firebase:";

const SUPABASE_HOST_SUFFIXES: &[&str] = &[".supabase.co", ".supabase.com"];

const AUTH_EXPORT_NAMES: &[&str] = &["auth_export.json", "users.json", "auth.json"];
const FIRESTORE_EXPORT_NAMES: &[&str] = &["firestore_export", "firestore"];
const RTDB_EXPORT_NAMES: &[&str] = &["database.json", "rtdb.json", "database_export.json"];
const STORAGE_EXPORT_NAMES: &[&str] = &["storage_export", "storage"];

/// Classifies a source locator.
///
/// URL and prefix checks are purely textual; path checks look at what exists
/// on disk, so the same input on the same filesystem always yields the same
/// answer.
#[must_use]
pub fn detect_source(locator: &str) -> SourceKind {
    let locator = locator.trim();
    if locator.is_empty() {
        return SourceKind::Unknown;
    }

    if let Some(rest) = locator
        .strip_prefix("postgres://")
        .or_else(|| locator.strip_prefix("postgresql://"))
    {
        return match url_host(rest) {
            Some(host) if is_supabase_host(&host) => SourceKind::Relational(RelationalFlavor::Supabase),
            Some(_) => SourceKind::Relational(RelationalFlavor::Generic),
            None => SourceKind::Unknown,
        };
    }

    if locator.starts_with(FIREBASE_PREFIX) {
        return SourceKind::OfflineExport;
    }

    if locator.contains("://") {
        return SourceKind::Unknown;
    }

    let path = Path::new(locator);
    if path.is_dir() {
        if path.join("data.db").is_file() {
            return SourceKind::EmbeddedFile;
        }
        if has_firebase_markers(path) {
            return SourceKind::OfflineExport;
        }
        return SourceKind::Unknown;
    }

    if path.is_file() {
        if path.file_name().is_some_and(|n| n == "data.db") {
            return SourceKind::EmbeddedFile;
        }
        if path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
        {
            return SourceKind::OfflineExport;
        }
    }

    SourceKind::Unknown
}

/// Extracts the host part of a URL with the scheme already removed.
fn url_host(rest: &str) -> Option<String> {
    let authority = rest.split(['/', '?']).next()?;
    let host_port = authority.rsplit('@').next()?;
    let host = if let Some(stripped) = host_port.strip_prefix('[') {
        stripped.split(']').next()?
    } else {
        host_port.split(':').next()?
    };
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

fn is_supabase_host(host: &str) -> bool {
    SUPABASE_HOST_SUFFIXES.iter().any(|s| host.ends_with(s))
}

fn has_firebase_markers(dir: &Path) -> bool {
    dir.join("firebase.json").is_file()
        || AUTH_EXPORT_NAMES.iter().any(|n| dir.join(n).is_file())
        || RTDB_EXPORT_NAMES.iter().any(|n| dir.join(n).is_file())
        || FIRESTORE_EXPORT_NAMES.iter().any(|n| dir.join(n).is_dir())
}

/// Resolves the individual export artifacts behind an offline locator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfflineExportPaths {
    /// Auth export file.
    pub auth_export: Option<PathBuf>,
    /// Firestore export directory.
    pub firestore_export: Option<PathBuf>,
    /// RTDB export file.
    pub rtdb_export: Option<PathBuf>,
    /// Storage export directory.
    pub storage_export: Option<PathBuf>,
}

impl OfflineExportPaths {
    /// Discovers export artifacts for a locator classified as
    /// [`SourceKind::OfflineExport`].
    ///
    /// A single JSON file is treated as an auth export when its name mentions
    /// `auth` or `users`, otherwise as an RTDB tree.
    #[must_use]
    pub fn discover(locator: &str) -> Self {
        let locator = locator.trim();
        let raw = locator.strip_prefix(FIREBASE_PREFIX).unwrap_or(locator);
        let raw = raw.strip_prefix("//").unwrap_or(raw);
        let path = Path::new(raw);

        if path.is_file() {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            return if name.contains("auth") || name.contains("users") {
                Self {
                    auth_export: Some(path.to_path_buf()),
                    ..Default::default()
                }
            } else {
                Self {
                    rtdb_export: Some(path.to_path_buf()),
                    ..Default::default()
                }
            };
        }

        if !path.is_dir() {
            return Self::default();
        }

        let first_file = |names: &[&str]| {
            names
                .iter()
                .map(|n| path.join(n))
                .find(|p| p.is_file())
        };
        let first_dir = |names: &[&str]| names.iter().map(|n| path.join(n)).find(|p| p.is_dir());

        Self {
            auth_export: first_file(AUTH_EXPORT_NAMES),
            firestore_export: first_dir(FIRESTORE_EXPORT_NAMES),
            rtdb_export: first_file(RTDB_EXPORT_NAMES),
            storage_export: first_dir(STORAGE_EXPORT_NAMES),
        }
    }

    /// Whether nothing was found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.auth_export.is_none()
            && self.firestore_export.is_none()
            && self.rtdb_export.is_none()
            && self.storage_export.is_none()
    }

    /// Converts into a Firebase source configuration.
    #[must_use]
    pub fn into_config(self) -> FirebaseConfig {
        FirebaseConfig {
            auth_export: self.auth_export,
            firestore_export: self.firestore_export,
            rtdb_export: self.rtdb_export,
            storage_export: self.storage_export,
            hash_config: None,
        }
    }
}

/// Resolves the `pb_data` directory behind an embedded locator.
#[must_use]
pub fn embedded_data_dir(locator: &str) -> PathBuf {
    let path = Path::new(locator.trim());
    if path.file_name().is_some_and(|n| n == "data.db") {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    } else {
        path.to_path_buf()
    }
}
