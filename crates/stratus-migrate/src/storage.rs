//! Storage file scanning and copying into the target's local layout.
//!
//! The target keeps files at `<storage_path>/<bucket>/<key>`. Adapters scan a
//! source tree, map each file to its bucket-relative destination and hand the
//! resulting plan to [`copy_files`].

use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::progress::Progress;

/// Placeholder files some exporters write for empty folders.
const PLACEHOLDER_FILES: &[&str] = &[".emptyFolderPlaceholder", ".DS_Store"];

/// Progress phase name for file copies.
pub const FILES_PHASE: &str = "files";

/// A regular file found under a scanned root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Absolute (or root-joined) source path.
    pub source: PathBuf,
    /// Path relative to the scanned root.
    pub relative: PathBuf,
    /// Size in bytes.
    pub size: u64,
}

/// One planned copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyJob {
    /// Source file.
    pub source: PathBuf,
    /// Destination relative to the storage root, `<bucket>/<key>`.
    pub destination: PathBuf,
    /// Size in bytes.
    pub size: u64,
}

impl From<FileEntry> for CopyJob {
    fn from(entry: FileEntry) -> Self {
        Self {
            source: entry.source,
            destination: entry.relative,
            size: entry.size,
        }
    }
}

/// File and byte totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageTotals {
    /// Number of files.
    pub files: u64,
    /// Aggregate size.
    pub bytes: u64,
}

impl StorageTotals {
    /// Totals of a copy plan.
    #[must_use]
    pub fn of(jobs: &[CopyJob]) -> Self {
        Self {
            files: jobs.len() as u64,
            bytes: jobs.iter().map(|j| j.size).sum(),
        }
    }
}

/// Lists every regular file under `root`, sorted by path.
///
/// Symlinks are not followed and exporter placeholders are skipped.
///
/// # Errors
///
/// Returns [`Error::Extraction`] when `root` is not a directory or cannot be
/// walked.
pub fn scan_tree(root: &Path) -> Result<Vec<FileEntry>> {
    if !root.is_dir() {
        return Err(Error::Extraction(format!(
            "storage export {} is not a directory",
            root.display()
        )));
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            Error::Extraction(format!("cannot walk {}: {e}", root.display()))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if PLACEHOLDER_FILES.contains(&name.as_ref()) {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::Extraction(e.to_string()))?
            .to_path_buf();
        let size = entry
            .metadata()
            .map_err(|e| Error::Extraction(format!("cannot stat {}: {e}", entry.path().display())))?
            .len();
        entries.push(FileEntry {
            source: entry.path().to_path_buf(),
            relative,
            size,
        });
    }

    debug!(root = %root.display(), files = entries.len(), "Scanned storage tree");
    Ok(entries)
}

/// Scans on a blocking thread.
///
/// # Errors
///
/// Same as [`scan_tree`].
pub async fn scan_tree_async(root: PathBuf) -> Result<Vec<FileEntry>> {
    tokio::task::spawn_blocking(move || scan_tree(&root))
        .await
        .map_err(|e| Error::Extraction(format!("storage scan panicked: {e}")))?
}

/// Copies every job under `storage_root`, creating bucket directories as
/// needed. Existing files are overwritten, so re-runs converge.
///
/// # Errors
///
/// Returns [`Error::Cancelled`] when `cancel` fires between files, or
/// [`Error::Loading`] naming the file that failed.
pub async fn copy_files(
    jobs: &[CopyJob],
    storage_root: &Path,
    progress: &dyn Progress,
    cancel: &CancellationToken,
) -> Result<StorageTotals> {
    progress.phase_started(FILES_PHASE, Some(jobs.len() as u64));
    let mut totals = StorageTotals::default();

    for job in jobs {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let destination = storage_root.join(&job.destination);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Loading(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let bytes = tokio::fs::copy(&job.source, &destination).await.map_err(|e| {
            Error::Loading(format!(
                "cannot copy {} to {}: {e}",
                job.source.display(),
                destination.display()
            ))
        })?;
        totals.files += 1;
        totals.bytes += bytes;
        progress.phase_advanced(FILES_PHASE, 1);
    }

    progress.phase_finished(FILES_PHASE);
    info!(files = totals.files, bytes = totals.bytes, "Copied storage files");
    Ok(totals)
}
