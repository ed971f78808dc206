//! Server directory backups.
//!
//! A backup copies the live server directory into a temporary stage,
//! deletes excluded paths from the stage, archives the stage into the
//! backup directory and prunes archives past the retention count. All of
//! this is blocking filesystem work and is meant to run on a blocking
//! thread.

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::server::ServerId;
use chrono::Local;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tar::Builder as TarBuilder;
use walkdir::WalkDir;

/// Archive name timestamp. Lexical order equals chronological order.
pub const ARCHIVE_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

const TAR_EXT: &str = ".tar";
const TAR_GZ_EXT: &str = ".tar.gz";

/// Snapshot of backup progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupProgress {
    pub percent: f64,
    pub total_files: u64,
    pub current_files: u64,
}

/// Live progress counters shared between the copying thread and the reporter.
#[derive(Debug, Default)]
pub struct BackupTracker {
    total_bytes: AtomicU64,
    copied_bytes: AtomicU64,
    total_files: AtomicU64,
    current_files: AtomicU64,
}

impl BackupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&self, total_bytes: u64, total_files: u64) {
        self.total_bytes.store(total_bytes, Ordering::SeqCst);
        self.total_files.store(total_files, Ordering::SeqCst);
        self.copied_bytes.store(0, Ordering::SeqCst);
        self.current_files.store(0, Ordering::SeqCst);
    }

    fn record_file(&self, bytes: u64) {
        self.copied_bytes.fetch_add(bytes, Ordering::SeqCst);
        self.current_files.fetch_add(1, Ordering::SeqCst);
    }

    /// Marks the copy phase finished regardless of rounding.
    pub fn complete(&self) {
        let total_bytes = self.total_bytes.load(Ordering::SeqCst);
        let total_files = self.total_files.load(Ordering::SeqCst);
        self.copied_bytes.store(total_bytes, Ordering::SeqCst);
        self.current_files.store(total_files, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> BackupProgress {
        let total_bytes = self.total_bytes.load(Ordering::SeqCst);
        let copied_bytes = self.copied_bytes.load(Ordering::SeqCst);
        let total_files = self.total_files.load(Ordering::SeqCst);
        let current_files = self.current_files.load(Ordering::SeqCst);

        let percent = if total_bytes == 0 {
            if total_files == 0 || current_files >= total_files { 100.0 } else { 0.0 }
        } else {
            ((copied_bytes as f64 / total_bytes as f64) * 100.0 * 10.0).round() / 10.0
        };

        BackupProgress {
            percent: percent.min(100.0),
            total_files,
            current_files,
        }
    }
}

/// An archive present in a backup directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArchive {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// One backup run of one server.
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub target_id: ServerId,
    pub source_path: PathBuf,
    pub backup_dir: PathBuf,
    pub excluded_paths: Vec<PathBuf>,
    pub compress: bool,
    pub max_backups: usize,
}

impl BackupJob {
    /// Builds the job for a server. Fails when no backup directory is set.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let backup_dir = config
            .backup_path
            .clone()
            .ok_or_else(|| Error::Backup(format!("Server {} has no backup path", config.id)))?;

        Ok(Self {
            target_id: config.id,
            source_path: config.path.clone(),
            backup_dir,
            excluded_paths: config.backup.excluded_paths.clone(),
            compress: config.backup.compress,
            max_backups: config.backup.max_backups,
        })
    }

    /// Runs the backup and returns the archive path.
    ///
    /// The temporary stage is removed on every path and a partially written
    /// archive is deleted on failure.
    pub fn run(&self, tracker: &BackupTracker) -> Result<PathBuf> {
        fs::create_dir_all(&self.backup_dir)
            .map_err(|e| Error::Backup(format!("Failed to create backup directory: {}", e)))?;

        let stage = tempfile::tempdir()
            .map_err(|e| Error::Backup(format!("Failed to create staging directory: {}", e)))?;

        let (total_bytes, total_files) = self.measure_source()?;
        tracker.reset(total_bytes, total_files);

        self.copy_to_stage(stage.path(), tracker)?;
        self.remove_exclusions(stage.path());
        tracker.complete();

        let archive = self
            .next_archive_path()
            .map_err(|e| Error::Backup(format!("Failed to list existing archives: {}", e)))?;
        if let Err(e) = write_archive(&archive, stage.path(), self.compress) {
            if archive.exists() {
                if let Err(cleanup) = fs::remove_file(&archive) {
                    tracing::warn!(path = %archive.display(), error = %cleanup, "Failed to remove partial archive");
                }
            }
            return Err(Error::Backup(format!("Failed to write archive: {}", e)));
        }

        let removed = prune_archives(&self.backup_dir, self.max_backups)
            .map_err(|e| Error::Backup(format!("Failed to prune old archives: {}", e)))?;
        if !removed.is_empty() {
            tracing::info!(server_id = %self.target_id, removed = removed.len(), "Pruned old backups");
        }

        Ok(archive)
    }

    fn walk_source(&self) -> impl Iterator<Item = walkdir::Result<walkdir::DirEntry>> + '_ {
        WalkDir::new(&self.source_path)
            .min_depth(1)
            .into_iter()
            .filter_entry(move |entry| !entry.path().starts_with(&self.backup_dir))
    }

    fn measure_source(&self) -> Result<(u64, u64)> {
        let mut bytes = 0;
        let mut files = 0;
        for entry in self.walk_source() {
            let entry =
                entry.map_err(|e| Error::Backup(format!("Failed to scan server directory: {}", e)))?;
            if entry.file_type().is_file() {
                bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
                files += 1;
            }
        }
        Ok((bytes, files))
    }

    fn copy_to_stage(&self, stage: &Path, tracker: &BackupTracker) -> Result<()> {
        for entry in self.walk_source() {
            let entry =
                entry.map_err(|e| Error::Backup(format!("Failed to scan server directory: {}", e)))?;
            let rel = entry
                .path()
                .strip_prefix(&self.source_path)
                .map_err(|_| Error::Backup("Failed to compute relative path".to_string()))?;
            let target = stage.join(rel);

            if entry.file_type().is_dir() {
                fs::create_dir_all(&target)?;
            } else if entry.file_type().is_file() {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let bytes = fs::copy(entry.path(), &target).map_err(|e| {
                    Error::Backup(format!("Failed to copy {}: {}", entry.path().display(), e))
                })?;
                tracker.record_file(bytes);
            } else {
                tracing::debug!(path = %entry.path().display(), "Skipping special file");
            }
        }
        Ok(())
    }

    /// Deletes excluded paths from the stage. The live directory is never touched.
    fn remove_exclusions(&self, stage: &Path) {
        for excluded in &self.excluded_paths {
            let rel = if excluded.is_absolute() {
                match excluded.strip_prefix(&self.source_path) {
                    Ok(rel) => rel,
                    Err(_) => {
                        tracing::warn!(path = %excluded.display(), "Excluded path is outside the server directory");
                        continue;
                    }
                }
            } else {
                excluded.as_path()
            };

            if rel.as_os_str().is_empty() || rel.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
                tracing::warn!(path = %excluded.display(), "Ignoring unsafe excluded path");
                continue;
            }

            let target = stage.join(rel);
            let result = if target.is_dir() {
                fs::remove_dir_all(&target)
            } else {
                fs::remove_file(&target)
            };
            match result {
                Ok(()) => tracing::debug!(path = %rel.display(), "Excluded from backup"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %rel.display(), error = %e, "Failed to remove excluded path from stage"),
            }
        }
    }

    fn next_archive_path(&self) -> io::Result<PathBuf> {
        let ext = if self.compress { TAR_GZ_EXT } else { TAR_EXT };
        let stamp = Local::now().format(ARCHIVE_TIME_FORMAT).to_string();
        let newest = list_backups(&self.backup_dir)?.pop().map(|a| a.name);
        Ok(self
            .backup_dir
            .join(next_archive_name(&stamp, ext, newest.as_deref())))
    }
}

/// Picks an archive name that sorts after `newest`.
///
/// Names never go back to a stamp that is already taken or was pruned, so
/// lexical order stays creation order. Several archives in the same second
/// get a `_NNN` sequence suffix.
pub fn next_archive_name(stamp: &str, ext: &str, newest: Option<&str>) -> String {
    let bare = format!("{}{}", stamp, ext);
    let Some(newest) = newest else {
        return bare;
    };
    if bare.as_str() > newest {
        return bare;
    }

    let stem = newest
        .strip_suffix(TAR_GZ_EXT)
        .or_else(|| newest.strip_suffix(TAR_EXT))
        .unwrap_or(newest);
    let (base, seq) = match stem.rsplit_once('_') {
        Some((base, seq)) if seq.len() >= 3 && seq.bytes().all(|b| b.is_ascii_digit()) => {
            (base, seq.parse::<u32>().unwrap_or(0))
        }
        _ => (stem, 0),
    };
    format!("{}_{:03}{}", base, seq + 1, ext)
}

fn write_archive(archive: &Path, stage: &Path, compress: bool) -> io::Result<()> {
    let file = fs::File::create(archive)?;
    if compress {
        let encoder = GzEncoder::new(file, Compression::default());
        let encoder = append_stage(TarBuilder::new(encoder), stage)?;
        encoder.finish()?.flush()
    } else {
        append_stage(TarBuilder::new(file), stage)?.flush()
    }
}

fn append_stage<W: Write>(mut builder: TarBuilder<W>, stage: &Path) -> io::Result<W> {
    builder.follow_symlinks(false);
    builder.append_dir_all(".", stage)?;
    builder.into_inner()
}

fn is_archive(name: &str) -> bool {
    name.ends_with(TAR_EXT) || name.ends_with(TAR_GZ_EXT)
}

/// Archives in `dir`, oldest first.
pub fn list_backups(dir: &Path) -> io::Result<Vec<BackupArchive>> {
    let mut archives = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(archives),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        let metadata = entry.metadata()?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if metadata.is_file() && is_archive(&name) {
            archives.push(BackupArchive {
                name,
                path: entry.path(),
                size: metadata.len(),
            });
        }
    }
    archives.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(archives)
}

/// Deletes the oldest archives until at most `max_backups` remain.
///
/// Zero keeps everything. Returns the deleted paths.
pub fn prune_archives(dir: &Path, max_backups: usize) -> io::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    if max_backups == 0 {
        return Ok(removed);
    }

    let archives = list_backups(dir)?;
    let excess = archives.len().saturating_sub(max_backups);
    for archive in archives.into_iter().take(excess) {
        fs::remove_file(&archive.path)?;
        removed.push(archive.path);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "2024-01-01_00-00-00.tar",
            "2024-01-03_00-00-00.tar",
            "2024-01-02_00-00-00.tar.gz",
            "notes.txt",
        ] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }

        let removed = prune_archives(dir.path(), 2).unwrap();

        assert_eq!(removed, vec![dir.path().join("2024-01-01_00-00-00.tar")]);
        let left: Vec<String> = list_backups(dir.path()).unwrap().into_iter().map(|a| a.name).collect();
        assert_eq!(left, vec!["2024-01-02_00-00-00.tar.gz", "2024-01-03_00-00-00.tar"]);
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_archive_names_keep_increasing() {
        let stamp = "2024-01-01_00-00-00";
        assert_eq!(next_archive_name(stamp, ".tar", None), "2024-01-01_00-00-00.tar");
        assert_eq!(
            next_archive_name(stamp, ".tar", Some("2023-12-31_23-59-59_004.tar")),
            "2024-01-01_00-00-00.tar"
        );

        // Same second as the newest archive.
        let second = next_archive_name(stamp, ".tar", Some("2024-01-01_00-00-00.tar"));
        assert_eq!(second, "2024-01-01_00-00-00_001.tar");
        let third = next_archive_name(stamp, ".tar.gz", Some(&second));
        assert_eq!(third, "2024-01-01_00-00-00_002.tar.gz");
        assert!(third > second);

        // The clock stepped back behind the newest archive.
        let behind = next_archive_name("2023-06-01_00-00-00", ".tar", Some("2024-01-01_00-00-00.tar.gz"));
        assert_eq!(behind, "2024-01-01_00-00-00_001.tar");
    }

    #[test]
    fn test_zero_retention_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("2024-01-01_00-00-00.tar"), b"x").unwrap();
        assert!(prune_archives(dir.path(), 0).unwrap().is_empty());
    }

    #[test]
    fn test_tracker_percent() {
        let tracker = BackupTracker::new();
        tracker.reset(200, 2);
        tracker.record_file(50);
        assert_eq!(tracker.snapshot().percent, 25.0);
        tracker.complete();
        let done = tracker.snapshot();
        assert_eq!(done.percent, 100.0);
        assert_eq!(done.current_files, 2);
    }
}
