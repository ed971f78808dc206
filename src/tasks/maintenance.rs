use crate::error::Result;
use crate::stats::StatsCollector;
use crate::store::Store;
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

/// Periodic housekeeping supplied by the embedding application.
#[async_trait]
pub trait MaintenanceHook: Send + Sync {
    /// Refreshes cached executable listings.
    async fn refresh_cache(&self) -> Result<()>;
}

/// Hook that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMaintenance;

#[async_trait]
impl MaintenanceHook for NoopMaintenance {
    async fn refresh_cache(&self) -> Result<()> {
        tracing::debug!("No executable cache configured");
        Ok(())
    }
}

/// Records one host snapshot and prunes history past `max_age`.
///
/// Returns the number of pruned rows.
pub async fn record_host_stats(
    store: &dyn Store,
    stats: &StatsCollector,
    max_age: chrono::Duration,
) -> Result<usize> {
    let snapshot = stats.host_stats().await;
    store.insert_host_stats(snapshot).await?;
    let pruned = store.prune_stats_older_than(max_age).await?;
    if pruned > 0 {
        tracing::debug!(pruned, "Pruned stats history");
    }
    Ok(pruned)
}

/// Deletes files under `dir` last modified more than `max_age` ago.
///
/// A missing directory counts as empty. Returns the number of deleted files.
pub fn prune_old_logs(dir: &Path, max_age: Duration) -> io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut deleted = 0;
    for entry in WalkDir::new(dir).min_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let modified = entry.metadata().map_err(io::Error::other)?.modified()?;
        if modified <= cutoff {
            std::fs::remove_file(entry.path())?;
            tracing::debug!(path = %entry.path().display(), "Deleted old log file");
            deleted += 1;
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_prune_old_logs_keeps_recent_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("latest.log"), b"now").unwrap();
        std::fs::write(dir.path().join("nested/old.log"), b"old").unwrap();

        assert_eq!(prune_old_logs(dir.path(), Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(prune_old_logs(dir.path(), Duration::ZERO).unwrap(), 2);
        assert!(dir.path().join("nested").is_dir());
        assert_eq!(prune_old_logs(&dir.path().join("missing"), Duration::ZERO).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_record_host_stats() {
        let store = MemoryStore::new();
        let stats = StatsCollector::new();
        record_host_stats(&store, &stats, chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(store.host_stats_count(), 1);
        assert!(store.latest_host_stats().await.unwrap().is_some());
    }
}
