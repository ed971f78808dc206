use crate::config::ServerConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Directory, inside the server directory, holding the previous executable.
pub const EXECUTABLE_BACKUP_DIR: &str = "executable_backups";

/// Fetches a replacement executable.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Downloads `url` into `dest`, replacing any existing file.
    async fn download(&self, url: &str, dest: &Path) -> Result<()>;
}

/// Downloader backed by an HTTP client.
#[derive(Debug, Clone, Default)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    #[tracing::instrument(skip(self), fields(dest = %dest.display()))]
    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Update(format!("Download of {} failed: {}", url, e)))?;

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Update(format!("Failed to read download body: {}", e)))?;

        let dest = dest.to_path_buf();
        let written = body.len();
        tokio::task::spawn_blocking(move || std::fs::write(&dest, &body))
            .await
            .map_err(|e| Error::Update(format!("Download writer panicked: {}", e)))?
            .map_err(|e| Error::Update(format!("Failed to write executable: {}", e)))?;

        tracing::info!(bytes = written, "Downloaded executable");
        Ok(())
    }
}

/// Where the previous executable of a server is kept during an update.
pub fn executable_backup_path(config: &ServerConfig) -> PathBuf {
    let file_name = Path::new(&config.executable)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| config.executable.clone());
    config
        .path
        .join(EXECUTABLE_BACKUP_DIR)
        .join(format!("old_{}", file_name))
}

/// Copies the current executable aside. A missing executable is not an error.
pub fn backup_executable(config: &ServerConfig) -> Result<Option<PathBuf>> {
    let current = config.executable_path();
    if !current.exists() {
        return Ok(None);
    }

    let backup = executable_backup_path(config);
    if let Some(parent) = backup.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(&current, &backup)
        .map_err(|e| Error::Update(format!("Failed to back up executable: {}", e)))?;
    Ok(Some(backup))
}

/// Puts the previously saved executable back in place.
pub fn restore_executable(config: &ServerConfig) -> Result<()> {
    let backup = executable_backup_path(config);
    if !backup.exists() {
        return Ok(());
    }
    std::fs::copy(&backup, config.executable_path())
        .map_err(|e| Error::Update(format!("Failed to restore executable: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_and_restore_executable() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::new(1, "s", dir.path(), "server.jar", "java -jar server.jar");
        assert_eq!(backup_executable(&config).unwrap(), None);

        std::fs::write(config.executable_path(), b"v1").unwrap();
        let saved = backup_executable(&config).unwrap().unwrap();
        assert_eq!(saved, dir.path().join("executable_backups/old_server.jar"));

        std::fs::write(config.executable_path(), b"broken").unwrap();
        restore_executable(&config).unwrap();
        assert_eq!(std::fs::read(config.executable_path()).unwrap(), b"v1");
    }
}
