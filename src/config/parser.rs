use crate::error::{Error, Result};
use crate::server::ServerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Kind of game server being supervised.
///
/// The server type selects both the launch variant and the status
/// protocol used to ping the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ServerType {
    /// Java edition server, pinged over TCP.
    #[default]
    #[serde(rename = "minecraft-java")]
    MinecraftJava,
    /// Bedrock edition server, pinged over UDP. Ships native libraries
    /// next to its executable.
    #[serde(rename = "minecraft-bedrock")]
    MinecraftBedrock,
}

/// Backup settings for one server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackupConfig {
    /// Produce a gzip-compressed archive instead of a plain tar.
    pub compress: bool,
    /// Number of archives to keep. Zero keeps everything.
    pub max_backups: usize,
    /// Paths excluded from the archive, either absolute paths inside the
    /// server directory or paths relative to it.
    pub excluded_paths: Vec<PathBuf>,
}

/// Configuration for a single supervised game server.
///
/// # Examples
///
/// ```
/// use game_runner::config::ServerConfig;
///
/// let server = ServerConfig::new(1, "survival", "/srv/survival", "server.jar", "java -jar server.jar nogui");
/// assert_eq!(server.server_port, 25565);
/// assert!(server.stop_command.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Unique server id.
    pub id: ServerId,
    /// Display name.
    pub name: String,
    /// Working directory of the server process.
    pub path: PathBuf,
    /// Executable file, relative to `path`. Must exist before a start.
    pub executable: String,
    /// Full launch command, split with shell quoting rules.
    pub execution_command: String,
    /// Console command written to stdin for a graceful stop.
    #[serde(default)]
    pub stop_command: Option<String>,
    /// Restart the server automatically when it crashes.
    #[serde(default)]
    pub crash_detection: bool,
    /// Server flavour.
    #[serde(default)]
    pub server_type: ServerType,
    /// Address used for status pings.
    #[serde(default = "default_server_ip")]
    pub server_ip: String,
    /// Port used for status pings.
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Directory receiving backup archives.
    #[serde(default)]
    pub backup_path: Option<PathBuf>,
    /// Where a replacement executable is downloaded from.
    #[serde(default)]
    pub executable_update_url: Option<String>,
    /// Start the server when the runner starts.
    #[serde(default)]
    pub auto_start: bool,
    /// Delay before an automatic start, in seconds.
    #[serde(default)]
    pub auto_start_delay_secs: u64,
    /// Directory holding the server's own log files, pruned by age.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Extra environment variables for the process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Backup settings.
    #[serde(default)]
    pub backup: BackupConfig,
}

fn default_server_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    25565
}

impl ServerConfig {
    /// Creates a configuration with the required fields and defaults for everything else.
    pub fn new(
        id: i64,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        executable: impl Into<String>,
        execution_command: impl Into<String>,
    ) -> Self {
        Self {
            id: ServerId(id),
            name: name.into(),
            path: path.into(),
            executable: executable.into(),
            execution_command: execution_command.into(),
            stop_command: None,
            crash_detection: false,
            server_type: ServerType::default(),
            server_ip: default_server_ip(),
            server_port: default_server_port(),
            backup_path: None,
            executable_update_url: None,
            auto_start: false,
            auto_start_delay_secs: 0,
            log_path: None,
            env: HashMap::new(),
            backup: BackupConfig::default(),
        }
    }

    /// Absolute path of the server executable.
    pub fn executable_path(&self) -> PathBuf {
        self.path.join(&self.executable)
    }
}

/// Runner-wide tunables.
///
/// Every field has a default, so an empty `settings` object is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Lines kept per server in the virtual terminal.
    pub virtual_terminal_lines: usize,
    /// Period of host stats recording, in seconds.
    pub stats_update_frequency_secs: u64,
    /// Age after which recorded stats are pruned, in days.
    pub history_max_age_days: u64,
    /// Command queue poll period, in milliseconds.
    pub command_poll_interval_ms: u64,
    /// Realtime broadcast period, in milliseconds.
    pub realtime_interval_ms: u64,
    /// Crash detection period, in seconds.
    pub crash_check_interval_secs: u64,
    /// Per-server stats recording period while running, in seconds.
    pub stats_poll_interval_secs: u64,
    /// Wait between exit polls during a stop, in milliseconds.
    pub stop_poll_interval_ms: u64,
    /// Exit polls before a stop escalates to a kill.
    pub stop_max_polls: u32,
    /// Pause between the stop and start halves of a restart, in milliseconds.
    pub restart_settle_ms: u64,
    /// Backup progress reporting period, in milliseconds.
    pub backup_progress_interval_ms: u64,
    /// Runner log directory pruned by the log watcher.
    pub log_dir: Option<PathBuf>,
    /// Age after which log files are deleted, in days.
    pub log_retention_days: u64,
    /// Log pruning period, in hours.
    pub log_prune_interval_hours: u64,
    /// Executable cache refresh period, in hours.
    pub cache_refresh_interval_hours: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            virtual_terminal_lines: 70,
            stats_update_frequency_secs: 30,
            history_max_age_days: 7,
            command_poll_interval_ms: 1000,
            realtime_interval_ms: 4000,
            crash_check_interval_secs: 30,
            stats_poll_interval_secs: 5,
            stop_poll_interval_ms: 2000,
            stop_max_polls: 30,
            restart_settle_ms: 2000,
            backup_progress_interval_ms: 1000,
            log_dir: None,
            log_retention_days: 7,
            log_prune_interval_hours: 6,
            cache_refresh_interval_hours: 12,
        }
    }
}

impl Settings {
    pub fn command_poll_interval(&self) -> Duration {
        Duration::from_millis(self.command_poll_interval_ms)
    }

    pub fn realtime_interval(&self) -> Duration {
        Duration::from_millis(self.realtime_interval_ms)
    }

    pub fn crash_check_interval(&self) -> Duration {
        Duration::from_secs(self.crash_check_interval_secs)
    }

    pub fn stats_poll_interval(&self) -> Duration {
        Duration::from_secs(self.stats_poll_interval_secs)
    }

    pub fn stats_update_frequency(&self) -> Duration {
        Duration::from_secs(self.stats_update_frequency_secs)
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }

    pub fn backup_progress_interval(&self) -> Duration {
        Duration::from_millis(self.backup_progress_interval_ms)
    }

    pub fn history_max_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.history_max_age_days as i64)
    }

    pub fn log_retention(&self) -> Duration {
        Duration::from_secs(self.log_retention_days * 24 * 60 * 60)
    }

    pub fn log_prune_interval(&self) -> Duration {
        Duration::from_secs(self.log_prune_interval_hours * 60 * 60)
    }

    pub fn cache_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.cache_refresh_interval_hours * 60 * 60)
    }
}

/// Main configuration for the Game Runner.
///
/// # JSON Schema
///
/// ```json
/// {
///   "settings": { "virtualTerminalLines": 100 },
///   "servers": [
///     {
///       "id": 1,
///       "name": "survival",
///       "path": "/srv/survival",
///       "executable": "server.jar",
///       "executionCommand": "java -Xmx2G -jar server.jar nogui",
///       "stopCommand": "stop",
///       "crashDetection": true,
///       "backupPath": "/srv/backups/survival",
///       "backup": { "compress": true, "maxBackups": 5 }
///     }
///   ]
/// }
/// ```
///
/// # Examples
///
/// ```
/// use game_runner::config::RunnerConfig;
///
/// let config = RunnerConfig::parse_from_str(r#"{"servers": []}"#).unwrap();
/// assert_eq!(config.settings.virtual_terminal_lines, 70);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Runner-wide tunables.
    #[serde(default)]
    pub settings: Settings,
    /// Supervised servers.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl RunnerConfig {
    /// Loads a configuration from a file path.
    ///
    /// Files ending in `.yaml` or `.yml` are parsed as YAML, everything
    /// else as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * The file cannot be read
    /// * The file contents are not valid JSON or YAML
    /// * The document does not conform to the expected schema
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigParse(format!("Failed to read config file: {}", e)))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::parse_from_yaml_str(&content),
            _ => Self::parse_from_str(&content),
        }
    }

    /// Parses a configuration from a JSON string.
    pub fn parse_from_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse JSON config: {}", e)))
    }

    /// Parses a configuration from a YAML string.
    pub fn parse_from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse YAML config: {}", e)))
    }

    /// Finds a server configuration by id.
    pub fn server(&self, id: ServerId) -> Option<&ServerConfig> {
        self.servers.iter().find(|server| server.id == id)
    }
}
